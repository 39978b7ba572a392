//! Configuration for readout-rs
//!
//! One TOML file configures the whole pipeline: buffer pool sizing, device
//! read timeouts and drain policy, output formatting, the run identity, the
//! module list loaded into the device, logging, and the simulated device used
//! when no hardware driver is linked in.
//!
//! # Config Location
//!
//! Without an explicit path the binary looks in the platform config
//! directory:
//! - **Linux**: `~/.config/readout-rs/readout.toml`
//! - **macOS**: `~/Library/Application Support/readout-rs/readout.toml`
//! - **Windows**: `%APPDATA%\readout-rs\readout.toml`
//!
//! Every section and field has a default, so a partial file is valid.
//!
//! # Example
//!
//! ```toml
//! [pool]
//! buffer_count = 32
//! buffer_words = 4096
//!
//! [acquisition]
//! read_timeout_ms = 100
//! hang_recovery = "RestartAcquisition"
//!
//! [run]
//! run_number = 17
//! title = "Calibration"
//!
//! [[modules]]
//! name = "adc1"
//! kind = "adc"
//! base_address = 0x10000000
//! ```

use crate::acquisition::run_state::RunInfo;
use crate::device::{ModuleConfig, SimulatedDeviceConfig};
use crate::error::{ReadoutError, Result};
use crate::output::legacy::MIN_BUFFER_WORDS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application directory name under the platform config directory
pub const APP_DIR: &str = "readout-rs";

/// Config filename
pub const CONFIG_FILE: &str = "readout.toml";

/// Default device read timeout in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 100;

/// Default tracing filter
pub const DEFAULT_LOG_FILTER: &str = "info,readout_rs=debug";

// ==================== Config Directory ====================

/// Default config file path (`<config_dir>/readout-rs/readout.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_DIR).join(CONFIG_FILE))
}

// ==================== Readout Config ====================

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadoutConfig {
    pub pool: PoolConfig,
    pub acquisition: AcquisitionConfig,
    pub output: OutputConfig,
    /// Identity of the next run
    pub run: RunInfo,
    /// Modules configured into the device at every start
    pub modules: Vec<ModuleConfig>,
    pub logging: LoggingConfig,
    pub simulation: SimulatedDeviceConfig,
}

impl ReadoutConfig {
    /// Load a config file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReadoutError::Config(format!("Failed to read config {:?}: {}", path, e))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            ReadoutError::Config(format!("Failed to parse config {:?}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, returning defaults if it does not exist
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Save the config as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ReadoutError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| ReadoutError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            ReadoutError::Config(format!("Failed to write config {:?}: {}", path, e))
        })
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ReadoutError::Config(msg));

        if self.pool.buffer_count < 2 {
            return invalid(format!(
                "pool.buffer_count must be at least 2, got {}",
                self.pool.buffer_count
            ));
        }
        if self.pool.buffer_words < 2 {
            return invalid(format!(
                "pool.buffer_words must be at least 2, got {}",
                self.pool.buffer_words
            ));
        }
        if self.acquisition.read_timeout_ms == 0 {
            return invalid("acquisition.read_timeout_ms must be non-zero".to_string());
        }
        if self.output.assembly_capacity_words == 0 {
            return invalid("output.assembly_capacity_words must be non-zero".to_string());
        }
        for (name, stack) in [
            ("output.scaler_stack", self.output.scaler_stack),
            ("output.monitor_stack", self.output.monitor_stack),
        ] {
            if stack > 7 {
                return invalid(format!("{} must be 0..=7, got {}", name, stack));
            }
        }
        if self.output.scaler_stack == self.output.monitor_stack {
            return invalid(format!(
                "scaler and monitor stacks must differ (both {})",
                self.output.scaler_stack
            ));
        }
        if self.output.legacy_buffer_words < MIN_BUFFER_WORDS {
            return invalid(format!(
                "output.legacy_buffer_words must be at least {}",
                MIN_BUFFER_WORDS
            ));
        }
        if self.output.legacy_buffer_words > u16::MAX as usize {
            return invalid(format!(
                "output.legacy_buffer_words must fit the 16-bit size field, got {}",
                self.output.legacy_buffer_words
            ));
        }
        Ok(())
    }

    /// Extra checks for running against the simulated controller
    pub fn validate_simulation(&self) -> Result<()> {
        let simulated = self.simulation.max_buffer_words();
        if simulated > self.pool.buffer_words {
            return Err(ReadoutError::Config(format!(
                "simulated buffers need up to {} words but pool buffers hold {}",
                simulated, self.pool.buffer_words
            )));
        }
        Ok(())
    }
}

// ==================== Pool Config ====================

/// Buffer pool sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of buffers
    pub buffer_count: usize,
    /// Words per buffer
    pub buffer_words: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_count: 32,
            buffer_words: 13 * 1024,
        }
    }
}

// ==================== Acquisition Config ====================

/// What the worker does once a hang is suspected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HangRecovery {
    /// Warn and keep reading
    #[default]
    Ignore,
    /// Stop, drain and restart the device
    RestartAcquisition,
}

impl std::fmt::Display for HangRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HangRecovery::Ignore => write!(f, "Ignore"),
            HangRecovery::RestartAcquisition => write!(f, "Restart acquisition"),
        }
    }
}

/// Acquisition worker timing and drain policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Bounded device read timeout while acquiring
    pub read_timeout_ms: u64,

    /// Read timeout while draining after a stop
    pub drain_timeout_ms: u64,

    /// Consecutive empty reads that end a drain without a last-buffer marker
    pub max_drain_timeouts: u32,

    /// Reset the device after every drain
    pub reset_after_drain: bool,

    /// Consecutive read timeouts before a hang is suspected (0 disables)
    pub hang_warn_timeouts: u64,

    /// Action taken when a hang is suspected
    pub hang_recovery: HangRecovery,

    /// Deadline for the device to start and for `submit_text` to get a buffer;
    /// also the interval between progress logs while waiting for the End record
    pub control_timeout_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            drain_timeout_ms: 50,
            max_drain_timeouts: 10,
            reset_after_drain: false,
            hang_warn_timeouts: 50,
            hang_recovery: HangRecovery::Ignore,
            control_timeout_ms: 10_000,
        }
    }
}

impl AcquisitionConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

// ==================== Output Config ====================

/// Record file format written by the binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SinkFormat {
    /// One JSON object per line
    #[default]
    JsonLines,
    /// Fixed-size buffers with the legacy 16-word header
    Legacy,
}

impl std::fmt::Display for SinkFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkFormat::JsonLines => write!(f, "JSON lines"),
            SinkFormat::Legacy => write!(f, "Legacy buffers"),
        }
    }
}

/// Output formatter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Capacity of the event assembly buffer
    pub assembly_capacity_words: usize,

    /// Emit a count record every this many event buffers (0 disables)
    pub count_interval_buffers: u64,

    /// Stack id whose entries are scaler readouts
    pub scaler_stack: u8,

    /// Stack id whose entries go to the monitor sink
    pub monitor_stack: u8,

    /// Record file format
    pub format: SinkFormat,

    /// Record file path; records are only kept in memory without one
    pub path: Option<PathBuf>,

    /// Words per buffer in the legacy format
    pub legacy_buffer_words: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            assembly_capacity_words: 4096,
            count_interval_buffers: 64,
            scaler_stack: 1,
            monitor_stack: 7,
            format: SinkFormat::JsonLines,
            path: None,
            legacy_buffer_words: 4096,
        }
    }
}

// ==================== Logging Config ====================

/// Tracing setup used by the binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence
    pub filter: String,

    /// Directory for daily rolling log files; console only when unset
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            log_dir: None,
        }
    }
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        ReadoutConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ReadoutConfig = toml::from_str(
            r#"
            [pool]
            buffer_count = 8

            [acquisition]
            hang_recovery = "RestartAcquisition"

            [run]
            run_number = 17
            title = "Calibration"

            [[modules]]
            name = "adc1"
            kind = "adc"
            base_address = 0x10000000
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.buffer_count, 8);
        assert_eq!(config.pool.buffer_words, PoolConfig::default().buffer_words);
        assert_eq!(config.acquisition.hang_recovery, HangRecovery::RestartAcquisition);
        assert_eq!(config.acquisition.read_timeout_ms, DEFAULT_READ_TIMEOUT_MS);
        assert_eq!(config.run.run_number, 17);
        assert_eq!(config.modules.len(), 1);
        assert_eq!(config.modules[0].base_address, 0x1000_0000);
        assert_eq!(config.output.scaler_stack, 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let mut config = ReadoutConfig::default();
        config.run.run_number = 3;
        config.output.format = SinkFormat::Legacy;
        config.logging.log_dir = Some(dir.path().join("logs"));
        config.save(&path).unwrap();

        let loaded = ReadoutConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ReadoutConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ReadoutConfig::default());
    }

    #[test]
    fn test_invalid_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[pool]\nbuffer_count = \"many\"\n").unwrap();
        assert!(matches!(
            ReadoutConfig::load(&path),
            Err(ReadoutError::Config(_))
        ));
    }

    #[test]
    fn test_validation_rules() {
        let mut config = ReadoutConfig::default();
        config.output.monitor_stack = config.output.scaler_stack;
        assert!(config.validate().is_err());

        // Only the simulated controller cares about its own buffer size
        let mut config = ReadoutConfig::default();
        config.pool.buffer_words = 64;
        config.validate().unwrap();
        assert!(config.validate_simulation().is_err());
        ReadoutConfig::default().validate_simulation().unwrap();

        let mut config = ReadoutConfig::default();
        config.output.legacy_buffer_words = MIN_BUFFER_WORDS - 1;
        assert!(config.validate().is_err());

        let mut config = ReadoutConfig::default();
        config.acquisition.read_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations() {
        let config = AcquisitionConfig::default();
        assert_eq!(config.read_timeout(), Duration::from_millis(100));
        assert_eq!(config.control_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_default_config_path() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("readout-rs/readout.toml"));
        }
    }
}
