//! Readout device interface
//!
//! The pipeline talks to the controller only through [`ReadoutDevice`]: a
//! narrow initialize / load / start / stop / read surface. Register-level
//! drivers implement it elsewhere; this crate ships a
//! [`SimulatedDevice`](simulated::SimulatedDevice) that produces buffers in
//! the controller's [`format`].
//!
//! A device handle is a `Box<dyn ReadoutDevice>`. It is moved, never shared:
//! the acquisition worker owns it while a run is active and hands it to the
//! control thread for the length of an acquire/release window.

pub mod format;
pub mod simulated;

pub use format::{parse_entries, DeviceBufferBuilder, Entry};
pub use simulated::{SimulatedDevice, SimulatedDeviceConfig};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of a bounded block read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// `n` words were transferred
    Data(usize),
    /// Nothing arrived before the timeout
    Timeout,
}

/// One hardware module in the readout list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Name used in logs and documentation strings
    pub name: String,
    /// Driver kind (e.g. "adc", "scaler")
    pub kind: String,
    /// Base address on the bus
    #[serde(default)]
    pub base_address: u32,
    /// Stack the module's readout is loaded into
    #[serde(default)]
    pub stack: u8,
}

impl ModuleConfig {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        base_address: u32,
        stack: u8,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            base_address,
            stack,
        }
    }
}

/// Narrow interface to a list-mode readout controller
///
/// Implementations must be `Send`: the handle moves between the control
/// thread and the acquisition worker.
pub trait ReadoutDevice: Send {
    /// Bring the controller to a known state
    fn initialize(&mut self) -> Result<()>;

    /// Configure the modules and load the readout stacks
    fn configure_and_load(&mut self, modules: &[ModuleConfig]) -> Result<()>;

    /// Enter autonomous (triggered) acquisition mode
    fn start_autonomous(&mut self) -> Result<()>;

    /// Leave autonomous acquisition mode
    ///
    /// Buffers already in flight are still returned by `block_read`.
    fn stop_autonomous(&mut self) -> Result<()>;

    /// Read one buffer into `dest`, waiting at most `timeout`
    ///
    /// A timeout is reported as [`ReadStatus::Timeout`], never as an error.
    fn block_read(&mut self, dest: &mut [u16], timeout: Duration) -> Result<ReadStatus>;

    /// Whether `data` is the final buffer emitted after `stop_autonomous`
    fn is_last_buffer(&self, data: &[u16]) -> bool {
        format::is_last_buffer(data)
    }

    /// Reset the controller after a drain
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    /// Short name used in logs
    fn name(&self) -> &str {
        "device"
    }
}

impl std::fmt::Debug for dyn ReadoutDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadoutDevice")
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDevice;

    impl ReadoutDevice for NullDevice {
        fn initialize(&mut self) -> Result<()> {
            Ok(())
        }
        fn configure_and_load(&mut self, _modules: &[ModuleConfig]) -> Result<()> {
            Ok(())
        }
        fn start_autonomous(&mut self) -> Result<()> {
            Ok(())
        }
        fn stop_autonomous(&mut self) -> Result<()> {
            Ok(())
        }
        fn block_read(&mut self, _dest: &mut [u16], _timeout: Duration) -> Result<ReadStatus> {
            Ok(ReadStatus::Timeout)
        }
    }

    #[test]
    fn test_default_last_buffer_check() {
        let device = NullDevice;
        let last = DeviceBufferBuilder::new().last_buffer().build();
        let normal = DeviceBufferBuilder::new().build();
        assert!(device.is_last_buffer(&last));
        assert!(!device.is_last_buffer(&normal));
        assert!(!device.is_last_buffer(&[]));
    }

    #[test]
    fn test_boxed_debug() {
        let device: Box<dyn ReadoutDevice> = Box::new(NullDevice);
        assert!(format!("{:?}", device).contains("device"));
    }

    #[test]
    fn test_module_config_toml() {
        let module = ModuleConfig::new("adc1", "adc", 0x1000_0000, 0);
        let text = toml::to_string(&module).unwrap();
        let parsed: ModuleConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, module);
    }
}
