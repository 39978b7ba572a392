//! Test data builders for creating test objects

use readout_rs::config::{HangRecovery, ReadoutConfig};
use readout_rs::RunInfo;

/// Builder for a config with timeouts short enough for tests
pub struct ConfigBuilder {
    config: ReadoutConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        let mut config = ReadoutConfig::default();
        config.pool.buffer_count = 8;
        config.pool.buffer_words = 1024;
        config.acquisition.read_timeout_ms = 5;
        config.acquisition.drain_timeout_ms = 2;
        config.acquisition.max_drain_timeouts = 5;
        config.acquisition.control_timeout_ms = 2_000;
        config.simulation.read_delay_us = 200;
        config.output.legacy_buffer_words = 256;
        Self { config }
    }

    pub fn run(mut self, run_number: u32, title: &str) -> Self {
        self.config.run = RunInfo {
            run_number,
            title: title.to_string(),
        };
        self
    }

    pub fn buffers(mut self, count: usize) -> Self {
        self.config.pool.buffer_count = count;
        self
    }

    pub fn hang_warning(mut self, timeouts: u64, recovery: HangRecovery) -> Self {
        self.config.acquisition.hang_warn_timeouts = timeouts;
        self.config.acquisition.hang_recovery = recovery;
        self
    }

    pub fn control_timeout(mut self, ms: u64) -> Self {
        self.config.acquisition.control_timeout_ms = ms;
        self
    }

    pub fn reset_after_drain(mut self, reset: bool) -> Self {
        self.config.acquisition.reset_after_drain = reset;
        self
    }

    pub fn count_interval(mut self, buffers: u64) -> Self {
        self.config.output.count_interval_buffers = buffers;
        self
    }

    pub fn build(self) -> ReadoutConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder_is_valid() {
        let config = ConfigBuilder::new().run(3, "builder").buffers(4).build();
        config.validate().unwrap();
        assert_eq!(config.run.run_number, 3);
        assert_eq!(config.pool.buffer_count, 4);
    }
}
