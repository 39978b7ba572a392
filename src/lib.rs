//! # readout-rs: threaded readout pipeline for list-mode controllers
//!
//! Moves raw data buffers from an autonomous data-acquisition controller to a
//! record sink, with run control (begin, pause, resume, end) driven from the
//! caller's thread.
//!
//! ## Architecture
//!
//! - **Acquisition**: one worker thread per run polls the device with a
//!   bounded timeout and hands filled buffers downstream
//! - **Buffer pool**: a fixed set of buffers cycling between a free queue and
//!   a filled queue, so memory is bounded and nothing allocates per read
//! - **Output**: a formatter thread turns buffers into begin/end, physics,
//!   scaler, count and text records and commits them to a sink
//! - **Communication**: crossbeam channels for the pool queues, the control
//!   request/acknowledge protocol and asynchronous events
//!
//! ## Configuration
//!
//! Everything is configured from one TOML file, by default in the platform
//! config directory under `readout-rs/readout.toml`. See [`config`].
//!
//! ## Example
//!
//! ```no_run
//! use readout_rs::{
//!     config::ReadoutConfig,
//!     device::SimulatedDevice,
//!     output::{JsonLinesSink, LogMonitor},
//!     Readout,
//! };
//!
//! fn main() -> readout_rs::Result<()> {
//!     let config = ReadoutConfig::default();
//!     let device = SimulatedDevice::new(config.simulation.clone());
//!     let sink = JsonLinesSink::create("run.jsonl")?;
//!
//!     let mut readout = Readout::new(
//!         config,
//!         Box::new(device),
//!         Box::new(sink),
//!         Box::new(LogMonitor::new()),
//!     )?;
//!
//!     readout.begin()?;
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//!     readout.end()?;
//!     println!("{:?}", readout.stats());
//!     readout.shutdown()?;
//!     Ok(())
//! }
//! ```

pub mod acquisition;
pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod output;
pub mod types;

// Re-export commonly used types
pub use acquisition::{DeviceLease, Readout, ReadoutEvent, RunInfo, RunState};
pub use buffer::{Buffer, BufferPool, BufferType};
pub use config::ReadoutConfig;
pub use device::{ModuleConfig, ReadStatus, ReadoutDevice};
pub use error::{ReadoutError, Result};
pub use output::{OutputRecord, RecordSink};
pub use types::{PipelineStats, TextKind};
