//! Simulated readout controller
//!
//! Generates buffers in the controller's raw [`format`](super::format) without
//! hardware, so the pipeline can be exercised end to end from tests and from
//! the binary.
//!
//! # Behaviour
//!
//! - While acquiring, every `block_read` sleeps for the configured read delay
//!   and returns one buffer of `events_per_buffer` physics events.
//! - Every `scaler_period` buffers a scaler entry is added on the scaler
//!   stack; every `monitor_period` buffers a monitor entry is added.
//! - With `split_events` the last event of each buffer is cut in two: the
//!   first half carries the continuation bit and the rest opens the next
//!   buffer.
//! - After `stop_autonomous` the device returns `drain_buffers` trailing
//!   buffers, then a buffer with the last-buffer marker, then only timeouts.
//! - `fail_after_reads` injects a hard read error, for failure-path testing.
//!
//! Events have a fixed shape: word 0 is the low half of the event number,
//! the rest are 12-bit pseudo-random "ADC" values from a fixed seed, so runs
//! are reproducible.

use super::format::DeviceBufferBuilder;
use super::{ModuleConfig, ReadStatus, ReadoutDevice};
use crate::error::{ReadoutError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Parameters of the simulated controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedDeviceConfig {
    /// Physics events per buffer
    pub events_per_buffer: usize,
    /// Body words per physics event
    pub event_words: usize,
    /// Stack the physics events come from
    pub event_stack: u8,
    /// Buffers between scaler entries (0 disables scalers)
    pub scaler_period: u32,
    /// Counters per scaler entry
    pub scaler_channels: usize,
    /// Stack the scaler entries come from
    pub scaler_stack: u8,
    /// Buffers between monitor entries (0 disables the monitor stack)
    pub monitor_period: u32,
    /// Stack the monitor entries come from
    pub monitor_stack: u8,
    /// Split the last event of each buffer across two buffers
    pub split_events: bool,
    /// Buffers returned after `stop_autonomous` before the last-buffer marker
    pub drain_buffers: u32,
    /// Simulated transfer time per buffer, in microseconds
    pub read_delay_us: u64,
    /// Fail with a device error on this read (1-based), if set
    pub fail_after_reads: Option<u64>,
    /// Seed for the ADC value generator
    pub seed: u64,
}

impl Default for SimulatedDeviceConfig {
    fn default() -> Self {
        Self {
            events_per_buffer: 8,
            event_words: 12,
            event_stack: 0,
            scaler_period: 10,
            scaler_channels: 4,
            scaler_stack: 1,
            monitor_period: 0,
            monitor_stack: 7,
            split_events: false,
            drain_buffers: 1,
            read_delay_us: 500,
            fail_after_reads: None,
            seed: 0x2545_f491_4f6c_dd1d,
        }
    }
}

impl SimulatedDeviceConfig {
    /// Upper bound on the words one generated buffer occupies
    pub fn max_buffer_words(&self) -> usize {
        let events = self.events_per_buffer + 1;
        let mut words = 1 + events * (self.event_words + 1);
        words += 1 + self.scaler_channels * 2;
        words += 1 + MONITOR_WORDS;
        words
    }
}

const MONITOR_WORDS: usize = 4;

/// Counters observable from outside while the device is owned by the
/// pipeline
#[derive(Debug, Default)]
pub struct DeviceActivity {
    pub initializations: AtomicU64,
    pub loads: AtomicU64,
    pub starts: AtomicU64,
    pub stops: AtomicU64,
    pub resets: AtomicU64,
    pub reads: AtomicU64,
    pub events: AtomicU64,
}

impl DeviceActivity {
    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn stops(&self) -> u64 {
        self.stops.load(Ordering::Relaxed)
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Ready,
    Acquiring,
    /// Stopped; trailing buffers still to hand out
    Draining { remaining: u32 },
    /// Marker delivered; only timeouts from here on
    Stopped,
}

/// Simulated list-mode controller
pub struct SimulatedDevice {
    config: SimulatedDeviceConfig,
    phase: Phase,
    modules: Vec<ModuleConfig>,
    /// Tail of an event split across buffers
    carry: Option<Vec<u16>>,
    event_number: u64,
    buffers_generated: u64,
    scaler_totals: Vec<u32>,
    events_since_scaler: u32,
    rng: u64,
    activity: Arc<DeviceActivity>,
}

impl SimulatedDevice {
    pub fn new(config: SimulatedDeviceConfig) -> Self {
        let rng = config.seed.max(1);
        let scaler_totals = vec![0; config.scaler_channels];
        Self {
            config,
            phase: Phase::Uninitialized,
            modules: Vec::new(),
            carry: None,
            event_number: 0,
            buffers_generated: 0,
            scaler_totals,
            events_since_scaler: 0,
            rng,
            activity: Arc::new(DeviceActivity::default()),
        }
    }

    /// Shared handle to the activity counters
    pub fn activity(&self) -> Arc<DeviceActivity> {
        self.activity.clone()
    }

    /// Modules passed to the last `configure_and_load`
    pub fn modules(&self) -> &[ModuleConfig] {
        &self.modules
    }

    pub fn config(&self) -> &SimulatedDeviceConfig {
        &self.config
    }

    fn next_adc(&mut self) -> u16 {
        let mut s = self.rng;
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        self.rng = s;
        (s & 0x0fff) as u16
    }

    fn next_event(&mut self) -> Vec<u16> {
        self.event_number += 1;
        self.events_since_scaler += 1;
        let mut body = Vec::with_capacity(self.config.event_words);
        if self.config.event_words > 0 {
            body.push(self.event_number as u16);
        }
        for _ in 1..self.config.event_words {
            let value = self.next_adc();
            body.push(value);
        }
        body
    }

    fn scaler_body(&mut self) -> Vec<u16> {
        let increment = self.events_since_scaler;
        self.events_since_scaler = 0;
        let mut body = Vec::with_capacity(self.scaler_totals.len() * 2);
        for (channel, total) in self.scaler_totals.iter_mut().enumerate() {
            let count = increment.wrapping_mul(channel as u32 + 1);
            *total = total.wrapping_add(count);
            body.push((count & 0xffff) as u16);
            body.push((count >> 16) as u16);
        }
        body
    }

    /// Build one acquisition buffer; `final_flush` closes any split event
    /// without starting a new one
    fn generate(&mut self, final_flush: bool) -> Vec<u16> {
        let stack = self.config.event_stack;
        let mut builder = DeviceBufferBuilder::new();
        let mut events = 0u64;

        if let Some(tail) = self.carry.take() {
            builder.push_entry(stack, false, &tail);
        }

        if !final_flush {
            for index in 0..self.config.events_per_buffer {
                let body = self.next_event();
                events += 1;
                let last = index + 1 == self.config.events_per_buffer;
                if last && self.config.split_events && body.len() >= 2 {
                    let (head, tail) = body.split_at(body.len() / 2);
                    builder.push_entry(stack, true, head);
                    self.carry = Some(tail.to_vec());
                } else {
                    builder.push_entry(stack, false, &body);
                }
            }
        }

        self.buffers_generated += 1;
        let n = self.buffers_generated;
        if self.config.scaler_period > 0 && n % self.config.scaler_period as u64 == 0 {
            let body = self.scaler_body();
            builder.push_entry(self.config.scaler_stack, false, &body);
        }
        if self.config.monitor_period > 0 && n % self.config.monitor_period as u64 == 0 {
            let [lo, hi] = [(n & 0xffff) as u16, ((n >> 16) & 0xffff) as u16];
            builder.push_entry(self.config.monitor_stack, false, &[lo, hi, 0, 0]);
        }

        self.activity.events.fetch_add(events, Ordering::Relaxed);
        builder.build()
    }

    fn deliver(dest: &mut [u16], words: &[u16]) -> Result<ReadStatus> {
        if words.len() > dest.len() {
            return Err(ReadoutError::BufferOverflow {
                needed: words.len(),
                capacity: dest.len(),
            }
            .with_context("simulated buffer larger than read destination"));
        }
        dest[..words.len()].copy_from_slice(words);
        Ok(ReadStatus::Data(words.len()))
    }
}

impl ReadoutDevice for SimulatedDevice {
    fn initialize(&mut self) -> Result<()> {
        self.phase = Phase::Ready;
        self.carry = None;
        self.activity.initializations.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Simulated controller initialized");
        Ok(())
    }

    fn configure_and_load(&mut self, modules: &[ModuleConfig]) -> Result<()> {
        if self.phase == Phase::Uninitialized {
            return Err(ReadoutError::Device(
                "configure_and_load before initialize".to_string(),
            ));
        }
        self.modules = modules.to_vec();
        self.activity.loads.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(modules = modules.len(), "Simulated stacks loaded");
        Ok(())
    }

    fn start_autonomous(&mut self) -> Result<()> {
        match self.phase {
            Phase::Uninitialized => Err(ReadoutError::Device(
                "start_autonomous before initialize".to_string(),
            )),
            _ => {
                self.phase = Phase::Acquiring;
                self.activity.starts.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    fn stop_autonomous(&mut self) -> Result<()> {
        if self.phase == Phase::Acquiring {
            let mut remaining = self.config.drain_buffers;
            if self.carry.is_some() {
                remaining = remaining.max(1);
            }
            self.phase = Phase::Draining { remaining };
        }
        self.activity.stops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn block_read(&mut self, dest: &mut [u16], timeout: Duration) -> Result<ReadStatus> {
        let reads = self.activity.reads.fetch_add(1, Ordering::Relaxed) + 1;
        if self.config.fail_after_reads == Some(reads) {
            return Err(ReadoutError::Device(format!(
                "simulated bus error on read {}",
                reads
            )));
        }

        match self.phase {
            Phase::Uninitialized => Err(ReadoutError::Device(
                "block_read before initialize".to_string(),
            )),
            Phase::Acquiring => {
                if self.config.read_delay_us > 0 {
                    std::thread::sleep(Duration::from_micros(self.config.read_delay_us));
                }
                let words = self.generate(false);
                Self::deliver(dest, &words)
            }
            Phase::Draining { remaining } if remaining > 0 => {
                let final_flush = remaining == 1;
                self.phase = Phase::Draining {
                    remaining: remaining - 1,
                };
                let words = self.generate(final_flush);
                Self::deliver(dest, &words)
            }
            Phase::Draining { .. } => {
                self.phase = Phase::Stopped;
                let words = DeviceBufferBuilder::new().last_buffer().build();
                Self::deliver(dest, &words)
            }
            Phase::Ready | Phase::Stopped => {
                std::thread::sleep(timeout);
                Ok(ReadStatus::Timeout)
            }
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.carry = None;
        if self.phase != Phase::Uninitialized {
            self.phase = Phase::Ready;
        }
        self.activity.resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated"
    }
}
