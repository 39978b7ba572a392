//! Acquisition worker thread
//!
//! The worker owns the device for the length of a run. Its loop alternates
//! between one bounded device read and one non-blocking poll of the control
//! channel, so a control request is seen within one read timeout.
//!
//! # Responsibilities
//!
//! - **Device lifecycle**: load and start the device, stop it and drain the
//!   data still in flight
//! - **Buffer hand-off**: read into free pool buffers and queue them as filled
//! - **State markers**: synthesize Start/Stop/Pause/Resume buffers in order
//!   with the data
//! - **Control protocol**: pause, resume, end, and lending the device out
//! - **Failure path**: a hard device error ends the run and is reported on the
//!   event channel
//!
//! Whatever happens, the worker returns its in-progress buffer to the pool and
//! hands the device back in its [`WorkerOutcome`].

use super::control::{Acknowledge, ControlRequest, ControlServer};
use super::run_state::RunState;
use super::{PipelineShared, ReadoutEvent};
use crate::buffer::{Buffer, BufferType};
use crate::config::{AcquisitionConfig, HangRecovery};
use crate::device::{ModuleConfig, ReadStatus, ReadoutDevice};
use crate::error::{ReadoutError, Result, ResultExt};
use crate::types::StatsCounters;
use std::time::Duration;

/// Whether the worker loop keeps going after a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Exit,
}

/// What the worker hands back when its thread finishes
#[derive(Debug)]
pub struct WorkerOutcome {
    /// The device, unless it was lost with a lent-out handle
    pub device: Option<Box<dyn ReadoutDevice>>,
    /// The error that ended the run, if it did not end normally
    pub error: Option<ReadoutError>,
}

/// Polling loop for one run
pub struct AcquisitionWorker {
    device: Option<Box<dyn ReadoutDevice>>,
    modules: Vec<ModuleConfig>,
    shared: PipelineShared,
    control: ControlServer,
    config: AcquisitionConfig,
    run_number: u32,
    /// Capture sequence within the run
    sequence: u64,
    consecutive_timeouts: u64,
    /// Free buffer held across timed-out reads
    current: Option<Buffer>,
    /// Start marker already queued
    begun: bool,
}

impl AcquisitionWorker {
    pub fn new(
        device: Box<dyn ReadoutDevice>,
        modules: Vec<ModuleConfig>,
        shared: PipelineShared,
        control: ControlServer,
        config: AcquisitionConfig,
    ) -> Self {
        let run_number = shared.state.run_info().run_number;
        Self {
            device: Some(device),
            modules,
            shared,
            control,
            config,
            run_number,
            sequence: 0,
            consecutive_timeouts: 0,
            current: None,
            begun: false,
        }
    }

    /// Run until End or a fatal error
    pub fn run(mut self) -> WorkerOutcome {
        tracing::info!(run_number = self.run_number, "Acquisition worker started");

        let error = match self.run_inner() {
            Ok(()) => None,
            Err(e) => {
                self.fail(&e);
                Some(e)
            }
        };

        if let Some(buffer) = self.current.take() {
            if let Err(e) = self.shared.pool.release_free(buffer) {
                tracing::error!("Failed to return buffer to pool: {}", e);
            }
        }

        tracing::info!(
            run_number = self.run_number,
            buffers = self.sequence,
            "Acquisition worker stopped"
        );
        WorkerOutcome {
            device: self.device.take(),
            error,
        }
    }

    fn run_inner(&mut self) -> Result<()> {
        self.start_daq().context("Starting acquisition")?;
        self.emit_marker(BufferType::Start)?;
        self.begun = true;
        self.shared
            .state
            .transition_from(RunState::Starting, RunState::Active)?;

        loop {
            self.poll_device()?;

            if let Some(request) = self.control.try_receive()? {
                tracing::debug!(?request, "Control request while active");
                if self.dispatch(request)? == LoopControl::Exit {
                    return Ok(());
                }
            }
        }
    }

    /// Handle a request received while acquiring
    fn dispatch(&mut self, request: ControlRequest) -> Result<LoopControl> {
        match request {
            ControlRequest::Pause => self.pause(),
            ControlRequest::End => {
                self.stop_daq().context("Stopping acquisition")?;
                self.finish_run()
            }
            ControlRequest::Acquire => {
                self.lend_device(true)?;
                Ok(LoopControl::Continue)
            }
            other => Err(protocol(&other, "acquiring")),
        }
    }

    fn pause(&mut self) -> Result<LoopControl> {
        self.stop_daq().context("Pausing acquisition")?;
        self.emit_marker(BufferType::Pause)?;
        self.shared
            .state
            .transition_from(RunState::Pausing, RunState::Paused)?;
        self.control.acknowledge(Acknowledge::Done)?;
        tracing::info!(run_number = self.run_number, "Run paused");

        loop {
            let request = self.control.receive()?;
            tracing::debug!(?request, "Control request while paused");
            match request {
                ControlRequest::Resume => {
                    self.start_daq().context("Resuming acquisition")?;
                    self.emit_marker(BufferType::Resume)?;
                    self.shared
                        .state
                        .transition_from(RunState::Resuming, RunState::Active)?;
                    self.control.acknowledge(Acknowledge::Done)?;
                    tracing::info!(run_number = self.run_number, "Run resumed");
                    return Ok(LoopControl::Continue);
                }
                ControlRequest::End => return self.finish_run(),
                ControlRequest::Acquire => self.lend_device(false)?,
                other => return Err(protocol(&other, "paused")),
            }
        }
    }

    /// Close the run once the device is stopped and drained
    fn finish_run(&mut self) -> Result<LoopControl> {
        // Ending must be visible before the formatter can see the marker
        self.shared
            .state
            .transition_from(RunState::Stopping, RunState::Ending)?;
        self.emit_marker(BufferType::Stop)?;
        self.control.acknowledge(Acknowledge::Done)?;
        tracing::info!(run_number = self.run_number, "Run ended");
        Ok(LoopControl::Exit)
    }

    /// Hand the device to the control thread until it is released
    fn lend_device(&mut self, restart: bool) -> Result<()> {
        if restart {
            self.stop_daq().context("Stopping for device acquire")?;
        }
        let device = self.device.take().ok_or_else(no_device)?;
        self.control.acknowledge(Acknowledge::Device(device))?;
        tracing::debug!("Device lent to control thread");

        let device = match self.control.receive()? {
            ControlRequest::Release(device) => device,
            other => return Err(protocol(&other, "the device is lent out")),
        };
        self.device = Some(device);

        if restart {
            self.start_daq().context("Restarting after device release")?;
        }
        self.control.acknowledge(Acknowledge::Done)?;
        tracing::debug!(restarted = restart, "Device returned by control thread");
        Ok(())
    }

    /// Load the readout and enter autonomous mode
    fn start_daq(&mut self) -> Result<()> {
        let device = self.device.as_deref_mut().ok_or_else(no_device)?;
        device.configure_and_load(&self.modules)?;
        device.start_autonomous()?;
        self.consecutive_timeouts = 0;
        Ok(())
    }

    /// Leave autonomous mode and forward everything still in flight
    fn stop_daq(&mut self) -> Result<()> {
        self.device
            .as_deref_mut()
            .ok_or_else(no_device)?
            .stop_autonomous()?;
        self.drain()?;
        if self.config.reset_after_drain {
            self.device.as_deref_mut().ok_or_else(no_device)?.reset()?;
        }
        Ok(())
    }

    /// Read with a short timeout until the last-buffer marker or until
    /// `max_drain_timeouts` reads in a row come back empty
    fn drain(&mut self) -> Result<()> {
        let timeout = self.config.drain_timeout();
        let max_timeouts = self.config.max_drain_timeouts.max(1);
        let mut timeouts = 0u32;
        let mut drained = 0u64;

        loop {
            let mut buffer = self.take_free()?;
            let Some(device) = self.device.as_deref_mut() else {
                self.current = Some(buffer);
                return Err(no_device());
            };

            match device.block_read(buffer.storage_mut(), timeout) {
                Ok(ReadStatus::Data(n)) => {
                    timeouts = 0;
                    if let Err(e) = buffer.set_used(n) {
                        self.current = Some(buffer);
                        return Err(e);
                    }
                    let last = device.is_last_buffer(buffer.as_slice());
                    // A bare marker (header word only) carries no entries
                    if last && n <= 1 {
                        self.current = Some(buffer);
                        break;
                    }
                    self.commit_events(buffer)?;
                    drained += 1;
                    StatsCounters::bump(&self.shared.stats.drained_buffers);
                    if last {
                        break;
                    }
                }
                Ok(ReadStatus::Timeout) => {
                    self.current = Some(buffer);
                    timeouts += 1;
                    if timeouts >= max_timeouts {
                        tracing::warn!(
                            timeouts,
                            "No last-buffer marker while draining, giving up"
                        );
                        break;
                    }
                }
                Err(e) => {
                    self.current = Some(buffer);
                    return Err(e.with_context("Device read failed while draining"));
                }
            }
        }

        tracing::debug!(drained, "Device drained");
        Ok(())
    }

    /// One bounded read into a free buffer
    fn poll_device(&mut self) -> Result<()> {
        let timeout = self.config.read_timeout();
        let mut buffer = match self.current.take() {
            Some(buffer) => buffer,
            // Pool exhausted: keep servicing control requests
            None => match self.shared.pool.acquire_free_timeout(timeout) {
                Some(buffer) => buffer,
                None => return Ok(()),
            },
        };
        let Some(device) = self.device.as_deref_mut() else {
            self.current = Some(buffer);
            return Err(no_device());
        };

        match device.block_read(buffer.storage_mut(), timeout) {
            Ok(ReadStatus::Data(n)) => {
                self.consecutive_timeouts = 0;
                if let Err(e) = buffer.set_used(n) {
                    self.current = Some(buffer);
                    return Err(e);
                }
                self.commit_events(buffer)
            }
            Ok(ReadStatus::Timeout) => {
                self.current = Some(buffer);
                self.on_timeout()
            }
            Err(e) if !e.is_fatal_to_run() => {
                tracing::warn!("Recoverable device read error: {}", e);
                self.current = Some(buffer);
                self.on_timeout()
            }
            Err(e) => {
                self.current = Some(buffer);
                Err(e.with_context("Device read failed"))
            }
        }
    }

    fn on_timeout(&mut self) -> Result<()> {
        self.consecutive_timeouts += 1;
        let stats = &self.shared.stats;
        StatsCounters::bump(&stats.read_timeouts);
        stats.observe_timeout_streak(self.consecutive_timeouts);

        let threshold = self.config.hang_warn_timeouts;
        if threshold == 0 || self.consecutive_timeouts != threshold {
            return Ok(());
        }

        tracing::warn!(
            run_number = self.run_number,
            consecutive_timeouts = self.consecutive_timeouts,
            "Device has not produced data for a while, it may be hung"
        );
        self.shared.publish(ReadoutEvent::HangSuspected {
            run_number: self.run_number,
            consecutive_timeouts: self.consecutive_timeouts,
        });

        match self.config.hang_recovery {
            HangRecovery::Ignore => Ok(()),
            HangRecovery::RestartAcquisition => {
                tracing::info!("Restarting acquisition after suspected hang");
                self.stop_daq().context("Stopping hung device")?;
                self.start_daq().context("Restarting hung device")
            }
        }
    }

    /// Tag a data buffer and queue it for the formatter
    fn commit_events(&mut self, mut buffer: Buffer) -> Result<()> {
        let words = buffer.used() as u64;
        buffer.stamp(BufferType::Events, self.run_number, self.sequence);
        self.sequence += 1;
        self.shared.pool.enqueue_filled(buffer)?;

        let stats = &self.shared.stats;
        StatsCounters::bump(&stats.buffers_read);
        StatsCounters::add(&stats.words_read, words);
        Ok(())
    }

    /// Queue a payload-free state marker
    fn emit_marker(&mut self, kind: BufferType) -> Result<()> {
        let mut buffer = self.take_free()?;
        if let Err(e) = buffer.set_used(0) {
            self.current = Some(buffer);
            return Err(e);
        }
        buffer.stamp(kind, self.run_number, self.sequence);
        self.sequence += 1;
        self.shared.pool.enqueue_filled(buffer)?;
        tracing::debug!(run_number = self.run_number, ?kind, "State marker queued");
        Ok(())
    }

    /// The held buffer, or the next free one
    ///
    /// Blocks while the formatter holds every buffer.
    fn take_free(&mut self) -> Result<Buffer> {
        if let Some(buffer) = self.current.take() {
            return Ok(buffer);
        }
        if let Some(buffer) = self.shared.pool.acquire_free_timeout(Duration::ZERO) {
            return Ok(buffer);
        }
        tracing::debug!(
            run_number = self.run_number,
            "Buffer pool exhausted, waiting for the formatter"
        );
        StatsCounters::bump(&self.shared.stats.pool_waits);
        self.shared.pool.acquire_free()
    }

    /// Failure path: stop what can be stopped, close the run, report
    fn fail(&mut self, error: &ReadoutError) {
        tracing::error!(run_number = self.run_number, "Run failed: {}", error);

        if self.device.is_some() {
            let stopped = self
                .device
                .as_deref_mut()
                .map(|device| device.stop_autonomous());
            if let Some(Ok(())) = stopped {
                if let Err(e) = self.drain() {
                    tracing::warn!("Drain after failure incomplete: {}", e);
                }
            }
        }

        if self.begun {
            if let Err(e) = self.emit_marker(BufferType::Stop) {
                tracing::error!("Could not queue End marker: {}", e);
            }
        }
        self.shared.state.abort();
        self.shared.publish(ReadoutEvent::RunFailed {
            run_number: self.run_number,
            message: error.to_string(),
        });
    }
}

fn no_device() -> ReadoutError {
    ReadoutError::DeviceUnavailable("worker does not hold the device".to_string())
}

fn protocol(request: &ControlRequest, context: &'static str) -> ReadoutError {
    ReadoutError::Protocol {
        request: request.name(),
        context,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::control;
    use crate::acquisition::run_state::{RunInfo, RunStateMachine};
    use crate::buffer::BufferPool;
    use crate::device::{DeviceBufferBuilder, SimulatedDevice, SimulatedDeviceConfig};
    use crossbeam_channel::Receiver;
    use mockall::mock;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    mock! {
        pub Device {}

        impl ReadoutDevice for Device {
            fn initialize(&mut self) -> Result<()>;
            fn configure_and_load(&mut self, modules: &[ModuleConfig]) -> Result<()>;
            fn start_autonomous(&mut self) -> Result<()>;
            fn stop_autonomous(&mut self) -> Result<()>;
            fn block_read(&mut self, dest: &mut [u16], timeout: Duration) -> Result<ReadStatus>;
        }
    }

    fn test_config() -> AcquisitionConfig {
        AcquisitionConfig {
            read_timeout_ms: 5,
            drain_timeout_ms: 1,
            max_drain_timeouts: 3,
            control_timeout_ms: 200,
            ..Default::default()
        }
    }

    fn shared(buffers: usize) -> (PipelineShared, Receiver<ReadoutEvent>) {
        let pool = Arc::new(BufferPool::new(buffers, 256).unwrap());
        let state = Arc::new(RunStateMachine::new(RunInfo {
            run_number: 12,
            title: "worker test".to_string(),
        }));
        PipelineShared::new(pool, state, Arc::new(StatsCounters::default()))
    }

    fn drain_filled(shared: &PipelineShared) -> Vec<BufferType> {
        let mut kinds = Vec::new();
        while let Some(buffer) = shared.pool.dequeue_filled_timeout(Duration::ZERO) {
            kinds.push(buffer.buffer_type());
            shared.pool.release_free(buffer).unwrap();
        }
        kinds
    }

    #[test]
    fn test_read_failure_ends_run() {
        let mut device = MockDevice::new();
        device.expect_configure_and_load().returning(|_| Ok(()));
        device.expect_start_autonomous().returning(|| Ok(()));
        device.expect_stop_autonomous().returning(|| Ok(()));
        let mut reads = 0;
        device.expect_block_read().returning(move |dest, _| {
            reads += 1;
            match reads {
                1 => {
                    let words = DeviceBufferBuilder::new().entry(0, false, &[1, 2]).build();
                    dest[..words.len()].copy_from_slice(&words);
                    Ok(ReadStatus::Data(words.len()))
                }
                2 => Err(ReadoutError::Device("bus error".to_string())),
                _ => Ok(ReadStatus::Timeout),
            }
        });

        let (shared, events) = shared(8);
        shared.state.transition(RunState::Starting).unwrap();
        let (_client, server) = control::channel();
        let worker = AcquisitionWorker::new(
            Box::new(device),
            Vec::new(),
            shared.clone(),
            server,
            test_config(),
        );

        let outcome = worker.run();
        assert!(outcome.device.is_some());
        assert!(outcome.error.unwrap().to_string().contains("bus error"));
        assert_eq!(shared.state.state(), RunState::Idle);
        assert!(matches!(
            events.try_recv().unwrap(),
            ReadoutEvent::RunFailed { run_number: 12, .. }
        ));

        assert_eq!(
            drain_filled(&shared),
            vec![BufferType::Start, BufferType::Events, BufferType::Stop]
        );
        assert_eq!(shared.pool.free_count(), shared.pool.capacity());
    }

    #[test]
    fn test_start_failure_queues_no_markers() {
        let mut device = MockDevice::new();
        device
            .expect_configure_and_load()
            .returning(|_| Err(ReadoutError::Device("stack load rejected".to_string())));
        device.expect_stop_autonomous().returning(|| Ok(()));
        device
            .expect_block_read()
            .returning(|_, _| Ok(ReadStatus::Timeout));

        let (shared, _events) = shared(4);
        shared.state.transition(RunState::Starting).unwrap();
        let (_client, server) = control::channel();
        let outcome = AcquisitionWorker::new(
            Box::new(device),
            Vec::new(),
            shared.clone(),
            server,
            test_config(),
        )
        .run();

        assert!(outcome.error.is_some());
        assert_eq!(shared.state.state(), RunState::Idle);
        assert!(drain_filled(&shared).is_empty());
    }

    #[test]
    fn test_unexpected_request_is_protocol_error() {
        let device = SimulatedDevice::new(SimulatedDeviceConfig {
            read_delay_us: 100,
            ..Default::default()
        });
        let mut device: Box<dyn ReadoutDevice> = Box::new(device);
        device.initialize().unwrap();

        let (shared, _events) = shared(8);
        shared.state.transition(RunState::Starting).unwrap();
        let (client, server) = control::channel();
        let handle = {
            let shared = shared.clone();
            thread::spawn(move || {
                AcquisitionWorker::new(device, Vec::new(), shared, server, test_config()).run()
            })
        };

        assert!(shared
            .state
            .wait_for(RunState::Active, Duration::from_secs(5)));
        client.send(ControlRequest::Resume).unwrap();

        let outcome = handle.join().unwrap();
        assert!(matches!(
            outcome.error,
            Some(ReadoutError::Protocol {
                request: "Resume",
                ..
            })
        ));
        assert_eq!(shared.state.state(), RunState::Idle);
        // Consumer never ran, so everything is still queued; nothing leaked
        assert_eq!(
            shared.pool.free_count() + shared.pool.filled_count(),
            shared.pool.capacity()
        );
    }

    #[test]
    fn test_hang_warning_published_once_per_streak() {
        let mut device = MockDevice::new();
        device.expect_configure_and_load().returning(|_| Ok(()));
        device.expect_start_autonomous().returning(|| Ok(()));
        device.expect_stop_autonomous().returning(|| Ok(()));
        device
            .expect_block_read()
            .returning(|_, _| Ok(ReadStatus::Timeout));

        let (shared, events) = shared(4);
        shared.state.transition(RunState::Starting).unwrap();
        let (client, server) = control::channel();
        let config = AcquisitionConfig {
            hang_warn_timeouts: 3,
            ..test_config()
        };
        let handle = {
            let shared = shared.clone();
            thread::spawn(move || {
                AcquisitionWorker::new(Box::new(device), Vec::new(), shared, server, config).run()
            })
        };

        assert!(shared
            .state
            .wait_for(RunState::Active, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(100));
        shared.state.transition(RunState::Stopping).unwrap();
        client.request(ControlRequest::End).unwrap();
        let outcome = handle.join().unwrap();
        assert!(outcome.error.is_none());
        assert_eq!(shared.state.state(), RunState::Ending);

        let hangs: Vec<_> = events
            .try_iter()
            .filter(|e| matches!(e, ReadoutEvent::HangSuspected { .. }))
            .collect();
        assert_eq!(hangs.len(), 1);
        assert!(shared.stats.snapshot().max_consecutive_timeouts >= 3);
    }
}
