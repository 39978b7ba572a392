//! Run control and the acquisition side of the pipeline
//!
//! [`Readout`] is the control-thread handle. It owns the device while no run
//! is open, spawns one [`AcquisitionWorker`](worker::AcquisitionWorker) per
//! run and keeps the output formatter thread alive for its whole lifetime.
//!
//! ```text
//!  control thread          worker thread                formatter thread
//!  ──────────────          ─────────────                ────────────────
//!  begin() ──spawn──────▶  configure + start device
//!                          Start marker ──filled──────▶ Begin record
//!                          read ─▶ Events ──filled────▶ event/scaler records
//!  pause() ──Pause──────▶  stop + drain, Pause marker ─▶ Pause record
//!          ◀──Done──────
//!  end()   ──End────────▶  stop + drain, Stop marker ──▶ End record
//!          ◀──Done──────                                 Ending -> Idle
//! ```
//!
//! All three threads share a [`PipelineShared`]: the buffer pool, the run
//! state machine, the statistics counters and the sender half of the
//! asynchronous event channel.

pub mod control;
pub mod run_state;
pub mod worker;

pub use control::{channel, Acknowledge, ControlClient, ControlRequest, ControlServer};
pub use run_state::{RunInfo, RunState, RunStateMachine};
pub use worker::{AcquisitionWorker, WorkerOutcome};

use crate::buffer::{BufferPool, BufferType};
use crate::config::ReadoutConfig;
use crate::device::ReadoutDevice;
use crate::error::{ReadoutError, Result, ResultExt};
use crate::output::{MonitorSink, OutputFormatter, RecordSink};
use crate::types::{PipelineStats, StatsCounters, TextKind};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Capacity of the asynchronous event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Asynchronous notifications for the control thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadoutEvent {
    /// A hard error ended the run; the state is back to Idle
    RunFailed { run_number: u32, message: String },
    /// The device has returned nothing for a suspicious number of reads
    HangSuspected {
        run_number: u32,
        consecutive_timeouts: u64,
    },
    /// The record sink rejected a record
    SinkError { message: String },
    /// A raw buffer failed validation and was discarded
    MalformedBuffer { run_number: u32, message: String },
}

/// Handles shared by the control, worker and formatter threads
#[derive(Debug, Clone)]
pub struct PipelineShared {
    pub pool: Arc<BufferPool>,
    pub state: Arc<RunStateMachine>,
    pub stats: Arc<StatsCounters>,
    events: Sender<ReadoutEvent>,
}

impl PipelineShared {
    /// Bundle the shared handles and create the event channel
    pub fn new(
        pool: Arc<BufferPool>,
        state: Arc<RunStateMachine>,
        stats: Arc<StatsCounters>,
    ) -> (Self, Receiver<ReadoutEvent>) {
        let (events, receiver) = bounded(EVENT_CHANNEL_CAPACITY);
        (
            Self {
                pool,
                state,
                stats,
                events,
            },
            receiver,
        )
    }

    /// Post an event without blocking; dropped if nobody keeps up
    pub fn publish(&self, event: ReadoutEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(?event, "Event channel full, event dropped");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// The device, borrowed from the pipeline by the control thread
///
/// Must be handed back with [`Readout::release`]; while a lease is out the
/// run can be neither paused nor ended.
#[must_use = "a leased device must be returned with Readout::release"]
pub struct DeviceLease {
    device: Box<dyn ReadoutDevice>,
    /// Lent by a running worker, which waits for the release
    from_worker: bool,
}

impl DeviceLease {
    /// Whether a run was in progress when the device was lent
    pub fn from_worker(&self) -> bool {
        self.from_worker
    }
}

impl std::fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLease")
            .field("device", &self.device.name())
            .field("from_worker", &self.from_worker)
            .finish()
    }
}

impl Deref for DeviceLease {
    type Target = dyn ReadoutDevice;

    fn deref(&self) -> &Self::Target {
        self.device.as_ref()
    }
}

impl DerefMut for DeviceLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.device.as_mut()
    }
}

/// Worker thread plus the control end of its channel
struct ActiveRun {
    client: ControlClient,
    thread: JoinHandle<WorkerOutcome>,
}

/// Control-thread handle for the whole pipeline
pub struct Readout {
    config: ReadoutConfig,
    shared: PipelineShared,
    events: Receiver<ReadoutEvent>,
    /// Held here while no worker owns it
    device: Option<Box<dyn ReadoutDevice>>,
    run: Option<ActiveRun>,
    lease_out: bool,
    formatter_running: Arc<AtomicBool>,
    formatter: Option<JoinHandle<()>>,
}

impl Readout {
    /// Initialize the device, allocate the pool and start the formatter
    pub fn new(
        config: ReadoutConfig,
        mut device: Box<dyn ReadoutDevice>,
        sink: Box<dyn RecordSink>,
        monitor: Box<dyn MonitorSink>,
    ) -> Result<Self> {
        config.validate()?;
        device.initialize().context("Initializing device")?;

        let pool = Arc::new(BufferPool::new(
            config.pool.buffer_count,
            config.pool.buffer_words,
        )?);
        let state = Arc::new(RunStateMachine::new(config.run.clone()));
        let (shared, events) = PipelineShared::new(pool, state, Arc::new(StatsCounters::default()));

        let formatter_running = Arc::new(AtomicBool::new(true));
        let formatter = OutputFormatter::new(shared.clone(), config.output.clone(), sink, monitor);
        let running = formatter_running.clone();
        let handle = thread::Builder::new()
            .name("readout-formatter".to_string())
            .spawn(move || formatter.run(running))
            .context("Spawning formatter thread")?;

        tracing::info!(
            device = device.name(),
            buffers = config.pool.buffer_count,
            buffer_words = config.pool.buffer_words,
            "Readout pipeline ready"
        );

        Ok(Self {
            config,
            shared,
            events,
            device: Some(device),
            run: None,
            lease_out: false,
            formatter_running,
            formatter: Some(handle),
        })
    }

    /// Current run state
    pub fn state(&self) -> RunState {
        self.shared.state.state()
    }

    pub fn run_info(&self) -> RunInfo {
        self.shared.state.run_info()
    }

    /// Set the number and title of the next run; only while Idle
    pub fn set_run_info(&mut self, info: RunInfo) -> Result<()> {
        self.shared.state.set_run_info(info)
    }

    /// Snapshot of the pipeline counters
    pub fn stats(&self) -> PipelineStats {
        self.shared.stats.snapshot()
    }

    /// Shared handles, for embedding the pipeline in a larger program
    pub fn shared(&self) -> &PipelineShared {
        &self.shared
    }

    /// Next pending event, if any
    pub fn try_event(&self) -> Option<ReadoutEvent> {
        self.events.try_recv().ok()
    }

    /// All pending events
    pub fn drain_events(&self) -> Vec<ReadoutEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Receiver for blocking or `select!`-based event handling
    pub fn events(&self) -> Receiver<ReadoutEvent> {
        self.events.clone()
    }

    /// Start a run and wait until it is Active
    ///
    /// When the device cannot be started the run never opens: no Start marker
    /// is queued, the state returns to Idle and the device error is returned.
    /// A device that takes longer than the control timeout to start has its
    /// run abandoned; the worker is joined and the device is held again
    /// before the timeout error is returned.
    pub fn begin(&mut self) -> Result<()> {
        self.reap_finished();
        if self.lease_out {
            return Err(ReadoutError::DeviceLeased);
        }
        if self.device.is_none() {
            return Err(ReadoutError::DeviceUnavailable(
                "lost with a previous run".to_string(),
            ));
        }
        self.shared.state.transition(RunState::Starting)?;

        let device = match self.device.take() {
            Some(device) => device,
            None => {
                self.shared.state.abort();
                return Err(ReadoutError::DeviceUnavailable(
                    "taken while starting".to_string(),
                ));
            }
        };

        let (client, server) = channel();
        let worker = AcquisitionWorker::new(
            device,
            self.config.modules.clone(),
            self.shared.clone(),
            server,
            self.config.acquisition.clone(),
        );
        let spawned = thread::Builder::new()
            .name("readout-worker".to_string())
            .spawn(move || worker.run());
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.shared.state.abort();
                return Err(ReadoutError::Io(e).with_context("Spawning acquisition worker"));
            }
        };
        self.run = Some(ActiveRun { client, thread });

        let timeout = self.config.acquisition.control_timeout();
        match self
            .shared
            .state
            .wait_while(|s| s == RunState::Starting, timeout)
        {
            RunState::Starting => {
                // Close the run the worker is still opening and take the device back
                tracing::warn!(?timeout, "Device did not start in time, abandoning run");
                self.shared.state.abort();
                if let Some(error) = self.join_run() {
                    tracing::debug!("Abandoned run ended with: {}", error);
                }
                Err(ReadoutError::Timeout(format!(
                    "run did not become active within {:?}",
                    timeout
                )))
            }
            RunState::Idle => {
                let error = self.join_run();
                Err(error.unwrap_or_else(|| {
                    ReadoutError::Device("acquisition worker exited while starting".to_string())
                }))
            }
            state => {
                tracing::info!(run_number = self.run_info().run_number, %state, "Run begun");
                Ok(())
            }
        }
    }

    /// Pause an Active run; returns once the Pause marker is queued
    pub fn pause(&mut self) -> Result<()> {
        self.ensure_run()?;
        self.shared.state.transition(RunState::Pausing)?;
        self.request_done(ControlRequest::Pause)
    }

    /// Resume a Paused run; returns once the device is restarted
    pub fn resume(&mut self) -> Result<()> {
        self.ensure_run()?;
        self.shared.state.transition(RunState::Resuming)?;
        self.request_done(ControlRequest::Resume)
    }

    /// End an Active or Paused run
    ///
    /// Returns once the formatter has committed the End record and the state
    /// is Idle again.
    pub fn end(&mut self) -> Result<()> {
        self.ensure_run()?;
        self.shared.state.transition(RunState::Stopping)?;
        let requested = self.request_done(ControlRequest::End);
        let failure = self.join_run();
        requested?;
        if let Some(error) = failure {
            return Err(error);
        }

        // The formatter may still be working through a backlog
        let timeout = self.config.acquisition.control_timeout();
        while !self.shared.state.wait_for(RunState::Idle, timeout) {
            let formatter_alive = self
                .formatter
                .as_ref()
                .is_some_and(|handle| !handle.is_finished());
            if !formatter_alive {
                return Err(ReadoutError::Channel(
                    "formatter exited before the End record".to_string(),
                ));
            }
            tracing::debug!(
                queued = self.shared.pool.filled_count(),
                "Waiting for the End record"
            );
        }
        tracing::info!(stats = ?self.stats(), "Run finished");
        Ok(())
    }

    /// Borrow the device for direct access
    ///
    /// During a run the worker stops autonomous mode and drains first (when
    /// Active) and waits for the release before restarting.
    pub fn acquire(&mut self) -> Result<DeviceLease> {
        if self.lease_out {
            return Err(ReadoutError::DeviceLeased);
        }
        self.reap_finished();

        let lease = match &self.run {
            Some(run) => {
                match run.client.request(ControlRequest::Acquire)? {
                    Acknowledge::Device(device) => DeviceLease {
                        device,
                        from_worker: true,
                    },
                    Acknowledge::Done => {
                        return Err(ReadoutError::Protocol {
                            request: "Done",
                            context: "waiting for the device",
                        })
                    }
                }
            }
            None => DeviceLease {
                device: self.device.take().ok_or_else(|| {
                    ReadoutError::DeviceUnavailable("lost with a previous run".to_string())
                })?,
                from_worker: false,
            },
        };
        self.lease_out = true;
        tracing::debug!(from_worker = lease.from_worker, "Device acquired");
        Ok(lease)
    }

    /// Return a leased device
    pub fn release(&mut self, lease: DeviceLease) -> Result<()> {
        self.lease_out = false;
        let DeviceLease {
            device,
            from_worker,
        } = lease;

        let run = match (&self.run, from_worker) {
            (Some(run), true) => run,
            _ => {
                self.device = Some(device);
                return Ok(());
            }
        };
        match run.client.request(ControlRequest::Release(device)) {
            Ok(Acknowledge::Done) => Ok(()),
            Ok(Acknowledge::Device(device)) => {
                self.device = Some(device);
                Err(ReadoutError::Protocol {
                    request: "Device",
                    context: "releasing the device",
                })
            }
            Err(e) => {
                // A restart failure ends the run; collect what the worker left
                self.reap_finished();
                Err(e)
            }
        }
    }

    /// Queue a text record in order with the data
    pub fn submit_text<S: AsRef<str>>(&self, kind: TextKind, strings: &[S]) -> Result<()> {
        let timeout = self.config.acquisition.control_timeout();
        let mut buffer = self
            .shared
            .pool
            .acquire_free_timeout(timeout)
            .ok_or_else(|| {
                ReadoutError::Timeout(format!("no free buffer within {:?}", timeout))
            })?;
        if let Err(e) = buffer.write_strings(kind, strings) {
            self.shared.pool.release_free(buffer)?;
            return Err(e);
        }
        buffer.stamp(BufferType::Strings, self.run_info().run_number, 0);
        self.shared.pool.enqueue_filled(buffer)
    }

    /// End any open run and stop the formatter
    ///
    /// Returns the device when it is still held.
    pub fn shutdown(mut self) -> Result<Option<Box<dyn ReadoutDevice>>> {
        let ended = self.stop_all();
        ended.map(|()| self.device.take())
    }

    fn stop_all(&mut self) -> Result<()> {
        self.reap_finished();
        let mut result = Ok(());
        let open = matches!(self.state(), RunState::Active | RunState::Paused);
        if self.run.is_some() && !self.lease_out && open {
            result = self.end();
        }

        self.formatter_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.formatter.take() {
            if handle.join().is_err() {
                tracing::error!("Formatter thread panicked");
            }
        }
        result
    }

    fn ensure_run(&mut self) -> Result<()> {
        if self.lease_out {
            return Err(ReadoutError::DeviceLeased);
        }
        self.reap_finished();
        if self.run.is_none() {
            return Err(ReadoutError::NotRunning);
        }
        Ok(())
    }

    /// Send a request that must be answered with `Done`
    fn request_done(&mut self, request: ControlRequest) -> Result<()> {
        let run = self.run.as_ref().ok_or(ReadoutError::NotRunning)?;
        let name = request.name();
        match run.client.request(request) {
            Ok(Acknowledge::Done) => Ok(()),
            Ok(Acknowledge::Device(device)) => {
                self.device = Some(device);
                Err(ReadoutError::Protocol {
                    request: name,
                    context: "expecting Done",
                })
            }
            Err(e) => {
                self.reap_finished();
                Err(e)
            }
        }
    }

    /// Join the worker if its thread has exited or the run was aborted
    fn reap_finished(&mut self) {
        let aborted = self.state() == RunState::Idle;
        let finished = self
            .run
            .as_ref()
            .map(|run| aborted || run.thread.is_finished())
            .unwrap_or(false);
        if finished {
            if let Some(error) = self.join_run() {
                tracing::debug!("Collected failed run: {}", error);
            }
        }
    }

    /// Join the worker, reclaim the device and return the run's error
    fn join_run(&mut self) -> Option<ReadoutError> {
        let run = self.run.take()?;
        drop(run.client);
        match run.thread.join() {
            Ok(outcome) => {
                if let Some(device) = outcome.device {
                    self.device = Some(device);
                } else {
                    tracing::error!("Acquisition worker did not return the device");
                }
                outcome.error
            }
            Err(_) => {
                self.shared.state.abort();
                Some(ReadoutError::Device(
                    "acquisition worker panicked".to_string(),
                ))
            }
        }
    }
}

impl Drop for Readout {
    fn drop(&mut self) {
        if self.formatter.is_some() {
            if let Err(e) = self.stop_all() {
                tracing::error!("Error shutting down readout: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SimulatedDevice, SimulatedDeviceConfig};
    use crate::output::{MemoryMonitor, MemorySink, OutputRecord, StateChangeKind};
    use std::time::Duration;

    fn config() -> ReadoutConfig {
        let mut config = ReadoutConfig::default();
        config.pool.buffer_count = 8;
        config.acquisition.read_timeout_ms = 5;
        config.acquisition.drain_timeout_ms = 2;
        config.acquisition.max_drain_timeouts = 3;
        config.acquisition.control_timeout_ms = 2_000;
        config.simulation.read_delay_us = 200;
        config.run = RunInfo {
            run_number: 12,
            title: "unit".to_string(),
        };
        config
    }

    fn readout(sim: SimulatedDeviceConfig) -> (Readout, MemorySink) {
        let sink = MemorySink::new();
        let readout = Readout::new(
            config(),
            Box::new(SimulatedDevice::new(sim)),
            Box::new(sink.clone()),
            Box::new(MemoryMonitor::new()),
        )
        .unwrap();
        (readout, sink)
    }

    fn state_changes(sink: &MemorySink) -> Vec<StateChangeKind> {
        sink.records()
            .iter()
            .filter_map(OutputRecord::state_change)
            .collect()
    }

    #[test]
    fn test_publish_drops_when_full() {
        let pool = Arc::new(BufferPool::new(2, 16).unwrap());
        let (shared, events) = PipelineShared::new(
            pool,
            Arc::new(RunStateMachine::default()),
            Arc::new(StatsCounters::default()),
        );
        for _ in 0..EVENT_CHANNEL_CAPACITY + 5 {
            shared.publish(ReadoutEvent::SinkError {
                message: "x".to_string(),
            });
        }
        assert_eq!(events.len(), EVENT_CHANNEL_CAPACITY);
    }

    #[test]
    fn test_begin_end_cycle() {
        let (mut readout, sink) = readout(SimulatedDeviceConfig::default());
        readout.begin().unwrap();
        assert_eq!(readout.state(), RunState::Active);
        std::thread::sleep(Duration::from_millis(20));
        readout.end().unwrap();

        assert_eq!(readout.state(), RunState::Idle);
        assert_eq!(
            state_changes(&sink),
            vec![StateChangeKind::Begin, StateChangeKind::End]
        );
        assert!(sink.records().iter().all(|r| r.run_number() == 12));
        readout.shutdown().unwrap();
    }

    #[test]
    fn test_pause_requires_active_run() {
        let (mut readout, _sink) = readout(SimulatedDeviceConfig::default());
        assert!(matches!(readout.pause(), Err(ReadoutError::NotRunning)));

        readout.begin().unwrap();
        assert!(matches!(
            readout.resume(),
            Err(ReadoutError::InvalidTransition { .. })
        ));
        readout.end().unwrap();
    }

    #[test]
    fn test_run_info_locked_while_running() {
        let (mut readout, _sink) = readout(SimulatedDeviceConfig::default());
        readout.begin().unwrap();
        assert!(matches!(
            readout.set_run_info(RunInfo::default()),
            Err(ReadoutError::RunInProgress(RunState::Active))
        ));
        readout.end().unwrap();
        readout
            .set_run_info(RunInfo {
                run_number: 13,
                title: "next".to_string(),
            })
            .unwrap();
        assert_eq!(readout.run_info().run_number, 13);
    }

    #[test]
    fn test_lease_blocks_end() {
        let (mut readout, _sink) = readout(SimulatedDeviceConfig::default());
        readout.begin().unwrap();
        let mut lease = readout.acquire().unwrap();
        assert!(lease.from_worker());
        lease.reset().unwrap();
        assert!(matches!(readout.end(), Err(ReadoutError::DeviceLeased)));
        assert!(matches!(
            readout.acquire(),
            Err(ReadoutError::DeviceLeased)
        ));

        readout.release(lease).unwrap();
        assert_eq!(readout.state(), RunState::Active);
        readout.end().unwrap();
    }

    #[test]
    fn test_acquire_while_idle() {
        let (mut readout, _sink) = readout(SimulatedDeviceConfig::default());
        let lease = readout.acquire().unwrap();
        assert!(!lease.from_worker());
        assert_eq!(lease.name(), "simulated");
        assert!(matches!(readout.begin(), Err(ReadoutError::DeviceLeased)));
        readout.release(lease).unwrap();
        readout.begin().unwrap();
        readout.end().unwrap();
    }

    #[test]
    fn test_device_failure_reported_and_recovered() {
        let (mut readout, _sink) = readout(SimulatedDeviceConfig {
            fail_after_reads: Some(200),
            ..Default::default()
        });
        readout.begin().unwrap();
        let events = readout.events();
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, ReadoutEvent::RunFailed { run_number: 12, .. }));

        assert!(readout.shared().state.wait_for(RunState::Idle, Duration::from_secs(5)));
        assert!(matches!(readout.end(), Err(ReadoutError::NotRunning)));
        assert!(readout.stats().buffers_read > 0);
        // The device came back with the worker
        let lease = readout.acquire().unwrap();
        readout.release(lease).unwrap();
    }

    #[test]
    fn test_submit_text_reaches_sink() {
        let (readout, sink) = readout(SimulatedDeviceConfig::default());
        readout
            .submit_text(TextKind::RunVariables, &["beam=on"])
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while sink.is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(
            sink.records()[0],
            OutputRecord::Text {
                kind: TextKind::RunVariables,
                ..
            }
        ));
        readout.shutdown().unwrap();
    }
}
