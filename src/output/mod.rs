//! Output formatting: filled buffers in, typed records out
//!
//! The [`OutputFormatter`] is the single consumer of the pool's filled queue.
//! For every buffer it dispatches on the buffer type, commits the resulting
//! records to its [`RecordSink`](sink::RecordSink) and returns the buffer to
//! the free queue, whatever the outcome.
//!
//! # Event buffers
//!
//! A raw device buffer is validated as a whole before any entry is used. Each
//! entry is then routed by stack id:
//!
//! - scaler stack: a [`Scaler`](OutputRecord::Scaler) record covering the
//!   time since the previous scaler, followed by a
//!   [`Count`](OutputRecord::Count) record
//! - monitor stack: forwarded to the [`MonitorSink`](sink::MonitorSink)
//! - anything else: a physics segment, assembled until a segment without the
//!   continuation bit completes the event
//!
//! # End of run
//!
//! On the Stop marker a partially assembled event is flushed as its own
//! record, the End record is committed and the run state moves from Ending
//! to Idle. That last transition is what `Readout::end` waits for.

pub mod assembly;
pub mod legacy;
pub mod record;
pub mod sink;

pub use assembly::{EventAssembly, SegmentOutcome};
pub use legacy::{read_legacy_stream, LegacyBufferSink};
pub use record::{OutputRecord, StateChangeKind};
pub use sink::{JsonLinesSink, LogMonitor, MemoryMonitor, MemorySink, MonitorSink, RecordSink};

use crate::acquisition::run_state::RunState;
use crate::acquisition::{PipelineShared, ReadoutEvent};
use crate::buffer::header::join_u32;
use crate::buffer::{Buffer, BufferType};
use crate::config::OutputConfig;
use crate::device::format::{parse_entries, Entry};
use crate::error::Result;
use crate::types::StatsCounters;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long the formatter waits on an empty filled queue before rechecking
/// its running flag
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-run context latched from the Start marker
#[derive(Debug)]
struct RunContext {
    title: String,
    started_at: Instant,
    events_so_far: u64,
    last_scaler_end: u64,
    event_buffers: u64,
}

impl RunContext {
    fn new(title: String, started_at: Instant) -> Self {
        Self {
            title,
            started_at,
            events_so_far: 0,
            last_scaler_end: 0,
            event_buffers: 0,
        }
    }

    fn elapsed_seconds(&self, buffer: &Buffer) -> u64 {
        buffer
            .captured_at()
            .saturating_duration_since(self.started_at)
            .as_secs()
    }
}

/// Consumer of the filled queue
pub struct OutputFormatter {
    shared: PipelineShared,
    config: OutputConfig,
    sink: Box<dyn RecordSink>,
    monitor: Box<dyn MonitorSink>,
    assembly: EventAssembly,
    run: RunContext,
}

impl OutputFormatter {
    pub fn new(
        shared: PipelineShared,
        config: OutputConfig,
        sink: Box<dyn RecordSink>,
        monitor: Box<dyn MonitorSink>,
    ) -> Self {
        let assembly = EventAssembly::new(config.assembly_capacity_words);
        let title = shared.state.run_info().title;
        Self {
            shared,
            config,
            sink,
            monitor,
            assembly,
            run: RunContext::new(title, Instant::now()),
        }
    }

    /// Consume buffers until `running` is cleared and the queue is empty
    pub fn run(mut self, running: Arc<AtomicBool>) {
        tracing::info!("Output formatter started");

        loop {
            match self.shared.pool.dequeue_filled_timeout(POLL_INTERVAL) {
                Some(buffer) => self.handle(buffer),
                None if !running.load(Ordering::SeqCst) => break,
                None => {}
            }
        }

        if let Err(e) = self.sink.flush() {
            tracing::error!("Failed to flush sink on shutdown: {}", e);
        }
        tracing::info!("Output formatter stopped");
    }

    /// Process one filled buffer and return it to the pool
    pub fn handle(&mut self, buffer: Buffer) {
        if let Err(e) = self.process_buffer(&buffer) {
            tracing::error!(
                run_number = buffer.run_number(),
                sequence = buffer.sequence(),
                "Failed to process buffer: {}",
                e
            );
        }
        StatsCounters::bump(&self.shared.stats.buffers_processed);
        if let Err(e) = self.shared.pool.release_free(buffer) {
            tracing::error!("Failed to return buffer to pool: {}", e);
        }
    }

    /// Turn one buffer into records
    pub fn process_buffer(&mut self, buffer: &Buffer) -> Result<()> {
        match buffer.buffer_type() {
            BufferType::Start => self.begin_run(buffer),
            BufferType::Stop => self.end_run(buffer),
            BufferType::Pause => {
                self.state_change(StateChangeKind::Pause, buffer);
                Ok(())
            }
            BufferType::Resume => {
                self.state_change(StateChangeKind::Resume, buffer);
                Ok(())
            }
            BufferType::Strings => {
                let (kind, strings) = buffer.read_strings()?;
                self.commit(OutputRecord::Text {
                    run_number: buffer.run_number(),
                    kind,
                    strings,
                });
                Ok(())
            }
            BufferType::Events => {
                self.process_events(buffer);
                Ok(())
            }
        }
    }

    fn begin_run(&mut self, buffer: &Buffer) -> Result<()> {
        let title = self.shared.state.run_info().title;
        self.run = RunContext::new(title, buffer.captured_at());
        self.assembly.clear();
        tracing::info!(
            run_number = buffer.run_number(),
            title = %self.run.title,
            "Formatting new run"
        );
        self.state_change(StateChangeKind::Begin, buffer);
        Ok(())
    }

    fn end_run(&mut self, buffer: &Buffer) -> Result<()> {
        if let Some(partial) = self.assembly.take() {
            tracing::warn!(
                run_number = buffer.run_number(),
                bytes = partial.len(),
                "Run ended mid-event, flushing partial event"
            );
            StatsCounters::bump(&self.shared.stats.partial_flushes);
            self.commit_event(buffer.run_number(), partial);
        }

        self.state_change(StateChangeKind::End, buffer);
        if let Err(e) = self.sink.flush() {
            self.sink_failed(e.to_string());
        }

        // Fails when the run was already closed on the failure path
        if let Err(e) = self
            .shared
            .state
            .transition_from(RunState::Ending, RunState::Idle)
        {
            tracing::debug!("End marker without Ending state: {}", e);
        }
        tracing::info!(
            run_number = buffer.run_number(),
            events = self.run.events_so_far,
            "Run closed"
        );
        Ok(())
    }

    fn state_change(&mut self, kind: StateChangeKind, buffer: &Buffer) {
        let record = OutputRecord::StateChange {
            kind,
            run_number: buffer.run_number(),
            title: self.run.title.clone(),
            elapsed_seconds: self.run.elapsed_seconds(buffer),
            wall_clock: buffer.wall_clock(),
        };
        self.commit(record);
    }

    fn process_events(&mut self, buffer: &Buffer) {
        let entries = match parse_entries(buffer.as_slice()) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    run_number = buffer.run_number(),
                    sequence = buffer.sequence(),
                    "Discarding buffer: {}",
                    e
                );
                StatsCounters::bump(&self.shared.stats.malformed_buffers);
                self.shared.publish(ReadoutEvent::MalformedBuffer {
                    run_number: buffer.run_number(),
                    message: e.to_string(),
                });
                return;
            }
        };

        for entry in &entries {
            if entry.stack_id == self.config.scaler_stack {
                self.scaler_entry(buffer, entry);
            } else if entry.stack_id == self.config.monitor_stack {
                self.monitor_entry(buffer, entry);
            } else {
                self.physics_segment(buffer, entry);
            }
        }

        self.run.event_buffers += 1;
        let interval = self.config.count_interval_buffers;
        if interval > 0 && self.run.event_buffers % interval == 0 {
            self.count_record(buffer);
        }
    }

    fn scaler_entry(&mut self, buffer: &Buffer, entry: &Entry<'_>) {
        if entry.body.len() % 2 != 0 {
            tracing::warn!(
                words = entry.body.len(),
                "Scaler entry with odd word count, skipped"
            );
            return;
        }
        let counters: Vec<u32> = entry
            .body
            .chunks_exact(2)
            .map(|pair| join_u32(pair[0], pair[1]))
            .collect();

        let interval_end = self.run.elapsed_seconds(buffer);
        let interval_start = self.run.last_scaler_end;
        self.run.last_scaler_end = interval_end;

        self.commit(OutputRecord::Scaler {
            run_number: buffer.run_number(),
            interval_start,
            interval_end,
            wall_clock: buffer.wall_clock(),
            counters,
        });
        self.count_record(buffer);
    }

    fn monitor_entry(&mut self, buffer: &Buffer, entry: &Entry<'_>) {
        match self.monitor.forward(buffer.run_number(), entry.body) {
            Ok(()) => StatsCounters::bump(&self.shared.stats.monitor_entries),
            Err(e) => tracing::warn!("Monitor sink rejected entry: {}", e),
        }
    }

    fn physics_segment(&mut self, buffer: &Buffer, entry: &Entry<'_>) {
        match self.assembly.push_segment(entry.body) {
            SegmentOutcome::Appended => {}
            SegmentOutcome::Flushed(held) => {
                tracing::warn!(
                    bytes = held.len(),
                    capacity = self.assembly.capacity(),
                    "Event assembly overflow, flushing held segments"
                );
                StatsCounters::bump(&self.shared.stats.partial_flushes);
                self.commit_event(buffer.run_number(), held);
            }
            SegmentOutcome::Oversize => {
                tracing::warn!(
                    words = entry.body.len(),
                    capacity = self.assembly.capacity(),
                    "Segment larger than the assembly buffer, dropped"
                );
                StatsCounters::bump(&self.shared.stats.oversize_segments);
            }
        }

        if !entry.continuation {
            if let Some(payload) = self.assembly.take() {
                self.commit_event(buffer.run_number(), payload);
            }
        }
    }

    fn count_record(&mut self, buffer: &Buffer) {
        self.commit(OutputRecord::Count {
            run_number: buffer.run_number(),
            events_so_far: self.run.events_so_far,
            run_offset: self.run.elapsed_seconds(buffer),
        });
    }

    fn commit_event(&mut self, run_number: u32, payload: Vec<u8>) {
        self.run.events_so_far += 1;
        self.commit(OutputRecord::PhysicsEvent {
            run_number,
            payload,
        });
    }

    fn commit(&mut self, record: OutputRecord) {
        if let Err(e) = self.sink.commit(&record) {
            tracing::error!(record = record.kind_name(), "Sink rejected record: {}", e);
            self.sink_failed(e.to_string());
            return;
        }

        let stats = &self.shared.stats;
        match record {
            OutputRecord::PhysicsEvent { .. } => StatsCounters::bump(&stats.physics_events),
            OutputRecord::Scaler { .. } => StatsCounters::bump(&stats.scaler_records),
            OutputRecord::Count { .. } => StatsCounters::bump(&stats.count_records),
            OutputRecord::Text { .. } => StatsCounters::bump(&stats.text_records),
            OutputRecord::StateChange { .. } => {}
        }
    }

    fn sink_failed(&self, message: String) {
        StatsCounters::bump(&self.shared.stats.sink_errors);
        self.shared.publish(ReadoutEvent::SinkError { message });
    }
}
