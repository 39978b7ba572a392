//! Core data types shared across the readout pipeline
//!
//! This module contains the small value types that cross module boundaries:
//! the kinds of text records, and the statistics counters that the
//! acquisition worker and the output formatter update concurrently.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Kind of a string-list record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TextKind {
    /// Packet/stack documentation strings
    #[default]
    Documentation,
    /// Run variables (name=value pairs set by the operator)
    RunVariables,
    /// State variables (name=value pairs tracked by the control surface)
    StateVariables,
}

impl TextKind {
    /// Code stored in a Strings buffer; matches the legacy buffer type
    pub fn code(self) -> u16 {
        match self {
            TextKind::StateVariables => 4,
            TextKind::RunVariables => 5,
            TextKind::Documentation => 6,
        }
    }

    /// Inverse of [`TextKind::code`]
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            4 => Some(TextKind::StateVariables),
            5 => Some(TextKind::RunVariables),
            6 => Some(TextKind::Documentation),
            _ => None,
        }
    }
}

impl std::fmt::Display for TextKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TextKind::Documentation => write!(f, "Documentation"),
            TextKind::RunVariables => write!(f, "Run variables"),
            TextKind::StateVariables => write!(f, "State variables"),
        }
    }
}

/// Snapshot of pipeline statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Device buffers carrying data, including drained ones
    pub buffers_read: u64,
    /// Buffers forwarded while draining the device
    pub drained_buffers: u64,
    /// Device reads that timed out
    pub read_timeouts: u64,
    /// Longest run of consecutive read timeouts
    pub max_consecutive_timeouts: u64,
    /// Words read from the device
    pub words_read: u64,
    /// Buffers the formatter has processed (all types)
    pub buffers_processed: u64,
    /// Physics events committed
    pub physics_events: u64,
    /// Scaler records committed
    pub scaler_records: u64,
    /// Count records committed
    pub count_records: u64,
    /// Text records committed
    pub text_records: u64,
    /// Monitor entries forwarded
    pub monitor_entries: u64,
    /// Event buffers discarded as malformed
    pub malformed_buffers: u64,
    /// Partial events flushed early (overflow or end of run)
    pub partial_flushes: u64,
    /// Segments dropped because they exceed the assembly capacity
    pub oversize_segments: u64,
    /// Records the sink failed to accept
    pub sink_errors: u64,
    /// Times the worker had to wait for the formatter to free a buffer
    pub pool_waits: u64,
}

/// Lock-free statistics counters shared between threads
#[derive(Debug, Default)]
pub struct StatsCounters {
    pub buffers_read: AtomicU64,
    pub drained_buffers: AtomicU64,
    pub read_timeouts: AtomicU64,
    pub max_consecutive_timeouts: AtomicU64,
    pub words_read: AtomicU64,
    pub buffers_processed: AtomicU64,
    pub physics_events: AtomicU64,
    pub scaler_records: AtomicU64,
    pub count_records: AtomicU64,
    pub text_records: AtomicU64,
    pub monitor_entries: AtomicU64,
    pub malformed_buffers: AtomicU64,
    pub partial_flushes: AtomicU64,
    pub oversize_segments: AtomicU64,
    pub sink_errors: AtomicU64,
    pub pool_waits: AtomicU64,
}

impl StatsCounters {
    /// Increment a counter by one
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n` to a counter
    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Record a consecutive-timeout streak length
    pub fn observe_timeout_streak(&self, streak: u64) {
        self.max_consecutive_timeouts
            .fetch_max(streak, Ordering::Relaxed);
    }

    /// Take a consistent-enough snapshot for reporting
    pub fn snapshot(&self) -> PipelineStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineStats {
            buffers_read: load(&self.buffers_read),
            drained_buffers: load(&self.drained_buffers),
            read_timeouts: load(&self.read_timeouts),
            max_consecutive_timeouts: load(&self.max_consecutive_timeouts),
            words_read: load(&self.words_read),
            buffers_processed: load(&self.buffers_processed),
            physics_events: load(&self.physics_events),
            scaler_records: load(&self.scaler_records),
            count_records: load(&self.count_records),
            text_records: load(&self.text_records),
            monitor_entries: load(&self.monitor_entries),
            malformed_buffers: load(&self.malformed_buffers),
            partial_flushes: load(&self.partial_flushes),
            oversize_segments: load(&self.oversize_segments),
            sink_errors: load(&self.sink_errors),
            pool_waits: load(&self.pool_waits),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_kind_codes_round_trip() {
        for kind in [
            TextKind::Documentation,
            TextKind::RunVariables,
            TextKind::StateVariables,
        ] {
            assert_eq!(TextKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(TextKind::from_code(1), None);
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = StatsCounters::default();
        StatsCounters::bump(&stats.buffers_read);
        StatsCounters::add(&stats.words_read, 128);
        stats.observe_timeout_streak(3);
        stats.observe_timeout_streak(2);

        let snap = stats.snapshot();
        assert_eq!(snap.buffers_read, 1);
        assert_eq!(snap.words_read, 128);
        assert_eq!(snap.max_consecutive_timeouts, 3);
        assert_eq!(snap.physics_events, 0);
    }
}
