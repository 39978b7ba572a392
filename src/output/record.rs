//! Typed records committed to the sink

use crate::types::TextKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which run-state change a state record marks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateChangeKind {
    Begin,
    End,
    Pause,
    Resume,
}

impl std::fmt::Display for StateChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateChangeKind::Begin => write!(f, "Begin run"),
            StateChangeKind::End => write!(f, "End run"),
            StateChangeKind::Pause => write!(f, "Pause run"),
            StateChangeKind::Resume => write!(f, "Resume run"),
        }
    }
}

/// A self-describing output record
///
/// Every variant carries the run number stamped on the buffer it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutputRecord {
    /// Run-state change
    StateChange {
        kind: StateChangeKind,
        run_number: u32,
        title: String,
        /// Seconds since the run began
        elapsed_seconds: u64,
        wall_clock: DateTime<Utc>,
    },
    /// One fully assembled physics event
    PhysicsEvent { run_number: u32, payload: Vec<u8> },
    /// Counter readout covering `[interval_start, interval_end)` seconds into
    /// the run
    Scaler {
        run_number: u32,
        interval_start: u64,
        interval_end: u64,
        wall_clock: DateTime<Utc>,
        counters: Vec<u32>,
    },
    /// Running physics event count
    Count {
        run_number: u32,
        events_so_far: u64,
        /// Seconds since the run began
        run_offset: u64,
    },
    /// String list (documentation, run or state variables)
    Text {
        run_number: u32,
        kind: TextKind,
        strings: Vec<String>,
    },
}

impl OutputRecord {
    pub fn run_number(&self) -> u32 {
        match self {
            OutputRecord::StateChange { run_number, .. }
            | OutputRecord::PhysicsEvent { run_number, .. }
            | OutputRecord::Scaler { run_number, .. }
            | OutputRecord::Count { run_number, .. }
            | OutputRecord::Text { run_number, .. } => *run_number,
        }
    }

    /// Variant name for logs
    pub fn kind_name(&self) -> &'static str {
        match self {
            OutputRecord::StateChange { .. } => "StateChange",
            OutputRecord::PhysicsEvent { .. } => "PhysicsEvent",
            OutputRecord::Scaler { .. } => "Scaler",
            OutputRecord::Count { .. } => "Count",
            OutputRecord::Text { .. } => "Text",
        }
    }

    /// State-change kind, if this is a state record
    pub fn state_change(&self) -> Option<StateChangeKind> {
        match self {
            OutputRecord::StateChange { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
