//! Run-state machine shared by the control thread, the acquisition worker
//! and the output formatter.
//!
//! The state lives behind a mutex with a condition variable so that any
//! thread can read it, validated transitions can be applied from any thread,
//! and the control thread can block until the worker or the formatter
//! confirms a change.
//!
//! ```text
//! Idle ─► Starting ─► Active ─► Pausing ─► Paused ─► Resuming ─┐
//!  ▲                    ▲  │                  │                │
//!  │                    └──┼──────────────────┼────────────────┘
//!  │                       ▼                  │
//!  ├──────────────── Stopping ◄───────────────┘
//!  │                    │
//!  └────── Ending ◄─────┘
//! ```

use crate::error::{ReadoutError, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// State of the current run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RunState {
    /// No run in progress
    #[default]
    Idle,
    /// Begin requested, worker is bringing the device up
    Starting,
    /// Acquisition running
    Active,
    /// Pause requested, worker is stopping the device
    Pausing,
    /// Acquisition stopped, run still open
    Paused,
    /// End requested, worker is stopping and draining
    Stopping,
    /// Resume requested, worker is restarting the device
    Resuming,
    /// Worker has finished, output is being flushed
    Ending,
}

impl RunState {
    /// All states, in declaration order
    pub const ALL: [RunState; 8] = [
        RunState::Idle,
        RunState::Starting,
        RunState::Active,
        RunState::Pausing,
        RunState::Paused,
        RunState::Stopping,
        RunState::Resuming,
        RunState::Ending,
    ];

    /// Whether `self -> next` is in the transition table
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Active)
                | (Active, Pausing)
                | (Pausing, Paused)
                | (Paused, Resuming)
                | (Resuming, Active)
                | (Active, Stopping)
                | (Paused, Stopping)
                | (Stopping, Idle)
                | (Stopping, Ending)
                | (Ending, Idle)
        )
    }

    /// Whether a run is open (anything but Idle)
    pub fn is_running(self) -> bool {
        self != RunState::Idle
    }

    /// Display name for the state
    pub fn display_name(&self) -> &'static str {
        match self {
            RunState::Idle => "Idle",
            RunState::Starting => "Starting",
            RunState::Active => "Active",
            RunState::Pausing => "Pausing",
            RunState::Paused => "Paused",
            RunState::Stopping => "Stopping",
            RunState::Resuming => "Resuming",
            RunState::Ending => "Ending",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Identity of the run the state machine is tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunInfo {
    /// Run number stamped on every buffer captured during the run
    pub run_number: u32,
    /// Free-form run title
    pub title: String,
}

impl Default for RunInfo {
    fn default() -> Self {
        Self {
            run_number: 0,
            title: String::from("Untitled run"),
        }
    }
}

#[derive(Debug)]
struct RunStatus {
    state: RunState,
    info: RunInfo,
}

/// Guarded run state plus the legal-transition table
#[derive(Debug)]
pub struct RunStateMachine {
    status: Mutex<RunStatus>,
    changed: Condvar,
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new(RunInfo::default())
    }
}

impl RunStateMachine {
    /// Create a state machine in the Idle state
    pub fn new(info: RunInfo) -> Self {
        Self {
            status: Mutex::new(RunStatus {
                state: RunState::Idle,
                info,
            }),
            changed: Condvar::new(),
        }
    }

    // A panicking holder cannot leave the state half-written, so a poisoned
    // lock is still usable.
    fn lock(&self) -> MutexGuard<'_, RunStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state
    pub fn state(&self) -> RunState {
        self.lock().state
    }

    /// Apply a transition from the table, returning the previous state
    ///
    /// Transitions not in the table fail with `InvalidTransition` and leave
    /// the state unchanged.
    pub fn transition(&self, next: RunState) -> Result<RunState> {
        let mut status = self.lock();
        let from = status.state;
        if !from.can_transition_to(next) {
            return Err(ReadoutError::InvalidTransition { from, to: next });
        }
        status.state = next;
        drop(status);
        tracing::debug!(%from, to = %next, "Run state changed");
        self.changed.notify_all();
        Ok(from)
    }

    /// Apply a transition only if the current state is `expected`
    pub fn transition_from(&self, expected: RunState, next: RunState) -> Result<()> {
        let mut status = self.lock();
        let from = status.state;
        if from != expected || !from.can_transition_to(next) {
            return Err(ReadoutError::InvalidTransition { from, to: next });
        }
        status.state = next;
        drop(status);
        tracing::debug!(%from, to = %next, "Run state changed");
        self.changed.notify_all();
        Ok(())
    }

    /// Failure path: return to Idle from any state
    ///
    /// Used when a device error ends the run outside the normal
    /// Stopping/Ending sequence.
    pub fn abort(&self) -> RunState {
        let mut status = self.lock();
        let from = status.state;
        status.state = RunState::Idle;
        drop(status);
        if from != RunState::Idle {
            tracing::warn!(%from, "Run aborted, state forced to Idle");
        }
        self.changed.notify_all();
        from
    }

    /// Block while `pred(state)` holds, up to `timeout`
    ///
    /// Returns the state observed when the wait ended.
    pub fn wait_while<F>(&self, mut pred: F, timeout: Duration) -> RunState
    where
        F: FnMut(RunState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut status = self.lock();
        while pred(status.state) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(status, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            status = guard;
        }
        status.state
    }

    /// Block until the state equals `target`, up to `timeout`
    pub fn wait_for(&self, target: RunState, timeout: Duration) -> bool {
        self.wait_while(|s| s != target, timeout) == target
    }

    /// Snapshot of the run identity
    pub fn run_info(&self) -> RunInfo {
        self.lock().info.clone()
    }

    /// Replace the run identity; only allowed while Idle
    pub fn set_run_info(&self, info: RunInfo) -> Result<()> {
        let mut status = self.lock();
        if status.state != RunState::Idle {
            return Err(ReadoutError::RunInProgress(status.state));
        }
        status.info = info;
        Ok(())
    }
}
