//! Error handling for the readout pipeline
//!
//! This module defines the crate-wide error type and a Result alias used by
//! the buffer pool, the acquisition worker, the output formatter and the
//! record sinks.

use crate::acquisition::run_state::RunState;
use thiserror::Error;

/// Main error type for readout operations
#[derive(Error, Debug)]
pub enum ReadoutError {
    /// A run-state change that is not in the transition table
    #[error("Invalid run-state transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    /// Errors reported by the device collaborator
    #[error("Device error: {0}")]
    Device(String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// A control request arrived in a wait state that does not accept it
    #[error("Protocol violation: unexpected {request} while {context}")]
    Protocol {
        request: &'static str,
        context: &'static str,
    },

    /// Raw device buffer whose structure does not match its header
    #[error("Malformed buffer: {0}")]
    MalformedBuffer(String),

    /// Data that does not fit into a fixed-capacity buffer
    #[error("Buffer overflow: need {needed} words, capacity {capacity}")]
    BufferOverflow { needed: usize, capacity: usize },

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Errors raised by a record sink
    #[error("Sink error: {0}")]
    Sink(String),

    /// The operation needs an active run
    #[error("No run in progress")]
    NotRunning,

    /// The operation is only allowed while no run is open
    #[error("Run in progress (state {0})")]
    RunInProgress(RunState),

    /// The device is currently lent out to the control thread
    #[error("Device is lent out; release it first")]
    DeviceLeased,

    /// The device handle is not available (lost after a failed run)
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<ReadoutError>,
    },
}

impl ReadoutError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        ReadoutError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error ends the current run when raised by the device
    pub fn is_fatal_to_run(&self) -> bool {
        match self {
            ReadoutError::Timeout(_) | ReadoutError::MalformedBuffer(_) => false,
            ReadoutError::WithContext { source, .. } => source.is_fatal_to_run(),
            _ => true,
        }
    }
}

/// Result type alias for readout operations
pub type Result<T> = std::result::Result<T, ReadoutError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| ReadoutError::Io(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| ReadoutError::Io(e).with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ReadoutError::Device("bus error".to_string());
        assert_eq!(err.to_string(), "Device error: bus error");
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = ReadoutError::InvalidTransition {
            from: RunState::Idle,
            to: RunState::Active,
        };
        assert_eq!(
            err.to_string(),
            "Invalid run-state transition: Idle -> Active"
        );
    }

    #[test]
    fn test_error_with_context() {
        let err = ReadoutError::Sink("disk full".to_string());
        let with_ctx = err.with_context("Failed to commit record");
        assert!(with_ctx.to_string().contains("Failed to commit record"));
        assert!(with_ctx.is_fatal_to_run());
    }

    #[test]
    fn test_timeouts_are_not_fatal() {
        assert!(!ReadoutError::Timeout("read".into()).is_fatal_to_run());
        let wrapped = ReadoutError::Timeout("read".into()).with_context("drain");
        assert!(!wrapped.is_fatal_to_run());
    }

    #[test]
    fn test_io_context() {
        let res: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        let err = res.context("Opening output").unwrap_err();
        assert!(err.to_string().starts_with("Opening output"));
    }
}
