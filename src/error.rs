//! Custom error types for the station.
//!
//! This module defines the primary error type, `BhangError`, used across the capture
//! and delivery pipeline. Using the `thiserror` crate, it gives one consistent way to
//! report everything from a dropped interrupt edge to a corrupt queue file.
//!
//! ## Error Hierarchy
//!
//! - **`SignalBacklog`**: the interrupt handoff ring was full and an edge was dropped.
//!   Fatal to the mission and never retried, because the edge is gone.
//! - **`StorageCorruption`**: an unreadable persisted record. The file is quarantined
//!   and the rest of the queue keeps operating.
//! - **`InvalidTransition`** / **`EntryNotFound`**: misuse of the queue state machine.
//! - **`Io`**, **`Serialization`**, **`Config`**, **`Configuration`**, **`TimeSync`**:
//!   ambient failures.
//!
//! Link and remote-store failures never become a `BhangError`: the upload worker
//! folds `ConnectError` and `RemoteError` into its step outcome and the diagnostic
//! counters.
//!
//! By using `#[from]`, `BhangError` can be created from the underlying error types,
//! so the `?` operator works across module boundaries.

use crate::queue::EntryState;
use crate::signal::EdgeSource;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the station error type.
pub type AppResult<T> = std::result::Result<T, BhangError>;

/// Primary error type for the station.
#[derive(Error, Debug)]
pub enum BhangError {
    /// Edges were dropped because the classifier fell behind the interrupt handler.
    #[error("Signal backlog: {dropped} edge(s) dropped on the {line} line")]
    SignalBacklog {
        /// Line the last dropped edge arrived on.
        line: EdgeSource,
        /// Number of edges dropped since the last report.
        dropped: u64,
    },

    /// A persisted record could not be trusted.
    #[error("Storage corruption in {path:?}: {reason}")]
    StorageCorruption {
        /// Offending file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// A queue entry was asked to make a transition its state does not allow.
    #[error("Queue entry {sequence} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Sequence number of the entry.
        sequence: u64,
        /// Current state.
        from: EntryState,
        /// Requested state.
        to: EntryState,
    },

    /// No queue entry with this sequence number.
    #[error("Queue entry {0} not found")]
    EntryNotFound(u64),

    /// Standard I/O failure (filesystem, sockets).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but holds values that make no sense.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Wall-clock synchronisation failed.
    #[error("Time sync error: {0}")]
    TimeSync(String),
}

impl From<figment::Error> for BhangError {
    fn from(value: figment::Error) -> Self {
        BhangError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backlog_message_names_line_and_count() {
        let err = BhangError::SignalBacklog {
            line: EdgeSource::Detector,
            dropped: 2,
        };
        assert_eq!(
            err.to_string(),
            "Signal backlog: 2 edge(s) dropped on the detector line"
        );
    }

    #[test]
    fn figment_errors_convert() {
        let err: BhangError = figment::Error::from("bad value".to_string()).into();
        assert!(err.to_string().starts_with("Configuration error"));
    }

    #[test]
    fn invalid_transition_formats_states() {
        let err = BhangError::InvalidTransition {
            sequence: 7,
            from: EntryState::Delivered,
            to: EntryState::InFlight,
        };
        assert_eq!(
            err.to_string(),
            "Queue entry 7 cannot move from DELIVERED to IN_FLIGHT"
        );
    }
}
