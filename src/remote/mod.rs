//! Remote JSON document store.
//!
//! Delivered events end up in one JSON document per station. The document is shared
//! with the periodic heartbeat, so every write is a read-modify-write that preserves
//! fields this crate does not own.
//!
//! The upload worker sees the store only through [`RemoteStore`]. Implementations
//! must make [`RemoteStore::commit`] idempotent on `event_id`: committing a record
//! whose id is already present returns [`CommitOutcome::AlreadyPresent`] without
//! writing, which is what makes a retry after an unacknowledged success harmless.

mod document;
mod github;
mod memory;

pub use document::{StationDocument, StationIdentity};
pub use github::{classify_status, GitHubContentStore, GitHubTarget, RequestKind};
pub use memory::{MemoryDocumentStore, ScriptedFault};

use crate::event::EventRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The record was written.
    Created,
    /// A record with the same `event_id` was already there; nothing written.
    AlreadyPresent,
}

/// Failure talking to the remote store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The request never got an answer: connect failure, reset or timeout. Says
    /// more about the link than about the record.
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    /// Throttling, a write conflict or a server-side error. Try again later.
    #[error("retryable remote failure: {0}")]
    Retryable(String),
    /// The store refused the request; retrying the same request will not help.
    #[error("remote rejected request (status {status}): {message}")]
    Rejected {
        /// HTTP status, or 0 for a rejection not tied to a response code.
        status: u16,
        /// Reason.
        message: String,
    },
}

/// Periodic "still monitoring" update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    /// Time of the update.
    pub at: DateTime<Utc>,
    /// Whether this station has ever recorded a NED.
    pub ned_seen: bool,
}

/// Durable remote sink for event records.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Append `record` unless a record with the same `event_id` already exists.
    async fn commit(&self, record: &EventRecord) -> Result<CommitOutcome, RemoteError>;

    /// Apply a heartbeat to the station document.
    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), RemoteError>;
}
