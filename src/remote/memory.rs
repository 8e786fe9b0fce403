//! In-process document store for tests and bench runs.

use super::{
    CommitOutcome, Heartbeat, RemoteError, RemoteStore, StationDocument, StationIdentity,
};
use crate::event::EventRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

/// Failure to inject into the next commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedFault {
    /// Fail with [`RemoteError::Unreachable`] without writing.
    Unreachable(String),
    /// Fail with [`RemoteError::Retryable`] without writing.
    Retryable(String),
    /// Fail with [`RemoteError::Rejected`] without writing.
    Rejected(u16, String),
    /// Write the record, then report a timeout as if the acknowledgement was lost.
    CommitThenTimeout,
}

/// [`RemoteStore`] holding the document in memory with the same merge rules as the
/// real store.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    identity: StationIdentity,
    document: Mutex<StationDocument>,
    faults: Mutex<VecDeque<ScriptedFault>>,
    commit_calls: AtomicU32,
    writes: AtomicU32,
}

impl MemoryDocumentStore {
    /// Empty document for `identity`.
    pub fn new(identity: StationIdentity) -> Self {
        Self {
            identity,
            ..Default::default()
        }
    }

    /// Queue a fault for the next commit call. Faults are consumed in order.
    pub fn push_fault(&self, fault: ScriptedFault) {
        self.faults.lock().push_back(fault);
    }

    /// Copy of the current document.
    pub fn document(&self) -> StationDocument {
        self.document.lock().clone()
    }

    /// Commit calls seen, including failed ones.
    pub fn commit_calls(&self) -> u32 {
        self.commit_calls.load(Ordering::SeqCst)
    }

    /// Successful document writes.
    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for MemoryDocumentStore {
    async fn commit(&self, record: &EventRecord) -> Result<CommitOutcome, RemoteError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        let fault = self.faults.lock().pop_front();
        let lose_ack = matches!(fault, Some(ScriptedFault::CommitThenTimeout));

        match fault {
            Some(ScriptedFault::Unreachable(message)) => return Err(RemoteError::Unreachable(message)),
            Some(ScriptedFault::Retryable(message)) => return Err(RemoteError::Retryable(message)),
            Some(ScriptedFault::Rejected(status, message)) => {
                return Err(RemoteError::Rejected { status, message })
            }
            Some(ScriptedFault::CommitThenTimeout) | None => {}
        }

        let mut document = self.document.lock();
        if !document.append_event(record) {
            return Ok(CommitOutcome::AlreadyPresent);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);

        if lose_ack {
            return Err(RemoteError::Unreachable("request timed out".to_string()));
        }
        Ok(CommitOutcome::Created)
    }

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), RemoteError> {
        self.document.lock().apply_heartbeat(heartbeat, &self.identity);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
