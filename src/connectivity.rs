//! Link readiness.
//!
//! Bringing the radio up, associating and provisioning credentials happen outside
//! this crate. The upload path only needs two answers: is the link usable right now,
//! and can an attempt to bring it up be made. [`ConnectivitySupervisor`] is that
//! seam. A caller whose request died in transport reports it with
//! [`ConnectivitySupervisor::mark_down`], so readiness never outlives the link.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

/// Why the link could not be brought up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The attempt did not finish in time.
    #[error("connection attempt timed out")]
    Timeout,
    /// The target could not be reached.
    #[error("unreachable: {0}")]
    Unreachable(String),
}

/// Network readiness as seen by the upload worker.
#[async_trait]
pub trait ConnectivitySupervisor: Send + Sync {
    /// Cheap, non-blocking readiness check.
    fn is_ready(&self) -> bool;

    /// Try to bring the link up. Bounded in time; never retries internally.
    async fn ensure_connected(&self) -> Result<(), ConnectError>;

    /// A request failed in transport; treat the link as down until the next
    /// successful `ensure_connected`.
    fn mark_down(&self) {}
}

/// A link that is always up. Used on hosts with their own network management.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReady;

#[async_trait]
impl ConnectivitySupervisor for AlwaysReady {
    fn is_ready(&self) -> bool {
        true
    }

    async fn ensure_connected(&self) -> Result<(), ConnectError> {
        Ok(())
    }
}

/// Reports "not ready" for the first `n` readiness checks, then ready.
/// [`ConnectivitySupervisor::mark_down`] starts a one-check outage.
///
/// Used by bench runs and tests to reproduce an outage of known length.
#[derive(Debug)]
pub struct ScriptedConnectivity {
    remaining_down: AtomicU32,
    connect_calls: AtomicU32,
    down_marks: AtomicU32,
}

impl ScriptedConnectivity {
    /// Down for `not_ready_checks` calls to [`ConnectivitySupervisor::is_ready`].
    pub fn down_for(not_ready_checks: u32) -> Self {
        Self {
            remaining_down: AtomicU32::new(not_ready_checks),
            connect_calls: AtomicU32::new(0),
            down_marks: AtomicU32::new(0),
        }
    }

    /// Number of `ensure_connected` calls seen.
    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of `mark_down` calls seen.
    pub fn down_marks(&self) -> u32 {
        self.down_marks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivitySupervisor for ScriptedConnectivity {
    fn is_ready(&self) -> bool {
        self.remaining_down
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
    }

    async fn ensure_connected(&self) -> Result<(), ConnectError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.remaining_down.load(Ordering::SeqCst) == 0 {
            Ok(())
        } else {
            Err(ConnectError::Unreachable("scripted outage".to_string()))
        }
    }

    fn mark_down(&self) {
        self.down_marks.fetch_add(1, Ordering::SeqCst);
        self.remaining_down.fetch_max(1, Ordering::SeqCst);
    }
}

/// Readiness from a TCP connect probe against the remote API host.
///
/// `is_ready` returns the result of the last probe; `ensure_connected` runs a new one.
#[derive(Debug)]
pub struct TcpProbeSupervisor {
    target: String,
    timeout: Duration,
    ready: AtomicBool,
}

impl TcpProbeSupervisor {
    /// Probe `target` (`host:port`) with the given connect timeout.
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
            ready: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ConnectivitySupervisor for TcpProbeSupervisor {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn ensure_connected(&self) -> Result<(), ConnectError> {
        let result = match tokio::time::timeout(self.timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(ConnectError::Unreachable(format!("{}: {e}", self.target))),
            Err(_) => Err(ConnectError::Timeout),
        };
        let up = result.is_ok();
        if self.ready.swap(up, Ordering::AcqRel) != up {
            if up {
                tracing::info!(addr = %self.target, "Link up");
            } else {
                tracing::warn!(addr = %self.target, "Link down");
            }
        }
        result
    }

    fn mark_down(&self) {
        if self.ready.swap(false, Ordering::AcqRel) {
            tracing::warn!(addr = %self.target, "Link down");
        }
    }
}
