//! Station diagnostics for unattended operation.
//!
//! [`Diagnostics`] is the operator-visible channel of the pipeline. It tracks:
//! - counters for every degraded-but-handled condition (debounce, deferrals, retries)
//! - a bounded history of faults with severity
//! - a latched fatal flag that only an operator clears
//!
//! Every fault is logged through `tracing` and forwarded to the local status sink, so
//! a dropped edge or a permanently failed upload always leaves a persistent signal
//! distinct from normal operation.

use crate::status::StatusSink;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Fault severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Informational.
    Info = 0,
    /// Degraded but functional.
    Warning = 1,
    /// A record needs operator attention.
    Error = 2,
    /// Mission impact: a detection may have been lost.
    Critical = 3,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Interrupt handoff overflowed and edges were dropped.
    SignalBacklog,
    /// The remote store refused a record.
    RemoteRejection,
    /// A record ran out of retries.
    DeliveryExhausted,
    /// A persisted record was unreadable and quarantined.
    StorageCorruption,
    /// Durable storage failed to write.
    StorageFailure,
}

/// One reported fault.
#[derive(Debug, Clone)]
pub struct Fault {
    /// Category.
    pub kind: FaultKind,
    /// Severity.
    pub severity: Severity,
    /// Reporting component.
    pub component: String,
    /// Human-readable message.
    pub message: String,
    /// When it was reported.
    pub at: DateTime<Utc>,
}

impl Fault {
    /// New fault stamped now.
    pub fn new(
        kind: FaultKind,
        severity: Severity,
        component: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            component: component.into(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Overall station health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemHealth {
    /// Nothing outstanding.
    Healthy,
    /// Warnings or errors in recent history.
    Degraded,
    /// A critical fault is latched.
    Critical,
}

/// Counter snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// BIST results discarded because a detector edge shared the window.
    pub bist_suppressed: u64,
    /// Edges lost to handoff backlog.
    pub edges_dropped: u64,
    /// Upload attempts deferred because the link was down.
    pub connectivity_deferrals: u64,
    /// Retryable remote failures.
    pub retryable_failures: u64,
    /// Entries moved to `FailedPermanent`.
    pub permanent_failures: u64,
    /// Entries delivered.
    pub delivered: u64,
    /// Persisted records quarantined.
    pub quarantined: u64,
    /// Status sink calls that failed.
    pub status_sink_failures: u64,
    /// Heartbeat updates that failed.
    pub heartbeat_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    bist_suppressed: AtomicU64,
    edges_dropped: AtomicU64,
    connectivity_deferrals: AtomicU64,
    retryable_failures: AtomicU64,
    permanent_failures: AtomicU64,
    delivered: AtomicU64,
    quarantined: AtomicU64,
    status_sink_failures: AtomicU64,
    heartbeat_failures: AtomicU64,
}

/// Countable conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// See [`CounterSnapshot::bist_suppressed`].
    BistSuppressed,
    /// See [`CounterSnapshot::edges_dropped`].
    EdgesDropped,
    /// See [`CounterSnapshot::connectivity_deferrals`].
    ConnectivityDeferrals,
    /// See [`CounterSnapshot::retryable_failures`].
    RetryableFailures,
    /// See [`CounterSnapshot::permanent_failures`].
    PermanentFailures,
    /// See [`CounterSnapshot::delivered`].
    Delivered,
    /// See [`CounterSnapshot::quarantined`].
    Quarantined,
    /// See [`CounterSnapshot::status_sink_failures`].
    StatusSinkFailures,
    /// See [`CounterSnapshot::heartbeat_failures`].
    HeartbeatFailures,
}

/// Diagnostics configuration.
#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    /// Faults kept in history.
    pub max_fault_history: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            max_fault_history: 256,
        }
    }
}

/// Operator-visible diagnostic channel.
pub struct Diagnostics {
    counters: Counters,
    faults: Mutex<VecDeque<Fault>>,
    fatal: AtomicBool,
    sink: RwLock<Option<Arc<dyn StatusSink>>>,
    config: DiagnosticsConfig,
}

impl Diagnostics {
    /// Empty diagnostics with the given configuration.
    pub fn new(config: DiagnosticsConfig) -> Self {
        Self {
            counters: Counters::default(),
            faults: Mutex::new(VecDeque::new()),
            fatal: AtomicBool::new(false),
            sink: RwLock::new(None),
            config,
        }
    }

    /// Forward faults to `sink` as well as the log.
    pub fn attach_sink(&self, sink: Arc<dyn StatusSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Add `by` to a counter.
    pub fn increment(&self, counter: Counter, by: u64) {
        let c = &self.counters;
        let cell = match counter {
            Counter::BistSuppressed => &c.bist_suppressed,
            Counter::EdgesDropped => &c.edges_dropped,
            Counter::ConnectivityDeferrals => &c.connectivity_deferrals,
            Counter::RetryableFailures => &c.retryable_failures,
            Counter::PermanentFailures => &c.permanent_failures,
            Counter::Delivered => &c.delivered,
            Counter::Quarantined => &c.quarantined,
            Counter::StatusSinkFailures => &c.status_sink_failures,
            Counter::HeartbeatFailures => &c.heartbeat_failures,
        };
        cell.fetch_add(by, Ordering::Relaxed);
    }

    /// Current counters.
    pub fn counters(&self) -> CounterSnapshot {
        let c = &self.counters;
        CounterSnapshot {
            bist_suppressed: c.bist_suppressed.load(Ordering::Relaxed),
            edges_dropped: c.edges_dropped.load(Ordering::Relaxed),
            connectivity_deferrals: c.connectivity_deferrals.load(Ordering::Relaxed),
            retryable_failures: c.retryable_failures.load(Ordering::Relaxed),
            permanent_failures: c.permanent_failures.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            quarantined: c.quarantined.load(Ordering::Relaxed),
            status_sink_failures: c.status_sink_failures.load(Ordering::Relaxed),
            heartbeat_failures: c.heartbeat_failures.load(Ordering::Relaxed),
        }
    }

    /// Record a fault: log it, keep it, latch it if critical, forward it.
    pub fn report(&self, fault: Fault) {
        match fault.severity {
            Severity::Critical | Severity::Error => tracing::error!(
                component = %fault.component,
                severity = %fault.severity,
                kind = ?fault.kind,
                "{}",
                fault.message
            ),
            Severity::Warning => tracing::warn!(
                component = %fault.component,
                kind = ?fault.kind,
                "{}",
                fault.message
            ),
            Severity::Info => tracing::info!(
                component = %fault.component,
                kind = ?fault.kind,
                "{}",
                fault.message
            ),
        }

        if fault.severity >= Severity::Error {
            self.fatal.store(true, Ordering::Release);
        }

        if let Some(sink) = self.sink.read().clone() {
            if let Err(e) = sink.fault(&fault) {
                self.increment(Counter::StatusSinkFailures, 1);
                tracing::warn!(error = %e, "status sink rejected fault");
            }
        }

        let mut faults = self.faults.lock();
        faults.push_back(fault);
        while faults.len() > self.config.max_fault_history {
            faults.pop_front();
        }
    }

    /// Fault history, oldest first.
    pub fn faults(&self) -> Vec<Fault> {
        self.faults.lock().iter().cloned().collect()
    }

    /// Whether an unacknowledged fatal condition exists.
    pub fn is_fatal_latched(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    /// Operator acknowledgement.
    pub fn acknowledge(&self) {
        self.fatal.store(false, Ordering::Release);
        self.faults.lock().clear();
    }

    /// Health rollup.
    pub fn system_health(&self) -> SystemHealth {
        let faults = self.faults.lock();
        let worst = faults.iter().map(|f| f.severity).max();
        match worst {
            Some(Severity::Critical) => SystemHealth::Critical,
            Some(Severity::Error) | Some(Severity::Warning) => SystemHealth::Degraded,
            _ => SystemHealth::Healthy,
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(DiagnosticsConfig::default())
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("counters", &self.counters())
            .field("fatal", &self.is_fatal_latched())
            .finish()
    }
}
