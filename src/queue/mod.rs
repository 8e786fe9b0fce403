//! Durable, ordered delivery queue.
//!
//! [`DeliveryQueue`] is the single writer of persisted state: the sequence counter
//! and the set of [`QueueEntry`] records. The classifier only calls
//! [`DeliveryQueue::allocate_sequence`] and [`DeliveryQueue::enqueue`]; the upload
//! worker only moves entries through the state machine below. Neither touches the
//! filesystem.
//!
//! ```text
//!            mark_in_flight              mark_delivered
//!  PENDING ─────────────────► IN_FLIGHT ───────────────► DELIVERED (pruned)
//!     ▲   ◄───────────────────    │
//!     │    mark_failed(false)     │ mark_failed(true)
//!     │    release_in_flight      │
//!     │    stuck timeout / reboot ▼
//!     └──── requeue_failed ── FAILED_PERMANENT (kept for inspection)
//! ```
//!
//! Every mutation is written to storage before the in-memory view changes and before
//! the call returns, so a successful return is the durability boundary.
//!
//! # Example
//! ```no_run
//! use bhangmeter::clock::Tick;
//! use bhangmeter::event::Event;
//! use bhangmeter::health::Diagnostics;
//! use bhangmeter::queue::{DeliveryQueue, DEFAULT_STUCK_IN_FLIGHT};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let diagnostics = Arc::new(Diagnostics::new(Default::default()));
//! let queue = DeliveryQueue::open("data/queue", DEFAULT_STUCK_IN_FLIGHT, diagnostics).await?;
//! let sequence = queue.allocate_sequence().await?;
//! queue
//!     .enqueue(Event::ned("kx1", sequence, Tick(1000), chrono::Utc::now(), false))
//!     .await?;
//! # Ok::<(), bhangmeter::BhangError>(())
//! # });
//! ```

mod storage;

pub use storage::{LoadReport, Quarantined, QueueStore};

use crate::error::{AppResult, BhangError};
use crate::event::Event;
use crate::health::{Counter, Diagnostics, Fault, FaultKind, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// Default time after which an `InFlight` entry is presumed abandoned.
pub const DEFAULT_STUCK_IN_FLIGHT: Duration = Duration::from_secs(120);

/// Delivery state of a queued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryState {
    /// Waiting to be uploaded.
    Pending,
    /// An upload is in progress.
    InFlight,
    /// Committed remotely.
    Delivered,
    /// Given up on; kept for manual inspection.
    FailedPermanent,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntryState::Pending => "PENDING",
            EntryState::InFlight => "IN_FLIGHT",
            EntryState::Delivered => "DELIVERED",
            EntryState::FailedPermanent => "FAILED_PERMANENT",
        };
        write!(f, "{label}")
    }
}

/// A queued event and its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// The event to deliver.
    pub event: Event,
    /// Delivery state.
    pub state: EntryState,
    /// Delivery attempts, including ones deferred for lack of connectivity.
    pub attempts: u32,
    /// Retryable remote failures; drives the give-up rule.
    #[serde(default)]
    pub failures: u32,
    /// Time of the last attempt.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Reason for the last failure or deferral.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Time the entry was persisted.
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    fn new(event: Event) -> Self {
        Self {
            event,
            state: EntryState::Pending,
            attempts: 0,
            failures: 0,
            last_attempt_at: None,
            last_error: None,
            enqueued_at: Utc::now(),
        }
    }

    /// Sequence number of the queued event.
    pub fn sequence(&self) -> u64 {
        self.event.sequence
    }
}

/// Result of [`DeliveryQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Persisted as a new entry.
    Added,
    /// An entry with this sequence already exists (or was delivered); nothing written.
    Duplicate,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: BTreeMap<u64, QueueEntry>,
    in_flight_since: HashMap<u64, Instant>,
    delivered: BTreeSet<u64>,
    last_sequence: u64,
}

/// The station's durable outbox.
pub struct DeliveryQueue {
    store: QueueStore,
    state: Mutex<QueueState>,
    notify: Notify,
    stuck_timeout: Duration,
    diagnostics: Arc<Diagnostics>,
}

impl DeliveryQueue {
    /// Open (or create) the queue in `dir`.
    ///
    /// Unreadable files are quarantined and reported; entries left `InFlight` by a
    /// previous boot are returned to `Pending`.
    pub async fn open(
        dir: impl Into<PathBuf>,
        stuck_timeout: Duration,
        diagnostics: Arc<Diagnostics>,
    ) -> AppResult<Self> {
        let store = QueueStore::open(dir).await?;
        let report = store.load().await?;

        for q in &report.quarantined {
            diagnostics.increment(Counter::Quarantined, 1);
            let err = BhangError::StorageCorruption {
                path: q.original.clone(),
                reason: q.reason.clone(),
            };
            diagnostics.report(Fault::new(
                FaultKind::StorageCorruption,
                Severity::Error,
                "queue",
                format!("{err}; moved to {:?}", q.moved_to),
            ));
        }
        if report.discarded_temps > 0 {
            tracing::warn!(
                count = report.discarded_temps,
                "Discarded interrupted queue writes"
            );
        }

        let mut state = QueueState {
            last_sequence: report.last_sequence,
            ..Default::default()
        };

        for mut entry in report.entries {
            let sequence = entry.sequence();
            if entry.state == EntryState::InFlight {
                tracing::warn!(sequence, "Recovering entry left in flight at reset");
                entry.state = EntryState::Pending;
                store.write_entry(&entry).await?;
            }
            if entry.state == EntryState::Delivered {
                // Delivered but not yet pruned when power was lost.
                store.remove_entry(sequence).await?;
                state.delivered.insert(sequence);
                continue;
            }
            state.last_sequence = state.last_sequence.max(sequence);
            state.entries.insert(sequence, entry);
        }

        tracing::info!(
            dir = ?store.dir(),
            entries = state.entries.len(),
            last_sequence = state.last_sequence,
            "Delivery queue opened"
        );

        Ok(Self {
            store,
            state: Mutex::new(state),
            notify: Notify::new(),
            stuck_timeout,
            diagnostics,
        })
    }

    /// Reserve the next sequence number. The counter is persisted before returning.
    pub async fn allocate_sequence(&self) -> AppResult<u64> {
        let mut state = self.state.lock().await;
        let next = state.last_sequence + 1;
        self.store.write_counter(next).await?;
        state.last_sequence = next;
        Ok(next)
    }

    /// Last sequence number handed out.
    pub async fn last_sequence(&self) -> u64 {
        self.state.lock().await.last_sequence
    }

    /// Persist `event` as a new `Pending` entry.
    ///
    /// Returns once the entry is on durable storage. Re-enqueuing a sequence that is
    /// already present is a no-op.
    pub async fn enqueue(&self, event: Event) -> AppResult<Enqueued> {
        let mut state = self.state.lock().await;
        let sequence = event.sequence;
        if state.entries.contains_key(&sequence) || state.delivered.contains(&sequence) {
            tracing::debug!(sequence, "Duplicate enqueue ignored");
            return Ok(Enqueued::Duplicate);
        }

        let entry = QueueEntry::new(event);
        self.store.write_entry(&entry).await?;
        if sequence > state.last_sequence {
            self.store.write_counter(sequence).await?;
            state.last_sequence = sequence;
        }
        state.entries.insert(sequence, entry);
        drop(state);

        self.notify.notify_one();
        Ok(Enqueued::Added)
    }

    /// Oldest `Pending` entry, after returning stuck `InFlight` entries to `Pending`.
    pub async fn peek_next(&self) -> AppResult<Option<QueueEntry>> {
        let mut state = self.state.lock().await;

        let stuck: Vec<u64> = state
            .in_flight_since
            .iter()
            .filter(|(_, since)| since.elapsed() >= self.stuck_timeout)
            .map(|(sequence, _)| *sequence)
            .collect();
        for sequence in stuck {
            let Some(entry) = state.entries.get(&sequence) else {
                state.in_flight_since.remove(&sequence);
                continue;
            };
            let mut updated = entry.clone();
            updated.state = EntryState::Pending;
            updated.last_error = Some("stuck in flight".to_string());
            self.store.write_entry(&updated).await?;
            tracing::warn!(sequence, "Entry stuck in flight, returned to pending");
            state.in_flight_since.remove(&sequence);
            state.entries.insert(sequence, updated);
        }

        Ok(state
            .entries
            .values()
            .find(|entry| entry.state == EntryState::Pending)
            .cloned())
    }

    /// Move a `Pending` entry to `InFlight`, counting the attempt.
    pub async fn mark_in_flight(&self, sequence: u64) -> AppResult<QueueEntry> {
        self.transition(sequence, EntryState::InFlight, |entry| {
            entry.attempts += 1;
            entry.last_attempt_at = Some(Utc::now());
        })
        .await
    }

    /// Count an attempt that was deferred because the link was not ready.
    /// The entry stays `Pending`.
    pub async fn record_deferral(&self, sequence: u64, reason: &str) -> AppResult<QueueEntry> {
        let reason = reason.to_string();
        self.transition(sequence, EntryState::Pending, move |entry| {
            entry.attempts += 1;
            entry.last_attempt_at = Some(Utc::now());
            entry.last_error = Some(reason);
        })
        .await
    }

    /// Confirm remote commit and prune the entry.
    pub async fn mark_delivered(&self, sequence: u64) -> AppResult<QueueEntry> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get(&sequence)
            .ok_or(BhangError::EntryNotFound(sequence))?;
        check_transition(entry, EntryState::Delivered)?;

        let mut updated = entry.clone();
        updated.state = EntryState::Delivered;
        updated.last_error = None;
        // Delivered is written first so a crash before the unlink still prunes on open.
        self.store.write_entry(&updated).await?;
        self.store.remove_entry(sequence).await?;

        state.entries.remove(&sequence);
        state.in_flight_since.remove(&sequence);
        state.delivered.insert(sequence);
        Ok(updated)
    }

    /// Record a failed upload. `permanent` moves the entry to `FailedPermanent`,
    /// otherwise it returns to `Pending`.
    pub async fn mark_failed(
        &self,
        sequence: u64,
        permanent: bool,
        reason: &str,
    ) -> AppResult<QueueEntry> {
        let target = if permanent {
            EntryState::FailedPermanent
        } else {
            EntryState::Pending
        };
        let reason = reason.to_string();
        self.transition(sequence, target, move |entry| {
            entry.failures += 1;
            entry.last_error = Some(reason);
        })
        .await
    }

    /// Return an in-flight entry to `Pending` without counting a failure.
    /// Used when the attempt never reached the remote store.
    pub async fn release_in_flight(&self, sequence: u64, reason: &str) -> AppResult<QueueEntry> {
        let reason = reason.to_string();
        self.transition(sequence, EntryState::Pending, move |entry| {
            entry.last_error = Some(reason);
        })
        .await
    }

    /// Operator action: give a `FailedPermanent` entry a fresh retry budget.
    /// This is the only way out of `FailedPermanent`.
    pub async fn requeue_failed(&self, sequence: u64) -> AppResult<QueueEntry> {
        let entry = self
            .apply_transition(sequence, EntryState::Pending, check_requeue, |entry| {
                entry.failures = 0;
            })
            .await?;
        self.notify.notify_one();
        Ok(entry)
    }

    /// One entry by sequence.
    pub async fn get(&self, sequence: u64) -> Option<QueueEntry> {
        self.state.lock().await.entries.get(&sequence).cloned()
    }

    /// All retained entries in sequence order.
    pub async fn entries(&self) -> Vec<QueueEntry> {
        self.state.lock().await.entries.values().cloned().collect()
    }

    /// Wait until new work may be available.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Diagnostics this queue reports to.
    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    async fn transition<F>(&self, sequence: u64, to: EntryState, apply: F) -> AppResult<QueueEntry>
    where
        F: FnOnce(&mut QueueEntry),
    {
        self.apply_transition(sequence, to, check_transition, apply).await
    }

    async fn apply_transition<F>(
        &self,
        sequence: u64,
        to: EntryState,
        check: fn(&QueueEntry, EntryState) -> AppResult<()>,
        apply: F,
    ) -> AppResult<QueueEntry>
    where
        F: FnOnce(&mut QueueEntry),
    {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get(&sequence)
            .ok_or(BhangError::EntryNotFound(sequence))?;
        check(entry, to)?;

        let mut updated = entry.clone();
        updated.state = to;
        apply(&mut updated);
        self.store.write_entry(&updated).await?;

        if to == EntryState::InFlight {
            state.in_flight_since.insert(sequence, Instant::now());
        } else {
            state.in_flight_since.remove(&sequence);
        }
        state.entries.insert(sequence, updated.clone());
        Ok(updated)
    }
}

impl fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("dir", &self.store.dir())
            .field("stuck_timeout", &self.stuck_timeout)
            .finish()
    }
}

fn check_transition(entry: &QueueEntry, to: EntryState) -> AppResult<()> {
    use EntryState::*;
    let allowed = matches!(
        (entry.state, to),
        (Pending, InFlight)
            | (Pending, Pending)
            | (InFlight, Delivered)
            | (InFlight, Pending)
            | (InFlight, FailedPermanent)
    );
    if allowed {
        Ok(())
    } else {
        Err(invalid(entry, to))
    }
}

fn check_requeue(entry: &QueueEntry, to: EntryState) -> AppResult<()> {
    if entry.state == EntryState::FailedPermanent && to == EntryState::Pending {
        Ok(())
    } else {
        Err(invalid(entry, to))
    }
}

fn invalid(entry: &QueueEntry, to: EntryState) -> BhangError {
    BhangError::InvalidTransition {
        sequence: entry.sequence(),
        from: entry.state,
        to,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Tick;
    use chrono::Utc;

    fn ned(sequence: u64) -> Event {
        Event::ned("test", sequence, Tick(1000 + sequence as u32), Utc::now(), true)
    }

    async fn open(dir: &std::path::Path) -> DeliveryQueue {
        DeliveryQueue::open(dir, Duration::from_secs(5), Arc::new(Diagnostics::default()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_is_durable_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(dir.path()).await;

        assert_eq!(queue.enqueue(ned(1)).await.unwrap(), Enqueued::Added);
        assert_eq!(queue.enqueue(ned(1)).await.unwrap(), Enqueued::Duplicate);
        assert_eq!(queue.entries().await.len(), 1);
        drop(queue);

        let reopened = open(dir.path()).await;
        let entries = reopened.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, EntryState::Pending);
        assert_eq!(reopened.enqueue(ned(1)).await.unwrap(), Enqueued::Duplicate);
    }

    #[tokio::test]
    async fn sequence_counter_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(dir.path()).await;
        assert_eq!(queue.allocate_sequence().await.unwrap(), 1);
        assert_eq!(queue.allocate_sequence().await.unwrap(), 2);
        drop(queue);

        let reopened = open(dir.path()).await;
        assert_eq!(reopened.allocate_sequence().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn peek_is_fifo_by_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(dir.path()).await;
        queue.enqueue(ned(3)).await.unwrap();
        queue.enqueue(ned(1)).await.unwrap();
        queue.enqueue(ned(2)).await.unwrap();

        let first = queue.peek_next().await.unwrap().unwrap();
        assert_eq!(first.sequence(), 1);
        queue.mark_in_flight(1).await.unwrap();
        queue.mark_delivered(1).await.unwrap();
        assert_eq!(queue.peek_next().await.unwrap().unwrap().sequence(), 2);
        assert!(queue.get(1).await.is_none());
        assert_eq!(queue.enqueue(ned(1)).await.unwrap(), Enqueued::Duplicate);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_in_flight_is_reoffered_before_newer_entries() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(dir.path()).await;
        queue.enqueue(ned(1)).await.unwrap();
        queue.enqueue(ned(2)).await.unwrap();

        queue.mark_in_flight(1).await.unwrap();
        assert_eq!(queue.peek_next().await.unwrap().unwrap().sequence(), 2);

        tokio::time::advance(Duration::from_secs(6)).await;
        let next = queue.peek_next().await.unwrap().unwrap();
        assert_eq!(next.sequence(), 1);
        assert_eq!(next.state, EntryState::Pending);
        assert_eq!(next.attempts, 1);
    }

    #[tokio::test]
    async fn in_flight_at_power_loss_is_pending_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(dir.path()).await;
        queue.enqueue(ned(1)).await.unwrap();
        queue.mark_in_flight(1).await.unwrap();
        drop(queue);

        let reopened = open(dir.path()).await;
        let entry = reopened.get(1).await.unwrap();
        assert_eq!(entry.state, EntryState::Pending);
        assert_eq!(entry.attempts, 1);
    }

    #[tokio::test]
    async fn permanent_failures_are_retained_and_requeueable() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(dir.path()).await;
        queue.enqueue(ned(1)).await.unwrap();
        queue.mark_in_flight(1).await.unwrap();
        queue.mark_failed(1, true, "401 Unauthorized").await.unwrap();

        assert!(queue.peek_next().await.unwrap().is_none());
        drop(queue);

        let reopened = open(dir.path()).await;
        let entry = reopened.get(1).await.unwrap();
        assert_eq!(entry.state, EntryState::FailedPermanent);
        assert_eq!(entry.last_error.as_deref(), Some("401 Unauthorized"));

        let requeued = reopened.requeue_failed(1).await.unwrap();
        assert_eq!(requeued.state, EntryState::Pending);
        assert_eq!(requeued.failures, 0);
    }

    #[tokio::test]
    async fn only_requeue_leaves_failed_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(dir.path()).await;
        queue.enqueue(ned(1)).await.unwrap();
        queue.mark_in_flight(1).await.unwrap();
        queue.mark_failed(1, true, "422 Unprocessable").await.unwrap();

        let err = queue.mark_failed(1, false, "HTTP 502").await.unwrap_err();
        assert!(matches!(
            err,
            BhangError::InvalidTransition {
                from: EntryState::FailedPermanent,
                to: EntryState::Pending,
                ..
            }
        ));
        assert!(queue.record_deferral(1, "link not ready").await.is_err());
        assert!(queue.release_in_flight(1, "link down").await.is_err());

        let entry = queue.get(1).await.unwrap();
        assert_eq!(entry.state, EntryState::FailedPermanent);
        assert_eq!(entry.failures, 1);
        assert!(queue.peek_next().await.unwrap().is_none());

        assert!(matches!(
            queue.requeue_failed(2).await.unwrap_err(),
            BhangError::EntryNotFound(2)
        ));
        queue.enqueue(ned(2)).await.unwrap();
        assert!(queue.requeue_failed(2).await.is_err());
        assert_eq!(queue.requeue_failed(1).await.unwrap().state, EntryState::Pending);
    }

    #[tokio::test]
    async fn released_entry_keeps_its_failure_count() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(dir.path()).await;
        queue.enqueue(ned(1)).await.unwrap();
        queue.mark_in_flight(1).await.unwrap();
        queue.mark_failed(1, false, "HTTP 503").await.unwrap();
        queue.mark_in_flight(1).await.unwrap();

        let released = queue.release_in_flight(1, "connection refused").await.unwrap();
        assert_eq!(released.state, EntryState::Pending);
        assert_eq!(released.attempts, 2);
        assert_eq!(released.failures, 1);
        assert_eq!(released.last_error.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(dir.path()).await;
        queue.enqueue(ned(1)).await.unwrap();

        let err = queue.mark_delivered(1).await.unwrap_err();
        assert!(matches!(
            err,
            BhangError::InvalidTransition {
                from: EntryState::Pending,
                to: EntryState::Delivered,
                ..
            }
        ));
        assert!(matches!(
            queue.mark_in_flight(9).await.unwrap_err(),
            BhangError::EntryNotFound(9)
        ));
    }

    #[tokio::test]
    async fn corrupt_entry_is_quarantined_and_rest_survive() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(dir.path()).await;
        queue.enqueue(ned(1)).await.unwrap();
        queue.enqueue(ned(2)).await.unwrap();
        drop(queue);

        tokio::fs::write(
            dir.path().join("entry-00000000000000000001.json"),
            b"{\"version\":1,\"checksum\":\"00\",\"payload\":\"{}\"}",
        )
        .await
        .unwrap();

        let diagnostics = Arc::new(Diagnostics::default());
        let reopened = DeliveryQueue::open(dir.path(), Duration::from_secs(5), diagnostics.clone())
            .await
            .unwrap();

        let entries = reopened.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence(), 2);
        assert_eq!(diagnostics.counters().quarantined, 1);
        assert!(diagnostics.is_fatal_latched());

        let mut quarantine = tokio::fs::read_dir(dir.path().join("quarantine")).await.unwrap();
        assert!(quarantine.next_entry().await.unwrap().is_some());
        // The counter still remembers sequence 2 was handed out.
        assert_eq!(reopened.allocate_sequence().await.unwrap(), 3);
    }
}
