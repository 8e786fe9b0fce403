//! Upload worker: drains the delivery queue into the remote store.
//!
//! One entry is handled at a time, oldest first. A commit that does not answer
//! within the request timeout is dropped and the entry is retried later; it may have
//! landed anyway, which is safe because the remote commit is idempotent on
//! `event_id`.
//!
//! ## Attempt accounting
//!
//! `attempts` on a queue entry counts every time the worker picked it up, including
//! pick-ups deferred because the link was down. `failures` counts only retryable
//! answers from the remote store and is what [`RetryPolicy::max_attempts`] limits.
//! A request that gets no answer at all (connect failure, reset, timeout) marks the
//! link down and counts as a deferral, so a long outage never turns into a permanent
//! failure.

use crate::connectivity::ConnectivitySupervisor;
use crate::error::AppResult;
use crate::event::EventRecord;
use crate::health::{Counter, Diagnostics, Fault, FaultKind, Severity};
use crate::queue::DeliveryQueue;
use crate::remote::{CommitOutcome, RemoteError, RemoteStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Exponential backoff with jitter.
///
/// The delay before retry `n` (1-based) is `base_delay * 2^(n-1)`, capped at
/// `max_delay`, then scaled by a random factor in `1 ± jitter` and capped again.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retryable remote failures tolerated. The entry is given up on when one more
    /// arrives, so it sees at most `max_attempts + 1` failed commits.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    /// Upper bound on any delay.
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Relative jitter, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        if self.jitter <= 0.0 {
            return raw;
        }
        let jitter = self.jitter.min(1.0);
        let factor = 1.0 + rng.gen_range(-jitter..=jitter);
        raw.mul_f64(factor).min(self.max_delay)
    }
}

/// Durations in config files are whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// What one [`UploadWorker::step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing pending.
    Idle,
    /// The link was down, or went down during the commit; the head entry is pending.
    Deferred {
        /// Head entry.
        sequence: u64,
        /// Suggested wait before the next step.
        delay: Duration,
    },
    /// The head entry is committed remotely and pruned.
    Delivered {
        /// Delivered entry.
        sequence: u64,
        /// Attempts it took, deferrals included.
        attempts: u32,
        /// Whether the commit wrote or found the record already there.
        outcome: CommitOutcome,
    },
    /// Retryable failure; the entry is pending again.
    Retrying {
        /// Entry that failed.
        sequence: u64,
        /// Wait before the next step.
        delay: Duration,
    },
    /// The entry was moved to `FailedPermanent`.
    Failed {
        /// Entry that failed.
        sequence: u64,
    },
}

/// Worker timing.
#[derive(Clone, Debug)]
pub struct UploadSettings {
    /// Backoff for retryable failures and for connectivity deferrals.
    pub retry: RetryPolicy,
    /// Bound on one remote commit.
    pub request_timeout: Duration,
    /// Wake-up interval when the queue is empty.
    pub idle_poll: Duration,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(15),
            idle_poll: Duration::from_secs(5),
        }
    }
}

/// Single consumer of the delivery queue.
pub struct UploadWorker {
    queue: Arc<DeliveryQueue>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<dyn ConnectivitySupervisor>,
    diagnostics: Arc<Diagnostics>,
    settings: UploadSettings,
    consecutive_deferrals: u32,
    rng: StdRng,
}

impl UploadWorker {
    /// Worker over `queue`.
    pub fn new(
        queue: Arc<DeliveryQueue>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<dyn ConnectivitySupervisor>,
        settings: UploadSettings,
    ) -> Self {
        let diagnostics = queue.diagnostics().clone();
        Self {
            queue,
            remote,
            connectivity,
            diagnostics,
            settings,
            consecutive_deferrals: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Process the head of the queue once.
    ///
    /// Errors are storage failures only; remote and connectivity problems are
    /// folded into the outcome.
    pub async fn step(&mut self) -> AppResult<StepOutcome> {
        let Some(entry) = self.queue.peek_next().await? else {
            return Ok(StepOutcome::Idle);
        };
        let sequence = entry.sequence();

        if !self.connectivity.is_ready() {
            let reason = match self.connectivity.ensure_connected().await {
                Ok(()) => "link not ready".to_string(),
                Err(e) => format!("link not ready: {e}"),
            };
            self.queue.record_deferral(sequence, &reason).await?;
            return Ok(self.deferred(sequence, &reason));
        }
        self.consecutive_deferrals = 0;

        let entry = self.queue.mark_in_flight(sequence).await?;
        let record = EventRecord::from(&entry.event);
        tracing::debug!(sequence, event_id = %record.event_id, attempt = entry.attempts, "Committing event");

        let result = match tokio::time::timeout(
            self.settings.request_timeout,
            self.remote.commit(&record),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Unreachable("request timed out".to_string())),
        };

        match result {
            Ok(outcome) => {
                let delivered = self.queue.mark_delivered(sequence).await?;
                self.diagnostics.increment(Counter::Delivered, 1);
                tracing::info!(
                    sequence,
                    event_id = %record.event_id,
                    attempts = delivered.attempts,
                    ?outcome,
                    "Event delivered"
                );
                Ok(StepOutcome::Delivered {
                    sequence,
                    attempts: delivered.attempts,
                    outcome,
                })
            }
            Err(RemoteError::Unreachable(reason)) => {
                self.connectivity.mark_down();
                self.queue.release_in_flight(sequence, &reason).await?;
                Ok(self.deferred(sequence, &reason))
            }
            Err(RemoteError::Retryable(reason)) => {
                let exhausted = entry.failures >= self.settings.retry.max_attempts;
                let failed = self.queue.mark_failed(sequence, exhausted, &reason).await?;
                self.diagnostics.increment(Counter::RetryableFailures, 1);
                if exhausted {
                    self.diagnostics.increment(Counter::PermanentFailures, 1);
                    self.diagnostics.report(Fault::new(
                        FaultKind::DeliveryExhausted,
                        Severity::Error,
                        "upload",
                        format!(
                            "Event {} gave up after {} failures: {reason}",
                            record.event_id, failed.failures
                        ),
                    ));
                    return Ok(StepOutcome::Failed { sequence });
                }
                let delay = self
                    .settings
                    .retry
                    .delay_for(failed.failures, &mut self.rng);
                tracing::warn!(sequence, failures = failed.failures, ?delay, "Commit failed, will retry: {reason}");
                Ok(StepOutcome::Retrying { sequence, delay })
            }
            Err(RemoteError::Rejected { status, message }) => {
                self.queue.mark_failed(sequence, true, &message).await?;
                self.diagnostics.increment(Counter::PermanentFailures, 1);
                self.diagnostics.report(Fault::new(
                    FaultKind::RemoteRejection,
                    Severity::Error,
                    "upload",
                    format!("Event {} rejected (status {status}): {message}", record.event_id),
                ));
                Ok(StepOutcome::Failed { sequence })
            }
        }
    }

    fn deferred(&mut self, sequence: u64, reason: &str) -> StepOutcome {
        self.diagnostics.increment(Counter::ConnectivityDeferrals, 1);
        self.consecutive_deferrals = self.consecutive_deferrals.saturating_add(1);
        let delay = self
            .settings
            .retry
            .delay_for(self.consecutive_deferrals, &mut self.rng);
        tracing::debug!(sequence, ?delay, "Upload deferred, {reason}");
        StepOutcome::Deferred { sequence, delay }
    }

    /// Drain the queue until `shutdown` turns true or its sender goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Upload worker started");
        let queue = self.queue.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.step().await {
                Ok(StepOutcome::Idle) => None,
                Ok(StepOutcome::Delivered { .. }) | Ok(StepOutcome::Failed { .. }) => {
                    Some(Duration::ZERO)
                }
                Ok(StepOutcome::Deferred { delay, .. }) | Ok(StepOutcome::Retrying { delay, .. }) => {
                    Some(delay)
                }
                Err(e) => {
                    self.diagnostics.report(Fault::new(
                        FaultKind::StorageFailure,
                        Severity::Critical,
                        "upload",
                        format!("Queue storage failed: {e}"),
                    ));
                    Some(self.settings.retry.base_delay)
                }
            };

            match wait {
                Some(delay) if delay.is_zero() => {}
                Some(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => if changed.is_err() { break },
                    }
                }
                None => {
                    tokio::select! {
                        _ = queue.notified() => {}
                        _ = tokio::time::sleep(self.settings.idle_poll) => {}
                        changed = shutdown.changed() => if changed.is_err() { break },
                    }
                }
            }
        }
        tracing::info!("Upload worker stopped");
    }
}
