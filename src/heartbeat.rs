//! Periodic "still monitoring" update of the station document.
//!
//! Each beat adds one to `total minutes monitored` and stamps the upload date. A
//! beat tries to bring a down link up itself, so an idle station keeps reporting.
//! A missed beat is simply missed: heartbeats are not queued and never block event
//! delivery.

use crate::connectivity::ConnectivitySupervisor;
use crate::health::{Counter, Diagnostics};
use crate::queue::DeliveryQueue;
use crate::remote::{Heartbeat, RemoteError, RemoteStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// What a single beat did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeatOutcome {
    /// The document was updated.
    Sent,
    /// The link was down; nothing sent.
    Skipped,
}

/// Heartbeat task.
pub struct Heartbeater {
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<dyn ConnectivitySupervisor>,
    queue: Arc<DeliveryQueue>,
    diagnostics: Arc<Diagnostics>,
    interval: Duration,
    request_timeout: Duration,
}

impl Heartbeater {
    /// Beat every `interval`.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<dyn ConnectivitySupervisor>,
        queue: Arc<DeliveryQueue>,
        interval: Duration,
        request_timeout: Duration,
    ) -> Self {
        let diagnostics = queue.diagnostics().clone();
        Self {
            remote,
            connectivity,
            queue,
            diagnostics,
            interval,
            request_timeout,
        }
    }

    /// Send one heartbeat if the link is up or can be brought up.
    pub async fn beat(&self) -> Result<BeatOutcome, RemoteError> {
        if !self.connectivity.is_ready() {
            if let Err(e) = self.connectivity.ensure_connected().await {
                tracing::debug!("Heartbeat link check failed: {e}");
                return Ok(BeatOutcome::Skipped);
            }
        }
        let heartbeat = Heartbeat {
            at: Utc::now(),
            // Any allocated sequence means a NED was detected at some point.
            ned_seen: self.queue.last_sequence().await > 0,
        };
        let result = tokio::time::timeout(self.request_timeout, self.remote.heartbeat(&heartbeat))
            .await
            .unwrap_or_else(|_| Err(RemoteError::Unreachable("request timed out".to_string())));
        if let Err(RemoteError::Unreachable(_)) = &result {
            self.connectivity.mark_down();
        }
        result.map(|()| BeatOutcome::Sent)
    }

    /// Beat until shutdown. The first beat goes out immediately.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.beat().await {
                        Ok(BeatOutcome::Sent) => tracing::debug!("Heartbeat sent"),
                        Ok(BeatOutcome::Skipped) => tracing::debug!("Heartbeat skipped, link down"),
                        Err(e) => {
                            self.diagnostics.increment(Counter::HeartbeatFailures, 1);
                            tracing::warn!("Heartbeat failed: {e}");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::{AlwaysReady, ScriptedConnectivity, TcpProbeSupervisor};
    use tokio::net::TcpListener;
    use crate::remote::{MemoryDocumentStore, StationIdentity};

    async fn queue(dir: &std::path::Path) -> Arc<DeliveryQueue> {
        Arc::new(
            DeliveryQueue::open(dir, Duration::from_secs(60), Arc::new(Diagnostics::default()))
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn beat_counts_minutes_and_reports_ned() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue(dir.path()).await;
        let remote = Arc::new(MemoryDocumentStore::new(StationIdentity {
            name: "kx1".into(),
            ..Default::default()
        }));
        let heart = Heartbeater::new(
            remote.clone(),
            Arc::new(AlwaysReady),
            queue.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        assert_eq!(heart.beat().await.unwrap(), BeatOutcome::Sent);
        assert_eq!(remote.document().nuke_gone_off, "no");

        queue.allocate_sequence().await.unwrap();
        heart.beat().await.unwrap();
        let doc = remote.document();
        assert_eq!(doc.total_minutes_monitored, 2);
        assert_eq!(doc.nuke_gone_off, "yes");
        assert_eq!(doc.station.as_deref(), Some("kx1"));
    }

    #[tokio::test]
    async fn link_down_skips() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryDocumentStore::default());
        let heart = Heartbeater::new(
            remote.clone(),
            Arc::new(ScriptedConnectivity::down_for(2)),
            queue(dir.path()).await,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );
        assert_eq!(heart.beat().await.unwrap(), BeatOutcome::Skipped);
        assert_eq!(remote.writes(), 0);
    }

    #[tokio::test]
    async fn idle_station_checks_the_link_itself() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let link = Arc::new(TcpProbeSupervisor::new(addr.to_string(), Duration::from_secs(1)));
        let remote = Arc::new(MemoryDocumentStore::default());
        let heart = Heartbeater::new(
            remote.clone(),
            link.clone(),
            queue(dir.path()).await,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        assert_eq!(heart.beat().await.unwrap(), BeatOutcome::Sent);
        assert!(link.is_ready());
        assert_eq!(remote.writes(), 1);

        link.mark_down();
        drop(listener);
        assert_eq!(heart.beat().await.unwrap(), BeatOutcome::Skipped);
        assert_eq!(remote.writes(), 1);
    }
}
