//! Wiring: builds the pipeline from configuration and runs its tasks.
//!
//! ```text
//!  pin driver ──► EdgeTimestamper ═══ring═══► EventClassifier ──► DeliveryQueue
//!                 (returned to caller)          (task)                 │
//!                                                                      ▼
//!     SNTP task ──► TimeSync              Heartbeater (task)     UploadWorker (task)
//!                                                 └──────► RemoteStore ◄──┘
//! ```
//!
//! The interrupt half is handed back to the caller, which owns the pins. Everything
//! else runs as tokio tasks until [`RunningStation::shutdown`].

use crate::classifier::EventClassifier;
use crate::clock::{MonotonicClock, TimeSync, TokioTickClock};
use crate::config::{ConnectivityMode, RemoteBackend, StationConfig};
use crate::connectivity::{AlwaysReady, ConnectivitySupervisor, TcpProbeSupervisor};
use crate::error::AppResult;
use crate::health::{Diagnostics, DiagnosticsConfig};
use crate::heartbeat::Heartbeater;
use crate::queue::DeliveryQueue;
use crate::remote::{GitHubContentStore, MemoryDocumentStore, RemoteStore};
use crate::signal::EdgeTimestamper;
use crate::sntp;
use crate::status::{IndicatorBoard, StatusSink};
use crate::upload::UploadWorker;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// External collaborators of the pipeline.
pub struct StationDeps {
    /// Where delivered events go.
    pub remote: Arc<dyn RemoteStore>,
    /// Link readiness.
    pub connectivity: Arc<dyn ConnectivitySupervisor>,
    /// Local indicators.
    pub status: Arc<dyn StatusSink>,
    /// Tick source shared with the pin driver.
    pub clock: Arc<dyn MonotonicClock>,
}

impl StationDeps {
    /// Production collaborators as configured. Returns the indicator board too so
    /// the caller can render it.
    pub fn from_config(config: &StationConfig) -> AppResult<(Self, Arc<IndicatorBoard>)> {
        let identity = config.station.identity();
        let request_timeout = Duration::from_secs(config.upload.request_timeout_secs);

        let remote: Arc<dyn RemoteStore> = match config.remote.backend {
            RemoteBackend::Github => Arc::new(GitHubContentStore::new(
                config.remote.github_target(),
                identity,
                request_timeout,
            )?),
            RemoteBackend::Memory => {
                tracing::warn!("Using in-memory remote store; nothing leaves this process");
                Arc::new(MemoryDocumentStore::new(identity))
            }
        };

        let connectivity: Arc<dyn ConnectivitySupervisor> = match config.remote.connectivity {
            ConnectivityMode::Probe => Arc::new(TcpProbeSupervisor::new(
                config.remote.probe_addr.clone(),
                Duration::from_secs(config.remote.probe_timeout_secs),
            )),
            ConnectivityMode::Always => Arc::new(AlwaysReady),
        };

        let board = Arc::new(IndicatorBoard::new());
        let deps = Self {
            remote,
            connectivity,
            status: board.clone(),
            clock: Arc::new(TokioTickClock::new()),
        };
        Ok((deps, board))
    }
}

/// Handle to the running pipeline.
pub struct RunningStation {
    queue: Arc<DeliveryQueue>,
    diagnostics: Arc<Diagnostics>,
    time: Arc<TimeSync>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl RunningStation {
    /// Open the queue, spawn the tasks, and return the interrupt half.
    pub async fn start(
        config: &StationConfig,
        deps: StationDeps,
    ) -> AppResult<(RunningStation, EdgeTimestamper)> {
        let diagnostics = Arc::new(Diagnostics::new(DiagnosticsConfig {
            max_fault_history: config.status.fault_history,
        }));
        diagnostics.attach_sink(deps.status.clone());

        let queue = Arc::new(
            DeliveryQueue::open(
                &config.queue.dir,
                Duration::from_secs(config.queue.stuck_in_flight_secs),
                diagnostics.clone(),
            )
            .await?,
        );
        let time = Arc::new(TimeSync::new(deps.clock.clone()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let (timestamper, receiver) =
            EdgeTimestamper::new(config.signal.handoff_capacity, config.signal.debounce());

        let classifier = EventClassifier::new(
            config.station.name.clone(),
            queue.clone(),
            time.clone(),
            deps.status.clone(),
            config.signal.debounce(),
        )
        .with_signal_state(timestamper.state().clone());
        tasks.push((
            "classifier",
            tokio::spawn(classifier.run(receiver, deps.clock.clone(), shutdown_rx.clone())),
        ));

        let worker = UploadWorker::new(
            queue.clone(),
            deps.remote.clone(),
            deps.connectivity.clone(),
            config.upload.settings(),
        );
        tasks.push(("upload", tokio::spawn(worker.run(shutdown_rx.clone()))));

        if config.status.heartbeat_secs > 0 {
            let heart = Heartbeater::new(
                deps.remote.clone(),
                deps.connectivity.clone(),
                queue.clone(),
                Duration::from_secs(config.status.heartbeat_secs),
                Duration::from_secs(config.upload.request_timeout_secs),
            );
            tasks.push(("heartbeat", tokio::spawn(heart.run(shutdown_rx.clone()))));
        }

        if config.time.enabled {
            tasks.push((
                "time-sync",
                tokio::spawn(sntp::run(time.clone(), config.time.clone(), shutdown_rx)),
            ));
        }

        tracing::info!(
            station = %config.station.name,
            queue = %config.queue.dir.display(),
            pending = queue.entries().await.len(),
            "Station started"
        );

        Ok((
            RunningStation {
                queue,
                diagnostics,
                time,
                shutdown,
                tasks,
            },
            timestamper,
        ))
    }

    /// The delivery queue.
    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    /// Station diagnostics.
    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    /// Wall-clock correction.
    pub fn time(&self) -> &Arc<TimeSync> {
        &self.time
    }

    /// Stop all tasks and wait for them. The classifier drains edges already handed
    /// off; an in-progress commit finishes before the worker exits.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                tracing::error!(task = name, "Task ended abnormally: {e}");
            }
        }
        tracing::info!("Station stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Tick;
    use crate::config::{RemoteSection, StatusSection};
    use crate::remote::StationIdentity;
    use crate::signal::{EdgeSource, EdgeOutcome, Level};
    use crate::sntp::SntpSettings;

    #[tokio::test]
    async fn detector_edge_reaches_remote_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StationConfig {
            remote: RemoteSection {
                backend: RemoteBackend::Memory,
                ..Default::default()
            },
            time: SntpSettings {
                enabled: false,
                ..Default::default()
            },
            status: StatusSection {
                heartbeat_secs: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        config.station.name = "kx1".into();
        config.queue.dir = dir.path().to_path_buf();

        let remote = Arc::new(MemoryDocumentStore::new(StationIdentity::default()));
        let board = Arc::new(IndicatorBoard::new());
        let deps = StationDeps {
            remote: remote.clone(),
            connectivity: Arc::new(AlwaysReady),
            status: board.clone(),
            clock: Arc::new(TokioTickClock::new()),
        };

        let (station, mut timestamper) = RunningStation::start(&config, deps).await.unwrap();
        assert_eq!(
            timestamper.on_level_change(EdgeSource::Detector, Level::Low, Tick(1000)),
            EdgeOutcome::Accepted
        );

        for _ in 0..100 {
            if !remote.document().events.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let doc = remote.document();
        assert_eq!(doc.events.len(), 1);
        assert_eq!(doc.events[0].event_id, "kx1-ned-00000001-000003e8");
        assert!(board.snapshot().ned_latched);

        station.shutdown().await;
    }
}
