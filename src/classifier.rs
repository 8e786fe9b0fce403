//! Turns accepted edges into events.
//!
//! Detector edges become NED events: a sequence number is allocated, the event is
//! persisted through the delivery queue, and the NED indicator is latched. Self-test
//! edges never enter the queue. A BIST edge is held for one debounce window and only
//! reported as a pass if no detector edge lands inside that window, in either order,
//! so a genuine detection can never be mistaken for (or masked by) a self-test.

use crate::clock::{duration_to_ms, MonotonicClock, Tick, TimeSync};
use crate::error::BhangError;
use crate::event::Event;
use crate::health::{Counter, Diagnostics, Fault, FaultKind, Severity};
use crate::queue::{DeliveryQueue, Enqueued};
use crate::signal::{Edge, EdgeReceiver, EdgeSource, SignalState};
use crate::status::StatusSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Result of classifying one edge.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// A NED was persisted.
    Ned(Event),
    /// A NED could not be persisted; a critical fault was raised.
    NedLost,
    /// A self-test edge is waiting out the priority window.
    BistPending,
    /// A self-test edge was discarded because a detector edge shared its window.
    BistSuppressed,
}

/// Task-side classifier.
pub struct EventClassifier {
    station: String,
    queue: Arc<DeliveryQueue>,
    time: Arc<TimeSync>,
    status: Arc<dyn StatusSink>,
    diagnostics: Arc<Diagnostics>,
    signal: Option<Arc<SignalState>>,
    window_ms: u32,
    pending_bist: Option<Tick>,
    last_detector: Option<Tick>,
    bist_count: u64,
}

impl EventClassifier {
    /// Classifier for `station`. `window` is the detector-priority window, normally
    /// the debounce window.
    pub fn new(
        station: impl Into<String>,
        queue: Arc<DeliveryQueue>,
        time: Arc<TimeSync>,
        status: Arc<dyn StatusSink>,
        window: Duration,
    ) -> Self {
        let diagnostics = queue.diagnostics().clone();
        Self {
            station: station.into(),
            queue,
            time,
            status,
            diagnostics,
            signal: None,
            window_ms: duration_to_ms(window),
            pending_bist: None,
            last_detector: None,
            bist_count: 0,
        }
    }

    /// Clear the interrupt side's BIST flag when a self-test is resolved.
    pub fn with_signal_state(mut self, signal: Arc<SignalState>) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Self-test passes reported this boot.
    pub fn bist_count(&self) -> u64 {
        self.bist_count
    }

    /// Classify one edge.
    pub async fn handle(&mut self, edge: Edge) -> Classified {
        match edge.source {
            EdgeSource::Detector => self.handle_detector(edge.tick).await,
            EdgeSource::Bist => self.handle_bist(edge.tick),
        }
    }

    /// Report the pending self-test as passed once its window has closed.
    pub fn expire_pending(&mut self, now: Tick) -> Option<Event> {
        let pending = self.pending_bist?;
        if now.since(pending) < self.window_ms {
            return None;
        }
        self.pending_bist = None;
        self.bist_count += 1;

        let (detected_at, synced) = self.time.wall_time_at(pending);
        let event = Event::bist_pass(&self.station, self.bist_count, pending, detected_at, synced);
        self.disarm();
        if let Err(e) = self.status.bist_passed(&event) {
            self.diagnostics.increment(Counter::StatusSinkFailures, 1);
            tracing::warn!(error = %e, "Status sink failed to show BIST pass");
        }
        Some(event)
    }

    /// Time left until the pending self-test can be reported.
    pub fn pending_deadline(&self, now: Tick) -> Option<Duration> {
        self.pending_bist.map(|pending| {
            let remaining = self.window_ms.saturating_sub(now.since(pending));
            Duration::from_millis(u64::from(remaining))
        })
    }

    async fn handle_detector(&mut self, tick: Tick) -> Classified {
        if let Some(pending) = self.pending_bist {
            if tick.since(pending) < self.window_ms {
                self.suppress_bist(pending, tick);
            } else {
                self.expire_pending(tick);
            }
        }
        self.last_detector = Some(tick);

        let sequence = match self.queue.allocate_sequence().await {
            Ok(sequence) => sequence,
            Err(e) => {
                self.report_lost(format!("NED at tick {tick} lost, no sequence: {e}"));
                return Classified::NedLost;
            }
        };

        let (detected_at, synced) = self.time.wall_time_at(tick);
        let event = Event::ned(&self.station, sequence, tick, detected_at, synced);

        match self.queue.enqueue(event.clone()).await {
            Ok(Enqueued::Added) => {}
            Ok(Enqueued::Duplicate) => {
                tracing::warn!(sequence, "Freshly allocated sequence already queued");
            }
            Err(e) => {
                self.report_lost(format!("NED {event:?} could not be persisted: {e}"));
                return Classified::NedLost;
            }
        }

        if let Err(e) = self.status.ned_latched(&event) {
            self.diagnostics.increment(Counter::StatusSinkFailures, 1);
            tracing::warn!(error = %e, "Status sink failed to latch NED");
        }
        Classified::Ned(event)
    }

    fn handle_bist(&mut self, tick: Tick) -> Classified {
        if let Some(detector) = self.last_detector {
            if tick.since(detector) < self.window_ms {
                self.suppress_bist(tick, detector);
                return Classified::BistSuppressed;
            }
        }
        // The self-test line is debounced, so an older pending edge is past its window.
        self.expire_pending(tick);
        self.pending_bist = Some(tick);
        Classified::BistPending
    }

    fn suppress_bist(&mut self, bist: Tick, detector: Tick) {
        self.pending_bist = None;
        self.disarm();
        self.diagnostics.increment(Counter::BistSuppressed, 1);
        tracing::info!(%bist, %detector, "Self-test discarded, detector edge in the same window");
    }

    fn disarm(&self) {
        if let Some(signal) = &self.signal {
            signal.disarm_bist();
        }
    }

    fn report_lost(&self, message: String) {
        self.diagnostics.report(Fault::new(
            FaultKind::StorageFailure,
            Severity::Critical,
            "classifier",
            message,
        ));
    }

    /// Classify edges until shutdown, then drain what is already in the ring.
    pub async fn run(
        mut self,
        mut receiver: EdgeReceiver,
        clock: Arc<dyn MonotonicClock>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!(station = %self.station, window_ms = self.window_ms, "Classifier started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let deadline = self.pending_deadline(clock.now());

            // Edges already in the ring are classified before a pending BIST may
            // expire, however late this task runs.
            tokio::select! {
                biased;
                edge = receiver.recv() => {
                    self.report_backlog(&receiver);
                    if let Some(edge) = edge {
                        self.handle(edge).await;
                    }
                }
                _ = tokio::time::sleep(deadline.unwrap_or_default()), if deadline.is_some() => {
                    while let Some(edge) = receiver.try_recv() {
                        self.handle(edge).await;
                    }
                    self.expire_pending(clock.now());
                }
                changed = shutdown.changed() => if changed.is_err() { break },
            }
        }

        tracing::debug!(pending = receiver.pending(), "Classifier draining handoff ring");
        while let Some(edge) = receiver.try_recv() {
            self.handle(edge).await;
        }
        self.report_backlog(&receiver);
        tracing::info!("Classifier stopped");
    }

    fn report_backlog(&self, receiver: &EdgeReceiver) {
        let Some((line, dropped)) = receiver.take_dropped() else {
            return;
        };
        self.diagnostics.increment(Counter::EdgesDropped, dropped);
        let err = BhangError::SignalBacklog { line, dropped };
        self.diagnostics.report(Fault::new(
            FaultKind::SignalBacklog,
            Severity::Critical,
            "signal",
            err.to_string(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tests::ManualClock;
    use crate::clock::TokioTickClock;
    use crate::event::EventKind;
    use crate::signal::EdgeTimestamper;
    use crate::status::IndicatorBoard;
    use tracing_test::traced_test;

    const WINDOW: Duration = Duration::from_millis(50);

    struct Rig {
        _dir: tempfile::TempDir,
        queue: Arc<DeliveryQueue>,
        board: Arc<IndicatorBoard>,
        classifier: EventClassifier,
    }

    async fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(
            DeliveryQueue::open(dir.path(), Duration::from_secs(60), Arc::new(Diagnostics::default()))
                .await
                .unwrap(),
        );
        let board = Arc::new(IndicatorBoard::new());
        let time = Arc::new(TimeSync::new(ManualClock::at(0)));
        let classifier = EventClassifier::new("kx1", queue.clone(), time, board.clone(), WINDOW);
        Rig {
            _dir: dir,
            queue,
            board,
            classifier,
        }
    }

    fn detector(ms: u32) -> Edge {
        Edge {
            source: EdgeSource::Detector,
            tick: Tick(ms),
        }
    }

    fn bist(ms: u32) -> Edge {
        Edge {
            source: EdgeSource::Bist,
            tick: Tick(ms),
        }
    }

    #[tokio::test]
    async fn detector_edge_becomes_persisted_ned() {
        let mut rig = rig().await;
        let Classified::Ned(event) = rig.classifier.handle(detector(1000)).await else {
            panic!("expected a NED");
        };
        assert_eq!(event.kind, EventKind::Ned);
        assert_eq!(event.sequence, 1);
        assert_eq!(event.event_id, "kx1-ned-00000001-000003e8");

        let entries = rig.queue.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, event);
        assert!(rig.board.snapshot().ned_latched);
    }

    #[tokio::test]
    async fn bist_then_detector_in_window_keeps_only_ned() {
        let mut rig = rig().await;
        assert_eq!(rig.classifier.handle(bist(1000)).await, Classified::BistPending);
        assert!(matches!(rig.classifier.handle(detector(1020)).await, Classified::Ned(_)));

        assert!(rig.classifier.expire_pending(Tick(2000)).is_none());
        assert_eq!(rig.board.snapshot().bist_confirmations, 0);
        assert_eq!(rig.queue.diagnostics().counters().bist_suppressed, 1);
        assert_eq!(rig.queue.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn detector_then_bist_in_window_keeps_only_ned() {
        let mut rig = rig().await;
        assert!(matches!(rig.classifier.handle(detector(1000)).await, Classified::Ned(_)));
        assert_eq!(rig.classifier.handle(bist(1020)).await, Classified::BistSuppressed);
        assert!(rig.classifier.expire_pending(Tick(5000)).is_none());
        assert!(rig.board.snapshot().ned_latched);
    }

    #[tokio::test]
    async fn lone_bist_passes_after_window_without_touching_queue() {
        let mut rig = rig().await;
        rig.classifier.handle(bist(1000)).await;
        assert_eq!(
            rig.classifier.pending_deadline(Tick(1030)),
            Some(Duration::from_millis(20))
        );
        assert!(rig.classifier.expire_pending(Tick(1049)).is_none());

        let event = rig.classifier.expire_pending(Tick(1050)).unwrap();
        assert_eq!(event.kind, EventKind::BistPass);
        assert_eq!(rig.board.snapshot().bist_confirmations, 1);
        assert!(rig.queue.entries().await.is_empty());
        assert_eq!(rig.queue.last_sequence().await, 0);
    }

    #[tokio::test]
    async fn bist_outside_window_of_detector_passes() {
        let mut rig = rig().await;
        rig.classifier.handle(detector(1000)).await;
        assert_eq!(rig.classifier.handle(bist(1100)).await, Classified::BistPending);
        assert!(rig.classifier.expire_pending(Tick(1150)).is_some());
        // The pass clears the NED indicator, like the manual reset on the board.
        assert!(!rig.board.snapshot().ned_latched);
    }

    #[traced_test]
    #[tokio::test]
    async fn dropped_edges_raise_critical_fault() {
        let rig = rig().await;
        let (mut timestamper, receiver) = EdgeTimestamper::new(1, WINDOW);
        timestamper.on_edge_detected(EdgeSource::Detector, Tick(0));
        timestamper.on_edge_detected(EdgeSource::Detector, Tick(100));

        let classifier = rig.classifier;
        let diagnostics = rig.queue.diagnostics().clone();
        let (tx, rx) = watch::channel(true);
        classifier
            .run(receiver, Arc::new(TokioTickClock::new()), rx)
            .await;
        drop(tx);

        assert_eq!(diagnostics.counters().edges_dropped, 1);
        assert!(diagnostics.is_fatal_latched());
        assert!(logs_contain("Signal backlog: 1 edge(s) dropped on the detector line"));
        // The edge that made it into the ring is still recorded.
        assert_eq!(rig.queue.entries().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_reports_bist_after_window() {
        let rig = rig().await;
        let clock = Arc::new(TokioTickClock::new());
        let (mut timestamper, receiver) = EdgeTimestamper::new(8, WINDOW);
        let board = rig.board.clone();
        let classifier = rig.classifier.with_signal_state(timestamper.state().clone());
        let signal = timestamper.state().clone();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(classifier.run(receiver, clock.clone(), rx));

        timestamper.on_edge_detected(EdgeSource::Bist, clock.now());
        assert!(signal.bist_armed());
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(board.snapshot().bist_confirmations, 1);
        assert!(!signal.bist_armed());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn late_start_still_suppresses_bist_behind_detector() {
        for _ in 0..8 {
            let rig = rig().await;
            let clock = Arc::new(TokioTickClock::new());
            let (mut timestamper, receiver) = EdgeTimestamper::new(8, WINDOW);
            let t0 = clock.now();
            timestamper.on_edge_detected(EdgeSource::Bist, t0);
            timestamper.on_edge_detected(EdgeSource::Detector, Tick(t0.0 + 20));
            // Both edges sit in the ring well past the window before the task runs.
            tokio::time::advance(Duration::from_millis(100)).await;

            let board = rig.board.clone();
            let (tx, rx) = watch::channel(false);
            let handle = tokio::spawn(rig.classifier.run(receiver, clock, rx));
            tokio::time::sleep(Duration::from_millis(200)).await;
            tx.send(true).unwrap();
            handle.await.unwrap();

            assert_eq!(board.snapshot().bist_confirmations, 0);
            assert_eq!(rig.queue.diagnostics().counters().bist_suppressed, 1);
            assert_eq!(rig.queue.entries().await.len(), 1);
        }
    }
}
