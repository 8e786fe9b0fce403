//! Interrupt-context edge capture.
//!
//! [`EdgeTimestamper`] is the only code that runs in the pin interrupt. It debounces
//! each line against the last accepted tick for that line and hands accepted edges
//! to the classifier task through a bounded single-producer/single-consumer ring.
//!
//! # Interrupt rules
//!
//! `on_edge_detected` never allocates, blocks, logs or performs I/O. The ring is
//! allocated once in [`EdgeTimestamper::new`], the consumer is woken through an
//! [`AtomicWaker`], and every counter is a relaxed atomic. When the ring is full the
//! edge is dropped and `dropped_backlog` increments; the classifier task turns that
//! into a critical fault the next time it runs.
//!
//! ```text
//!  pin IRQ ──► EdgeTimestamper ──[HeapRb<Edge>]──► EdgeReceiver ──► EventClassifier
//!                   │                                   ▲
//!                   └──── AtomicWaker::wake ────────────┘
//! ```

use crate::clock::{duration_to_ms, Tick};
use futures::task::AtomicWaker;
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::fmt;
use std::future::poll_fn;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

/// Default debounce window; rejects contact and electrical bounce.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

/// Default handoff ring capacity.
pub const DEFAULT_HANDOFF_CAPACITY: usize = 32;

/// Which input line asserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeSource {
    /// Detector output (NED line).
    Detector,
    /// Built-in self-test line.
    Bist,
}

impl EdgeSource {
    fn index(self) -> usize {
        match self {
            EdgeSource::Detector => 0,
            EdgeSource::Bist => 1,
        }
    }

    fn from_index(index: u8) -> Self {
        if index == 1 {
            EdgeSource::Bist
        } else {
            EdgeSource::Detector
        }
    }
}

impl fmt::Display for EdgeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeSource::Detector => write!(f, "detector"),
            EdgeSource::Bist => write!(f, "bist"),
        }
    }
}

/// Electrical level reported by a pin-change interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Line pulled low: the asserted state for both lines.
    Low,
    /// Line released.
    High,
}

/// An accepted, debounced assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// Line that asserted.
    pub source: EdgeSource,
    /// Monotonic tick of the assertion.
    pub tick: Tick,
}

/// What the interrupt handler did with an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOutcome {
    /// Handed off to the classifier.
    Accepted,
    /// Inside the debounce window of the previous accepted edge on the same line.
    Debounced,
    /// Ring full; the edge is lost.
    DroppedBacklog,
    /// Deassertion; not an edge of interest.
    Ignored,
}

/// Counters and flags shared between the interrupt half and the task half.
#[derive(Debug, Default)]
pub struct SignalState {
    accepted: AtomicU64,
    debounced: AtomicU64,
    dropped_backlog: AtomicU64,
    dropped_reported: AtomicU64,
    last_dropped_line: AtomicU8,
    bist_armed: AtomicBool,
}

impl SignalState {
    /// Edges handed to the classifier.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Edges suppressed by debounce.
    pub fn debounced(&self) -> u64 {
        self.debounced.load(Ordering::Relaxed)
    }

    /// Edges lost because the ring was full.
    pub fn dropped_backlog(&self) -> u64 {
        self.dropped_backlog.load(Ordering::Relaxed)
    }

    /// Whether a BIST edge is waiting for confirmation.
    pub fn bist_armed(&self) -> bool {
        self.bist_armed.load(Ordering::Acquire)
    }

    /// Clear the BIST confirmation flag, returning its previous value.
    pub fn disarm_bist(&self) -> bool {
        self.bist_armed.swap(false, Ordering::AcqRel)
    }
}

/// Interrupt half of the handoff.
pub struct EdgeTimestamper {
    producer: HeapProducer<Edge>,
    waker: Arc<AtomicWaker>,
    state: Arc<SignalState>,
    debounce_ms: u32,
    last_accepted: [Option<Tick>; 2],
}

impl EdgeTimestamper {
    /// Allocate the handoff ring and split it into the interrupt and task halves.
    pub fn new(capacity: usize, debounce: Duration) -> (EdgeTimestamper, EdgeReceiver) {
        let (producer, consumer) = HeapRb::<Edge>::new(capacity.max(1)).split();
        let waker = Arc::new(AtomicWaker::new());
        let state = Arc::new(SignalState::default());

        let timestamper = EdgeTimestamper {
            producer,
            waker: waker.clone(),
            state: state.clone(),
            debounce_ms: duration_to_ms(debounce),
            last_accepted: [None, None],
        };
        let receiver = EdgeReceiver {
            consumer,
            waker,
            state,
        };
        (timestamper, receiver)
    }

    /// Pin-change entry point. Only an active-low assertion is an edge.
    pub fn on_level_change(&mut self, source: EdgeSource, level: Level, tick: Tick) -> EdgeOutcome {
        match level {
            Level::Low => self.on_edge_detected(source, tick),
            Level::High => EdgeOutcome::Ignored,
        }
    }

    /// Record an assertion on `source` at `tick`. Interrupt-safe.
    pub fn on_edge_detected(&mut self, source: EdgeSource, tick: Tick) -> EdgeOutcome {
        let slot = source.index();
        if let Some(last) = self.last_accepted[slot] {
            if tick.since(last) < self.debounce_ms {
                self.state.debounced.fetch_add(1, Ordering::Relaxed);
                return EdgeOutcome::Debounced;
            }
        }

        // The window restarts from the edge even when the ring is full, so a
        // bouncing contact cannot flood the drop counter.
        self.last_accepted[slot] = Some(tick);

        if self.producer.push(Edge { source, tick }).is_err() {
            self.state
                .last_dropped_line
                .store(slot as u8, Ordering::Relaxed);
            self.state.dropped_backlog.fetch_add(1, Ordering::Release);
            self.waker.wake();
            return EdgeOutcome::DroppedBacklog;
        }

        if source == EdgeSource::Bist {
            self.state.bist_armed.store(true, Ordering::Release);
        }
        self.state.accepted.fetch_add(1, Ordering::Relaxed);
        self.waker.wake();
        EdgeOutcome::Accepted
    }

    /// Shared counters.
    pub fn state(&self) -> &Arc<SignalState> {
        &self.state
    }
}

/// Task half of the handoff.
pub struct EdgeReceiver {
    consumer: HeapConsumer<Edge>,
    waker: Arc<AtomicWaker>,
    state: Arc<SignalState>,
}

impl EdgeReceiver {
    /// Next edge, without waiting.
    pub fn try_recv(&mut self) -> Option<Edge> {
        self.consumer.pop()
    }

    /// Wait for the next edge.
    ///
    /// Also wakes when an edge was dropped, so callers should check
    /// [`EdgeReceiver::take_dropped`] after each wake; in that case `None` is returned.
    pub async fn recv(&mut self) -> Option<Edge> {
        poll_fn(|cx| {
            if let Some(edge) = self.consumer.pop() {
                return Poll::Ready(Some(edge));
            }
            if self.has_unreported_drops() {
                return Poll::Ready(None);
            }
            self.waker.register(cx.waker());
            if let Some(edge) = self.consumer.pop() {
                return Poll::Ready(Some(edge));
            }
            if self.has_unreported_drops() {
                return Poll::Ready(None);
            }
            Poll::Pending
        })
        .await
    }

    /// Drops since the last call, with the line of the most recent one.
    pub fn take_dropped(&self) -> Option<(EdgeSource, u64)> {
        let total = self.state.dropped_backlog.load(Ordering::Acquire);
        let reported = self.state.dropped_reported.swap(total, Ordering::AcqRel);
        let fresh = total.saturating_sub(reported);
        if fresh == 0 {
            return None;
        }
        let line = EdgeSource::from_index(self.state.last_dropped_line.load(Ordering::Relaxed));
        Some((line, fresh))
    }

    /// Edges waiting in the ring.
    pub fn pending(&self) -> usize {
        self.consumer.len()
    }

    /// Shared counters.
    pub fn state(&self) -> &Arc<SignalState> {
        &self.state
    }

    fn has_unreported_drops(&self) -> bool {
        self.state.dropped_backlog.load(Ordering::Acquire)
            != self.state.dropped_reported.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timestamper(capacity: usize) -> (EdgeTimestamper, EdgeReceiver) {
        EdgeTimestamper::new(capacity, Duration::from_millis(50))
    }

    #[test]
    fn edges_spaced_beyond_window_are_all_accepted() {
        let (mut ts, mut rx) = timestamper(16);
        for i in 0..10u32 {
            assert_eq!(
                ts.on_edge_detected(EdgeSource::Detector, Tick(1000 + i * 50)),
                EdgeOutcome::Accepted
            );
        }
        let mut count = 0;
        while rx.try_recv().is_some() {
            count += 1;
        }
        assert_eq!(count, 10);
        assert_eq!(ts.state().debounced(), 0);
    }

    #[test]
    fn bounce_keeps_earliest_edge_per_window() {
        let (mut ts, mut rx) = timestamper(16);
        // Two bursts, each tighter than the window.
        for tick in [1000, 1005, 1020, 1049, 1100, 1130] {
            ts.on_edge_detected(EdgeSource::Detector, Tick(tick));
        }
        let accepted: Vec<_> = std::iter::from_fn(|| rx.try_recv()).collect();
        assert_eq!(
            accepted,
            vec![
                Edge {
                    source: EdgeSource::Detector,
                    tick: Tick(1000)
                },
                Edge {
                    source: EdgeSource::Detector,
                    tick: Tick(1100)
                },
            ]
        );
        assert_eq!(ts.state().debounced(), 4);
        assert_eq!(ts.state().dropped_backlog(), 0);
    }

    #[test]
    fn lines_debounce_independently() {
        let (mut ts, _rx) = timestamper(16);
        assert_eq!(
            ts.on_edge_detected(EdgeSource::Detector, Tick(1000)),
            EdgeOutcome::Accepted
        );
        assert_eq!(
            ts.on_edge_detected(EdgeSource::Bist, Tick(1010)),
            EdgeOutcome::Accepted
        );
        assert!(ts.state().bist_armed());
    }

    #[test]
    fn debounce_survives_tick_wrap() {
        let (mut ts, _rx) = timestamper(16);
        ts.on_edge_detected(EdgeSource::Detector, Tick(u32::MAX - 10));
        assert_eq!(
            ts.on_edge_detected(EdgeSource::Detector, Tick(20)),
            EdgeOutcome::Debounced
        );
        assert_eq!(
            ts.on_edge_detected(EdgeSource::Detector, Tick(60)),
            EdgeOutcome::Accepted
        );
    }

    #[test]
    fn full_ring_drops_and_counts() {
        let (mut ts, rx) = timestamper(2);
        ts.on_edge_detected(EdgeSource::Detector, Tick(0));
        ts.on_edge_detected(EdgeSource::Detector, Tick(100));
        assert_eq!(
            ts.on_edge_detected(EdgeSource::Detector, Tick(200)),
            EdgeOutcome::DroppedBacklog
        );
        assert_eq!(rx.take_dropped(), Some((EdgeSource::Detector, 1)));
        assert_eq!(rx.take_dropped(), None);
        assert_eq!(rx.pending(), 2);
    }

    #[test]
    fn release_is_ignored() {
        let (mut ts, mut rx) = timestamper(4);
        assert_eq!(
            ts.on_level_change(EdgeSource::Detector, Level::High, Tick(5)),
            EdgeOutcome::Ignored
        );
        assert!(rx.try_recv().is_none());
        assert_eq!(
            ts.on_level_change(EdgeSource::Detector, Level::Low, Tick(6)),
            EdgeOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn recv_wakes_on_push_from_another_task() {
        let (mut ts, mut rx) = timestamper(4);
        let waiter = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        ts.on_edge_detected(EdgeSource::Bist, Tick(42));
        let edge = waiter.await.unwrap();
        assert_eq!(
            edge,
            Some(Edge {
                source: EdgeSource::Bist,
                tick: Tick(42)
            })
        );
    }
}
