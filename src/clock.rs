//! Monotonic ticks and best-effort wall-clock correction.
//!
//! Edges are stamped with a [`Tick`]: 32-bit milliseconds from a monotonic clock that
//! wraps roughly every 49.7 days. All arithmetic on ticks is wrapping, so debounce and
//! age calculations stay correct across the wrap.
//!
//! Wall-clock time is derived later, outside interrupt context, by [`TimeSync`]: the
//! last successful synchronisation anchors a `(tick, UTC)` pair and any tick within
//! about ±24 days of the anchor maps onto UTC. Without an anchor the system clock is
//! used, corrected by the age of the tick, and the result is flagged as unsynced.

use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Millisecond tick from a wrapping monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tick(pub u32);

impl Tick {
    /// Milliseconds elapsed from `earlier` to `self`, modulo 2^32.
    pub fn since(self, earlier: Tick) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// Signed distance from `anchor` to `self` in milliseconds.
    ///
    /// Valid while the two ticks are less than half the wrap period apart.
    pub fn offset_from(self, anchor: Tick) -> i64 {
        i64::from(self.0.wrapping_sub(anchor.0) as i32)
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Source of monotonic ticks.
pub trait MonotonicClock: Send + Sync {
    /// Current tick.
    fn now(&self) -> Tick;
}

/// Tick clock backed by `tokio::time::Instant`.
///
/// Follows tokio's paused clock in tests, so backoff and debounce deadlines can be
/// driven deterministically.
#[derive(Debug, Clone)]
pub struct TokioTickClock {
    origin: tokio::time::Instant,
}

impl TokioTickClock {
    /// Clock whose tick zero is "now".
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioTickClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for TokioTickClock {
    fn now(&self) -> Tick {
        // Truncation is the wrap.
        Tick(self.origin.elapsed().as_millis() as u32)
    }
}

/// A `(tick, UTC)` pair captured at the moment of synchronisation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPoint {
    /// Tick when the reference time was obtained.
    pub tick: Tick,
    /// Reference wall-clock time at `tick`.
    pub wall: DateTime<Utc>,
}

/// Shared wall-clock correction for ticks.
pub struct TimeSync {
    clock: Arc<dyn MonotonicClock>,
    anchor: RwLock<Option<SyncPoint>>,
}

impl TimeSync {
    /// Unsynchronised time source over `clock`.
    pub fn new(clock: Arc<dyn MonotonicClock>) -> Self {
        Self {
            clock,
            anchor: RwLock::new(None),
        }
    }

    /// Anchor the current tick to `wall`.
    pub fn sync_to(&self, wall: DateTime<Utc>) -> SyncPoint {
        let point = SyncPoint {
            tick: self.clock.now(),
            wall,
        };
        *self.anchor.write() = Some(point);
        point
    }

    /// Last synchronisation, if any.
    pub fn anchor(&self) -> Option<SyncPoint> {
        *self.anchor.read()
    }

    /// The monotonic clock this sync corrects.
    pub fn clock(&self) -> &Arc<dyn MonotonicClock> {
        &self.clock
    }

    /// Best-effort UTC time of `tick`, truncated to milliseconds, plus whether it came
    /// from a synchronised anchor.
    pub fn wall_time_at(&self, tick: Tick) -> (DateTime<Utc>, bool) {
        match self.anchor() {
            Some(anchor) => {
                let offset = ChronoDuration::milliseconds(tick.offset_from(anchor.tick));
                ((anchor.wall + offset).trunc_subsecs(3), true)
            }
            None => {
                let age = self.clock.now().since(tick);
                let wall = Utc::now() - ChronoDuration::milliseconds(i64::from(age));
                (wall.trunc_subsecs(3), false)
            }
        }
    }
}

impl fmt::Debug for TimeSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeSync")
            .field("anchor", &self.anchor())
            .finish()
    }
}

/// Convert a duration to whole milliseconds for tick comparisons, saturating.
pub fn duration_to_ms(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}
