//! Event records produced by the classifier.

use crate::clock::Tick;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of an accepted edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// Nuclear Event Detection: a genuine detector assertion.
    Ned,
    /// Self-test stimulus confirmed.
    BistPass,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Ned => write!(f, "NED"),
            EventKind::BistPass => write!(f, "BIST_PASS"),
        }
    }
}

/// Immutable record of one classified edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Idempotency key for the remote store.
    pub event_id: String,
    /// Classification.
    pub kind: EventKind,
    /// Persisted sequence for NED; per-boot self-test count for BIST.
    pub sequence: u64,
    /// Best-effort UTC time of the edge, millisecond precision.
    pub detected_at: DateTime<Utc>,
    /// Raw monotonic tick, kept for forensic reconstruction.
    pub tick: Tick,
    /// Whether `detected_at` came from a synchronised clock.
    pub clock_synced: bool,
}

impl Event {
    /// Build a NED event.
    pub fn ned(
        station: &str,
        sequence: u64,
        tick: Tick,
        detected_at: DateTime<Utc>,
        clock_synced: bool,
    ) -> Self {
        Self {
            event_id: format!("{station}-ned-{sequence:08}-{:08x}", tick.0),
            kind: EventKind::Ned,
            sequence,
            detected_at,
            tick,
            clock_synced,
        }
    }

    /// Build a self-test event. `count` is the per-boot self-test counter.
    pub fn bist_pass(
        station: &str,
        count: u64,
        tick: Tick,
        detected_at: DateTime<Utc>,
        clock_synced: bool,
    ) -> Self {
        Self {
            event_id: format!("{station}-bist-{count}-{:08x}", tick.0),
            kind: EventKind::BistPass,
            sequence: count,
            detected_at,
            tick,
            clock_synced,
        }
    }
}

/// Wire shape of a delivered event in the remote document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Idempotency key.
    pub event_id: String,
    /// Always `"NED"` for delivered records.
    pub kind: EventKind,
    /// Persisted sequence number.
    pub sequence: u64,
    /// ISO-8601 UTC timestamp with millisecond precision.
    pub detected_at: String,
}

impl From<&Event> for EventRecord {
    fn from(event: &Event) -> Self {
        Self {
            event_id: event.event_id.clone(),
            kind: event.kind,
            sequence: event.sequence,
            detected_at: event
                .detected_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}
