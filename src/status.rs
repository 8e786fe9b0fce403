//! Local status sink: the indicator side of the station.
//!
//! The pipeline reports three things locally: a self-test passed, a NED was latched,
//! and a fault occurred. Driving actual LEDs is outside this crate; [`IndicatorBoard`]
//! models the latch behaviour so a board support layer (or an operator console) can
//! render it.
//!
//! A failing sink never blocks the NED path. Callers count the failure and move on.

use crate::event::Event;
use crate::health::Fault;
use parking_lot::Mutex;
use thiserror::Error;

/// Failure reported by a status sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("status sink unavailable: {0}")]
pub struct StatusError(pub String);

/// Receiver of local, non-mission status.
pub trait StatusSink: Send + Sync {
    /// A BIST stimulus was confirmed.
    fn bist_passed(&self, event: &Event) -> Result<(), StatusError>;

    /// A NED was recorded and queued for delivery.
    fn ned_latched(&self, event: &Event) -> Result<(), StatusError>;

    /// An operator-visible fault was raised.
    fn fault(&self, fault: &Fault) -> Result<(), StatusError>;
}

/// Snapshot of the indicator latches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndicatorState {
    /// NED indicator (red on the original board).
    pub ned_latched: bool,
    /// Self-test confirmations seen this boot.
    pub bist_confirmations: u64,
    /// Fault indicator. Only an operator clears it.
    pub fault_latched: bool,
    /// Message of the most recent fault.
    pub last_fault: Option<String>,
}

/// Latching indicator model.
#[derive(Debug, Default)]
pub struct IndicatorBoard {
    state: Mutex<IndicatorState>,
}

impl IndicatorBoard {
    /// All indicators off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current latches.
    pub fn snapshot(&self) -> IndicatorState {
        self.state.lock().clone()
    }

    /// Operator acknowledgement of the fault indicator.
    pub fn clear_fault(&self) {
        let mut state = self.state.lock();
        state.fault_latched = false;
        state.last_fault = None;
    }
}

impl StatusSink for IndicatorBoard {
    fn bist_passed(&self, event: &Event) -> Result<(), StatusError> {
        let mut state = self.state.lock();
        state.bist_confirmations += 1;
        // A passing self-test is the manual reset for the NED indicator.
        state.ned_latched = false;
        tracing::info!(event_id = %event.event_id, "BIST passed");
        Ok(())
    }

    fn ned_latched(&self, event: &Event) -> Result<(), StatusError> {
        self.state.lock().ned_latched = true;
        tracing::warn!(
            event_id = %event.event_id,
            sequence = event.sequence,
            detected_at = %event.detected_at,
            "NED latched"
        );
        Ok(())
    }

    fn fault(&self, fault: &Fault) -> Result<(), StatusError> {
        let mut state = self.state.lock();
        state.fault_latched = true;
        state.last_fault = Some(fault.message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Tick;
    use crate::event::EventKind;
    use crate::health::{FaultKind, Severity};
    use chrono::Utc;

    fn event(kind: EventKind) -> Event {
        Event {
            event_id: "test".into(),
            kind,
            sequence: 1,
            detected_at: Utc::now(),
            tick: Tick(0),
            clock_synced: false,
        }
    }

    #[test]
    fn bist_clears_ned_but_not_fault() {
        let board = IndicatorBoard::new();
        board.ned_latched(&event(EventKind::Ned)).unwrap();
        board
            .fault(&Fault::new(
                FaultKind::RemoteRejection,
                Severity::Error,
                "upload",
                "401",
            ))
            .unwrap();

        board.bist_passed(&event(EventKind::BistPass)).unwrap();

        let state = board.snapshot();
        assert!(!state.ned_latched);
        assert!(state.fault_latched);
        assert_eq!(state.bist_confirmations, 1);

        board.clear_fault();
        assert!(!board.snapshot().fault_latched);
    }
}
