//! The per-station JSON document.

use super::Heartbeat;
use crate::event::EventRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const NUKE_NO: &str = "no";
const NUKE_YES: &str = "yes";
const UPLOAD_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn nuke_no() -> String {
    NUKE_NO.to_string()
}

/// Fixed facts about the station written into every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StationIdentity {
    /// Station name.
    pub name: String,
    /// Latitude, written as configured.
    #[serde(default)]
    pub lat: Option<Value>,
    /// Longitude, written as configured.
    #[serde(default)]
    pub long: Option<Value>,
}

/// Remote document. Keys keep the names existing readers of the file expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationDocument {
    /// Station name.
    #[serde(default)]
    pub station: Option<String>,
    /// `"yes"` once any NED has been delivered. Never reverts.
    #[serde(rename = "nuke gone off?", default = "nuke_no")]
    pub nuke_gone_off: String,
    /// Time of the last heartbeat, `YYYY-MM-DD HH:MM:SS` UTC.
    #[serde(rename = "last monitor upload date", default)]
    pub last_monitor_upload: Option<String>,
    /// `detected_at` of the most recent delivered NED.
    #[serde(rename = "nuke detected time", default)]
    pub nuke_detected_time: Option<String>,
    /// One per successful heartbeat.
    #[serde(rename = "total minutes monitored", default)]
    pub total_minutes_monitored: u64,
    /// Latitude.
    #[serde(default)]
    pub lat: Option<Value>,
    /// Longitude.
    #[serde(default)]
    pub long: Option<Value>,
    /// Delivered events, in commit order.
    #[serde(default)]
    pub events: Vec<EventRecord>,
    /// Fields written by someone else; preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for StationDocument {
    fn default() -> Self {
        Self {
            station: None,
            nuke_gone_off: nuke_no(),
            last_monitor_upload: None,
            nuke_detected_time: None,
            total_minutes_monitored: 0,
            lat: None,
            long: None,
            events: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl StationDocument {
    /// Whether a record with `event_id` is already present.
    pub fn contains(&self, event_id: &str) -> bool {
        self.events.iter().any(|e| e.event_id == event_id)
    }

    /// Append `record` unless its id is already present. Returns whether it was added.
    pub fn append_event(&mut self, record: &EventRecord) -> bool {
        if self.contains(&record.event_id) {
            return false;
        }
        self.events.push(record.clone());
        self.nuke_gone_off = NUKE_YES.to_string();
        self.nuke_detected_time = Some(record.detected_at.clone());
        true
    }

    /// Count a monitored minute and refresh the station facts.
    pub fn apply_heartbeat(&mut self, heartbeat: &Heartbeat, identity: &StationIdentity) {
        self.station = Some(identity.name.clone());
        if identity.lat.is_some() {
            self.lat = identity.lat.clone();
        }
        if identity.long.is_some() {
            self.long = identity.long.clone();
        }
        self.total_minutes_monitored += 1;
        self.last_monitor_upload = Some(heartbeat.at.format(UPLOAD_DATE_FORMAT).to_string());
        if heartbeat.ned_seen || !self.events.is_empty() {
            self.nuke_gone_off = NUKE_YES.to_string();
        }
    }

    /// Commit message for a write of this document.
    pub fn commit_message(station: &str, what: &str) -> String {
        format!("Update from {station}: {what}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use chrono::{TimeZone, Utc};

    fn record(id: &str) -> EventRecord {
        EventRecord {
            event_id: id.to_string(),
            kind: EventKind::Ned,
            sequence: 1,
            detected_at: "2024-05-06T07:08:09.123Z".to_string(),
        }
    }

    #[test]
    fn legacy_document_parses_and_keeps_unknown_fields() {
        let legacy = serde_json::json!({
            "station": "kx1",
            "nuke gone off?": "no",
            "last monitor upload date": "2024-05-06 07:00:00",
            "nuke detected time": null,
            "total minutes monitored": 41,
            "lat": "51.5",
            "long": "-0.1",
            "operator": "night shift"
        });
        let mut doc: StationDocument = serde_json::from_value(legacy).unwrap();
        assert_eq!(doc.total_minutes_monitored, 41);
        assert!(doc.events.is_empty());

        assert!(doc.append_event(&record("kx1-ned-00000001-000003e8")));
        let out = serde_json::to_value(&doc).unwrap();
        assert_eq!(out["operator"], "night shift");
        assert_eq!(out["nuke gone off?"], "yes");
        assert_eq!(out["events"][0]["event_id"], "kx1-ned-00000001-000003e8");
    }

    #[test]
    fn append_is_idempotent_on_event_id() {
        let mut doc = StationDocument::default();
        assert!(doc.append_event(&record("a")));
        assert!(!doc.append_event(&record("a")));
        assert_eq!(doc.events.len(), 1);
    }

    #[test]
    fn heartbeat_counts_minutes_and_nuke_flag_is_sticky() {
        let mut doc = StationDocument::default();
        let identity = StationIdentity {
            name: "kx1".into(),
            lat: Some(Value::from(51.5)),
            long: None,
        };
        let at = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();

        doc.apply_heartbeat(&Heartbeat { at, ned_seen: false }, &identity);
        assert_eq!(doc.total_minutes_monitored, 1);
        assert_eq!(doc.nuke_gone_off, "no");
        assert_eq!(doc.last_monitor_upload.as_deref(), Some("2024-05-06 07:08:09"));

        doc.append_event(&record("a"));
        doc.events.clear();
        doc.apply_heartbeat(&Heartbeat { at, ned_seen: false }, &identity);
        assert_eq!(doc.nuke_gone_off, "yes");
        assert_eq!(doc.total_minutes_monitored, 2);
    }
}
