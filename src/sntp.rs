//! Minimal SNTP client for anchoring [`TimeSync`].
//!
//! A single mode-3 request, transmit timestamp read from the reply. Millisecond
//! accuracy is all the event records promise, so round-trip compensation is skipped.

use crate::clock::{SyncPoint, TimeSync};
use crate::error::{AppResult, BhangError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::watch;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
pub const NTP_UNIX_DELTA: u64 = 2_208_988_800;

const PACKET_LEN: usize = 48;
// LI = 0, VN = 3, Mode = 3 (client)
const CLIENT_REQUEST: u8 = 0x1b;

/// Time synchronisation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SntpSettings {
    /// Run synchronisation at all.
    pub enabled: bool,
    /// `host:port` of the time server.
    pub server: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Requests per synchronisation before giving up.
    pub retries: u32,
    /// Pause between failed requests in seconds.
    pub retry_pause_secs: u64,
    /// Interval between synchronisations in seconds. 0 syncs once at startup.
    pub resync_secs: u64,
}

impl Default for SntpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            server: "pool.ntp.org:123".to_string(),
            timeout_secs: 5,
            retries: 3,
            retry_pause_secs: 2,
            resync_secs: 3600,
        }
    }
}

/// Decode the transmit timestamp of a server reply.
pub fn parse_response(packet: &[u8]) -> AppResult<DateTime<Utc>> {
    if packet.len() < PACKET_LEN {
        return Err(BhangError::TimeSync(format!(
            "short reply: {} bytes",
            packet.len()
        )));
    }
    let mode = packet[0] & 0x07;
    if mode != 4 && mode != 5 {
        return Err(BhangError::TimeSync(format!("unexpected mode {mode}")));
    }
    let seconds = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]);
    let fraction = u32::from_be_bytes([packet[44], packet[45], packet[46], packet[47]]);
    if seconds == 0 {
        return Err(BhangError::TimeSync("server is unsynchronised".to_string()));
    }

    let unix = i64::from(seconds) - NTP_UNIX_DELTA as i64;
    let nanos = ((u64::from(fraction) * 1_000_000_000) >> 32) as u32;
    DateTime::from_timestamp(unix, nanos)
        .ok_or_else(|| BhangError::TimeSync(format!("timestamp out of range: {unix}")))
}

/// One request to `server`, bounded by `timeout`.
pub async fn query(server: &str, timeout: Duration) -> AppResult<DateTime<Utc>> {
    let addr = lookup_host(server)
        .await?
        .next()
        .ok_or_else(|| BhangError::TimeSync(format!("{server} did not resolve")))?;
    let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;

    let mut request = [0u8; PACKET_LEN];
    request[0] = CLIENT_REQUEST;
    socket.send(&request).await?;

    let mut reply = [0u8; PACKET_LEN];
    let len = tokio::time::timeout(timeout, socket.recv(&mut reply))
        .await
        .map_err(|_| BhangError::TimeSync(format!("no reply from {server} in {timeout:?}")))??;
    parse_response(&reply[..len])
}

/// Query with the configured retries and anchor `time` on success.
pub async fn synchronize(time: &TimeSync, settings: &SntpSettings) -> AppResult<SyncPoint> {
    let timeout = Duration::from_secs(settings.timeout_secs);
    let attempts = settings.retries.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match query(&settings.server, timeout).await {
            Ok(wall) => {
                let point = time.sync_to(wall);
                tracing::info!(server = %settings.server, %wall, tick = %point.tick, "Clock synchronised");
                return Ok(point);
            }
            Err(e) => {
                tracing::warn!(attempt, server = %settings.server, "Time query failed: {e}");
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_secs(settings.retry_pause_secs)).await;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| BhangError::TimeSync("no attempts made".to_string())))
}

/// Keep `time` anchored until shutdown.
pub async fn run(time: Arc<TimeSync>, settings: SntpSettings, mut shutdown: watch::Receiver<bool>) {
    loop {
        if let Err(e) = synchronize(&time, &settings).await {
            let fallback = if time.anchor().is_some() {
                "keeping previous anchor"
            } else {
                "using device time"
            };
            tracing::warn!("Time sync failed, {fallback}: {e}");
        }
        if settings.resync_secs == 0 {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(settings.resync_secs)) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
