//! Station configuration.
//!
//! Loaded with `figment`, later sources overriding earlier ones:
//! 1. built-in defaults
//! 2. a TOML file (default `config/bhangmeter.toml`, optional)
//! 3. environment variables prefixed `BHANGMETER_`, with `__` separating sections,
//!    e.g. `BHANGMETER_REMOTE__TOKEN` or `BHANGMETER_UPLOAD__RETRY__MAX_ATTEMPTS`
//!
//! [`StationConfig::load`] validates after extraction, so a station never starts with
//! a configuration it cannot run.

use crate::error::{AppResult, BhangError};
use crate::remote::{GitHubTarget, StationIdentity};
use crate::sntp::SntpSettings;
use crate::tracing_setup::{parse_log_level, OutputFormat};
use crate::upload::{RetryPolicy, UploadSettings};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/bhangmeter.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "BHANGMETER_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Station identity.
    pub station: StationSection,
    /// Edge capture.
    pub signal: SignalSection,
    /// Durable queue.
    pub queue: QueueSection,
    /// Upload worker.
    pub upload: UploadSection,
    /// Remote document store and link supervision.
    pub remote: RemoteSection,
    /// Wall-clock synchronisation.
    pub time: SntpSettings,
    /// Local status and heartbeat.
    pub status: StatusSection,
    /// Logging.
    pub logging: LoggingSection,
}

/// `[station]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationSection {
    /// Station name; prefixes every event id.
    pub name: String,
    /// Latitude reported in the station document.
    pub lat: Option<f64>,
    /// Longitude reported in the station document.
    pub long: Option<f64>,
}

impl Default for StationSection {
    fn default() -> Self {
        Self {
            name: "bhangmeter".to_string(),
            lat: None,
            long: None,
        }
    }
}

impl StationSection {
    /// Identity written into the remote document.
    pub fn identity(&self) -> StationIdentity {
        StationIdentity {
            name: self.name.clone(),
            lat: self.lat.map(serde_json::Value::from),
            long: self.long.map(serde_json::Value::from),
        }
    }
}

/// `[signal]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalSection {
    /// Debounce window in milliseconds; also the detector-priority window.
    pub debounce_ms: u64,
    /// Edges the interrupt handoff ring can hold.
    pub handoff_capacity: usize,
}

impl Default for SignalSection {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            handoff_capacity: 32,
        }
    }
}

impl SignalSection {
    /// Debounce window.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// `[queue]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// Directory holding queue entries.
    pub dir: PathBuf,
    /// Seconds after which an in-flight entry is presumed abandoned.
    pub stuck_in_flight_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/queue"),
            stuck_in_flight_secs: 120,
        }
    }
}

/// `[upload]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSection {
    /// Backoff and give-up rule.
    pub retry: RetryPolicy,
    /// Bound on one remote request, seconds.
    pub request_timeout_secs: u64,
    /// Poll interval when idle, milliseconds.
    pub idle_poll_ms: u64,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            request_timeout_secs: 15,
            idle_poll_ms: 5000,
        }
    }
}

impl UploadSection {
    /// Worker settings.
    pub fn settings(&self) -> UploadSettings {
        UploadSettings {
            retry: self.retry.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            idle_poll: Duration::from_millis(self.idle_poll_ms),
        }
    }
}

/// Remote store implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteBackend {
    /// GitHub contents API.
    Github,
    /// In-process document; bench runs only.
    Memory,
}

/// How link readiness is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityMode {
    /// TCP connect probe against `probe_addr`.
    Probe,
    /// Assume the host manages the network.
    Always,
}

/// `[remote]`
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    /// Store implementation.
    pub backend: RemoteBackend,
    /// API root.
    pub api_base: String,
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Document path inside the repository.
    pub path: String,
    /// Branch.
    pub branch: String,
    /// Access token. Prefer `BHANGMETER_REMOTE__TOKEN` over the file.
    pub token: String,
    /// Link readiness mode.
    pub connectivity: ConnectivityMode,
    /// `host:port` probed for readiness.
    pub probe_addr: String,
    /// Probe timeout, seconds.
    pub probe_timeout_secs: u64,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            backend: RemoteBackend::Github,
            api_base: "https://api.github.com".to_string(),
            owner: String::new(),
            repo: String::new(),
            path: "station.json".to_string(),
            branch: "main".to_string(),
            token: String::new(),
            connectivity: ConnectivityMode::Probe,
            probe_addr: "api.github.com:443".to_string(),
            probe_timeout_secs: 5,
        }
    }
}

impl fmt::Debug for RemoteSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = if self.token.is_empty() {
            "<unset>"
        } else {
            "<redacted>"
        };
        f.debug_struct("RemoteSection")
            .field("backend", &self.backend)
            .field("api_base", &self.api_base)
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("path", &self.path)
            .field("branch", &self.branch)
            .field("token", &token)
            .field("connectivity", &self.connectivity)
            .field("probe_addr", &self.probe_addr)
            .field("probe_timeout_secs", &self.probe_timeout_secs)
            .finish()
    }
}

impl RemoteSection {
    /// GitHub target for the contents store.
    pub fn github_target(&self) -> GitHubTarget {
        GitHubTarget {
            api_base: self.api_base.clone(),
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            path: self.path.clone(),
            branch: self.branch.clone(),
            token: self.token.clone(),
        }
    }
}

/// `[status]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSection {
    /// Seconds between heartbeats; 0 disables them.
    pub heartbeat_secs: u64,
    /// Faults kept in the diagnostic history.
    pub fault_history: usize,
}

impl Default for StatusSection {
    fn default() -> Self {
        Self {
            heartbeat_secs: 60,
            fault_history: 256,
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// trace, debug, info, warn or error.
    pub level: String,
    /// pretty, compact or json.
    pub format: String,
    /// Log span open/close.
    pub span_events: bool,
    /// Include source file and line.
    pub file_and_line: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            span_events: false,
            file_and_line: false,
        }
    }
}

impl StationConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` (missing file is fine) and the environment, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults and environment");
        }
        let config: StationConfig = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Provider chain: defaults, then TOML, then environment.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(StationConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check values that parse but cannot run.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(BhangError::Configuration(msg));

        parse_log_level(&self.logging.level)?;
        self.logging.format.parse::<OutputFormat>()?;

        let name = &self.station.name;
        if name.is_empty() || name.chars().any(|c| c.is_whitespace()) {
            return invalid(format!(
                "station.name '{name}' must be non-empty without whitespace"
            ));
        }
        if self.signal.debounce_ms == 0 {
            return invalid("signal.debounce_ms must be greater than 0".to_string());
        }
        if self.signal.handoff_capacity == 0 {
            return invalid("signal.handoff_capacity must be greater than 0".to_string());
        }
        if self.queue.stuck_in_flight_secs == 0 {
            return invalid("queue.stuck_in_flight_secs must be greater than 0".to_string());
        }

        let retry = &self.upload.retry;
        if retry.max_attempts == 0 {
            return invalid("upload.retry.max_attempts must be greater than 0".to_string());
        }
        if retry.base_delay.is_zero() || retry.base_delay > retry.max_delay {
            return invalid(format!(
                "upload.retry.base_delay_ms ({:?}) must be non-zero and not above max_delay_ms ({:?})",
                retry.base_delay, retry.max_delay
            ));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return invalid(format!(
                "upload.retry.jitter {} must be within 0.0..=1.0",
                retry.jitter
            ));
        }
        if self.upload.request_timeout_secs == 0 {
            return invalid("upload.request_timeout_secs must be greater than 0".to_string());
        }

        if self.remote.backend == RemoteBackend::Github {
            let remote = &self.remote;
            for (key, value) in [
                ("remote.owner", &remote.owner),
                ("remote.repo", &remote.repo),
                ("remote.path", &remote.path),
                ("remote.branch", &remote.branch),
                ("remote.token", &remote.token),
            ] {
                if value.trim().is_empty() {
                    return invalid(format!("{key} must be set for the github backend"));
                }
            }
        }
        if self.time.enabled && self.time.server.is_empty() {
            return invalid("time.server must be set when time sync is enabled".to_string());
        }
        Ok(())
    }

    /// Effective configuration as TOML, with the token masked.
    pub fn to_redacted_toml(&self) -> AppResult<String> {
        let mut shown = self.clone();
        if !shown.remote.token.is_empty() {
            shown.remote.token = "<redacted>".to_string();
        }
        toml::to_string_pretty(&shown)
            .map_err(|e| BhangError::Configuration(format!("Failed to render config: {e}")))
    }
}
