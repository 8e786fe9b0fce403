//! On-disk layout of the delivery queue.
//!
//! ```text
//! <queue dir>/
//!   sequence.a, sequence.b          dual-slot sequence counter
//!   entry-00000000000000000001.json one sealed QueueEntry per file
//!   quarantine/                     unreadable files, moved aside for inspection
//! ```
//!
//! Every file is a sealed envelope: the JSON payload as a string plus its SHA-256.
//! Files are written to a `.tmp` sibling, fsynced, renamed into place and the
//! directory fsynced, so a torn write leaves either the old file or a stray `.tmp`
//! that is discarded on the next open. A payload whose checksum does not match is
//! never interpreted as a valid record.

use super::QueueEntry;
use crate::error::{AppResult, BhangError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const ENVELOPE_VERSION: u32 = 1;
const ENTRY_PREFIX: &str = "entry-";
const ENTRY_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";
const QUARANTINE_DIR: &str = "quarantine";
const COUNTER_SLOTS: [&str; 2] = ["sequence.a", "sequence.b"];

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    checksum: String,
    payload: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CounterRecord {
    last_sequence: u64,
}

/// A file that could not be trusted and was moved aside.
#[derive(Debug, Clone)]
pub struct Quarantined {
    /// Where the file was found.
    pub original: PathBuf,
    /// Where it lives now.
    pub moved_to: PathBuf,
    /// Why it was rejected.
    pub reason: String,
}

/// Result of scanning the queue directory.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Valid entries, in no particular order.
    pub entries: Vec<QueueEntry>,
    /// Highest valid counter value, 0 when no slot was readable.
    pub last_sequence: u64,
    /// Files moved to quarantine.
    pub quarantined: Vec<Quarantined>,
    /// Interrupted writes that were discarded.
    pub discarded_temps: usize,
}

/// Filesystem backend. Only [`super::DeliveryQueue`] holds one.
#[derive(Debug)]
pub struct QueueStore {
    dir: PathBuf,
}

impl QueueStore {
    /// Create the directory tree if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> AppResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(QUARANTINE_DIR)).await?;
        Ok(Self { dir })
    }

    /// Queue directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, sequence: u64) -> PathBuf {
        self.dir
            .join(format!("{ENTRY_PREFIX}{sequence:020}.{ENTRY_EXTENSION}"))
    }

    /// Durably write one entry.
    pub async fn write_entry(&self, entry: &QueueEntry) -> AppResult<()> {
        let bytes = seal(entry)?;
        atomic_write(&self.entry_path(entry.event.sequence), &bytes).await
    }

    /// Remove a delivered entry.
    pub async fn remove_entry(&self, sequence: u64) -> AppResult<()> {
        match fs::remove_file(self.entry_path(sequence)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        sync_dir(&self.dir).await;
        Ok(())
    }

    /// Durably record the last allocated sequence number.
    pub async fn write_counter(&self, last_sequence: u64) -> AppResult<()> {
        let slot = COUNTER_SLOTS[(last_sequence % 2) as usize];
        let bytes = seal(&CounterRecord { last_sequence })?;
        atomic_write(&self.dir.join(slot), &bytes).await
    }

    /// Scan the directory: load entries and counter, quarantine what fails to unseal.
    pub async fn load(&self) -> AppResult<LoadReport> {
        let mut report = LoadReport::default();

        for slot in COUNTER_SLOTS {
            let path = self.dir.join(slot);
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match unseal::<CounterRecord>(&bytes) {
                Ok(record) => {
                    report.last_sequence = report.last_sequence.max(record.last_sequence);
                }
                Err(reason) => report.quarantined.push(self.quarantine(&path, reason).await?),
            }
        }

        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if !item.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
                fs::remove_file(&path).await?;
                report.discarded_temps += 1;
                continue;
            }

            let Some(sequence) = parse_entry_name(name) else {
                continue;
            };

            let bytes = fs::read(&path).await?;
            match unseal::<QueueEntry>(&bytes) {
                Ok(entry) if entry.event.sequence == sequence => report.entries.push(entry),
                Ok(entry) => {
                    let reason = format!(
                        "file name says sequence {sequence}, payload says {}",
                        entry.event.sequence
                    );
                    report.quarantined.push(self.quarantine(&path, reason).await?);
                }
                Err(reason) => report.quarantined.push(self.quarantine(&path, reason).await?),
            }
        }

        Ok(report)
    }

    async fn quarantine(&self, path: &Path, reason: String) -> AppResult<Quarantined> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let moved_to = self
            .dir
            .join(QUARANTINE_DIR)
            .join(format!("{file_name}.{stamp}"));
        fs::rename(path, &moved_to).await?;
        sync_dir(&self.dir).await;
        Ok(Quarantined {
            original: path.to_path_buf(),
            moved_to,
            reason,
        })
    }
}

fn parse_entry_name(name: &str) -> Option<u64> {
    name.strip_prefix(ENTRY_PREFIX)?
        .strip_suffix(&format!(".{ENTRY_EXTENSION}"))?
        .parse()
        .ok()
}

fn checksum(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn seal<T: Serialize>(value: &T) -> AppResult<Vec<u8>> {
    let payload = serde_json::to_string(value)?;
    let envelope = Envelope {
        version: ENVELOPE_VERSION,
        checksum: checksum(&payload),
        payload,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

fn unseal<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, String> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| format!("unreadable envelope: {e}"))?;
    if envelope.version != ENVELOPE_VERSION {
        return Err(format!("unsupported envelope version {}", envelope.version));
    }
    if checksum(&envelope.payload) != envelope.checksum {
        return Err("checksum mismatch".to_string());
    }
    serde_json::from_str(&envelope.payload).map_err(|e| format!("unreadable payload: {e}"))
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> AppResult<()> {
    let temp = path.with_extension(TEMP_EXTENSION);
    let mut file = fs::File::create(&temp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&temp, path).await.map_err(|e| {
        BhangError::Io(std::io::Error::new(
            e.kind(),
            format!("rename {temp:?} -> {path:?}: {e}"),
        ))
    })?;
    if let Some(parent) = path.parent() {
        sync_dir(parent).await;
    }
    Ok(())
}

// Directory fsync is not supported everywhere; the rename is still atomic.
async fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir).await {
        let _ = handle.sync_all().await;
    }
}
