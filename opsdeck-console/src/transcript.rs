use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use opsdeck_core::envelope::Direction;
use opsdeck_core::time::now_rfc3339_millis;

use crate::error::ConsoleError;
use crate::metrics::Metrics;

const SYNC_THRESHOLD_BYTES: usize = 32 * 1024;
const SYNC_INTERVAL: Duration = Duration::from_secs(2);

/// One newline-delimited transcript record. Output and input entries
/// carry base64 bytes; status entries carry a free-form message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub ts: String,
    pub dir: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TranscriptEntry {
    pub fn bytes(dir: Direction, encoded: String) -> Self {
        Self {
            ts: now_rfc3339_millis(),
            dir,
            data: Some(encoded),
            encoding: Some("base64".to_string()),
            message: None,
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self {
            ts: now_rfc3339_millis(),
            dir: Direction::Status,
            data: None,
            encoding: None,
            message: Some(message.into()),
        }
    }
}

struct TranscriptInner {
    file: Option<File>,
    unsynced_bytes: usize,
    last_sync: Instant,
}

/// Serialized append-only writer for a session transcript. Producers
/// contend on one mutex, so entry order equals append order. Write
/// errors are logged and the entry dropped; they never reach the PTY
/// pump.
pub struct TranscriptWriter {
    inner: Mutex<TranscriptInner>,
    metrics: Arc<Metrics>,
}

impl TranscriptWriter {
    pub fn open(path: &Path, metrics: Arc<Metrics>) -> Result<Self, ConsoleError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| ConsoleError::internal(format!("create transcript dir: {err}")))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| ConsoleError::internal(format!("open transcript: {err}")))?;
        Ok(Self {
            inner: Mutex::new(TranscriptInner {
                file: Some(file),
                unsynced_bytes: 0,
                last_sync: Instant::now(),
            }),
            metrics,
        })
    }

    /// Append one entry. Silently dropped once the writer is closed.
    pub fn append(&self, entry: &TranscriptEntry) {
        let line = match serde_json::to_vec(entry) {
            Ok(mut bytes) => {
                bytes.push(b'\n');
                bytes
            }
            Err(err) => {
                warn!(event = "transcript_encode_error", error = %err);
                self.metrics
                    .transcript_write_errors_total
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let mut inner = self.inner.lock().expect("transcript lock");
        let Some(file) = inner.file.as_mut() else {
            return;
        };
        if let Err(err) = file.write_all(&line) {
            warn!(event = "transcript_write_error", error = %err);
            self.metrics
                .transcript_write_errors_total
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        inner.unsynced_bytes += line.len();
        let due = inner.unsynced_bytes >= SYNC_THRESHOLD_BYTES
            || inner.last_sync.elapsed() >= SYNC_INTERVAL;
        if due {
            sync_locked(&mut inner);
        }
    }

    /// Flush buffered entries to durable storage. `force` syncs even
    /// when neither the byte nor the interval threshold has tripped.
    pub fn flush(&self, force: bool) {
        let mut inner = self.inner.lock().expect("transcript lock");
        if inner.file.is_none() {
            return;
        }
        let due = force
            || inner.unsynced_bytes >= SYNC_THRESHOLD_BYTES
            || inner.last_sync.elapsed() >= SYNC_INTERVAL;
        if due && inner.unsynced_bytes > 0 {
            sync_locked(&mut inner);
        }
    }

    /// Final flush + fsync, then release the file handle. Appends
    /// after close are dropped.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("transcript lock");
        if inner.file.is_some() {
            sync_locked(&mut inner);
        }
        inner.file = None;
    }
}

fn sync_locked(inner: &mut TranscriptInner) {
    if let Some(file) = inner.file.as_mut() {
        if let Err(err) = file.sync_data() {
            warn!(event = "transcript_sync_error", error = %err);
        }
    }
    inner.unsynced_bytes = 0;
    inner.last_sync = Instant::now();
}
