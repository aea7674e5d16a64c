use std::collections::VecDeque;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_CHUNKS: usize = 512;
pub const DEFAULT_MAX_BYTES: usize = 1024 * 1024;

/// Output payload as delivered to clients and replayed on attach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputChunk {
    pub data: String,
    pub encoding: String,
    pub dir: String,
    pub ts: String,
}

struct ReplayInner {
    chunks: VecDeque<(OutputChunk, usize)>,
    total_bytes: usize,
    truncated: bool,
}

/// Snapshot handed to a freshly attached client before live traffic.
#[derive(Debug, Clone, Serialize)]
pub struct ReplaySnapshot {
    pub chunks: Vec<OutputChunk>,
    pub truncated: bool,
}

/// Bounded ring of recent output chunks. Eviction from the head keeps
/// both the chunk-count and cumulative-byte limits and sets a sticky
/// `truncated` flag.
pub struct ReplayBuffer {
    inner: RwLock<ReplayInner>,
    max_chunks: usize,
    max_bytes: usize,
}

impl ReplayBuffer {
    pub fn new(max_chunks: usize, max_bytes: usize) -> Self {
        Self {
            inner: RwLock::new(ReplayInner {
                chunks: VecDeque::new(),
                total_bytes: 0,
                truncated: false,
            }),
            max_chunks: max_chunks.max(1),
            max_bytes: max_bytes.max(1),
        }
    }

    /// Append one chunk; `raw_len` is the decoded byte size used for
    /// the cumulative-byte limit.
    pub fn append(&self, chunk: OutputChunk, raw_len: usize) {
        let mut inner = self.inner.write().expect("replay lock");
        inner.chunks.push_back((chunk, raw_len));
        inner.total_bytes += raw_len;
        while inner.chunks.len() > self.max_chunks || inner.total_bytes > self.max_bytes {
            if let Some((_, evicted)) = inner.chunks.pop_front() {
                inner.total_bytes -= evicted;
                inner.truncated = true;
            } else {
                break;
            }
        }
    }

    /// Copy the current window under the read lock so no producer can
    /// mutate mid-copy.
    pub fn snapshot(&self) -> ReplaySnapshot {
        let inner = self.inner.read().expect("replay lock");
        ReplaySnapshot {
            chunks: inner.chunks.iter().map(|(c, _)| c.clone()).collect(),
            truncated: inner.truncated,
        }
    }
}
