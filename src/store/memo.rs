//! Tool-ID memo: a tiny key/value store with expiring values.
//!
//! Wrapper selection sometimes has to answer "is this `cc` really clang or
//! gcc?", which costs a stat-and-hash of candidate binaries. The answer is
//! memoized here so repeated invocations within one build skip the check.
//! Values expire after a short TTL and are additionally invalidated when
//! the probed tool's mtime changes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::filesys;
use crate::hasher;

/// Default value lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct MemoRecord {
    value: String,
    expires_at: DateTime<Utc>,
    /// Millisecond mtime of the file the value was derived from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    source_mtime_ms: Option<i64>,
}

/// Key/value store under `root/memo/`, one JSON file per key.
pub struct ToolIdMemo {
    dir: PathBuf,
}

impl ToolIdMemo {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join("memo"),
        }
    }

    fn record_path(&self, key: &str) -> PathBuf {
        // Keys contain arbitrary path characters; hash them into a file name.
        self.dir
            .join(format!("{}.json", hasher::hash_bytes(key).to_hex()))
    }

    /// Look up a value. Returns `None` when the key is absent, expired,
    /// or stale with respect to `source_mtime`.
    pub fn get(&self, key: &str, source_mtime: Option<SystemTime>) -> Option<String> {
        let path = self.record_path(key);
        let text = fs::read_to_string(&path).ok()?;
        let record: MemoRecord = serde_json::from_str(&text).ok()?;

        if Utc::now() > record.expires_at {
            debug!("memo entry for {key:?} expired");
            return None;
        }
        if record.source_mtime_ms != source_mtime.map(mtime_ms) {
            debug!("memo entry for {key:?} invalidated by mtime change");
            return None;
        }
        Some(record.value)
    }

    /// Store a value. Failures are swallowed; the memo is an optimization.
    pub fn put(&self, key: &str, value: &str, ttl: Duration, source_mtime: Option<SystemTime>) {
        let record = MemoRecord {
            value: value.to_string(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30)),
            source_mtime_ms: source_mtime.map(mtime_ms),
        };
        let result = fs::create_dir_all(&self.dir).and_then(|_| {
            let json = serde_json::to_vec(&record)?;
            filesys::atomic_write(&self.record_path(key), &json)
        });
        if let Err(err) = result {
            debug!("failed to store memo entry for {key:?}: {err}");
        }
    }
}

fn mtime_ms(t: SystemTime) -> i64 {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}
