//! Stats ledger.
//!
//! One small JSON file per store (`root/stats`) holding the counters and
//! the recorded on-disk size. Every update is a read-modify-write of the
//! whole record under the store's exclusive file lock.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::filesys;
use crate::store::lock::StoreLock;

/// How long a writer waits for the ledger lock. Updates are tiny, so
/// contention clears quickly.
const LEDGER_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// The persistent counters for one store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Recorded total size of all entries on disk, in bytes.
    #[serde(default)]
    pub total_bytes: u64,
    /// Number of entries in the store.
    #[serde(default)]
    pub entry_count: u64,
    #[serde(default)]
    pub hits_direct: u64,
    #[serde(default)]
    pub hits_preprocessed: u64,
    #[serde(default)]
    pub hits_remote: u64,
    #[serde(default)]
    pub misses: u64,
    #[serde(default)]
    pub evictions: u64,
}

impl Stats {
    pub fn total_hits(&self) -> u64 {
        self.hits_direct + self.hits_preprocessed + self.hits_remote
    }
}

/// Handle to the on-disk ledger.
pub struct StatsLedger {
    path: PathBuf,
    lock_path: PathBuf,
}

impl StatsLedger {
    /// The ledger lives at `root/stats`.
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join("stats"),
            lock_path: root.join("stats.lock"),
        }
    }

    /// Read the current counters. A missing or corrupt ledger reads as
    /// all-zero; the next update rewrites it.
    pub fn read(&self) -> Stats {
        match fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
                debug!("unreadable stats ledger, starting fresh: {err}");
                Stats::default()
            }),
            Err(_) => Stats::default(),
        }
    }

    /// Apply a mutation to the ledger under the exclusive lock.
    pub fn update(&self, mutate: impl FnOnce(&mut Stats)) -> CacheResult<Stats> {
        let _lock = StoreLock::acquire(&self.lock_path, LEDGER_LOCK_TIMEOUT)
            .map_err(|e| CacheError::Internal(format!("stats lock: {e}")))?;

        let mut stats = self.read();
        mutate(&mut stats);

        let json = serde_json::to_string_pretty(&stats)
            .map_err(|e| CacheError::Internal(format!("stats serialization: {e}")))?;
        filesys::atomic_write(&self.path, json.as_bytes())?;
        Ok(stats)
    }

    /// Reset all counters to zero.
    pub fn zero(&self) -> CacheResult<Stats> {
        self.update(|stats| *stats = Stats::default())
    }
}
