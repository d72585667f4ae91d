//! Size-capped eviction and store housekeeping.
//!
//! Eviction is an LRU-by-atime sweep: snapshot every entry directory
//! under the global housekeeping lock, then delete oldest-first (with the
//! lock released) until the total drops to the low-water mark below the
//! configured cap. Deletions tolerate entries that disappear concurrently.

use std::fs;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::error::CacheResult;
use crate::filesys;
use crate::store::lock::{LockError, StoreLock};
use crate::store::LocalStore;

/// Eviction stops once the recorded size is at or below
/// `cap * LOW_WATER_NUM / LOW_WATER_DEN` (90%), so back-to-back publishes
/// do not re-trigger it immediately.
const LOW_WATER_NUM: u64 = 9;
const LOW_WATER_DEN: u64 = 10;

/// Lock files this old whose lock can be taken are considered stale.
const STALE_LOCK_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Housekeeping runs after roughly one publish in this many.
const HOUSEKEEPING_PERIOD: u64 = 100;

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvictionResult {
    pub scanned: usize,
    pub evicted: usize,
    pub bytes_reclaimed: u64,
}

impl LocalStore {
    /// Evict least-recently-used entries until the total size is within
    /// the cap's low-water mark.
    ///
    /// If another process holds the housekeeping lock the pass is skipped;
    /// that process is already doing the work.
    pub fn evict_until(&self, cap: u64) -> CacheResult<EvictionResult> {
        let lock_path = self.root().join(".housekeeping.lock");
        let lock = match StoreLock::acquire(&lock_path, Duration::from_millis(100)) {
            Ok(lock) => lock,
            Err(LockError::Timeout(_)) => {
                debug!("skipping eviction, another process is housekeeping");
                return Ok(EvictionResult::default());
            }
            Err(LockError::Io(err)) => return Err(err.into()),
        };

        // Snapshot under the lock so no publisher is mid-rename while we
        // enumerate; the deletions below run lock-free.
        let mut snapshot = self.collect_entries()?;
        let scanned = snapshot.len();
        let mut total: u64 = snapshot.iter().map(|e| e.size).sum();
        drop(lock);

        let low_water = cap / LOW_WATER_DEN * LOW_WATER_NUM;
        snapshot.sort_by_key(|e| e.atime);

        let mut evicted = 0usize;
        let mut bytes_reclaimed = 0u64;
        for entry in &snapshot {
            if total <= low_water {
                break;
            }
            match fs::remove_dir_all(&entry.path) {
                Ok(()) => {
                    debug!("evicted {} ({} bytes)", entry.path.display(), entry.size);
                    total = total.saturating_sub(entry.size);
                    evicted += 1;
                    bytes_reclaimed += entry.size;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    // Already gone; its size no longer counts.
                    total = total.saturating_sub(entry.size);
                }
                Err(err) => debug!("failed to evict {}: {err}", entry.path.display()),
            }
        }

        self.ledger().update(|stats| {
            stats.total_bytes = total;
            stats.entry_count = (scanned - evicted) as u64;
            stats.evictions += evicted as u64;
        })?;

        if evicted > 0 {
            info!("evicted {evicted} entries ({bytes_reclaimed} bytes reclaimed)");
        }
        Ok(EvictionResult {
            scanned,
            evicted,
            bytes_reclaimed,
        })
    }

    /// Full housekeeping pass: eviction plus stale lock cleanup.
    pub fn housekeep(&self, cap: u64) -> CacheResult<EvictionResult> {
        let result = self.evict_until(cap)?;
        self.delete_stale_locks();
        Ok(result)
    }

    /// Run housekeeping roughly once per `HOUSEKEEPING_PERIOD` calls.
    ///
    /// Called after successful publishes: that is the only place the
    /// store grows, and the invocation already paid for a compile.
    pub fn maybe_housekeep(&self, cap: u64) -> CacheResult<Option<EvictionResult>> {
        if !is_time_for_housekeeping() {
            return Ok(None);
        }
        self.housekeep(cap).map(Some)
    }

    /// Remove lock files that have not been used for a day and whose lock
    /// can be taken (i.e. no live holder).
    fn delete_stale_locks(&self) {
        let now = SystemTime::now();
        for path in match fs::read_dir(self.root()) {
            Ok(iter) => iter
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .collect::<Vec<_>>(),
            Err(_) => return,
        } {
            if path.extension().map_or(true, |ext| ext != "lock") {
                continue;
            }
            let info = match filesys::file_info(&path) {
                Ok(info) => info,
                Err(_) => continue,
            };
            let idle = now
                .duration_since(info.atime)
                .unwrap_or(Duration::ZERO);
            if idle < STALE_LOCK_AGE {
                continue;
            }
            // Holding the lock proves nobody else does.
            if let Ok(lock) = StoreLock::acquire(&path, Duration::from_millis(10)) {
                drop(lock);
                debug!("deleting stale lock file {}", path.display());
                let _ = fs::remove_file(&path);
            }
        }
    }
}

/// Decide probabilistically whether to run housekeeping, by scrambling a
/// high-resolution timestamp (timer accuracy alone is not uniform enough).
fn is_time_for_housekeeping() -> bool {
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    let rnd = (t ^ (t >> 7)) ^ ((t >> 14) ^ (t >> 20));
    rnd % HOUSEKEEPING_PERIOD == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CacheEntry;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn entry_with_size(size: usize) -> CacheEntry {
        let mut artifacts = BTreeMap::new();
        artifacts.insert("object".to_string(), vec![0u8; size]);
        CacheEntry {
            artifacts,
            stdout: Vec::new(),
            stderr: Vec::new(),
            return_code: 0,
        }
    }

    fn key(i: usize) -> String {
        format!("{i:064x}")
    }

    #[cfg(unix)]
    fn set_entry_atime(store: &LocalStore, entry_key: &str, secs: i64) {
        let dir = store.entry_dir(entry_key).unwrap();
        crate::filesys::set_file_times(&dir, secs, secs).unwrap();
    }

    #[test]
    fn eviction_is_a_no_op_under_cap() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        store.publish_entry(&key(1), &entry_with_size(100)).unwrap();

        let result = store.evict_until(1_000_000).unwrap();
        assert_eq!(result.evicted, 0);
        assert!(store.lookup_entry(&key(1)).is_some());
    }

    #[cfg(unix)]
    #[test]
    fn eviction_removes_oldest_first_down_to_low_water() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        // 10 entries of ~1000 bytes each, with ascending access times
        // (entry 0 is the oldest).
        for i in 0..10 {
            store.publish_entry(&key(i), &entry_with_size(1000)).unwrap();
            set_entry_atime(&store, &key(i), 1_000_000 + i as i64);
        }

        // Cap of 5000 → low water 4500 → at most 4 surviving entries.
        let result = store.evict_until(5000).unwrap();
        assert!(result.evicted >= 6, "evicted {}", result.evicted);

        let stats = store.ledger().read();
        assert!(stats.total_bytes <= 4500);
        assert_eq!(stats.evictions, result.evicted as u64);

        // No surviving entry is older than any evicted one.
        for i in 0..result.evicted {
            assert!(store.lookup_entry(&key(i)).is_none(), "entry {i} should be gone");
        }
        for i in result.evicted..10 {
            assert!(store.lookup_entry(&key(i)).is_some(), "entry {i} should survive");
        }
    }

    #[test]
    fn eviction_terminates_with_recorded_size_within_cap() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        for i in 0..5 {
            store.publish_entry(&key(i), &entry_with_size(2000)).unwrap();
        }

        store.evict_until(4000).unwrap();
        assert!(store.ledger().read().total_bytes <= 4000);
    }

    #[test]
    fn eviction_updates_entry_count() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        for i in 0..4 {
            store.publish_entry(&key(i), &entry_with_size(1000)).unwrap();
        }

        store.evict_until(2000).unwrap();

        let stats = store.ledger().read();
        let alive = (0..4).filter(|&i| store.lookup_entry(&key(i)).is_some()).count();
        assert_eq!(stats.entry_count, alive as u64);
    }

    #[cfg(unix)]
    #[test]
    fn stale_lock_files_are_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        let stale = dir.path().join("old.lock");
        std::fs::write(&stale, b"").unwrap();
        crate::filesys::set_file_times(&stale, 1_000, 1_000).unwrap();

        let fresh = dir.path().join("stats.lock");
        std::fs::write(&fresh, b"").unwrap();

        store.housekeep(u64::MAX).unwrap();

        assert!(!stale.exists());
        assert!(fresh.exists());
    }
}
