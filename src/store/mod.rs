//! Local content-addressed store.
//!
//! Layout under the configured root:
//!
//! ```text
//! root/stats                          ledger (JSON)
//! root/c/entries/<aa>/<bb>/<rest>/    one directory per cache entry
//! root/c/manifests/<aa>/<bb>/<rest>/  direct-mode manifests (slot files)
//! root/c/tmp/                         staging area for atomic renames
//! root/memo/                          tool-ID memo
//! ```
//!
//! Entries become visible only through a directory rename, so readers
//! never observe a half-written entry. Write-write races resolve to
//! first-writer-wins: a publisher that loses the rename discards its
//! staged copy and accepts the existing entry as canonical.

mod entry;
mod eviction;
mod lock;
mod manifest;
mod memo;
mod stats;

pub use entry::{CacheEntry, ENTRY_MAGIC, RETURN_CODE_FILE, STDERR_FILE, STDOUT_FILE};
pub use eviction::EvictionResult;
pub use lock::{LockError, LockResult, StoreLock};
pub use manifest::{Manifest, ManifestFile, MANIFEST_VERSION};
pub use memo::{ToolIdMemo, DEFAULT_TTL};
pub use stats::{Stats, StatsLedger};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::filesys::{self, TempPath};

/// Number of manifest slots per direct-mode key. Too few causes
/// thrashing when switching branches; too many slows down probes that
/// have to try every slot.
const MANIFEST_SLOTS: usize = 4;

/// Shortest key the two-level sharding can split.
const MIN_KEY_LEN: usize = 5;

/// Handle to an entry directory found by a lookup.
///
/// The entry may be evicted at any time after the lookup; all accessors
/// surface that as an error which callers treat as a miss.
pub struct EntryHandle {
    dir: PathBuf,
}

impl EntryHandle {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn return_code(&self) -> CacheResult<i32> {
        let text = fs::read_to_string(self.dir.join(RETURN_CODE_FILE))?;
        text.trim().parse().map_err(|_| CacheError::Corrupt {
            path: self.dir.join(RETURN_CODE_FILE),
            reason: format!("unparsable return code {text:?}"),
        })
    }

    pub fn stdout(&self) -> CacheResult<Vec<u8>> {
        Ok(fs::read(self.dir.join(STDOUT_FILE))?)
    }

    pub fn stderr(&self) -> CacheResult<Vec<u8>> {
        Ok(fs::read(self.dir.join(STDERR_FILE))?)
    }

    /// Materialize one artifact at `target`, via hard link when allowed.
    /// The target is touched so build-system file trackers pick it up.
    pub fn materialize_artifact(
        &self,
        artifact_id: &str,
        target: &Path,
        hard_links: bool,
    ) -> CacheResult<()> {
        let source = self.dir.join(artifact_id);
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        if hard_links {
            filesys::link_or_copy(&source, target)?;
        } else {
            fs::copy(&source, target)?;
        }
        filesys::touch(target)?;
        Ok(())
    }

    /// Read the whole entry into memory (used for remote replication).
    pub fn to_entry(&self) -> CacheResult<CacheEntry> {
        CacheEntry::read_from_dir(&self.dir)
    }
}

/// The local store rooted at a cache directory.
pub struct LocalStore {
    root: PathBuf,
    ledger: StatsLedger,
}

impl LocalStore {
    /// Open (and create, if needed) a store at `root`.
    pub fn open(root: &Path) -> CacheResult<Self> {
        let store = Self {
            root: root.to_path_buf(),
            ledger: StatsLedger::new(root),
        };
        fs::create_dir_all(store.entries_dir())?;
        fs::create_dir_all(store.manifests_dir())?;
        fs::create_dir_all(store.tmp_dir())?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ledger(&self) -> &StatsLedger {
        &self.ledger
    }

    pub fn memo(&self) -> ToolIdMemo {
        ToolIdMemo::new(&self.root)
    }

    fn entries_dir(&self) -> PathBuf {
        self.root.join("c").join("entries")
    }

    fn manifests_dir(&self) -> PathBuf {
        self.root.join("c").join("manifests")
    }

    pub(crate) fn tmp_dir(&self) -> PathBuf {
        self.root.join("c").join("tmp")
    }

    /// Two-level hex-prefix sharding: `<aa>/<bb>/<rest>`.
    fn shard_path(base: PathBuf, key: &str) -> CacheResult<PathBuf> {
        if key.len() < MIN_KEY_LEN || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CacheError::Internal(format!("malformed cache key {key:?}")));
        }
        Ok(base.join(&key[0..2]).join(&key[2..4]).join(&key[4..]))
    }

    /// Path of the entry directory for a key (whether or not it exists).
    pub fn entry_dir(&self, entry_key: &str) -> CacheResult<PathBuf> {
        Self::shard_path(self.entries_dir(), entry_key)
    }

    fn manifest_dir(&self, direct_key: &str) -> CacheResult<PathBuf> {
        Self::shard_path(self.manifests_dir(), direct_key)
    }

    /// Probe for an entry. A visible directory with a return-code file is
    /// a complete entry (publish is atomic).
    pub fn lookup_entry(&self, entry_key: &str) -> Option<EntryHandle> {
        let dir = self.entry_dir(entry_key).ok()?;
        if dir.join(RETURN_CODE_FILE).is_file() {
            Some(EntryHandle { dir })
        } else {
            None
        }
    }

    /// Publish an entry under `entry_key`.
    ///
    /// Returns `true` if this call created the entry, `false` if another
    /// publisher won the race (or the entry already existed); either way
    /// the store holds a complete entry for the key afterwards.
    pub fn publish_entry(&self, entry_key: &str, entry: &CacheEntry) -> CacheResult<bool> {
        let final_dir = self.entry_dir(entry_key)?;
        if final_dir.exists() {
            debug!("entry {entry_key} already published");
            return Ok(false);
        }

        for id in entry.artifacts.keys() {
            CacheEntry::check_artifact_id(id)?;
        }

        // Stage the whole entry next to its final home (same filesystem),
        // then rename the directory into place.
        let staging = TempPath::new(&self.tmp_dir(), "");
        fs::create_dir_all(staging.path())?;
        for (id, bytes) in &entry.artifacts {
            fs::write(staging.path().join(id), bytes)?;
        }
        fs::write(staging.path().join(STDOUT_FILE), &entry.stdout)?;
        fs::write(staging.path().join(STDERR_FILE), &entry.stderr)?;
        fs::write(
            staging.path().join(RETURN_CODE_FILE),
            entry.return_code.to_string(),
        )?;

        if let Some(parent) = final_dir.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(staging.path(), &final_dir) {
            Ok(()) => {}
            Err(_) if final_dir.exists() => {
                // Lost the race; the first writer's entry is canonical and
                // our staged copy is removed when `staging` drops.
                debug!("concurrent publisher won for {entry_key}");
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }

        let size = self.entry_size(&final_dir)?;
        self.ledger.update(|stats| {
            stats.total_bytes += size;
            stats.entry_count += 1;
        })?;
        Ok(true)
    }

    /// On-disk size of one entry directory.
    fn entry_size(&self, dir: &Path) -> io::Result<u64> {
        Ok(filesys::walk(dir)?
            .iter()
            .filter(|info| !info.is_dir)
            .map(|info| info.size)
            .sum())
    }

    /// All valid manifests for a direct-mode key, newest first.
    ///
    /// Corrupt or unreadable slots are skipped; the probe only cares
    /// about slots it can still use.
    pub fn lookup_manifests(&self, direct_key: &str) -> Vec<Manifest> {
        let dir = match self.manifest_dir(direct_key) {
            Ok(d) => d,
            Err(_) => return Vec::new(),
        };

        let mut slots: Vec<(std::time::SystemTime, Manifest)> = Vec::new();
        for slot in 0..MANIFEST_SLOTS {
            let path = dir.join(format!("{slot}.manifest"));
            let info = match filesys::file_info(&path) {
                Ok(info) => info,
                Err(_) => continue,
            };
            let text = match fs::read_to_string(&path) {
                Ok(t) => t,
                Err(err) => {
                    debug!("unreadable manifest slot {}: {err}", path.display());
                    continue;
                }
            };
            match Manifest::parse(&text, &path) {
                Ok(manifest) => slots.push((info.mtime, manifest)),
                Err(err) => debug!("skipping corrupt manifest {}: {err}", path.display()),
            }
        }

        slots.sort_by(|a, b| b.0.cmp(&a.0));
        slots.into_iter().map(|(_, m)| m).collect()
    }

    /// Publish a manifest for a direct-mode key.
    ///
    /// A manifest with the same entry key as an existing slot is a no-op.
    /// Otherwise the manifest takes an empty slot, or replaces the slot
    /// least recently used.
    pub fn publish_manifest(&self, direct_key: &str, manifest: &Manifest) -> CacheResult<()> {
        let dir = self.manifest_dir(direct_key)?;
        fs::create_dir_all(&dir)?;

        // Scan every slot first: an existing manifest for the same entry
        // key makes this publish a no-op regardless of slot order.
        let mut empty_slot = None;
        let mut oldest_slot = 0;
        let mut oldest_atime: Option<std::time::SystemTime> = None;
        for slot in 0..MANIFEST_SLOTS {
            let path = dir.join(format!("{slot}.manifest"));
            match filesys::file_info(&path) {
                Ok(info) => {
                    if let Ok(existing) =
                        Manifest::parse(&fs::read_to_string(&path).unwrap_or_default(), &path)
                    {
                        if existing.entry_key == manifest.entry_key {
                            return Ok(());
                        }
                    }
                    if oldest_atime.map_or(true, |t| info.atime < t) {
                        oldest_atime = Some(info.atime);
                        oldest_slot = slot;
                    }
                }
                Err(_) => {
                    if empty_slot.is_none() {
                        empty_slot = Some(slot);
                    }
                }
            }
        }

        let chosen = empty_slot.unwrap_or(oldest_slot);
        let path = dir.join(format!("{chosen}.manifest"));
        filesys::atomic_write(&path, manifest.serialize().as_bytes())?;
        Ok(())
    }

    /// Record a cache hit against an entry: bump its access time so
    /// eviction sees it as recently used.
    pub fn record_access(&self, entry_key: &str) {
        if let Ok(dir) = self.entry_dir(entry_key) {
            if let Err(err) = filesys::touch(&dir) {
                debug!("failed to record access for {entry_key}: {err}");
            }
        }
    }

    /// Snapshot every entry directory with its size and access time.
    pub(crate) fn collect_entries(&self) -> io::Result<Vec<EntrySnapshot>> {
        let mut out = Vec::new();
        let entries_dir = self.entries_dir();
        for level1 in read_dir_or_empty(&entries_dir) {
            for level2 in read_dir_or_empty(&level1) {
                for entry_dir in read_dir_or_empty(&level2) {
                    if !entry_dir.is_dir() {
                        continue;
                    }
                    let info = match filesys::file_info(&entry_dir) {
                        Ok(info) => info,
                        Err(_) => continue,
                    };
                    let size = self.entry_size(&entry_dir).unwrap_or(0);
                    out.push(EntrySnapshot {
                        path: entry_dir,
                        size,
                        atime: info.atime,
                    });
                }
            }
        }
        Ok(out)
    }

    /// Remove all entries and manifests; counters other than size and
    /// entry count are preserved.
    pub fn clear(&self) -> CacheResult<u64> {
        let mut removed = 0u64;
        for snapshot in self.collect_entries()? {
            match fs::remove_dir_all(&snapshot.path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => debug!("failed to remove {}: {err}", snapshot.path.display()),
            }
        }
        let manifests = self.manifests_dir();
        if manifests.exists() {
            fs::remove_dir_all(&manifests)?;
            fs::create_dir_all(&manifests)?;
        }
        self.ledger.update(|stats| {
            stats.total_bytes = 0;
            stats.entry_count = 0;
        })?;
        Ok(removed)
    }
}

/// One row of the eviction snapshot.
#[derive(Debug, Clone)]
pub(crate) struct EntrySnapshot {
    pub path: PathBuf,
    pub size: u64,
    pub atime: std::time::SystemTime,
}

fn read_dir_or_empty(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(iter) => iter.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    }
}
