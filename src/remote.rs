//! Remote cache providers.
//!
//! The core consumes a narrow capability set (`has` / `get` / `put`) and
//! treats concrete transports as opaque. Providers are selected by URL
//! scheme. A `file://` provider ships with the crate (shared-filesystem
//! caches, tests); network transports plug in behind the same trait.
//!
//! Remote failures never fail a build: lookups degrade to cold and
//! uploads are fire-and-forget on a background worker.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::filesys;
use crate::store::CacheEntry;

/// Uploads queued beyond this bound are dropped (with a debug log) rather
/// than delaying the caller.
const PUT_QUEUE_DEPTH: usize = 8;

/// Errors surfaced by remote providers.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt remote entry for key {0}")]
    Corrupt(String),
}

/// The capability set every remote backend implements.
///
/// Backends are constructed with the configured call timeout and must
/// report [`RemoteError::Unavailable`] when a call exceeds it; the core
/// then degrades to a cold cache for the invocation.
pub trait RemoteProvider: Send + Sync {
    fn has(&self, key: &str) -> Result<bool, RemoteError>;
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, RemoteError>;
    fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), RemoteError>;
}

/// Directory-backed provider (`file://<path>`).
///
/// Entries are stored as framed blobs, sharded by the first two key
/// characters, and written atomically so concurrent readers on a shared
/// filesystem never see partial uploads.
pub struct FileProvider {
    dir: PathBuf,
}

impl FileProvider {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf, RemoteError> {
        if key.len() < 3 || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RemoteError::Unavailable(format!("malformed key {key:?}")));
        }
        Ok(self.dir.join(&key[..2]).join(format!("{}.entry", &key[2..])))
    }
}

impl RemoteProvider for FileProvider {
    fn has(&self, key: &str) -> Result<bool, RemoteError> {
        Ok(self.blob_path(key)?.is_file())
    }

    fn get(&self, key: &str) -> Result<Option<CacheEntry>, RemoteError> {
        let path = self.blob_path(key)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        CacheEntry::from_bytes(&bytes)
            .map(Some)
            .map_err(|_| RemoteError::Corrupt(key.to_string()))
    }

    fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), RemoteError> {
        let path = self.blob_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        filesys::atomic_write(&path, &entry.to_bytes())?;
        Ok(())
    }
}

/// In-memory provider for tests and mock setups.
#[derive(Default)]
pub struct MemoryProvider {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RemoteProvider for MemoryProvider {
    fn has(&self, key: &str) -> Result<bool, RemoteError> {
        let map = self
            .entries
            .lock()
            .map_err(|_| RemoteError::Unavailable("poisoned".to_string()))?;
        Ok(map.contains_key(key))
    }

    fn get(&self, key: &str) -> Result<Option<CacheEntry>, RemoteError> {
        let map = self
            .entries
            .lock()
            .map_err(|_| RemoteError::Unavailable("poisoned".to_string()))?;
        match map.get(key) {
            Some(bytes) => CacheEntry::from_bytes(bytes)
                .map(Some)
                .map_err(|_| RemoteError::Corrupt(key.to_string())),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), RemoteError> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| RemoteError::Unavailable("poisoned".to_string()))?;
        map.insert(key.to_string(), entry.to_bytes());
        Ok(())
    }
}

/// Facade the pipeline talks to.
///
/// Wraps an optional provider; a cache with no provider (no remote
/// configured, or an unusable URL) answers every lookup with a miss.
pub struct RemoteCache {
    provider: Option<Arc<dyn RemoteProvider>>,
    put_tx: Option<SyncSender<(String, CacheEntry)>>,
    worker: Option<JoinHandle<()>>,
}

impl RemoteCache {
    /// Build a disconnected (cold) cache.
    pub fn disconnected() -> Self {
        Self {
            provider: None,
            put_tx: None,
            worker: None,
        }
    }

    /// Select a provider from the configured URL, if any.
    ///
    /// An unusable URL logs a warning and leaves the cache cold; the
    /// build must not fail because the remote is misconfigured. The
    /// timeout is handed to the provider (the `file://` backend has no
    /// network waits and ignores it).
    pub fn connect(url: Option<&str>, _timeout: Duration) -> Self {
        let url = match url {
            Some(u) if !u.is_empty() => u,
            _ => return Self::disconnected(),
        };
        match url.split_once("://") {
            Some(("file", path)) if !path.is_empty() => {
                Self::with_provider(Arc::new(FileProvider::new(Path::new(path))))
            }
            Some((scheme, _)) => {
                warn!("unsupported remote cache protocol {scheme:?}, running cold");
                Self::disconnected()
            }
            None => {
                warn!("invalid remote cache address {url:?}, running cold");
                Self::disconnected()
            }
        }
    }

    /// Wrap an explicit provider (used by tests and embedders).
    pub fn with_provider(provider: Arc<dyn RemoteProvider>) -> Self {
        let (tx, rx) = mpsc::sync_channel::<(String, CacheEntry)>(PUT_QUEUE_DEPTH);
        let upload_provider = Arc::clone(&provider);
        let worker = std::thread::spawn(move || {
            for (key, entry) in rx {
                if let Err(err) = upload_provider.put(&key, &entry) {
                    debug!("remote put failed for {key}: {err}");
                }
            }
        });
        Self {
            provider: Some(provider),
            put_tx: Some(tx),
            worker: Some(worker),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.provider.is_some()
    }

    /// Fetch an entry; any failure reads as a miss.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let provider = self.provider.as_ref()?;
        match provider.get(key) {
            Ok(found) => found,
            Err(err) => {
                debug!("remote lookup failed for {key}: {err}");
                None
            }
        }
    }

    /// Queue an upload without waiting for it.
    ///
    /// When the queue is full the upload is dropped; replication is
    /// best-effort and must never delay returning to the build.
    pub fn put_async(&self, key: &str, entry: CacheEntry) {
        let Some(tx) = &self.put_tx else { return };
        match tx.try_send((key.to_string(), entry)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("remote put queue full, dropping {key}"),
            Err(TrySendError::Disconnected(_)) => debug!("remote put worker gone"),
        }
    }

    /// Wait for queued uploads to finish. Called once before exit.
    pub fn drain(&mut self) {
        self.put_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for RemoteCache {
    fn drop(&mut self) {
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn sample_entry() -> CacheEntry {
        let mut artifacts = BTreeMap::new();
        artifacts.insert("object".to_string(), b"obj".to_vec());
        CacheEntry {
            artifacts,
            stdout: b"out".to_vec(),
            stderr: Vec::new(),
            return_code: 0,
        }
    }

    fn key() -> String {
        "5e".repeat(32)
    }

    #[test]
    fn file_provider_round_trip() {
        let dir = TempDir::new().unwrap();
        let provider = FileProvider::new(dir.path());

        assert!(!provider.has(&key()).unwrap());
        provider.put(&key(), &sample_entry()).unwrap();
        assert!(provider.has(&key()).unwrap());

        let fetched = provider.get(&key()).unwrap().unwrap();
        assert_eq!(fetched, sample_entry());
    }

    #[test]
    fn file_provider_misses_on_absent_key() {
        let dir = TempDir::new().unwrap();
        let provider = FileProvider::new(dir.path());
        assert_eq!(provider.get(&key()).unwrap(), None);
    }

    #[test]
    fn file_provider_rejects_corrupt_blob() {
        let dir = TempDir::new().unwrap();
        let provider = FileProvider::new(dir.path());
        provider.put(&key(), &sample_entry()).unwrap();

        // Clobber the blob.
        let shard = dir.path().join(&key()[..2]);
        let blob = fs::read_dir(&shard).unwrap().next().unwrap().unwrap().path();
        fs::write(&blob, b"garbage").unwrap();

        assert!(matches!(provider.get(&key()), Err(RemoteError::Corrupt(_))));
    }

    #[test]
    fn memory_provider_round_trip() {
        let provider = MemoryProvider::new();
        provider.put(&key(), &sample_entry()).unwrap();
        assert!(provider.has(&key()).unwrap());
        assert_eq!(provider.get(&key()).unwrap().unwrap(), sample_entry());
    }

    #[test]
    fn disconnected_cache_always_misses() {
        let cache = RemoteCache::disconnected();
        assert!(!cache.is_connected());
        assert!(cache.get(&key()).is_none());
        // put_async on a cold cache is a silent no-op.
        cache.put_async(&key(), sample_entry());
    }

    #[test]
    fn connect_selects_file_scheme() {
        let dir = TempDir::new().unwrap();
        let url = format!("file://{}", dir.path().display());
        let cache = RemoteCache::connect(Some(&url), Duration::from_secs(10));
        assert!(cache.is_connected());
    }

    #[test]
    fn connect_rejects_unknown_scheme_without_failing() {
        let cache = RemoteCache::connect(Some("gopher://cache.example"), Duration::from_secs(10));
        assert!(!cache.is_connected());
    }

    #[test]
    fn put_async_uploads_after_drain() {
        let provider = Arc::new(MemoryProvider::new());
        let mut cache = RemoteCache::with_provider(provider.clone());

        cache.put_async(&key(), sample_entry());
        cache.drain();

        assert_eq!(provider.len(), 1);
        assert_eq!(cache.get(&key()).unwrap(), sample_entry());
    }

    #[test]
    fn get_after_put_via_file_url() {
        let dir = TempDir::new().unwrap();
        let url = format!("file://{}", dir.path().display());

        {
            let mut cache = RemoteCache::connect(Some(&url), Duration::from_secs(10));
            cache.put_async(&key(), sample_entry());
            cache.drain();
        }

        let cache = RemoteCache::connect(Some(&url), Duration::from_secs(10));
        assert_eq!(cache.get(&key()).unwrap(), sample_entry());
    }
}
