//! Advisory file locking for the local store.
//!
//! The stats ledger and eviction both serialize writers through an
//! exclusive advisory lock. The lock is released when the guard drops.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock timeout after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Exclusive advisory lock on a lock file.
///
/// Dropping the guard releases the lock.
pub struct StoreLock {
    lock_path: PathBuf,
    #[allow(dead_code)]
    lock_file: File,
}

impl StoreLock {
    /// Acquire an exclusive lock at `lock_path`, waiting up to `timeout`.
    ///
    /// The parent directory is created if missing. Contention longer than
    /// half a second is logged once.
    pub fn acquire(lock_path: &Path, timeout: Duration) -> LockResult<Self> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let start = Instant::now();
        let poll_interval = Duration::from_millis(20);
        let mut warned = false;

        loop {
            match Self::try_acquire_exclusive(lock_path) {
                Ok(file) => {
                    return Ok(Self {
                        lock_path: lock_path.to_path_buf(),
                        lock_file: file,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned && start.elapsed() > Duration::from_millis(500) {
                        warn!("lock contention on {}, waiting", lock_path.display());
                        warned = true;
                    }
                }
                Err(e) => return Err(LockError::Io(e)),
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout(timeout));
            }
            std::thread::sleep(poll_interval);
        }
    }

    #[cfg(unix)]
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            Ok(file)
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            } else {
                Err(err)
            }
        }
    }

    #[cfg(not(unix))]
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
        match OpenOptions::new().write(true).create_new(true).open(lock_path) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            }
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_creates_lock_file() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("stats.lock");

        let lock = StoreLock::acquire(&lock_path, Duration::from_secs(1)).unwrap();
        assert!(lock.path().exists());
    }

    #[test]
    fn acquire_creates_missing_parent() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("deep/nested/x.lock");

        let _lock = StoreLock::acquire(&lock_path, Duration::from_secs(1)).unwrap();
        assert!(lock_path.exists());
    }

    #[test]
    fn lock_is_reacquirable_after_drop() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("x.lock");

        {
            let _lock = StoreLock::acquire(&lock_path, Duration::from_secs(1)).unwrap();
        }
        let _again = StoreLock::acquire(&lock_path, Duration::from_secs(1)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn contended_lock_times_out() {
        use std::sync::mpsc;
        use std::thread;

        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("x.lock");
        let lock_path2 = lock_path.clone();

        let held = StoreLock::acquire(&lock_path, Duration::from_secs(1)).unwrap();

        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let result = StoreLock::acquire(&lock_path2, Duration::from_millis(100));
            tx.send(matches!(result, Err(LockError::Timeout(_)))).unwrap();
        });

        assert!(rx.recv().unwrap(), "second acquisition should time out");
        handle.join().unwrap();
        drop(held);
    }
}
