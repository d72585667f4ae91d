//! Filesystem primitives used by the cache core.
//!
//! Everything that touches the store goes through the small set of
//! operations in this module: atomic writes (temp file + rename in the
//! same directory), hard-link-or-copy materialization, recursive walks,
//! scoped temporary paths, and executable lookup with self-exclusion.

use std::env;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tracing::debug;
use walkdir::WalkDir;

/// Process-global counter for unique temporary names.
static TMP_NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Metadata snapshot for a single filesystem entry.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: SystemTime,
    pub atime: SystemTime,
    pub is_dir: bool,
}

/// Stat a single path.
pub fn file_info(path: &Path) -> io::Result<FileInfo> {
    let meta = fs::metadata(path)?;
    let mtime = meta.modified()?;
    // Access time is unreliable on some filesystems (noatime mounts);
    // fall back to mtime rather than failing.
    let atime = meta.accessed().unwrap_or(mtime);
    Ok(FileInfo {
        path: path.to_path_buf(),
        size: meta.len(),
        mtime,
        atime,
        is_dir: meta.is_dir(),
    })
}

/// Recursively walk a directory, returning every entry below it.
///
/// The root itself is not included. Entries that disappear mid-walk are
/// skipped.
pub fn walk(dir: &Path) -> io::Result<Vec<FileInfo>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                debug!("skipping unreadable entry during walk: {err}");
                continue;
            }
        };
        match file_info(entry.path()) {
            Ok(info) => out.push(info),
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(out)
}

/// Generate a process-unique name component for temporary paths.
pub fn unique_name() -> String {
    let n = TMP_NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}", process::id(), n)
}

/// Write a file atomically: the data is staged in a temporary file in the
/// same directory and renamed into place, so readers observe either the
/// old contents or the new contents, never a partial write.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    let tmp = dir.join(format!(".tmp-{}", unique_name()));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            Err(err)
        }
    }
}

/// Hard-link `from` to `to`, falling back to a byte copy when linking is
/// not possible (cross-device, unsupported filesystem, permissions).
pub fn link_or_copy(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        fs::remove_file(to)?;
    }
    if fs::hard_link(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    Ok(())
}

/// Bump a file's access and modification times to now.
///
/// Build-system file trackers (e.g. MSBuild) key off timestamps, so
/// materialized cache hits must look freshly written.
pub fn touch(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
        let rc = unsafe { libc::utime(c_path.as_ptr(), std::ptr::null()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        // Opening for append updates the access time on most platforms.
        fs::OpenOptions::new().append(true).open(path)?;
        Ok(())
    }
}

/// Set explicit access/modification times on a path (seconds since epoch).
#[cfg(unix)]
pub fn set_file_times(path: &Path, atime_secs: i64, mtime_secs: i64) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let times = libc::utimbuf {
        actime: atime_secs as libc::time_t,
        modtime: mtime_secs as libc::time_t,
    };
    let rc = unsafe { libc::utime(c_path.as_ptr(), &times) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Canonicalized real path, with symlinks resolved.
pub fn resolve_path(path: &Path) -> io::Result<PathBuf> {
    fs::canonicalize(path)
}

/// A temporary path removed on drop.
///
/// The removal is best-effort: failures are logged and swallowed, since
/// cleanup runs on every exit path including error unwinds.
pub struct TempPath {
    path: PathBuf,
}

impl TempPath {
    /// Reserve a unique path under `dir` with the given suffix. Nothing is
    /// created; the caller writes the file or directory itself.
    pub fn new(dir: &Path, suffix: &str) -> Self {
        let name = format!("buildcache-{}{}", unique_name(), suffix);
        Self {
            path: dir.join(name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        let result = if self.path.is_dir() {
            fs::remove_dir_all(&self.path)
        } else if self.path.exists() {
            fs::remove_file(&self.path)
        } else {
            Ok(())
        };
        if let Err(err) = result {
            debug!("failed to remove temporary path {}: {err}", self.path.display());
        }
    }
}

/// Render a byte count with a binary-unit suffix.
pub fn human_readable_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["bytes", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Implicit extensions tried when looking up executables.
fn exe_extensions() -> Vec<String> {
    #[cfg(windows)]
    {
        let pathext = env::var("PATHEXT")
            .unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".to_string());
        let mut exts = vec![String::new()];
        exts.extend(pathext.split(';').map(|e| e.to_lowercase()));
        exts
    }
    #[cfg(not(windows))]
    {
        vec![String::new()]
    }
}

/// Find an executable by PATH search.
///
/// `exclude` is the front-end's own real path: when buildcache is
/// installed as a symlink named `gcc`, the search for `gcc` must skip the
/// symlink and return the real compiler further along the PATH.
pub fn find_executable(program: &str, exclude: &Path) -> io::Result<PathBuf> {
    let excluded = resolve_path(exclude).ok();
    let candidates: Vec<PathBuf> = if program.contains(std::path::MAIN_SEPARATOR) {
        vec![PathBuf::from(program)]
    } else {
        let path_var = env::var_os("PATH").unwrap_or_default();
        env::split_paths(&path_var)
            .map(|dir| dir.join(program))
            .collect()
    };

    for candidate in candidates {
        for ext in exe_extensions() {
            let mut full = candidate.clone();
            if !ext.is_empty() {
                let name = candidate
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                full.set_file_name(format!("{name}{ext}"));
            }
            if !full.is_file() {
                continue;
            }
            let resolved = match resolve_path(&full) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if excluded.as_deref() == Some(resolved.as_path()) {
                debug!("skipping own binary at {}", full.display());
                continue;
            }
            return Ok(full);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("executable not found in PATH: {program}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_creates_file_with_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.txt");

        atomic_write(&path, b"payload").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"payload");
        // No temp leftovers.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn atomic_write_replaces_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.txt");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn link_or_copy_produces_identical_bytes() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("a.bin");
        let to = dir.path().join("b.bin");
        fs::write(&from, b"object bytes").unwrap();

        link_or_copy(&from, &to).unwrap();

        assert_eq!(fs::read(&to).unwrap(), b"object bytes");
    }

    #[test]
    fn link_or_copy_replaces_existing_target() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("a.bin");
        let to = dir.path().join("b.bin");
        fs::write(&from, b"new").unwrap();
        fs::write(&to, b"old").unwrap();

        link_or_copy(&from, &to).unwrap();

        assert_eq!(fs::read(&to).unwrap(), b"new");
    }

    #[test]
    fn temp_path_removes_file_on_drop() {
        let dir = TempDir::new().unwrap();
        let kept;
        {
            let tmp = TempPath::new(dir.path(), ".i");
            fs::write(tmp.path(), b"scratch").unwrap();
            kept = tmp.path().to_path_buf();
            assert!(kept.exists());
        }
        assert!(!kept.exists());
    }

    #[test]
    fn temp_path_removes_directory_tree_on_drop() {
        let dir = TempDir::new().unwrap();
        let kept;
        {
            let tmp = TempPath::new(dir.path(), "");
            fs::create_dir_all(tmp.path().join("nested")).unwrap();
            fs::write(tmp.path().join("nested/file"), b"x").unwrap();
            kept = tmp.path().to_path_buf();
        }
        assert!(!kept.exists());
    }

    #[test]
    fn temp_paths_are_unique() {
        let dir = TempDir::new().unwrap();
        let a = TempPath::new(dir.path(), "");
        let b = TempPath::new(dir.path(), "");
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn walk_reports_sizes_and_dirs() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/file"), b"12345").unwrap();

        let infos = walk(dir.path()).unwrap();
        assert_eq!(infos.len(), 2);

        let file = infos.iter().find(|i| !i.is_dir).unwrap();
        assert_eq!(file.size, 5);
        assert!(infos.iter().any(|i| i.is_dir));
    }

    #[test]
    fn find_executable_skips_excluded_binary() {
        let dir = TempDir::new().unwrap();
        let fake = dir.path().join("sometool");
        fs::write(&fake, b"#!/bin/sh\n").unwrap();

        // Direct path lookup with the candidate excluded must fail.
        let err = find_executable(fake.to_str().unwrap(), &fake).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        // Without exclusion it is found.
        let found = find_executable(fake.to_str().unwrap(), Path::new("/no/such/file")).unwrap();
        assert_eq!(found, fake);
    }

    #[test]
    fn human_readable_sizes() {
        assert_eq!(human_readable_size(512), "512 bytes");
        assert_eq!(human_readable_size(2048), "2.0 KiB");
        assert_eq!(human_readable_size(5 * 1024 * 1024), "5.0 MiB");
    }

    #[cfg(unix)]
    #[test]
    fn set_file_times_changes_atime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"x").unwrap();

        set_file_times(&path, 1_000_000, 1_000_000).unwrap();

        let info = file_info(&path).unwrap();
        let secs = info
            .mtime
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert_eq!(secs, 1_000_000);
    }
}
