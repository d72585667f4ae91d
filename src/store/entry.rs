//! Cache entry: the artifact bundle stored per entry key.
//!
//! An entry owns the bytes of each produced artifact (keyed by a short
//! artifact id such as `object` or `coverage`), the captured stdout and
//! stderr, and the tool's return code. The same bundle has two encodings:
//! one file per component in the local store, and a single framed `BCE1`
//! blob for remote transfer.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{CacheError, CacheResult};

/// Magic prefix of the framed entry blob.
pub const ENTRY_MAGIC: &[u8; 4] = b"BCE1";

/// Component file names inside an entry directory. Artifact ids must not
/// collide with these.
pub const STDOUT_FILE: &str = "stdout";
pub const STDERR_FILE: &str = "stderr";
pub const RETURN_CODE_FILE: &str = "return_code";

const RESERVED_NAMES: &[&str] = &[STDOUT_FILE, STDERR_FILE, RETURN_CODE_FILE];

/// A stored artifact bundle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheEntry {
    /// Artifact id → file bytes, in stable (sorted) order.
    pub artifacts: BTreeMap<String, Vec<u8>>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub return_code: i32,
}

impl CacheEntry {
    /// Total payload size in bytes (artifacts plus captured output).
    pub fn payload_size(&self) -> u64 {
        let artifacts: usize = self.artifacts.values().map(|v| v.len()).sum();
        (artifacts + self.stdout.len() + self.stderr.len()) as u64
    }

    /// Validate an artifact id for use as a file name in the store.
    pub fn check_artifact_id(id: &str) -> CacheResult<()> {
        if id.is_empty()
            || RESERVED_NAMES.contains(&id)
            || id.contains('/')
            || id.contains('\\')
            || id.starts_with('.')
        {
            return Err(CacheError::Internal(format!(
                "invalid artifact id: {id:?}"
            )));
        }
        Ok(())
    }

    /// Encode as a framed blob for remote transfer.
    ///
    /// Layout: magic `BCE1`, u32 artifact count, per artifact
    /// `[u32 name-len][name][u64 size][bytes]`, then
    /// `[u32 stdout-len][stdout][u32 stderr-len][stderr][i32 return-code]`.
    /// All integers little-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload_size() as usize + 64);
        out.extend_from_slice(ENTRY_MAGIC);
        out.extend_from_slice(&(self.artifacts.len() as u32).to_le_bytes());
        for (name, bytes) in &self.artifacts {
            out.extend_from_slice(&(name.len() as u32).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        out.extend_from_slice(&(self.stdout.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.stdout);
        out.extend_from_slice(&(self.stderr.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.stderr);
        out.extend_from_slice(&self.return_code.to_le_bytes());
        out
    }

    /// Decode a framed blob.
    pub fn from_bytes(data: &[u8]) -> CacheResult<Self> {
        let mut cursor = Cursor { data, pos: 0 };

        let magic = cursor.take(4)?;
        if magic != ENTRY_MAGIC {
            return Err(CacheError::Internal("bad entry magic".to_string()));
        }

        let count = cursor.u32()?;
        let mut artifacts = BTreeMap::new();
        for _ in 0..count {
            let name_len = cursor.u32()? as usize;
            let name = std::str::from_utf8(cursor.take(name_len)?)
                .map_err(|_| CacheError::Internal("non-UTF-8 artifact name".to_string()))?
                .to_string();
            let size = cursor.u64()? as usize;
            let bytes = cursor.take(size)?.to_vec();
            artifacts.insert(name, bytes);
        }

        let stdout_len = cursor.u32()? as usize;
        let stdout = cursor.take(stdout_len)?.to_vec();
        let stderr_len = cursor.u32()? as usize;
        let stderr = cursor.take(stderr_len)?.to_vec();
        let return_code = cursor.i32()?;

        Ok(Self {
            artifacts,
            stdout,
            stderr,
            return_code,
        })
    }

    /// Read an entry from a local store directory.
    pub fn read_from_dir(dir: &Path) -> CacheResult<Self> {
        let mut artifacts = BTreeMap::new();
        for item in std::fs::read_dir(dir)? {
            let item = item?;
            let name = item.file_name().to_string_lossy().into_owned();
            if RESERVED_NAMES.contains(&name.as_str()) || name.starts_with('.') {
                continue;
            }
            artifacts.insert(name, std::fs::read(item.path())?);
        }

        let stdout = std::fs::read(dir.join(STDOUT_FILE)).unwrap_or_default();
        let stderr = std::fs::read(dir.join(STDERR_FILE)).unwrap_or_default();
        let rc_text = std::fs::read_to_string(dir.join(RETURN_CODE_FILE))?;
        let return_code = rc_text.trim().parse().map_err(|_| CacheError::Corrupt {
            path: dir.join(RETURN_CODE_FILE),
            reason: format!("unparsable return code {rc_text:?}"),
        })?;

        Ok(Self {
            artifacts,
            stdout,
            stderr,
            return_code,
        })
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> CacheResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| CacheError::Internal("truncated entry blob".to_string()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> CacheResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> CacheResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn i32(&mut self) -> CacheResult<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
