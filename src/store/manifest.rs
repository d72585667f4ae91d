//! Direct-mode manifests.
//!
//! A manifest records, for one direct-mode key, the set of implicit input
//! files (headers) that a prior preprocessor run discovered, each with the
//! content hash it had at publish time, plus the entry key the inputs
//! resolved to. A probe accepts a manifest only if every listed file still
//! hashes to its recorded value.
//!
//! On-disk format (UTF-8, line-delimited):
//!
//! ```text
//! <version>
//! <entry_key>
//! <N>
//! <path-1>\t<hash-1>
//! ...
//! <path-N>\t<hash-N>
//! ```
//!
//! Paths are absolute, canonicalized, and NFC-normalized.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::filesys;
use crate::hasher;
use crate::unicode;

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// One implicit input: an absolute path and the content hash recorded for
/// it when the manifest was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFile {
    pub path: PathBuf,
    pub digest: String,
}

/// A direct-mode manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub entry_key: String,
    pub files: Vec<ManifestFile>,
}

impl Manifest {
    /// Build a manifest by canonicalizing and hashing the given input
    /// files as they exist right now.
    pub fn from_inputs(inputs: &[PathBuf], entry_key: &str) -> CacheResult<Self> {
        let mut files = Vec::with_capacity(inputs.len());
        for input in inputs {
            let resolved = filesys::resolve_path(input)?;
            let digest = hasher::hash_file(&resolved)?;
            let normalized = unicode::nfc(&resolved.to_string_lossy()).into_owned();
            files.push(ManifestFile {
                path: PathBuf::from(normalized),
                digest: digest.to_hex(),
            });
        }
        // Stable order keeps equal input sets byte-identical on disk.
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files.dedup();
        Ok(Self {
            entry_key: entry_key.to_string(),
            files,
        })
    }

    /// Serialize to the line-delimited text format.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str(&MANIFEST_VERSION.to_string());
        out.push('\n');
        out.push_str(&self.entry_key);
        out.push('\n');
        out.push_str(&self.files.len().to_string());
        out.push('\n');
        for file in &self.files {
            out.push_str(&file.path.to_string_lossy());
            out.push('\t');
            out.push_str(&file.digest);
            out.push('\n');
        }
        out
    }

    /// Parse the line-delimited text format.
    pub fn parse(text: &str, origin: &Path) -> CacheResult<Self> {
        let corrupt = |reason: &str| CacheError::Corrupt {
            path: origin.to_path_buf(),
            reason: reason.to_string(),
        };

        let mut lines = text.lines();
        let version: u32 = lines
            .next()
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| corrupt("missing version line"))?;
        if version != MANIFEST_VERSION {
            return Err(CacheError::HashVersionMismatch {
                found: version,
                expected: MANIFEST_VERSION,
            });
        }

        let entry_key = lines
            .next()
            .ok_or_else(|| corrupt("missing entry key line"))?
            .trim()
            .to_string();
        if entry_key.is_empty() {
            return Err(corrupt("empty entry key"));
        }

        let count: usize = lines
            .next()
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| corrupt("missing file count line"))?;

        let mut files = Vec::with_capacity(count);
        for _ in 0..count {
            let line = lines.next().ok_or_else(|| corrupt("missing file record"))?;
            let (path, digest) = line
                .split_once('\t')
                .ok_or_else(|| corrupt("file record without tab separator"))?;
            files.push(ManifestFile {
                path: PathBuf::from(path),
                digest: digest.trim().to_string(),
            });
        }

        Ok(Self { entry_key, files })
    }

    /// Check that every referenced file still exists and hashes to its
    /// recorded value. Any mismatch, or any I/O failure, rejects the
    /// manifest.
    pub fn verify(&self) -> bool {
        for file in &self.files {
            let current = match hasher::hash_file(&file.path) {
                Ok(digest) => digest.to_hex(),
                Err(err) => {
                    debug!(
                        "manifest rejected: cannot hash {}: {err}",
                        file.path.display()
                    );
                    return false;
                }
            };
            if current != file.digest {
                debug!("manifest rejected: {} has changed", file.path.display());
                return false;
            }
        }
        true
    }
}
