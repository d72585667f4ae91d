//! Streaming content hashing.
//!
//! All cache keys (direct-mode keys, preprocessed keys, entry keys) and all
//! manifest file hashes are SHA-256 digests rendered as lowercase hex.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest as _, Sha256};

/// Block size for hashing file contents.
const FILE_BLOCK_SIZE: usize = 64 * 1024;

/// A finalized 256-bit digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Render the digest as lowercase hex without separators.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a digest from the hex form produced by [`Digest::to_hex`].
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental hasher over heterogeneous inputs.
///
/// Feeding a file via [`Hasher::update_from_file`] is byte-equivalent to
/// feeding the same contents through [`Hasher::update`].
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    /// Feed a byte sequence.
    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        self.inner.update(data.as_ref());
    }

    /// Feed the contents of a file, read in fixed-size blocks.
    pub fn update_from_file(&mut self, path: &Path) -> io::Result<()> {
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; FILE_BLOCK_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.inner.update(&buf[..n]);
        }
        Ok(())
    }

    /// Consume the hasher and produce the digest.
    pub fn finalize(self) -> Digest {
        let out = self.inner.finalize();
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&out);
        Digest(arr)
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a single byte sequence in one call.
pub fn hash_bytes(data: impl AsRef<[u8]>) -> Digest {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Hash the contents of a file in one call.
pub fn hash_file(path: &Path) -> io::Result<Digest> {
    let mut hasher = Hasher::new();
    hasher.update_from_file(path)?;
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn hex_rendering_is_lowercase_and_64_chars() {
        let digest = hash_bytes(b"hello");
        let hex = digest.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn file_feed_equals_byte_feed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");

        // Larger than one read block so the loop runs more than once.
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &content).unwrap();

        let mut from_file = Hasher::new();
        from_file.update_from_file(&path).unwrap();

        let mut from_bytes = Hasher::new();
        from_bytes.update(&content);

        assert_eq!(from_file.finalize(), from_bytes.finalize());
    }

    #[test]
    fn incremental_updates_match_single_update() {
        let mut split = Hasher::new();
        split.update(b"abc");
        split.update(b"def");

        assert_eq!(split.finalize(), hash_bytes(b"abcdef"));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let mut hasher = Hasher::new();
        let err = hasher
            .update_from_file(Path::new("/nonexistent/path/file"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn digest_hex_round_trip() {
        let digest = hash_bytes(b"round trip");
        let parsed = Digest::from_hex(&digest.to_hex()).unwrap();
        assert_eq!(parsed, digest);
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(Digest::from_hex("xyz").is_none());
        assert!(Digest::from_hex("ab").is_none());
    }
}
