//! Crate-wide error type for the cache engine.
//!
//! The error policy is deliberately conservative: lookup and publish
//! failures are logged and swallowed by the pipeline, unsupported
//! invocations degrade to passthrough, and only configuration or internal
//! errors that occur before the real tool runs are fatal.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors produced by the cache engine.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The invocation cannot be cached (e.g. linking, multi-output
    /// compilation, or a debug mode the configured accuracy excludes).
    /// The pipeline responds with transparent passthrough.
    #[error("unsupported invocation: {0}")]
    UnsupportedInvocation(String),

    /// A stored record was written with an incompatible format version.
    #[error("hash format version mismatch (found {found}, expected {expected})")]
    HashVersionMismatch { found: u32, expected: u32 },

    #[error("remote cache unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The wrapped tool ran and failed. The return code is forwarded
    /// verbatim and nothing is cached.
    #[error("tool failed with return code {0}")]
    ToolFailed(i32),

    #[error("corrupt cache record at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}
