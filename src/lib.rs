//! buildcache - a transparent compilation cache
//!
//! buildcache sits in front of slow build tools (primarily C/C++
//! compilers), recognizes when a previously executed invocation would
//! produce identical output, and returns the stored artifacts instead of
//! re-running the tool.

pub mod config;
pub mod error;
pub mod filesys;
pub mod hasher;
pub mod pipeline;
pub mod remote;
pub mod runner;
pub mod store;
pub mod unicode;
pub mod wrappers;

pub use config::{Accuracy, Config, ConfigError};
pub use error::{CacheError, CacheResult};
pub use hasher::{Digest, Hasher};
pub use pipeline::Pipeline;
pub use remote::{FileProvider, MemoryProvider, RemoteCache, RemoteError, RemoteProvider};
pub use runner::RunResult;
pub use store::{
    CacheEntry, EntryHandle, EvictionResult, LocalStore, Manifest, ManifestFile, Stats,
    StatsLedger, StoreLock, ToolIdMemo,
};
pub use wrappers::{
    find_wrapper, Capabilities, ExePath, ExpectedFile, GccWrapper, Invocation, MsvcWrapper,
    PreprocessOutput, ToolWrapper,
};
