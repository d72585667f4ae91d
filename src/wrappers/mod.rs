//! Tool adapters.
//!
//! Every cacheable tool is fronted by a wrapper implementing
//! [`ToolWrapper`]: it filters the arguments that matter for the output,
//! identifies the specific tool build, enumerates inputs and outputs,
//! runs the preprocessor, and runs the real tool on a miss. Wrapper
//! selection walks a static registry in order and picks the first adapter
//! that recognizes the invoked program.

mod args;
mod gcc;
mod msvc;

pub use args::split_args;
pub use gcc::GccWrapper;
pub use msvc::MsvcWrapper;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::Accuracy;
use crate::error::CacheResult;
use crate::runner::RunResult;
use crate::store::ToolIdMemo;

/// The invoked program: the name it was invoked as, and its resolved
/// real path. Shim binaries (`cc` as a symlink to clang) make the two
/// differ in meaningful ways.
#[derive(Debug, Clone)]
pub struct ExePath {
    pub virtual_path: PathBuf,
    pub real_path: PathBuf,
}

/// One tool invocation: the executable, the full argument vector
/// (`args[0]` is the program itself), and the working directory.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub exe: ExePath,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
}

/// Optional behaviors a wrapper supports.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    /// Manifest-based lookup that skips preprocessing.
    pub direct_mode: bool,
    /// Artifacts may be materialized via hard links (safe only for tools
    /// that never overwrite existing output files in place).
    pub hard_links: bool,
}

/// An output file the tool is expected to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedFile {
    pub path: PathBuf,
    pub required: bool,
}

/// Result of a preprocessor run.
#[derive(Debug, Clone)]
pub struct PreprocessOutput {
    /// The full preprocessed text.
    pub text: Vec<u8>,
    /// Implicit inputs (headers) the tool reported, canonicalized.
    /// Populated only when direct mode was requested.
    pub implicit_inputs: Vec<PathBuf>,
}

/// Contract every tool adapter satisfies.
pub trait ToolWrapper {
    /// Expand response files, environment references, and tool-specific
    /// aliasing. Must be called before any other operation.
    fn resolve_args(&mut self) -> CacheResult<()>;

    fn capabilities(&self) -> Capabilities;

    /// Stable identity of this specific tool build, conventionally a
    /// hash-format epoch byte string followed by the version banner.
    fn program_id(&self) -> CacheResult<Vec<u8>>;

    /// Deterministic projection of the arguments that affect output
    /// beyond the preprocessed text.
    fn relevant_args(&self) -> Vec<String>;

    /// Environment variables known to influence the output.
    fn relevant_env(&self) -> BTreeMap<String, String>;

    /// Explicit source files named on the command line, canonicalized.
    fn input_files(&self) -> CacheResult<Vec<PathBuf>>;

    /// Map of artifact id to expected output file. Exactly one output is
    /// required.
    fn expected_outputs(&self) -> CacheResult<BTreeMap<String, ExpectedFile>>;

    /// Run the tool in emit-preprocessed-text mode.
    fn preprocess(&mut self, direct_mode: bool) -> CacheResult<PreprocessOutput>;

    /// Invoke the real tool and capture its output.
    fn run_for_miss(&self) -> CacheResult<RunResult>;
}

/// Select a wrapper for an invocation. The registry is consulted in
/// order; the first adapter that accepts wins.
pub fn find_wrapper(
    invocation: &Invocation,
    accuracy: Accuracy,
    memo: &ToolIdMemo,
) -> Option<Box<dyn ToolWrapper>> {
    if GccWrapper::matches(invocation, memo) {
        return Some(Box::new(GccWrapper::new(invocation.clone(), accuracy)));
    }
    if MsvcWrapper::matches(invocation) {
        return Some(Box::new(MsvcWrapper::new(invocation.clone(), accuracy)));
    }
    None
}

/// Lowercased file name of a path, extension included.
pub(crate) fn file_name_lower(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Lowercased file name of a path, extension stripped.
pub(crate) fn file_stem_lower(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Lowercased extension (with the leading dot) of a path-like string.
pub(crate) fn extension_lower(arg: &str) -> String {
    match arg.rfind('.') {
        Some(pos) if !arg[pos..].contains('/') && !arg[pos..].contains('\\') => {
            arg[pos..].to_lowercase()
        }
        _ => String::new(),
    }
}

/// Whether an argument names a C/C++ translation unit.
pub(crate) fn is_source_file(arg: &str) -> bool {
    matches!(extension_lower(arg).as_str(), ".c" | ".cc" | ".cpp" | ".cxx")
}
