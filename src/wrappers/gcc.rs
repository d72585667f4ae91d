//! Wrapper for GCC-compatible compilers (gcc, g++, clang, clang++, and
//! the `cc`/`c++` shims that front them).

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use regex_lite::Regex;
use tracing::debug;

use crate::config::Accuracy;
use crate::error::{CacheError, CacheResult};
use crate::filesys::{self, TempPath};
use crate::hasher;
use crate::runner::{self, RunResult};
use crate::store::{ToolIdMemo, DEFAULT_TTL};
use crate::wrappers::{
    extension_lower, file_name_lower, file_stem_lower, is_source_file, split_args, Capabilities,
    ExpectedFile, Invocation, PreprocessOutput, ToolWrapper,
};

/// Bump on any change to how this wrapper derives cache keys; old entries
/// become unreachable rather than wrong.
const HASH_VERSION: &str = "3";

/// Arguments that take a following file path; both the flag and the path
/// are excluded from the relevant-args projection.
const PATH_PAIR_ARGS: &[&str] = &["-I", "-MF", "-MT", "-MQ", "-o"];

const DEBUG_OPTIONS: &[&str] = &[
    "-g", "-ggdb", "-gdwarf", "-gdwarf-2", "-gdwarf-3", "-gdwarf-4", "-gdwarf-5", "-gstabs",
    "-gstabs+", "-gxcoff", "-gxcoff+", "-gvms",
];

const COVERAGE_OPTIONS: &[&str] = &["-ftest-coverage", "-fprofile-arcs", "--coverage"];

fn is_path_pair_arg(arg: &str) -> bool {
    PATH_PAIR_ARGS.contains(&arg)
}

fn has_debug_symbols(args: &[String]) -> bool {
    args.iter().any(|a| DEBUG_OPTIONS.contains(&a.as_str()))
}

fn has_coverage_output(args: &[String]) -> bool {
    args.iter().any(|a| COVERAGE_OPTIONS.contains(&a.as_str()))
}

/// Check whether `path` is an identical copy of any of the given sibling
/// binaries (same directory, same contents). Used to recognize `cc`
/// installed as a copy of the real compiler front end.
fn is_file_identical_to(path: &Path, alternatives: &[&str]) -> bool {
    let reference = match filesys::file_info(path) {
        Ok(info) => info,
        Err(_) => return false,
    };
    let dir = match path.parent() {
        Some(dir) => dir,
        None => return false,
    };

    // The reference hash is computed on demand; most alternatives are
    // ruled out by the size comparison alone.
    let mut reference_hash = None;
    for name in alternatives {
        let alt = dir.join(name);
        let alt_info = match filesys::file_info(&alt) {
            Ok(info) => info,
            Err(_) => continue,
        };
        if alt_info.size != reference.size {
            continue;
        }
        if reference_hash.is_none() {
            reference_hash = match hasher::hash_file(path) {
                Ok(digest) => Some(digest),
                Err(_) => return false,
            };
        }
        if hasher::hash_file(&alt).ok() == reference_hash {
            return true;
        }
    }
    false
}

/// GCC-compatible tool adapter.
pub struct GccWrapper {
    invocation: Invocation,
    args: Vec<String>,
    accuracy: Accuracy,
}

impl GccWrapper {
    pub fn new(invocation: Invocation, accuracy: Accuracy) -> Self {
        let args = invocation.args.clone();
        Self {
            invocation,
            args,
            accuracy,
        }
    }

    /// Does this invocation look like a GCC-compatible compiler?
    pub fn matches(invocation: &Invocation, memo: &ToolIdMemo) -> bool {
        // Keep the extension: cross toolchains embed version strings in
        // the file name ("aarch64-unknown-nto-qnx7.0.0-g++").
        let cmd = file_name_lower(&invocation.exe.real_path);
        if cmd.contains("gcc") || cmd.contains("g++") {
            return true;
        }

        // clang-cl takes MSVC-style arguments; check the virtual path
        // since clang-cl is often a symlink to clang.
        if file_stem_lower(&invocation.exe.virtual_path) == "clang-cl" {
            return false;
        }

        // "clang", "clang++", "clang-14", "x86-clang-6.0" - but not
        // "clang-tidy" and friends.
        let clang_re =
            Regex::new(r"^.*clang(\+\+|-cpp)?(-[1-9][0-9]*(\.[0-9]+)*)?(\.exe)?$").unwrap();
        if clang_re.is_match(&cmd) {
            return true;
        }

        // On some systems the generic cc/c++ commands are copies of the
        // actual front end. The answer is memoized: the content check
        // costs a hash of the binaries.
        if cmd == "cc" || cmd == "c++" {
            let real = &invocation.exe.real_path;
            let memo_key = format!("is_gcc_compatible:{}", real.display());
            let tool_mtime = filesys::file_info(real).ok().map(|info| info.mtime);

            if let Some(value) = memo.get(&memo_key, tool_mtime) {
                return value == "true";
            }
            let compatible = is_file_identical_to(real, &["clang", "gcc", "clang++", "g++"]);
            memo.put(
                &memo_key,
                if compatible { "true" } else { "false" },
                DEFAULT_TTL,
                tool_mtime,
            );
            if compatible {
                debug!("recognized {} as a GCC compatible compiler", real.display());
            }
            return compatible;
        }

        false
    }

    fn program(&self) -> &Path {
        Path::new(&self.args[0])
    }

    fn absolutize(&self, arg: &str) -> PathBuf {
        let path = Path::new(arg);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.invocation.work_dir.join(path)
        }
    }

    fn expand_args(&self, args: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            if let Some(file_name) = arg.strip_prefix('@') {
                out.extend(self.expand_response_file(file_name));
            } else {
                out.push(arg.clone());
            }
        }
        out
    }

    fn expand_response_file(&self, file_name: &str) -> Vec<String> {
        match fs::read_to_string(self.absolutize(file_name)) {
            Ok(contents) => {
                let mut out = Vec::new();
                for line in contents.lines() {
                    out.extend(self.expand_args(&split_args(line)));
                }
                out
            }
            // GCC leaves an unopenable response file argument as-is.
            Err(_) => vec![format!("@{file_name}")],
        }
    }

    /// Preprocessor argv: the compile arguments minus `-c` and the output
    /// file, plus the flags that emit preprocessed text.
    fn make_preprocessor_cmd(&self, preprocessed_file: &Path, direct_mode: bool) -> Vec<String> {
        let mut cmd = Vec::with_capacity(self.args.len() + 5);
        let mut drop_next = false;
        for arg in &self.args {
            let drop_this = std::mem::replace(&mut drop_next, false);
            if arg == "-c" {
                continue;
            }
            if arg == "-o" {
                drop_next = true;
                continue;
            }
            if !drop_this {
                cmd.push(arg.clone());
            }
        }

        // Line directives are only kept when the requested accuracy needs
        // them for debug or coverage fidelity.
        let debug_required = has_debug_symbols(&self.args) && self.accuracy >= Accuracy::Strict;
        let coverage_required =
            has_coverage_output(&self.args) && self.accuracy >= Accuracy::Default;

        cmd.push("-E".to_string());
        if !(debug_required || coverage_required) {
            cmd.push("-P".to_string());
        }
        cmd.push("-o".to_string());
        cmd.push(preprocessed_file.to_string_lossy().into_owned());
        if direct_mode {
            // -H prints every opened include file on stderr.
            cmd.push("-H".to_string());
        }
        cmd
    }

    /// Extract include paths from `-H` output: one or more periods, a
    /// space, then the path.
    fn parse_include_files(&self, stderr: &[u8]) -> Vec<PathBuf> {
        let re = Regex::new(r"^\.+\s+(.*\S)\s*$").unwrap();
        let text = String::from_utf8_lossy(stderr);
        let mut includes = BTreeSet::new();
        for line in text.lines() {
            if let Some(caps) = re.captures(line) {
                let include = self.absolutize(&caps[1]);
                match filesys::resolve_path(&include) {
                    Ok(resolved) => {
                        includes.insert(resolved);
                    }
                    Err(err) => debug!("cannot resolve include {}: {err}", include.display()),
                }
            }
        }
        includes.into_iter().collect()
    }
}

impl ToolWrapper for GccWrapper {
    fn resolve_args(&mut self) -> CacheResult<()> {
        self.args = self.expand_args(&self.invocation.args);
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        // Hard links are safe: GCC never overwrites an existing output
        // file in place.
        Capabilities {
            direct_mode: true,
            hard_links: true,
        }
    }

    fn program_id(&self) -> CacheResult<Vec<u8>> {
        let result = runner::run(
            self.program(),
            &["--version".to_string()],
            &self.invocation.work_dir,
        )?;
        if !result.success() {
            return Err(CacheError::Internal(
                "unable to get the compiler version information".to_string(),
            ));
        }
        let mut id = HASH_VERSION.as_bytes().to_vec();
        id.extend_from_slice(&result.stdout);
        Ok(id)
    }

    fn relevant_args(&self) -> Vec<String> {
        // The compiler binary itself participates as a bare name so that
        // the same toolchain found via different paths hashes alike.
        let mut filtered = vec![file_stem_lower(self.program())];

        let mut skip_next = true;
        for arg in &self.args {
            if std::mem::replace(&mut skip_next, false) {
                continue;
            }
            // Arguments that do not change how preprocessed code becomes
            // object code: include paths, macro definitions, dependency
            // emission, sysroot, and the file paths themselves.
            let unwanted = arg.starts_with("-I")
                || arg.starts_with("-D")
                || arg.starts_with("-M")
                || arg.starts_with("--sysroot=")
                || is_source_file(arg);

            if is_path_pair_arg(arg) {
                skip_next = true;
            } else if !unwanted {
                filtered.push(arg.clone());
            }
        }
        filtered
    }

    fn relevant_env(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn input_files(&self) -> CacheResult<Vec<PathBuf>> {
        let mut inputs = Vec::new();
        let mut skip_next = true;
        for arg in &self.args {
            if std::mem::replace(&mut skip_next, false) {
                continue;
            }
            if is_path_pair_arg(arg) {
                skip_next = true;
            } else if is_source_file(arg) {
                inputs.push(filesys::resolve_path(&self.absolutize(arg))?);
            }
        }
        Ok(inputs)
    }

    fn expected_outputs(&self) -> CacheResult<BTreeMap<String, ExpectedFile>> {
        let mut object: Option<PathBuf> = None;
        for pair in self.args.windows(2) {
            if pair[0] == "-o" {
                if object.is_some() {
                    return Err(CacheError::UnsupportedInvocation(
                        "only a single target object file can be specified".to_string(),
                    ));
                }
                object = Some(self.absolutize(&pair[1]));
            }
        }
        let object = object.ok_or_else(|| {
            CacheError::UnsupportedInvocation("unable to get the target object file".to_string())
        })?;

        let mut outputs = BTreeMap::new();
        if has_coverage_output(&self.args) {
            outputs.insert(
                "coverage".to_string(),
                ExpectedFile {
                    path: object.with_extension("gcno"),
                    required: true,
                },
            );
        }
        outputs.insert(
            "object".to_string(),
            ExpectedFile {
                path: object,
                required: true,
            },
        );
        Ok(outputs)
    }

    fn preprocess(&mut self, direct_mode: bool) -> CacheResult<PreprocessOutput> {
        let is_object_compilation = self.args.iter().any(|a| a == "-c");
        let has_object_output = self.args.iter().any(|a| a == "-o");
        if !is_object_compilation || !has_object_output {
            return Err(CacheError::UnsupportedInvocation(
                "not a single-object compilation".to_string(),
            ));
        }

        let extension = self
            .input_files()?
            .first()
            .map(|p| extension_lower(&p.to_string_lossy()))
            .unwrap_or_default();
        let suffix = if extension == ".c" { ".i" } else { ".ii" };

        let preprocessed_file = TempPath::new(&std::env::temp_dir(), suffix);
        let cmd = self.make_preprocessor_cmd(preprocessed_file.path(), direct_mode);
        let result = runner::run(self.program(), &cmd[1..], &self.invocation.work_dir)?;
        if !result.success() {
            return Err(CacheError::Internal(format!(
                "preprocessing failed with return code {}",
                result.return_code
            )));
        }

        let implicit_inputs = if direct_mode {
            self.parse_include_files(&result.stderr)
        } else {
            Vec::new()
        };

        Ok(PreprocessOutput {
            text: fs::read(preprocessed_file.path())?,
            implicit_inputs,
        })
    }

    fn run_for_miss(&self) -> CacheResult<RunResult> {
        Ok(runner::run(
            self.program(),
            &self.args[1..],
            &self.invocation.work_dir,
        )?)
    }
}
