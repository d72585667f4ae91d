//! Wrapper for the Microsoft C/C++ compiler (`cl`).

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::Accuracy;
use crate::error::{CacheError, CacheResult};
use crate::filesys::{self, TempPath};
use crate::runner::{self, RunResult};
use crate::unicode;
use crate::wrappers::{
    extension_lower, file_stem_lower, is_source_file, split_args, Capabilities, ExpectedFile,
    Invocation, PreprocessOutput, ToolWrapper,
};

/// Bump on any change to how this wrapper derives cache keys.
const HASH_VERSION: &str = "1";

/// When cl.exe is started from Visual Studio it redirects its output to
/// the IDE process instead of stdout/stderr. The redirection is disabled
/// for any run whose output we must capture.
const ENV_VS_OUTPUT_REDIRECTION: &str = "VS_UNICODE_OUTPUT";

/// Environment variables cl reads extra options from.
const CL_ENV_VARS: &[&str] = &["CL", "_CL_"];

/// Temporarily unset an environment variable; restored on drop.
struct ScopedUnsetEnv {
    name: &'static str,
    saved: Option<std::ffi::OsString>,
}

impl ScopedUnsetEnv {
    fn new(name: &'static str) -> Self {
        let saved = env::var_os(name);
        if saved.is_some() {
            env::remove_var(name);
        }
        Self { name, saved }
    }
}

impl Drop for ScopedUnsetEnv {
    fn drop(&mut self) {
        if let Some(value) = self.saved.take() {
            env::set_var(self.name, value);
        }
    }
}

/// cl options may begin with either `/` or `-`.
fn arg_flag(arg: &str) -> Option<&str> {
    let mut chars = arg.chars();
    match chars.next() {
        Some('/') | Some('-') => Some(&arg[1..]),
        _ => None,
    }
}

fn arg_equals(arg: &str, name: &str) -> bool {
    arg_flag(arg) == Some(name)
}

fn arg_starts_with(arg: &str, prefix: &str) -> bool {
    arg_flag(arg).is_some_and(|flag| flag.starts_with(prefix))
}

/// Some cl options accept an optional colon separator (`/Foout.obj` and
/// `/Fo:out.obj` are both valid).
fn drop_leading_colon(s: &str) -> &str {
    s.strip_prefix(':').unwrap_or(s)
}

fn is_object_file(extension: &str) -> bool {
    matches!(extension.to_lowercase().as_str(), ".obj" | ".o")
}

/// Microsoft's tool adapter.
pub struct MsvcWrapper {
    invocation: Invocation,
    args: Vec<String>,
    accuracy: Accuracy,
}

impl MsvcWrapper {
    pub fn new(invocation: Invocation, accuracy: Accuracy) -> Self {
        let args = invocation.args.clone();
        Self {
            invocation,
            args,
            accuracy,
        }
    }

    /// Does this invocation name the MSVC compiler driver?
    pub fn matches(invocation: &Invocation) -> bool {
        file_stem_lower(&invocation.exe.real_path) == "cl"
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

    /// Find the object file named by a `/Fo` option: either a file with
    /// an object extension, or a target directory (trailing separator)
    /// combined with the source file's stem.
    fn try_get_obj_filename(&self) -> CacheResult<Option<String>> {
        let mut object: Option<String> = None;
        let mut found = |candidate: String, object: &mut Option<String>| {
            if object.is_some() {
                return Err(CacheError::UnsupportedInvocation(
                    "only a single target object file can be specified".to_string(),
                ));
            }
            *object = Some(candidate);
            Ok(())
        };

        for arg in &self.args {
            if !arg_starts_with(arg, "Fo") {
                continue;
            }
            let value = &arg[3..];
            if is_object_file(&extension_lower(value)) {
                found(drop_leading_colon(value).to_string(), &mut object)?;
            } else if value.ends_with('\\') || value.ends_with('/') {
                // Directory form: the object is named after the input
                // file. The input is conventionally the last argument.
                if let Some(input) = self.args.last() {
                    if is_source_file(input) {
                        let stem = Path::new(input)
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        found(format!("{value}{stem}.obj"), &mut object)?;
                    }
                }
            }
        }
        Ok(object)
    }

    /// Preprocessor argv: compile arguments minus `/c`, the object
    /// output, and any explicit preprocess flags, plus `/EP` (or `/E`
    /// when line info must be preserved) and `/showIncludes` for direct
    /// mode.
    fn make_preprocessor_cmd(&self, direct_mode: bool) -> Vec<String> {
        let mut has_debug_symbols = false;
        let mut has_coverage_output = false;
        let mut cmd = Vec::with_capacity(self.args.len() + 2);

        for arg in &self.args {
            let drop_this = arg_equals(arg, "c")
                || arg_starts_with(arg, "Fo")
                || arg_equals(arg, "C")
                || arg_equals(arg, "E")
                || arg_equals(arg, "EP");
            if arg_equals(arg, "Z7") || arg_equals(arg, "Zi") || arg_equals(arg, "ZI") {
                has_debug_symbols = true;
            }
            if arg_equals(arg, "DEBUG")
                || arg_equals(arg, "DEBUG:FULL")
                || arg_equals(arg, "Zi")
                || arg_equals(arg, "ZI")
            {
                has_coverage_output = true;
            }
            if !drop_this {
                cmd.push(arg.clone());
            }
        }

        let debug_required = has_debug_symbols && self.accuracy >= Accuracy::Strict;
        let coverage_required = has_coverage_output && self.accuracy >= Accuracy::Default;
        if debug_required || coverage_required {
            cmd.push("/E".to_string());
        } else {
            cmd.push("/EP".to_string());
        }
        if direct_mode {
            cmd.push("/showIncludes".to_string());
        }
        cmd
    }

    /// Extract include paths from `/showIncludes` stderr lines:
    /// `Note: including file: <path>`.
    fn parse_include_files(&self, stderr: &[u8]) -> Vec<PathBuf> {
        const PREFIX: &str = "Note: including file:";
        let text = String::from_utf8_lossy(stderr);
        let mut includes = BTreeSet::new();
        for line in text.lines() {
            if let Some(pos) = line.find(PREFIX) {
                let include = line[pos + PREFIX.len()..].trim();
                let path = self.absolutize(include);
                match filesys::resolve_path(&path) {
                    Ok(resolved) => {
                        includes.insert(resolved);
                    }
                    Err(err) => debug!("cannot resolve include {}: {err}", path.display()),
                }
            }
        }
        includes.into_iter().collect()
    }
}

impl ToolWrapper for MsvcWrapper {
    fn resolve_args(&mut self) -> CacheResult<()> {
        // Load response files. cl response files may be UTF-16 with a
        // BOM; a file that cannot be read contributes nothing.
        let mut resolved = Vec::with_capacity(self.invocation.args.len());
        for arg in &self.invocation.args {
            if let Some(file_name) = arg.strip_prefix('@') {
                if let Ok(bytes) = fs::read(self.absolutize(file_name)) {
                    let text = unicode::decode_response_file(&bytes);
                    for line in text.lines() {
                        resolved.extend(split_args(line.trim()));
                    }
                }
            } else {
                resolved.push(arg.clone());
            }
        }

        // cl expands %VAR% references itself; resolved args must match
        // what the compiler will actually see.
        self.args = resolved
            .iter()
            .map(|arg| unicode::expand_env_vars(arg))
            .collect();
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        // Hard links are safe: cl never overwrites an existing output
        // file in place.
        Capabilities {
            direct_mode: true,
            hard_links: true,
        }
    }

    fn program_id(&self) -> CacheResult<Vec<u8>> {
        // Running cl without arguments prints the version banner on
        // stderr.
        let _vs_redirect_off = ScopedUnsetEnv::new(ENV_VS_OUTPUT_REDIRECTION);
        let result = runner::run(self.program(), &[], &self.invocation.work_dir)?;
        if result.stderr.is_empty() {
            return Err(CacheError::Internal(
                "unable to get the compiler version information".to_string(),
            ));
        }
        let mut id = HASH_VERSION.as_bytes().to_vec();
        id.extend_from_slice(&result.stderr);
        Ok(id)
    }

    fn relevant_args(&self) -> Vec<String> {
        let mut filtered = vec![file_stem_lower(self.program())];

        let mut first = true;
        for arg in &self.args {
            if std::mem::replace(&mut first, false) {
                continue;
            }
            // Output/include/definition options do not change how
            // preprocessed code becomes object code.
            let unwanted = (arg_starts_with(arg, "F") && !arg_equals(arg, "F"))
                || arg_starts_with(arg, "I")
                || arg_starts_with(arg, "D")
                || is_source_file(arg);
            if !unwanted {
                filtered.push(arg.clone());
            }
        }
        filtered
    }

    fn relevant_env(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        for key in CL_ENV_VARS {
            if let Ok(value) = env::var(key) {
                vars.insert((*key).to_string(), value);
            }
        }
        vars
    }

    fn input_files(&self) -> CacheResult<Vec<PathBuf>> {
        let mut inputs = Vec::new();
        for arg in &self.args {
            if is_source_file(arg) {
                inputs.push(filesys::resolve_path(&self.absolutize(arg))?);
            }
        }
        Ok(inputs)
    }

    fn expected_outputs(&self) -> CacheResult<BTreeMap<String, ExpectedFile>> {
        let object = self.try_get_obj_filename()?.ok_or_else(|| {
            CacheError::UnsupportedInvocation("unable to get the target object file".to_string())
        })?;
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "object".to_string(),
            ExpectedFile {
                path: self.absolutize(&object),
                required: true,
            },
        );
        Ok(outputs)
    }

    fn preprocess(&mut self, direct_mode: bool) -> CacheResult<PreprocessOutput> {
        let is_object_compilation = self.args.iter().any(|a| arg_equals(a, "c"));
        for arg in &self.args {
            if arg_equals(arg, "Zi") || arg_equals(arg, "ZI") {
                return Err(CacheError::UnsupportedInvocation(
                    "PDB generation is not supported".to_string(),
                ));
            }
        }
        if !is_object_compilation || self.try_get_obj_filename()?.is_none() {
            return Err(CacheError::UnsupportedInvocation(
                "not a single-object compilation".to_string(),
            ));
        }

        let _vs_redirect_off = ScopedUnsetEnv::new(ENV_VS_OUTPUT_REDIRECTION);
        let cmd = self.make_preprocessor_cmd(direct_mode);
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

        // The preprocessed translation unit arrives on stdout.
        Ok(PreprocessOutput {
            text: result.stdout,
            implicit_inputs,
        })
    }

    fn run_for_miss(&self) -> CacheResult<RunResult> {
        let _vs_redirect_off = ScopedUnsetEnv::new(ENV_VS_OUTPUT_REDIRECTION);

        // The resolved arguments already have %VAR% references expanded,
        // which the original response files may not have had. Hand cl a
        // regenerated response file so it sees exactly the resolved form
        // (and long command lines stay within platform limits).
        let rsp = TempPath::new(&env::temp_dir(), ".rsp");
        let mut contents = String::new();
        for arg in &self.args[1..] {
            contents.push_str(arg);
            // `/D NAME=value` pairs must stay on one line.
            if arg == "/D" || arg == "-D" {
                contents.push(' ');
            } else {
                contents.push('\n');
            }
        }
        fs::write(rsp.path(), contents)?;

        let rsp_arg = format!("@{}", rsp.path().display());
        Ok(runner::run(
            self.program(),
            &[rsp_arg],
            &self.invocation.work_dir,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrappers::ExePath;
    use tempfile::TempDir;

    fn invocation(args: &[&str]) -> Invocation {
        let mut argv = vec!["C:/tools/cl.exe".to_string()];
        argv.extend(args.iter().map(|s| s.to_string()));
        Invocation {
            exe: ExePath {
                virtual_path: PathBuf::from("cl"),
                real_path: PathBuf::from("C:/tools/cl.exe"),
            },
            args: argv,
            work_dir: PathBuf::from("/work"),
        }
    }

    #[test]
    fn matches_only_cl() {
        assert!(MsvcWrapper::matches(&invocation(&[])));

        let mut other = invocation(&[]);
        other.exe.real_path = PathBuf::from("/usr/bin/gcc");
        assert!(!MsvcWrapper::matches(&other));
    }

    #[test]
    fn flags_accept_slash_and_dash() {
        assert!(arg_equals("/c", "c"));
        assert!(arg_equals("-c", "c"));
        assert!(!arg_equals("c", "c"));
        assert!(arg_starts_with("/Foout.obj", "Fo"));
        assert!(arg_starts_with("-Fo:out.obj", "Fo"));
        assert!(!arg_starts_with("out.obj", "Fo"));
    }

    #[test]
    fn object_from_explicit_file_form() {
        let wrapper = MsvcWrapper::new(
            invocation(&["/c", "/Fofoo.obj", "foo.cpp"]),
            Accuracy::Default,
        );
        assert_eq!(wrapper.try_get_obj_filename().unwrap(), Some("foo.obj".to_string()));
    }

    #[test]
    fn object_from_colon_form() {
        let wrapper = MsvcWrapper::new(
            invocation(&["/c", "/Fo:foo.obj", "foo.cpp"]),
            Accuracy::Default,
        );
        assert_eq!(wrapper.try_get_obj_filename().unwrap(), Some("foo.obj".to_string()));
    }

    #[test]
    fn object_from_directory_form() {
        let wrapper = MsvcWrapper::new(
            invocation(&["/c", "/Foobj/", "src/foo.cpp"]),
            Accuracy::Default,
        );
        assert_eq!(
            wrapper.try_get_obj_filename().unwrap(),
            Some("obj/foo.obj".to_string())
        );
    }

    #[test]
    fn duplicate_object_is_unsupported() {
        let wrapper = MsvcWrapper::new(
            invocation(&["/c", "/Foa.obj", "/Fob.obj", "foo.cpp"]),
            Accuracy::Default,
        );
        assert!(matches!(
            wrapper.try_get_obj_filename(),
            Err(CacheError::UnsupportedInvocation(_))
        ));
    }

    #[test]
    fn relevant_args_drop_output_include_and_defines() {
        let wrapper = MsvcWrapper::new(
            invocation(&["/c", "/O2", "/Fofoo.obj", "/Iinclude", "/DNDEBUG", "foo.cpp"]),
            Accuracy::Default,
        );
        assert_eq!(wrapper.relevant_args(), vec!["cl", "/c", "/O2"]);
    }

    #[test]
    fn relevant_env_picks_up_cl_variables() {
        env::set_var("CL", "/W4");
        let wrapper = MsvcWrapper::new(invocation(&[]), Accuracy::Default);
        let vars = wrapper.relevant_env();
        env::remove_var("CL");

        assert_eq!(vars.get("CL"), Some(&"/W4".to_string()));
    }

    #[test]
    fn preprocessor_cmd_uses_ep_and_show_includes() {
        let wrapper = MsvcWrapper::new(
            invocation(&["/c", "/O2", "/Fofoo.obj", "foo.cpp"]),
            Accuracy::Default,
        );
        let cmd = wrapper.make_preprocessor_cmd(true);
        assert_eq!(
            cmd,
            vec!["C:/tools/cl.exe", "/O2", "foo.cpp", "/EP", "/showIncludes"]
        );
    }

    #[test]
    fn pdb_modes_are_unsupported() {
        let mut wrapper = MsvcWrapper::new(
            invocation(&["/c", "/Zi", "/Fofoo.obj", "foo.cpp"]),
            Accuracy::Default,
        );
        assert!(matches!(
            wrapper.preprocess(false),
            Err(CacheError::UnsupportedInvocation(_))
        ));
    }

    #[test]
    fn include_lines_are_parsed_and_deduped() {
        let dir = TempDir::new().unwrap();
        let header = dir.path().join("windows.h");
        std::fs::write(&header, b"").unwrap();

        let wrapper = MsvcWrapper::new(invocation(&[]), Accuracy::Default);
        let stderr = format!(
            "Note: including file: {}\nNote: including file:  {}\nfoo.cpp\n",
            header.display(),
            header.display()
        );

        let includes = wrapper.parse_include_files(stderr.as_bytes());
        assert_eq!(includes, vec![filesys::resolve_path(&header).unwrap()]);
    }

    #[test]
    fn response_file_with_utf16_bom_is_expanded() {
        let dir = TempDir::new().unwrap();
        let rsp = dir.path().join("args.rsp");

        let mut bytes = vec![0xff, 0xfe];
        for unit in "/c /O2\n/Fofoo.obj foo.cpp".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        std::fs::write(&rsp, &bytes).unwrap();

        let mut inv = invocation(&[]);
        inv.args.push(format!("@{}", rsp.display()));
        inv.work_dir = dir.path().to_path_buf();

        let mut wrapper = MsvcWrapper::new(inv, Accuracy::Default);
        wrapper.resolve_args().unwrap();

        assert_eq!(
            wrapper.args[1..],
            ["/c", "/O2", "/Fofoo.obj", "foo.cpp"]
        );
    }

    #[test]
    fn env_references_are_expanded_in_resolved_args() {
        env::set_var("BUILDCACHE_TEST_MSVC_DIR", "C:/sdk");
        let mut wrapper = MsvcWrapper::new(
            invocation(&["/I%BUILDCACHE_TEST_MSVC_DIR%/include", "/c"]),
            Accuracy::Default,
        );
        wrapper.resolve_args().unwrap();
        env::remove_var("BUILDCACHE_TEST_MSVC_DIR");

        assert_eq!(wrapper.args[1], "/IC:/sdk/include");
    }

    #[test]
    fn missing_response_file_contributes_nothing() {
        let mut inv = invocation(&["/c"]);
        inv.args.push("@/no/such.rsp".to_string());

        let mut wrapper = MsvcWrapper::new(inv, Accuracy::Default);
        wrapper.resolve_args().unwrap();

        assert_eq!(wrapper.args[1..], ["/c"]);
    }
}
