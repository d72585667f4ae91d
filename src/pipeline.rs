//! The invocation pipeline.
//!
//! One instance drives one tool invocation through the cache:
//!
//! 1. select a wrapper (none → passthrough)
//! 2. resolve arguments
//! 3. direct-mode probe: manifests for the direct key, newest first
//! 4. preprocess and compute the preprocessed entry key on direct miss
//! 5. materialize from the local store, then from the remote
//! 6. on miss, run the real tool, publish the entry (and manifest), and
//!    replicate to the remote asynchronously
//!
//! The pipeline is deliberately conservative: any error before the real
//! tool runs degrades to transparent passthrough, and errors during
//! publish are logged and swallowed. The cache must never turn a
//! successful build into a failed one.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{CacheError, CacheResult};
use crate::filesys;
use crate::hasher::Hasher;
use crate::remote::RemoteCache;
use crate::runner;
use crate::store::{CacheEntry, EntryHandle, LocalStore, Manifest};
use crate::wrappers::{find_wrapper, ExpectedFile, Invocation, ToolWrapper};

/// Which probe produced a hit, for stats accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HitKind {
    Direct,
    Preprocessed,
}

/// The cache engine for one process.
pub struct Pipeline {
    config: Config,
    store: LocalStore,
    remote: RemoteCache,
}

impl Pipeline {
    /// Open the local store and connect the remote per the configuration.
    pub fn new(config: Config) -> CacheResult<Self> {
        let store = LocalStore::open(&config.dir)?;
        let remote = RemoteCache::connect(
            config.remote.as_deref(),
            std::time::Duration::from_secs(config.remote_timeout_secs),
        );
        Ok(Self {
            config,
            store,
            remote,
        })
    }

    /// Assemble a pipeline from explicit parts (tests, embedders).
    pub fn with_parts(config: Config, store: LocalStore, remote: RemoteCache) -> Self {
        Self {
            config,
            store,
            remote,
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Run one invocation through the cache. Returns the exit code to
    /// forward; this function does not fail.
    pub fn run(&mut self, invocation: &Invocation) -> i32 {
        if self.config.disabled {
            debug!("caching disabled, passing through");
            return self.passthrough(invocation);
        }

        let memo = self.store.memo();
        let mut wrapper = match find_wrapper(invocation, self.config.accuracy, &memo) {
            Some(wrapper) => wrapper,
            None => {
                debug!("no wrapper accepts {}, passing through", invocation.args[0]);
                return self.passthrough(invocation);
            }
        };
        self.run_wrapped(wrapper.as_mut(), invocation)
    }

    /// Run an invocation with an already-selected wrapper.
    pub fn run_wrapped(&mut self, wrapper: &mut dyn ToolWrapper, invocation: &Invocation) -> i32 {
        match self.try_cached(wrapper) {
            Ok(code) => code,
            Err(CacheError::ToolFailed(code)) => code,
            Err(err) => {
                debug!("cache bypassed: {err}");
                self.passthrough(invocation)
            }
        }
    }

    /// The cacheable path. Any error degrades to passthrough, except
    /// `ToolFailed` which carries the real tool's exit code.
    fn try_cached(&mut self, wrapper: &mut dyn ToolWrapper) -> CacheResult<i32> {
        wrapper.resolve_args()?;

        let capabilities = wrapper.capabilities();
        let direct_enabled = self.config.direct_mode && capabilities.direct_mode;
        let hard_links = self.config.hard_links && capabilities.hard_links;

        let program_id = wrapper.program_id()?;
        let relevant_args = wrapper.relevant_args();
        let relevant_env = wrapper.relevant_env();
        let outputs = wrapper.expected_outputs()?;

        // Fast path: hash the raw sources and look for a verified
        // manifest. The first valid manifest decides the entry key.
        let mut direct_key = None;
        let mut resolved: Option<(String, HitKind)> = None;
        if direct_enabled {
            match self.compute_direct_key(&program_id, &relevant_args, &relevant_env, wrapper) {
                Ok(key) => {
                    for manifest in self.store.lookup_manifests(&key) {
                        if manifest.verify() {
                            resolved = Some((manifest.entry_key, HitKind::Direct));
                            break;
                        }
                    }
                    direct_key = Some(key);
                }
                Err(err) => debug!("direct mode probe unavailable: {err}"),
            }
        }

        // Slow path: preprocess and hash the preprocessed text.
        let mut implicit_inputs: Vec<PathBuf> = Vec::new();
        let (entry_key, hit_kind) = match resolved {
            Some(found) => found,
            None => {
                let preprocessed = wrapper.preprocess(direct_enabled)?;
                implicit_inputs = preprocessed.implicit_inputs;
                let key = compute_preprocessed_key(
                    &program_id,
                    &relevant_args,
                    &relevant_env,
                    &preprocessed.text,
                );
                (key, HitKind::Preprocessed)
            }
        };

        // Local store probe. A replay failure (e.g. the entry was evicted
        // between lookup and materialize) is a miss, not an error.
        if let Some(handle) = self.store.lookup_entry(&entry_key) {
            match self.replay_local(&handle, &outputs, hard_links) {
                Ok(code) => {
                    self.store.record_access(&entry_key);
                    self.count_hit(hit_kind);
                    return Ok(code);
                }
                Err(err) => debug!("replay of {entry_key} failed, treating as miss: {err}"),
            }
        }

        // Remote probe: re-publish locally, then replay.
        if let Some(entry) = self.remote.get(&entry_key) {
            if let Err(err) = self.store.publish_entry(&entry_key, &entry) {
                debug!("local re-publish of remote entry failed: {err}");
            }
            match self.replay_remote(&entry, &outputs) {
                Ok(code) => {
                    self.count_remote_hit();
                    return Ok(code);
                }
                Err(err) => debug!("remote replay of {entry_key} failed: {err}"),
            }
        }

        // Miss: run the real tool and forward its output verbatim.
        let result = wrapper.run_for_miss()?;
        let _ = io::stdout().write_all(&result.stdout);
        let _ = io::stderr().write_all(&result.stderr);
        self.count_miss();

        if !result.success() {
            // Failed compiles are never cached.
            return Err(CacheError::ToolFailed(result.return_code));
        }

        if let Err(err) = self.publish(
            &entry_key,
            direct_key.as_deref(),
            &implicit_inputs,
            &outputs,
            CacheEntry {
                artifacts: BTreeMap::new(),
                stdout: result.stdout,
                stderr: result.stderr,
                return_code: result.return_code,
            },
        ) {
            debug!("publish of {entry_key} failed: {err}");
        }
        Ok(result.return_code)
    }

    /// Exec the real tool with the cache out of the way.
    fn passthrough(&self, invocation: &Invocation) -> i32 {
        match runner::passthrough(
            &invocation.exe.real_path,
            &invocation.args[1..],
            &invocation.work_dir,
        ) {
            Ok(code) => code,
            Err(err) => {
                eprintln!(
                    "buildcache: failed to run {}: {err}",
                    invocation.exe.real_path.display()
                );
                1
            }
        }
    }

    /// Direct-mode key: program identity, relevant args and env, and the
    /// raw contents of the explicit source files.
    fn compute_direct_key(
        &self,
        program_id: &[u8],
        relevant_args: &[String],
        relevant_env: &BTreeMap<String, String>,
        wrapper: &dyn ToolWrapper,
    ) -> CacheResult<String> {
        let inputs = wrapper.input_files()?;
        if inputs.is_empty() {
            return Err(CacheError::UnsupportedInvocation(
                "no input files for direct mode".to_string(),
            ));
        }
        let mut hasher = Hasher::new();
        hash_common(&mut hasher, program_id, relevant_args, relevant_env);
        for input in &inputs {
            hasher.update_from_file(input)?;
        }
        Ok(hasher.finalize().to_hex())
    }

    /// Materialize a local entry: artifacts first (so a build system
    /// watching the files sees them before any terminal output), then the
    /// captured stdout/stderr, then the recorded return code.
    fn replay_local(
        &self,
        handle: &EntryHandle,
        outputs: &BTreeMap<String, ExpectedFile>,
        hard_links: bool,
    ) -> CacheResult<i32> {
        for (artifact_id, expected) in outputs {
            match handle.materialize_artifact(artifact_id, &expected.path, hard_links) {
                Ok(()) => {}
                Err(err) if !expected.required => {
                    debug!("optional artifact {artifact_id} not materialized: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        let _ = io::stdout().write_all(&handle.stdout()?);
        let _ = io::stderr().write_all(&handle.stderr()?);
        handle.return_code()
    }

    /// Materialize an entry fetched from the remote.
    fn replay_remote(
        &self,
        entry: &CacheEntry,
        outputs: &BTreeMap<String, ExpectedFile>,
    ) -> CacheResult<i32> {
        for (artifact_id, expected) in outputs {
            match entry.artifacts.get(artifact_id) {
                Some(bytes) => {
                    if let Some(parent) = expected.path.parent() {
                        if !parent.as_os_str().is_empty() {
                            fs::create_dir_all(parent)?;
                        }
                    }
                    fs::write(&expected.path, bytes)?;
                    filesys::touch(&expected.path)?;
                }
                None if !expected.required => {}
                None => {
                    return Err(CacheError::Internal(format!(
                        "remote entry lacks required artifact {artifact_id}"
                    )))
                }
            }
        }
        let _ = io::stdout().write_all(&entry.stdout);
        let _ = io::stderr().write_all(&entry.stderr);
        Ok(entry.return_code)
    }

    /// Publish a successful miss: read the produced outputs into an
    /// entry, publish it (and the manifest when direct mode supplied
    /// one), replicate to the remote, and run opportunistic housekeeping.
    fn publish(
        &mut self,
        entry_key: &str,
        direct_key: Option<&str>,
        implicit_inputs: &[PathBuf],
        outputs: &BTreeMap<String, ExpectedFile>,
        mut entry: CacheEntry,
    ) -> CacheResult<()> {
        for (artifact_id, expected) in outputs {
            match fs::read(&expected.path) {
                Ok(bytes) => {
                    entry.artifacts.insert(artifact_id.clone(), bytes);
                }
                Err(err) if !expected.required => {
                    debug!("optional output {artifact_id} not produced: {err}");
                }
                Err(err) => {
                    // A required output is missing even though the tool
                    // reported success; do not cache.
                    return Err(CacheError::Internal(format!(
                        "required output {} missing: {err}",
                        expected.path.display()
                    )));
                }
            }
        }

        self.store.publish_entry(entry_key, &entry)?;

        if let Some(direct_key) = direct_key {
            let manifest = Manifest::from_inputs(implicit_inputs, entry_key)?;
            self.store.publish_manifest(direct_key, &manifest)?;
        }

        self.remote.put_async(entry_key, entry);

        if let Err(err) = self.store.maybe_housekeep(self.config.max_cache_size) {
            warn!("housekeeping failed: {err}");
        }
        Ok(())
    }

    fn count_hit(&self, kind: HitKind) {
        let result = self.store.ledger().update(|stats| match kind {
            HitKind::Direct => stats.hits_direct += 1,
            HitKind::Preprocessed => stats.hits_preprocessed += 1,
        });
        if let Err(err) = result {
            debug!("failed to record hit: {err}");
        }
    }

    fn count_remote_hit(&self) {
        if let Err(err) = self.store.ledger().update(|stats| stats.hits_remote += 1) {
            debug!("failed to record remote hit: {err}");
        }
    }

    fn count_miss(&self) {
        if let Err(err) = self.store.ledger().update(|stats| stats.misses += 1) {
            debug!("failed to record miss: {err}");
        }
    }
}

/// Preprocessed key: program identity, relevant args and env, and the
/// full preprocessed text.
fn compute_preprocessed_key(
    program_id: &[u8],
    relevant_args: &[String],
    relevant_env: &BTreeMap<String, String>,
    preprocessed: &[u8],
) -> String {
    let mut hasher = Hasher::new();
    hash_common(&mut hasher, program_id, relevant_args, relevant_env);
    hasher.update(preprocessed);
    hasher.finalize().to_hex()
}

/// Feed the key components shared by both key kinds. Every component is
/// terminated so adjacent fields cannot alias each other.
fn hash_common(
    hasher: &mut Hasher,
    program_id: &[u8],
    relevant_args: &[String],
    relevant_env: &BTreeMap<String, String>,
) {
    hasher.update(program_id);
    hasher.update([0u8]);
    for arg in relevant_args {
        hasher.update(arg);
        hasher.update([0u8]);
    }
    for (key, value) in relevant_env {
        hasher.update(key);
        hasher.update([b'=']);
        hasher.update(value);
        hasher.update([0u8]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_components_do_not_alias() {
        let mut one_arg = Hasher::new();
        hash_common(&mut one_arg, b"id", &["ab".to_string()], &BTreeMap::new());

        let mut two_args = Hasher::new();
        hash_common(
            &mut two_args,
            b"id",
            &["a".to_string(), "b".to_string()],
            &BTreeMap::new(),
        );

        assert_ne!(one_arg.finalize(), two_args.finalize());
    }

    #[test]
    fn env_participates_in_keys() {
        let mut without = Hasher::new();
        hash_common(&mut without, b"id", &[], &BTreeMap::new());

        let mut with = Hasher::new();
        let mut env = BTreeMap::new();
        env.insert("CL".to_string(), "/W4".to_string());
        hash_common(&mut with, b"id", &[], &env);

        assert_ne!(without.finalize(), with.finalize());
    }

    #[test]
    fn preprocessed_text_changes_the_key() {
        let args = vec!["-c".to_string(), "-O2".to_string()];
        let env = BTreeMap::new();

        let a = compute_preprocessed_key(b"3gcc 12.2", &args, &env, b"int main() {}");
        let b = compute_preprocessed_key(b"3gcc 12.2", &args, &env, b"int main() { return 1; }");
        let a_again = compute_preprocessed_key(b"3gcc 12.2", &args, &env, b"int main() {}");

        assert_ne!(a, b);
        assert_eq!(a, a_again);
        assert_eq!(a.len(), 64);
    }
}
