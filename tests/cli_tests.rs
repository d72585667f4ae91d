//! Front-end binary tests.

use std::fs;
use std::process::Command;

use tempfile::TempDir;

/// Run the buildcache binary with an isolated cache directory.
fn buildcache(cache_dir: &TempDir, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_buildcache"))
        .args(args)
        .env("BUILDCACHE_DIR", cache_dir.path())
        .env_remove("BUILDCACHE_REMOTE")
        .env_remove("BUILDCACHE_DISABLE")
        .output()
        .expect("failed to run buildcache")
}

#[test]
fn get_config_prints_effective_configuration() {
    let cache = TempDir::new().unwrap();
    let output = buildcache(&cache, &["--get-config"]);

    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("max_cache_size"));
    assert!(text.contains(&cache.path().to_string_lossy().into_owned()));
}

#[test]
fn show_stats_reports_an_empty_cache() {
    let cache = TempDir::new().unwrap();
    let output = buildcache(&cache, &["--show-stats"]);

    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("Entries in cache:    0"));
    assert!(text.contains("Misses:              0"));
}

#[test]
fn zero_stats_resets_counters() {
    let cache = TempDir::new().unwrap();

    // Seed a nonzero ledger by hand.
    fs::write(
        cache.path().join("stats"),
        r#"{"misses": 5, "hits_direct": 2}"#,
    )
    .unwrap();

    let output = buildcache(&cache, &["--zero-stats"]);
    assert!(output.status.success());

    let output = buildcache(&cache, &["--show-stats"]);
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("Misses:              0"));
}

#[test]
fn no_command_is_an_error() {
    let cache = TempDir::new().unwrap();
    let output = buildcache(&cache, &[]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn unknown_tool_is_an_error() {
    let cache = TempDir::new().unwrap();
    let output = buildcache(&cache, &["definitely-not-a-real-tool-xyz"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(!String::from_utf8_lossy(&output.stderr).is_empty());
}

#[cfg(unix)]
#[test]
fn passthrough_preserves_exit_code_and_output() {
    let cache = TempDir::new().unwrap();

    // `sh` is not a compiler; the invocation passes straight through.
    let output = buildcache(&cache, &["sh", "-c", "echo forwarded; exit 7"]);
    assert_eq!(output.status.code(), Some(7));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "forwarded\n");
}

#[cfg(unix)]
#[test]
fn disable_switch_forces_passthrough() {
    let cache = TempDir::new().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_buildcache"))
        .args(["sh", "-c", "exit 0"])
        .env("BUILDCACHE_DIR", cache.path())
        .env("BUILDCACHE_DISABLE", "1")
        .output()
        .unwrap();

    assert!(output.status.success());
    // A disabled cache creates no store structure at all.
    assert!(!cache.path().join("c").exists());
}

#[cfg(unix)]
#[test]
fn symlink_named_after_a_tool_dispatches_to_that_tool() {
    use std::os::unix::fs::symlink;

    let cache = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    let link = bin.path().join("sh");
    symlink(env!("CARGO_BIN_EXE_buildcache"), &link).unwrap();

    // Invoking the symlink behaves as `buildcache sh ...`; the real sh is
    // found on the PATH with the symlink itself excluded.
    let output = Command::new(&link)
        .args(["-c", "echo via-symlink"])
        .env("BUILDCACHE_DIR", cache.path())
        .output()
        .unwrap();

    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "via-symlink\n");
}

#[test]
fn invalid_configuration_exits_with_one() {
    let cache = TempDir::new().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_buildcache"))
        .args(["--show-stats"])
        .env("BUILDCACHE_DIR", cache.path())
        .env("BUILDCACHE_MAX_CACHE_SIZE", "not-a-size")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(!String::from_utf8_lossy(&output.stderr).is_empty());
}
