//! Configuration loading and environment overrides.
//!
//! Effective configuration is built from three layers: built-in defaults,
//! an optional TOML file (`buildcache.conf` in the cache directory, or the
//! path named by `BUILDCACHE_CONF`), and `BUILDCACHE_*` environment
//! variables. Later layers win. Unknown file keys are warned about and
//! ignored.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Default cache size cap: 5 GiB.
const DEFAULT_MAX_CACHE_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Configuration errors are fatal at startup: print and exit 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("cannot determine a cache directory (set BUILDCACHE_DIR)")]
    NoCacheDir,
}

/// Trade-off between hit rate and fidelity of debug/coverage output.
///
/// The ordering matters: each level keeps everything the previous level
/// keeps. `Sloppy` drops line directives even for coverage builds,
/// `Default` preserves them when coverage output is requested, `Strict`
/// also preserves them for debug-info builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Accuracy {
    Sloppy,
    #[default]
    Default,
    Strict,
}

impl FromStr for Accuracy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "SLOPPY" => Ok(Accuracy::Sloppy),
            "DEFAULT" => Ok(Accuracy::Default),
            "STRICT" => Ok(Accuracy::Strict),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Accuracy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Accuracy::Sloppy => "SLOPPY",
            Accuracy::Default => "DEFAULT",
            Accuracy::Strict => "STRICT",
        };
        f.write_str(s)
    }
}

/// Effective configuration for one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Root directory of the local store.
    pub dir: PathBuf,
    /// Size cap for the local store, in bytes.
    pub max_cache_size: u64,
    /// Accuracy level.
    pub accuracy: Accuracy,
    /// Whether direct mode (manifest-based lookup) is enabled.
    pub direct_mode: bool,
    /// Kill switch: when set, every invocation is a passthrough.
    pub disabled: bool,
    /// Remote cache URL (`file://...`), if any.
    pub remote: Option<String>,
    /// Timeout for remote cache calls, in seconds. On expiry a call
    /// reports the remote as unavailable and the lookup goes cold.
    pub remote_timeout_secs: u64,
    /// Log level for diagnostic output (`error`..`trace`).
    pub debug: String,
    /// Whether artifacts may be materialized via hard links.
    pub hard_links: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            accuracy: Accuracy::Default,
            direct_mode: false,
            disabled: false,
            remote: None,
            remote_timeout_secs: 10,
            debug: "warn".to_string(),
            hard_links: true,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".buildcache");
    }
    if let Some(profile) = env::var_os("USERPROFILE") {
        return PathBuf::from(profile).join(".buildcache");
    }
    PathBuf::new()
}

/// Keys recognized in the config file.
const KNOWN_KEYS: &[&str] = &[
    "dir",
    "max_cache_size",
    "accuracy",
    "direct_mode",
    "disable",
    "remote",
    "remote_timeout",
    "debug",
    "hard_links",
];

impl Config {
    /// Load the effective configuration: defaults, then the config file,
    /// then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // The cache dir may itself be overridden before the file is
        // found, so apply BUILDCACHE_DIR first.
        if let Ok(dir) = env::var("BUILDCACHE_DIR") {
            config.dir = PathBuf::from(dir);
        }
        if config.dir.as_os_str().is_empty() {
            return Err(ConfigError::NoCacheDir);
        }

        let file_path = match env::var_os("BUILDCACHE_CONF") {
            Some(p) => PathBuf::from(p),
            None => config.dir.join("buildcache.conf"),
        };
        if file_path.is_file() {
            config.apply_file(&file_path)?;
        }

        config.apply_env()?;
        Ok(config)
    }

    /// Merge values from a TOML config file.
    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let table: toml::Table = text.parse().map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        for (key, value) in &table {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                warn!("ignoring unknown config key {key:?} in {}", path.display());
                continue;
            }
            self.apply_key(key, &toml_value_to_string(value))?;
        }
        Ok(())
    }

    /// Merge `BUILDCACHE_*` environment overrides.
    fn apply_env(&mut self) -> Result<(), ConfigError> {
        const ENV_KEYS: &[(&str, &str)] = &[
            ("BUILDCACHE_DIR", "dir"),
            ("BUILDCACHE_MAX_CACHE_SIZE", "max_cache_size"),
            ("BUILDCACHE_ACCURACY", "accuracy"),
            ("BUILDCACHE_DIRECT_MODE", "direct_mode"),
            ("BUILDCACHE_DISABLE", "disable"),
            ("BUILDCACHE_REMOTE", "remote"),
            ("BUILDCACHE_REMOTE_TIMEOUT", "remote_timeout"),
            ("BUILDCACHE_DEBUG", "debug"),
            ("BUILDCACHE_HARD_LINKS", "hard_links"),
        ];
        for (var, key) in ENV_KEYS {
            if let Ok(value) = env::var(var) {
                self.apply_key(key, &value)?;
            }
        }
        Ok(())
    }

    fn apply_key(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "dir" => self.dir = PathBuf::from(value),
            "max_cache_size" => self.max_cache_size = parse_size(value).ok_or_else(invalid)?,
            "accuracy" => self.accuracy = value.parse().map_err(|_| invalid())?,
            "direct_mode" => self.direct_mode = parse_bool(value).ok_or_else(invalid)?,
            "disable" => self.disabled = parse_bool(value).ok_or_else(invalid)?,
            "remote" => {
                self.remote = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "remote_timeout" => {
                self.remote_timeout_secs = value.trim().parse().map_err(|_| invalid())?
            }
            "debug" => self.debug = value.to_string(),
            "hard_links" => self.hard_links = parse_bool(value).ok_or_else(invalid)?,
            _ => {}
        }
        Ok(())
    }

    /// Dump the effective configuration as pretty JSON (for `--get-config`).
    pub fn dump(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

fn toml_value_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse a boolean from the usual spellings.
fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" | "" => Some(false),
        _ => None,
    }
}

/// Parse a byte size with an optional `K`/`M`/`G`/`T` suffix.
fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (number, multiplier) = match s.chars().last()? {
        'k' | 'K' => (&s[..s.len() - 1], 1024u64),
        'm' | 'M' => (&s[..s.len() - 1], 1024 * 1024),
        'g' | 'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        't' | 'T' => (&s[..s.len() - 1], 1024u64 * 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value: u64 = number.trim().parse().ok()?;
    value.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_plain_and_suffixed() {
        assert_eq!(parse_size("1024"), Some(1024));
        assert_eq!(parse_size("4K"), Some(4096));
        assert_eq!(parse_size("2M"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("bogus"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn parse_bool_spellings() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("false"), Some(false));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn accuracy_ordering_forms_a_ladder() {
        assert!(Accuracy::Sloppy < Accuracy::Default);
        assert!(Accuracy::Default < Accuracy::Strict);
    }

    #[test]
    fn accuracy_parses_case_insensitively() {
        assert_eq!("strict".parse::<Accuracy>(), Ok(Accuracy::Strict));
        assert_eq!("Sloppy".parse::<Accuracy>(), Ok(Accuracy::Sloppy));
        assert!("fast".parse::<Accuracy>().is_err());
    }

    #[test]
    fn file_values_apply_and_unknown_keys_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("buildcache.conf");
        fs::write(
            &conf,
            "max_cache_size = \"2G\"\naccuracy = \"STRICT\"\nmystery_key = 1\n",
        )
        .unwrap();

        let mut config = Config::default();
        config.apply_file(&conf).unwrap();

        assert_eq!(config.max_cache_size, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.accuracy, Accuracy::Strict);
    }

    #[test]
    fn invalid_file_value_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("buildcache.conf");
        fs::write(&conf, "direct_mode = \"sometimes\"\n").unwrap();

        let mut config = Config::default();
        let err = config.apply_file(&conf).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn dump_is_valid_json() {
        let config = Config::default();
        let dumped = config.dump();
        let parsed: serde_json::Value = serde_json::from_str(&dumped).unwrap();
        assert!(parsed.get("max_cache_size").is_some());
    }
}
