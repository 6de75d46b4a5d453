//! Configuration module for OneMount.
//!
//! Typed configuration mapping the YAML configuration file (camelCase keys),
//! with loading, validation, defaults, and the directory conventions for
//! per-mount cache state.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Application directory name under config-home and cache-home.
pub const APP_NAME: &str = "onemount";

/// Valid values for the `log` key.
pub const VALID_LOG_LEVELS: &[&str] = &["fatal", "error", "warn", "info", "debug", "trace"];

/// Top-level configuration for OneMount.
///
/// Command-line options override file values; see the CLI crate for the
/// merge order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Cache directory root. Per-mount state lives in a subdirectory named
    /// after the escaped absolute mountpoint.
    pub cache_dir: PathBuf,
    /// Log level: `fatal`, `error`, `warn`, `info`, `debug`, or `trace`.
    pub log: String,
    /// Log output: `STDOUT`, `STDERR`, or a file path.
    pub log_output: String,
    /// Walk the full remote tree in the background after mount.
    pub sync_tree: bool,
    /// Seconds between delta polls when no push channel is configured.
    pub delta_interval: u64,
    /// Days a cached blob may go unused before eviction.
    pub cache_expiration: u64,
    /// Seconds between cache cleanup sweeps.
    pub cache_cleanup_interval: u64,
    /// Maximum cache size in MiB; 0 disables the bound.
    pub max_cache_size: u64,
    /// Seconds to wait for the mount to come up before failing.
    pub mount_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("~/.cache"))
                .join(APP_NAME),
            log: "info".to_string(),
            log_output: "STDERR".to_string(),
            sync_tree: false,
            delta_interval: 300,
            cache_expiration: 30,
            cache_cleanup_interval: 3600,
            max_cache_size: 0,
            mount_timeout: 60,
        }
    }
}

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Offending key, e.g. `"deltaInterval"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file,
    /// typically `$XDG_CONFIG_HOME/onemount/config.yml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join(APP_NAME)
            .join("config.yml")
    }

    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !VALID_LOG_LEVELS.contains(&self.log.as_str()) {
            errors.push(ValidationError {
                field: "log".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.log,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        if self.delta_interval == 0 {
            errors.push(ValidationError {
                field: "deltaInterval".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.cache_expiration == 0 {
            errors.push(ValidationError {
                field: "cacheExpiration".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.cache_cleanup_interval == 0 {
            errors.push(ValidationError {
                field: "cacheCleanupInterval".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.mount_timeout == 0 {
            errors.push(ValidationError {
                field: "mountTimeout".into(),
                message: "must be greater than 0".into(),
            });
        }

        errors
    }

    /// Per-mount cache directory: `<cacheDir>/<escaped-absmount>/`.
    ///
    /// Contains `auth_tokens.json`, the metadata database file, and the
    /// `content/` blob subdirectory.
    pub fn mount_cache_dir(&self, mountpoint: &Path) -> PathBuf {
        self.cache_dir.join(escape_mountpoint(mountpoint))
    }

    /// Path of the auth token file for a mount.
    pub fn auth_tokens_path(&self, mountpoint: &Path) -> PathBuf {
        self.mount_cache_dir(mountpoint).join("auth_tokens.json")
    }

    /// Path of the metadata database for a mount.
    pub fn database_path(&self, mountpoint: &Path) -> PathBuf {
        self.mount_cache_dir(mountpoint).join("onemount.db")
    }
}

/// Escapes an absolute mountpoint into a single path component by replacing
/// separators, mirroring how one cache root serves many mounts.
pub fn escape_mountpoint(mountpoint: &Path) -> String {
    let s = mountpoint.to_string_lossy();
    let trimmed = s.trim_matches('/');
    if trimmed.is_empty() {
        "-".to_string()
    } else {
        trimmed.replace('/', "-")
    }
}
