use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::StorageError;

pub const DEFAULT_DIR_PERMS: &str = "0755";
pub const DEFAULT_FILE_PERMS: &str = "0644";
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 10;

/// Errors raised while validating a configuration or constructing a backend from it.
///
/// These are kept apart from runtime [`StorageError`]s: they are fatal to startup
/// and never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid permissions for `{field}`: {value:?} is not an octal mode")]
    InvalidPermissions { field: &'static str, value: String },

    #[error("unsupported backend: {0}")]
    Unsupported(String),

    #[error("backend construction failed: {0}")]
    Backend(#[from] StorageError),
}

/// Storage configuration, tagged by backend type.
///
/// Deserializes from e.g. `{ "type": "local", "path": "/home/me/vault" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Local(LocalConfig),
    Remote(RemoteConfig),
}

impl StorageConfig {
    pub fn backend_type(&self) -> &'static str {
        match self {
            StorageConfig::Local(_) => "local",
            StorageConfig::Remote(_) => "remote",
        }
    }
}

/// Configuration for the local filesystem backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Storage root; every logical path resolves beneath it
    pub path: PathBuf,
    /// Create the root and missing parent directories on demand
    #[serde(default = "default_true")]
    pub create_dirs: bool,
    /// Octal mode for created directories
    #[serde(default = "default_dir_perms")]
    pub dir_perms: String,
    /// Octal mode for written files
    #[serde(default = "default_file_perms")]
    pub file_perms: String,
    /// Guard reads and writes with in-process and advisory file locks
    #[serde(default = "default_true")]
    pub enable_locking: bool,
    /// Lock acquisition timeout in seconds (0 = default)
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: u64,
    /// Largest accepted payload in bytes (0 = unlimited)
    #[serde(default)]
    pub max_file_size: u64,
}

fn default_true() -> bool {
    true
}

fn default_dir_perms() -> String {
    DEFAULT_DIR_PERMS.to_string()
}

fn default_file_perms() -> String {
    DEFAULT_FILE_PERMS.to_string()
}

fn default_lock_timeout() -> u64 {
    DEFAULT_LOCK_TIMEOUT_SECS
}

impl LocalConfig {
    /// Create a configuration rooted at `path` with every other field at its default.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            create_dirs: true,
            dir_perms: default_dir_perms(),
            file_perms: default_file_perms(),
            enable_locking: true,
            lock_timeout: DEFAULT_LOCK_TIMEOUT_SECS,
            max_file_size: 0,
        }
    }

    /// Get the effective lock timeout, applying the default when unset.
    pub fn effective_lock_timeout(&self) -> Duration {
        match self.lock_timeout {
            0 => Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            secs => Duration::from_secs(secs),
        }
    }

    /// Get the payload ceiling, if any.
    pub fn size_limit(&self) -> Option<u64> {
        (self.max_file_size > 0).then_some(self.max_file_size)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("path"));
        }
        parse_permissions("dir_perms", &self.dir_perms)?;
        parse_permissions("file_perms", &self.file_perms)?;
        Ok(())
    }
}

/// Configuration for a remote object-storage backend.
///
/// Only validated here; the backend itself lives outside this workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub bucket: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
}

impl RemoteConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket.trim().is_empty() {
            return Err(ConfigError::MissingField("bucket"));
        }
        Ok(())
    }
}

/// Parse an octal permission string such as `"0755"` or `"644"`.
pub fn parse_permissions(field: &'static str, value: &str) -> Result<u32, ConfigError> {
    let invalid = || ConfigError::InvalidPermissions {
        field,
        value: value.to_string(),
    };
    let digits = value.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);
    if digits.is_empty() || !digits.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        return Err(invalid());
    }
    let mode = u32::from_str_radix(digits, 8).map_err(|_| invalid())?;
    if mode > 0o7777 {
        return Err(invalid());
    }
    Ok(mode)
}

/// Validate a configuration without touching the filesystem.
pub fn validate_config(config: &StorageConfig) -> Result<(), ConfigError> {
    match config {
        StorageConfig::Local(local) => local.validate(),
        StorageConfig::Remote(remote) => remote.validate(),
    }
}
