//! Core traits and types for vault storage backends.
//!
//! This crate defines the abstractions shared between the local and remote storage implementations:
//! - `StorageBackend`: Read, write, list and metadata operations on vault-relative paths
//! - `StorageError`: Categorized failures carrying backend, operation and path context
//! - `StorageConfig`: Tagged backend configuration with side-effect free validation

mod config;
mod error;
mod storage;

pub use config::{
    parse_permissions, validate_config, ConfigError, LocalConfig, RemoteConfig, StorageConfig,
    DEFAULT_DIR_PERMS, DEFAULT_FILE_PERMS, DEFAULT_LOCK_TIMEOUT_SECS,
};
pub use error::{ErrorKind, StorageError};
pub use storage::{ByteReader, FileInfo, StorageBackend};
