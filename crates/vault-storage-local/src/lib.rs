//! Local filesystem storage backend for vaults.
//!
//! - [`LocalBackend`]: the [`StorageBackend`] implementation, with atomic writes
//! - [`LockManager`]: in-process reader/writer locks composed with advisory file locks
//! - [`PathResolver`]: confinement of logical paths to the storage root
//! - [`create_backend`]: configuration-driven construction behind `Arc<dyn StorageBackend>`

mod factory;
pub mod lock;
pub mod path;
mod storage;

pub use factory::create_backend;
pub use lock::{LockError, LockGuard, LockManager, LockMode};
pub use path::PathResolver;
pub use storage::LocalBackend;
pub use vault_storage_core::{
    validate_config, ConfigError, ErrorKind, FileInfo, LocalConfig, StorageBackend,
    StorageConfig, StorageError,
};
