use std::sync::Arc;

use tracing::info;
use vault_storage_core::{validate_config, ConfigError, StorageBackend, StorageConfig};

use crate::storage::LocalBackend;

/// Validate `config` and construct the backend it selects.
///
/// Validation failures and construction failures (missing or unwritable root)
/// are both reported as [`ConfigError`], never as runtime storage errors.
pub async fn create_backend(config: StorageConfig) -> Result<Arc<dyn StorageBackend>, ConfigError> {
    validate_config(&config)?;
    info!("Creating {} storage backend", config.backend_type());

    match config {
        StorageConfig::Local(local) => {
            let backend = LocalBackend::new(local).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::Remote(remote) => Err(ConfigError::Unsupported(format!(
            "remote backend (bucket {:?}) is not built into this crate",
            remote.bucket
        ))),
    }
}
