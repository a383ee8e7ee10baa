use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::error::StorageError;

/// A boxed byte stream, used both for streamed reads and as the source of streamed writes.
pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;

/// Metadata about a stored file.
///
/// Built fresh on every `stat` call; backends never cache it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Logical path relative to the storage root, `/`-separated
    pub path: String,
    /// File size in bytes
    pub size: u64,
    /// Last modification time (Unix timestamp, seconds)
    pub modified_at: i64,
    /// MIME type, when the backend can tell
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Entity tag identifying this version of the content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Backend-specific extras (e.g. `mode` for the local backend)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Storage backend abstraction for vault files.
///
/// All paths are relative to the backend's storage root. Implementations must
/// never resolve a path outside of that root, and must never let a reader
/// observe a partially written file.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Returns the backend identifier (e.g., "local", "remote").
    fn backend_name(&self) -> &'static str;

    // =========================================================================
    // Whole-file Operations
    // =========================================================================

    /// Read a file's bytes. Fails with `NotFound` if it does not exist.
    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Replace a file's content atomically.
    async fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Delete a file. Fails with `NotFound` if it does not exist.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Check whether a file exists. A missing path is `Ok(false)`, not an error.
    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// List files under a prefix.
    ///
    /// A prefix ending in a separator lists the direct children of that directory.
    /// Any other prefix lists the files of its parent directory whose names start
    /// with the final segment. Subdirectories are never descended into.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Get file metadata. Fails with `NotFound` if it does not exist.
    async fn stat(&self, path: &str) -> Result<FileInfo, StorageError>;

    // =========================================================================
    // Streaming Operations
    // =========================================================================

    /// Open a file for streamed reading.
    async fn read_stream(&self, path: &str) -> Result<ByteReader, StorageError>;

    /// Replace a file's content from a stream, with the same atomicity as `write`.
    ///
    /// Returns the number of bytes written.
    async fn write_stream(&self, path: &str, reader: ByteReader) -> Result<u64, StorageError>;

    // =========================================================================
    // Composite Operations
    // =========================================================================

    /// Copy `src` to `dst`, replacing `dst` if it exists.
    async fn copy_file(&self, src: &str, dst: &str) -> Result<(), StorageError>;

    /// Move `src` to `dst`, replacing `dst` if it exists.
    async fn move_file(&self, src: &str, dst: &str) -> Result<(), StorageError>;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Verify the backend is usable.
    async fn health(&self) -> Result<(), StorageError>;

    /// Shut the backend down. Idempotent: closing twice is not an error.
    async fn close(&self) -> Result<(), StorageError>;
}
