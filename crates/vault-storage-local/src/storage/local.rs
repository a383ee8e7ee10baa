use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vault_storage_core::{
    parse_permissions, ByteReader, ConfigError, ErrorKind, FileInfo, LocalConfig,
    StorageBackend, StorageError,
};

use crate::lock::{LockError, LockGuard, LockManager, LockMode};
use crate::path::PathResolver;

const BACKEND: &str = "local";

/// State shared by every handle onto one backend.
#[derive(Debug)]
struct Shared {
    config: LocalConfig,
    resolver: PathResolver,
    locks: LockManager,
    dir_mode: u32,
    file_mode: u32,
    closed: RwLock<bool>,
}

/// Local filesystem storage backend.
///
/// Every logical path is confined to the configured root by [`PathResolver`].
/// Writes go to a uniquely named sibling temp file which is renamed over the
/// target, so readers see either the old or the new content, never a mix:
/// ```text
/// {root}/
///   notes/
///     a.md
///     a.md.3f2b...e1.tmp   (only while a write is in flight)
/// ```
/// With locking enabled, reads take a shared lock and writes, deletes and moves an
/// exclusive one, both in-process and as an advisory lock on the file itself.
///
/// The advisory lock needs a file to lock, so a write to a new path first creates
/// it empty. Until the rename lands, the unlocked `exists`, `stat` and `list` see
/// that empty placeholder; a failed write removes it, but a crash in that window
/// leaves an empty file at the target.
///
/// Cloning is cheap and yields a handle onto the same backend.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl LocalBackend {
    /// Open a backend rooted at `config.path`.
    ///
    /// Validates the permission strings, creates the root when `create_dirs` is
    /// set, and fails unless the root passes a health check.
    pub async fn new(config: LocalConfig) -> Result<Self, StorageError> {
        let invalid = |e: ConfigError| {
            StorageError::new(BACKEND, "open", "", ErrorKind::InvalidConfig).with_source(e)
        };
        if config.path.as_os_str().is_empty() {
            return Err(invalid(ConfigError::MissingField("path")));
        }
        let dir_mode = parse_permissions("dir_perms", &config.dir_perms).map_err(invalid)?;
        let file_mode = parse_permissions("file_perms", &config.file_perms).map_err(invalid)?;

        let resolver = PathResolver::new(&config.path).map_err(|e| {
            StorageError::new(BACKEND, "open", "", ErrorKind::InvalidConfig).with_source(e)
        })?;

        if config.create_dirs {
            create_dirs(resolver.root(), dir_mode)
                .await
                .map_err(|e| StorageError::new(BACKEND, "open", "", ErrorKind::Io).with_source(e))?;
        }

        let locks = LockManager::new(config.effective_lock_timeout());
        let backend = Self {
            shared: Arc::new(Shared {
                config,
                resolver,
                locks,
                dir_mode,
                file_mode,
                closed: RwLock::new(false),
            }),
            cancel: CancellationToken::new(),
        };

        backend.check_root("open").await?;

        info!(
            "Opened local storage at {} (locking: {}, lock timeout: {:?})",
            backend.root().display(),
            backend.shared.config.enable_locking,
            backend.shared.locks.timeout()
        );
        Ok(backend)
    }

    /// Get a handle onto this backend whose lock waits abort when `token` is cancelled.
    ///
    /// The handle shares the lock table, the closed flag and the configuration.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            cancel: token,
        }
    }

    /// The absolute storage root.
    pub fn root(&self) -> &Path {
        self.shared.resolver.root()
    }

    pub fn config(&self) -> &LocalConfig {
        &self.shared.config
    }

    /// Fail fast once the backend has been closed.
    async fn ensure_open(&self, op: &'static str, path: &str) -> Result<(), StorageError> {
        if *self.shared.closed.read().await {
            return Err(StorageError::new(BACKEND, op, path, ErrorKind::Closed));
        }
        Ok(())
    }

    /// Resolve a path that must name a file, not the root itself.
    fn file_path(&self, op: &'static str, path: &str) -> Result<(String, PathBuf), StorageError> {
        let logical = PathResolver::logical(path);
        if logical.is_empty() {
            return Err(StorageError::new(BACKEND, op, path, ErrorKind::InvalidPath)
                .with_source(io::Error::other("path names the storage root")));
        }
        let resolved = self.shared.resolver.resolve(&logical);
        Ok((logical, resolved))
    }

    /// Take a lock on `resolved` if locking is enabled.
    async fn lock(
        &self,
        op: &'static str,
        logical: &str,
        resolved: &Path,
        mode: LockMode,
    ) -> Result<Option<LockGuard>, StorageError> {
        if !self.shared.config.enable_locking {
            return Ok(None);
        }
        match self.shared.locks.acquire(resolved, mode, &self.cancel).await {
            Ok(guard) => Ok(Some(guard)),
            Err(e) => {
                let kind = match &e {
                    LockError::Timeout(_) => ErrorKind::LockTimeout,
                    LockError::Cancelled => ErrorKind::Cancelled,
                    LockError::NotFound(_) => ErrorKind::NotFound,
                    LockError::Io(_) => ErrorKind::Io,
                };
                Err(StorageError::new(BACKEND, op, logical, kind).with_source(e))
            }
        }
    }

    /// Create the parent directory of `resolved` when configured to.
    async fn ensure_parent(
        &self,
        op: &'static str,
        logical: &str,
        resolved: &Path,
    ) -> Result<(), StorageError> {
        if !self.shared.config.create_dirs {
            return Ok(());
        }
        match resolved.parent() {
            Some(parent) => create_dirs(parent, self.shared.dir_mode)
                .await
                .map_err(|e| StorageError::new(BACKEND, op, logical, ErrorKind::Io).with_source(e)),
            None => Ok(()),
        }
    }

    /// Remove the empty file a failed exclusive operation's lock left behind.
    async fn discard_placeholder(&self, guard: &Option<LockGuard>, resolved: &Path) {
        if guard.as_ref().is_some_and(LockGuard::created) {
            remove_quietly(resolved).await;
        }
    }

    /// Atomically replace `path` with everything `reader` yields.
    async fn store<R>(&self, op: &'static str, path: &str, reader: R) -> Result<u64, StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.ensure_open(op, path).await?;
        let (logical, resolved) = self.file_path(op, path)?;
        self.ensure_parent(op, &logical, &resolved).await?;
        let guard = self
            .lock(op, &logical, &resolved, LockMode::Exclusive { create: true })
            .await?;

        let temp = temp_path(&resolved);
        let result = match self.write_temp(op, &logical, &temp, reader).await {
            Ok(written) => fs::rename(&temp, &resolved).await.map(|_| written).map_err(|e| {
                StorageError::new(BACKEND, op, &logical, ErrorKind::Io).with_source(e)
            }),
            Err(e) => Err(e),
        };

        match result {
            Ok(written) => {
                debug!("Wrote {} ({} bytes)", logical, written);
                Ok(written)
            }
            Err(e) => {
                remove_quietly(&temp).await;
                self.discard_placeholder(&guard, &resolved).await;
                Err(e)
            }
        }
    }

    /// Write the full payload to a fresh temp file with the configured mode, and sync it.
    async fn write_temp<R>(
        &self,
        op: &'static str,
        logical: &str,
        temp: &Path,
        mut reader: R,
    ) -> Result<u64, StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let io_err =
            |e: io::Error| StorageError::new(BACKEND, op, logical, ErrorKind::Io).with_source(e);

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(self.shared.file_mode);
        let mut file = options.open(temp).await.map_err(io_err)?;

        let written = match self.shared.config.size_limit() {
            Some(limit) => {
                let mut limited = (&mut reader).take(limit + 1);
                let written = tokio::io::copy(&mut limited, &mut file)
                    .await
                    .map_err(io_err)?;
                if written > limit {
                    return Err(too_large(op, logical, limit));
                }
                written
            }
            None => tokio::io::copy(&mut reader, &mut file)
                .await
                .map_err(io_err)?,
        };

        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        Ok(written)
    }

    /// Verify the root exists, is a directory, and accepts a probe file.
    async fn check_root(&self, op: &'static str) -> Result<(), StorageError> {
        let root = self.root();
        let metadata = fs::metadata(root)
            .await
            .map_err(|e| StorageError::from_io(BACKEND, op, "", e))?;
        if !metadata.is_dir() {
            return Err(StorageError::new(BACKEND, op, "", ErrorKind::Io).with_source(
                io::Error::other(format!("{} is not a directory", root.display())),
            ));
        }

        let probe = root.join(format!(".health.{}.tmp", Uuid::new_v4().simple()));
        let result = fs::write(&probe, b"ok").await;
        remove_quietly(&probe).await;
        result.map_err(|e| StorageError::new(BACKEND, op, "", ErrorKind::Io).with_source(e))
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    // =========================================================================
    // Whole-file Operations
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.ensure_open("read", path).await?;
        let (logical, resolved) = self.file_path("read", path)?;
        let _guard = self.lock("read", &logical, &resolved, LockMode::Shared).await?;

        let data = fs::read(&resolved)
            .await
            .map_err(|e| StorageError::from_io(BACKEND, "read", &logical, e))?;
        debug!("Read {} ({} bytes)", logical, data.len());
        Ok(data)
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        self.ensure_open("write", path).await?;
        if let Some(limit) = self.shared.config.size_limit() {
            if data.len() as u64 > limit {
                return Err(too_large("write", &PathResolver::logical(path), limit));
            }
        }
        self.store("write", path, data).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.ensure_open("delete", path).await?;
        let (logical, resolved) = self.file_path("delete", path)?;
        let _guard = self
            .lock("delete", &logical, &resolved, LockMode::Exclusive { create: false })
            .await?;

        fs::remove_file(&resolved)
            .await
            .map_err(|e| StorageError::from_io(BACKEND, "delete", &logical, e))?;
        debug!("Deleted {}", logical);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        self.ensure_open("exists", path).await?;
        let (logical, resolved) = self.file_path("exists", path)?;
        fs::try_exists(&resolved)
            .await
            .map_err(|e| StorageError::new(BACKEND, "exists", &logical, ErrorKind::Io).with_source(e))
    }

    #[instrument(skip(self), level = "debug")]
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.ensure_open("list", prefix).await?;
        let target = self.shared.resolver.list_target(prefix);

        let mut entries = match fs::read_dir(&target.dir).await {
            Ok(entries) => entries,
            Err(e)
                if e.kind() == io::ErrorKind::NotFound
                    || e.kind() == io::ErrorKind::NotADirectory =>
            {
                return Ok(vec![]);
            }
            Err(e) => {
                return Err(
                    StorageError::new(BACKEND, "list", prefix, ErrorKind::Io).with_source(e)
                );
            }
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            StorageError::new(BACKEND, "list", prefix, ErrorKind::Io).with_source(e)
        })? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(target.name_prefix.as_str()) || is_temp_name(&name) {
                continue;
            }
            let file_type = entry.file_type().await.map_err(|e| {
                StorageError::new(BACKEND, "list", prefix, ErrorKind::Io).with_source(e)
            })?;
            if file_type.is_dir() {
                continue;
            }
            if let Some(relative) = self.shared.resolver.relative(&entry.path()) {
                paths.push(relative);
            }
        }

        paths.sort();
        debug!("Listed {} entries for prefix {:?}", paths.len(), prefix);
        Ok(paths)
    }

    #[instrument(skip(self), level = "debug")]
    async fn stat(&self, path: &str) -> Result<FileInfo, StorageError> {
        self.ensure_open("stat", path).await?;
        let (logical, resolved) = self.file_path("stat", path)?;

        let metadata = fs::metadata(&resolved)
            .await
            .map_err(|e| StorageError::from_io(BACKEND, "stat", &logical, e))?;
        let modified: Option<DateTime<Utc>> = metadata.modified().ok().map(DateTime::from);

        Ok(FileInfo {
            content_type: content_type_for(&logical).map(str::to_string),
            etag: Some(etag(&metadata, modified)),
            metadata: extra_metadata(&metadata),
            path: logical,
            size: metadata.len(),
            modified_at: modified.map(|t| t.timestamp()).unwrap_or_default(),
        })
    }

    // =========================================================================
    // Streaming Operations
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    async fn read_stream(&self, path: &str) -> Result<ByteReader, StorageError> {
        self.ensure_open("read_stream", path).await?;
        let (logical, resolved) = self.file_path("read_stream", path)?;
        let guard = self
            .lock("read_stream", &logical, &resolved, LockMode::Shared)
            .await?;

        let file = fs::File::open(&resolved)
            .await
            .map_err(|e| StorageError::from_io(BACKEND, "read_stream", &logical, e))?;
        debug!("Opened {} for streaming", logical);
        Ok(Box::pin(LockedReader {
            file,
            _guard: guard,
        }))
    }

    #[instrument(skip(self, reader), level = "debug")]
    async fn write_stream(&self, path: &str, reader: ByteReader) -> Result<u64, StorageError> {
        self.store("write_stream", path, reader).await
    }

    // =========================================================================
    // Composite Operations
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    async fn copy_file(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        // Sequential, so no lock is held while waiting on another.
        let data = self.read(src).await?;
        self.write(dst, &data).await?;
        debug!("Copied {} -> {}", src, dst);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn move_file(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        const OP: &str = "move";
        self.ensure_open(OP, src).await?;
        let (src_logical, src_path) = self.file_path(OP, src)?;
        let (dst_logical, dst_path) = self.file_path(OP, dst)?;

        if src_path == dst_path {
            return match fs::try_exists(&src_path).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(StorageError::new(BACKEND, OP, &src_logical, ErrorKind::NotFound)),
                Err(e) => {
                    Err(StorageError::new(BACKEND, OP, &src_logical, ErrorKind::Io).with_source(e))
                }
            };
        }

        self.ensure_parent(OP, &dst_logical, &dst_path).await?;

        // Fixed order on the resolved paths keeps two crossing moves from deadlocking.
        let src_mode = LockMode::Exclusive { create: false };
        let dst_mode = LockMode::Exclusive { create: true };
        let (_src_guard, dst_guard) = if src_path < dst_path {
            let s = self.lock(OP, &src_logical, &src_path, src_mode).await?;
            let d = self.lock(OP, &dst_logical, &dst_path, dst_mode).await?;
            (s, d)
        } else {
            let d = self.lock(OP, &dst_logical, &dst_path, dst_mode).await?;
            let s = match self.lock(OP, &src_logical, &src_path, src_mode).await {
                Ok(s) => s,
                Err(e) => {
                    self.discard_placeholder(&d, &dst_path).await;
                    return Err(e);
                }
            };
            (s, d)
        };

        if let Err(e) = fs::rename(&src_path, &dst_path).await {
            self.discard_placeholder(&dst_guard, &dst_path).await;
            return Err(StorageError::from_io(BACKEND, OP, &src_logical, e));
        }

        debug!("Moved {} -> {}", src_logical, dst_logical);
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    async fn health(&self) -> Result<(), StorageError> {
        self.ensure_open("health", "").await?;
        self.check_root("health").await
    }

    #[instrument(skip(self), level = "debug")]
    async fn close(&self) -> Result<(), StorageError> {
        let mut closed = self.shared.closed.write().await;
        if *closed {
            return Ok(());
        }
        *closed = true;

        let released = self.shared.locks.tracked_paths();
        self.shared.locks.clear();
        info!(
            "Closed local storage at {} ({} lock entries released)",
            self.root().display(),
            released
        );
        Ok(())
    }
}

/// A file opened for streaming that keeps its shared lock until dropped.
///
/// Field order matters: the file closes before the lock is released.
struct LockedReader {
    file: fs::File,
    _guard: Option<LockGuard>,
}

impl AsyncRead for LockedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

async fn create_dirs(dir: &Path, mode: u32) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(dir).await
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

/// Unique sibling of `target` for an in-flight write: `{name}.{uuid}.tmp`.
fn temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{}.{}.tmp", name, Uuid::new_v4().simple()))
}

fn is_temp_name(name: &str) -> bool {
    name.strip_suffix(".tmp")
        .and_then(|stem| stem.rsplit_once('.'))
        .is_some_and(|(_, id)| id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit()))
}

fn too_large(op: &'static str, logical: &str, limit: u64) -> StorageError {
    StorageError::new(BACKEND, op, logical, ErrorKind::TooLarge).with_source(io::Error::other(
        format!("payload exceeds the {} byte limit", limit),
    ))
}

fn content_type_for(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    let content_type = match ext.as_str() {
        "md" | "markdown" => "text/markdown",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "toml" => "application/toml",
        "yaml" | "yml" => "application/yaml",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        _ => return None,
    };
    Some(content_type)
}

/// Opaque version tag derived from size, modification time and inode.
fn etag(metadata: &std::fs::Metadata, modified: Option<DateTime<Utc>>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(metadata.len().to_le_bytes());
    if let Some(nanos) = modified.and_then(|t| t.timestamp_nanos_opt()) {
        hasher.update(nanos.to_le_bytes());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        hasher.update(metadata.ino().to_le_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(unix)]
fn extra_metadata(metadata: &std::fs::Metadata) -> Option<BTreeMap<String, String>> {
    use std::os::unix::fs::PermissionsExt;
    let mode = metadata.permissions().mode() & 0o7777;
    Some(BTreeMap::from([("mode".to_string(), format!("{:04o}", mode))]))
}

#[cfg(not(unix))]
fn extra_metadata(_metadata: &std::fs::Metadata) -> Option<BTreeMap<String, String>> {
    None
}
