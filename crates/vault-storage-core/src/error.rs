use std::error::Error as StdError;

use thiserror::Error;

/// Failure categories surfaced by storage backends.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("not found")]
    NotFound,

    #[error("I/O error")]
    Io,

    #[error("lock timeout")]
    LockTimeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("backend is closed")]
    Closed,

    #[error("invalid configuration")]
    InvalidConfig,

    #[error("payload too large")]
    TooLarge,

    #[error("invalid path")]
    InvalidPath,
}

impl ErrorKind {
    /// Whether an operation failing with this kind may succeed if simply retried.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Io | ErrorKind::LockTimeout)
    }
}

/// Errors that can occur in the storage layer.
///
/// Every error names the backend, the operation and the logical (vault-relative)
/// path it concerns. The underlying cause, if any, is available through
/// [`std::error::Error::source`].
#[derive(Error, Debug)]
#[error("{backend}: {op} {path:?}: {kind}{}", detail(.source))]
pub struct StorageError {
    backend: &'static str,
    op: &'static str,
    path: String,
    kind: ErrorKind,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

fn detail(source: &Option<Box<dyn StdError + Send + Sync>>) -> String {
    match source {
        Some(e) => format!(": {}", e),
        None => String::new(),
    }
}

impl StorageError {
    pub fn new(
        backend: &'static str,
        op: &'static str,
        path: impl Into<String>,
        kind: ErrorKind,
    ) -> Self {
        Self {
            backend,
            op,
            path: path.into(),
            kind,
            source: None,
        }
    }

    /// Attach the underlying cause.
    pub fn with_source(mut self, source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Build an error from an I/O failure, mapping `NotFound` to [`ErrorKind::NotFound`]
    /// and everything else to [`ErrorKind::Io`].
    pub fn from_io(
        backend: &'static str,
        op: &'static str,
        path: impl Into<String>,
        err: std::io::Error,
    ) -> Self {
        let kind = if err.kind() == std::io::ErrorKind::NotFound {
            ErrorKind::NotFound
        } else {
            ErrorKind::Io
        };
        Self::new(backend, op, path, kind).with_source(err)
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    pub fn op(&self) -> &'static str {
        self.op
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Io.is_retryable());
        assert!(ErrorKind::LockTimeout.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::Closed.is_retryable());
        assert!(!ErrorKind::InvalidConfig.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_from_io_maps_not_found() {
        let err = StorageError::from_io(
            "local",
            "read",
            "notes/a.md",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.is_not_found());
        assert!(!err.is_retryable());

        let err = StorageError::from_io(
            "local",
            "write",
            "notes/a.md",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_display_carries_context() {
        let err = StorageError::new("local", "write", "notes/a.md", ErrorKind::Io)
            .with_source(std::io::Error::other("disk full"));
        let msg = err.to_string();
        assert!(msg.contains("local"));
        assert!(msg.contains("write"));
        assert!(msg.contains("notes/a.md"));
        assert!(msg.contains("disk full"));
        assert!(err.source().is_some());

        let err = StorageError::new("local", "read", "x", ErrorKind::Closed);
        assert!(err.source().is_none());
        assert_eq!(err.backend(), "local");
        assert_eq!(err.op(), "read");
        assert_eq!(err.path(), "x");
    }
}
