use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fs2::FileExt;
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// How often a contended advisory lock is retried.
const ADVISORY_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Deadline used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Lock modes. Shared locks admit other shared holders; exclusive locks admit nobody.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    /// `create` makes the lock target if it does not exist yet (writes);
    /// without it a missing target is `NotFound` (deletes, move sources).
    Exclusive { create: bool },
}

impl LockMode {
    fn is_exclusive(self) -> bool {
        matches!(self, LockMode::Exclusive { .. })
    }
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("timed out after {0:?} waiting for lock")]
    Timeout(Duration),

    #[error("lock acquisition cancelled")]
    Cancelled,

    #[error("lock target does not exist")]
    NotFound(#[source] io::Error),

    #[error("failed to lock: {0}")]
    Io(#[from] io::Error),
}

/// Two-layer lock manager keyed by resolved path.
///
/// - In-process: one `tokio::sync::RwLock` per path, created on first use and
///   kept until [`LockManager::clear`]. Serializes tasks of this process.
/// - Cross-process: an `fs2` advisory lock on the target file itself (flock on
///   Unix, LockFileEx on Windows). Serializes separate processes sharing the vault.
///
/// Both layers are acquired under a single deadline. The manager is owned by one
/// backend instance; nothing here is process-global.
#[derive(Debug)]
pub struct LockManager {
    entries: DashMap<PathBuf, Arc<RwLock<()>>>,
    timeout: Duration,
}

// Held only for its drop.
#[allow(dead_code)]
enum InProcessGuard {
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

/// A held lock on one path.
///
/// Dropping the guard releases the advisory lock, closes the file handle, then
/// releases the in-process lock, in that order, exactly once.
pub struct LockGuard {
    path: PathBuf,
    mode: LockMode,
    file: Option<File>,
    created: bool,
    _in_process: InProcessGuard,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Whether acquiring this lock created an empty placeholder at the target path.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Release the lock now rather than at end of scope.
    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!("Failed to unlock {}: {}", self.path.display(), e);
            }
            drop(file);
        }
        debug!("Released {:?} lock on {}", self.mode, self.path.display());
    }
}

impl LockManager {
    /// Create a new LockManager whose acquisitions give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of paths with in-process lock state.
    pub fn tracked_paths(&self) -> usize {
        self.entries.len()
    }

    /// Drop all in-process lock state.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// When an acquisition starting now gives up.
    fn deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.timeout).unwrap_or_else(|| now + FAR_FUTURE)
    }

    /// Get or lazily create the in-process lock for a path.
    fn entry(&self, path: &Path) -> Arc<RwLock<()>> {
        let existing = self.entries.get(path).map(|e| Arc::clone(e.value()));
        match existing {
            Some(lock) => lock,
            None => Arc::clone(
                self.entries
                    .entry(path.to_path_buf())
                    .or_insert_with(|| Arc::new(RwLock::new(())))
                    .value(),
            ),
        }
    }

    /// Acquire both lock layers on `path`.
    ///
    /// The in-process lock is awaited first, then the advisory lock is polled,
    /// both against the same deadline. Whatever was acquired is released again
    /// on timeout, cancellation or error.
    #[instrument(skip(self, path, cancel), level = "debug", fields(path = %path.display()))]
    pub async fn acquire(
        &self,
        path: &Path,
        mode: LockMode,
        cancel: &CancellationToken,
    ) -> Result<LockGuard, LockError> {
        let deadline = self.deadline();
        let lock = self.entry(path);

        let in_process = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LockError::Cancelled),
            guard = lock_in_process(lock, mode) => guard,
            _ = tokio::time::sleep_until(deadline) => {
                debug!("In-process lock on {} timed out", path.display());
                return Err(LockError::Timeout(self.timeout));
            }
        };

        let (file, created) = open_target(path, mode)?;

        loop {
            match try_lock(&file, mode) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(LockError::Io(e)),
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("Advisory lock on {} held by another process", path.display());
                return Err(LockError::Timeout(self.timeout));
            }
            let wait = ADVISORY_POLL_INTERVAL.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LockError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        debug!("Acquired {:?} lock on {}", mode, path.display());
        Ok(LockGuard {
            path: path.to_path_buf(),
            mode,
            file: Some(file),
            created,
            _in_process: in_process,
        })
    }
}

async fn lock_in_process(lock: Arc<RwLock<()>>, mode: LockMode) -> InProcessGuard {
    if mode.is_exclusive() {
        InProcessGuard::Write(lock.write_owned().await)
    } else {
        InProcessGuard::Read(lock.read_owned().await)
    }
}

/// Open the file the advisory lock is taken on.
///
/// Returns the handle and whether it had to be created.
fn open_target(path: &Path, mode: LockMode) -> Result<(File, bool), LockError> {
    let not_found = |e: io::Error| {
        if e.kind() == io::ErrorKind::NotFound {
            LockError::NotFound(e)
        } else {
            LockError::Io(e)
        }
    };

    match OpenOptions::new().read(true).open(path) {
        Ok(file) => Ok((file, false)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => match mode {
            LockMode::Exclusive { create: true } => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)
                    .map_err(not_found)?;
                Ok((file, true))
            }
            _ => Err(LockError::NotFound(e)),
        },
        Err(e) => Err(not_found(e)),
    }
}

fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
    if mode.is_exclusive() {
        FileExt::try_lock_exclusive(file)
    } else {
        FileExt::try_lock_shared(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const WRITE: LockMode = LockMode::Exclusive { create: true };

    fn setup(timeout: Duration) -> (LockManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        (LockManager::new(timeout), temp_dir)
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let (lock_mgr, temp) = setup(Duration::from_secs(5));
        let path = temp.path().join("a.md");
        let cancel = CancellationToken::new();

        let guard = lock_mgr.acquire(&path, WRITE, &cancel).await.unwrap();
        assert!(guard.created());
        assert!(path.exists());
        assert_eq!(guard.path(), path.as_path());
        guard.release();

        // Re-acquire after release
        let guard = lock_mgr.acquire(&path, WRITE, &cancel).await.unwrap();
        assert!(!guard.created());
        assert_eq!(lock_mgr.tracked_paths(), 1);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_does_not_overflow() {
        let (lock_mgr, temp) = setup(Duration::MAX);
        let path = temp.path().join("a.md");
        let cancel = CancellationToken::new();

        let guard = lock_mgr.acquire(&path, WRITE, &cancel).await.unwrap();
        assert_eq!(lock_mgr.timeout(), Duration::MAX);
        drop(guard);
        lock_mgr.acquire(&path, LockMode::Shared, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_holders_coexist() {
        let (lock_mgr, temp) = setup(Duration::from_millis(300));
        let path = temp.path().join("a.md");
        std::fs::write(&path, b"x").unwrap();
        let cancel = CancellationToken::new();

        let first = lock_mgr.acquire(&path, LockMode::Shared, &cancel).await.unwrap();
        let second = lock_mgr.acquire(&path, LockMode::Shared, &cancel).await.unwrap();
        assert_eq!(first.mode(), LockMode::Shared);
        drop(first);
        drop(second);
    }

    #[tokio::test]
    async fn test_exclusive_times_out_then_recovers() {
        let (lock_mgr, temp) = setup(Duration::from_millis(200));
        let path = temp.path().join("a.md");
        let cancel = CancellationToken::new();

        let held = lock_mgr.acquire(&path, WRITE, &cancel).await.unwrap();

        let started = std::time::Instant::now();
        let err = lock_mgr.acquire(&path, WRITE, &cancel).await.unwrap_err();
        assert!(matches!(err, LockError::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(200));

        let err = lock_mgr
            .acquire(&path, LockMode::Shared, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout(_)));

        drop(held);
        lock_mgr.acquire(&path, WRITE, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_advisory_layer_blocks_other_holders() {
        let (lock_mgr, temp) = setup(Duration::from_millis(200));
        let path = temp.path().join("a.md");
        std::fs::write(&path, b"x").unwrap();
        let cancel = CancellationToken::new();

        // Stands in for another process: a separate handle with its own flock.
        let foreign = File::open(&path).unwrap();
        FileExt::lock_exclusive(&foreign).unwrap();

        let err = lock_mgr
            .acquire(&path, LockMode::Shared, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout(_)));

        FileExt::unlock(&foreign).unwrap();
        lock_mgr.acquire(&path, LockMode::Shared, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_aborts_wait() {
        let (lock_mgr, temp) = setup(Duration::from_secs(30));
        let path = temp.path().join("a.md");
        let cancel = CancellationToken::new();

        let _held = lock_mgr.acquire(&path, WRITE, &cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let trigger = waiter_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = lock_mgr.acquire(&path, WRITE, &waiter_cancel).await.unwrap_err();
        assert!(matches!(err, LockError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_target() {
        let (lock_mgr, temp) = setup(Duration::from_secs(1));
        let path = temp.path().join("missing.md");
        let cancel = CancellationToken::new();

        let err = lock_mgr
            .acquire(&path, LockMode::Shared, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::NotFound(_)));

        let err = lock_mgr
            .acquire(&path, LockMode::Exclusive { create: false }, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::NotFound(_)));
        assert!(!path.exists());

        // The failed attempts left the path lockable.
        lock_mgr.acquire(&path, WRITE, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_clear() {
        let (lock_mgr, temp) = setup(Duration::from_secs(1));
        let cancel = CancellationToken::new();
        for name in ["a.md", "b.md", "c.md"] {
            lock_mgr
                .acquire(&temp.path().join(name), WRITE, &cancel)
                .await
                .unwrap();
        }
        assert_eq!(lock_mgr.tracked_paths(), 3);
        lock_mgr.clear();
        assert_eq!(lock_mgr.tracked_paths(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_locking() {
        use tokio::sync::Barrier;

        let (lock_mgr, temp) = setup(Duration::from_secs(30));
        let lock_mgr = Arc::new(lock_mgr);
        let path = temp.path().join("shared-resource");

        const NUM_TASKS: usize = 10;
        let barrier = Arc::new(Barrier::new(NUM_TASKS));
        let inside = Arc::new(AtomicUsize::new(0));
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..NUM_TASKS {
            let lock_mgr = Arc::clone(&lock_mgr);
            let barrier = Arc::clone(&barrier);
            let inside = Arc::clone(&inside);
            let counter = Arc::clone(&counter);
            let path = path.clone();

            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                let cancel = CancellationToken::new();
                let guard = lock_mgr
                    .acquire(&path, WRITE, &cancel)
                    .await
                    .expect("acquire failed");

                // Critical section: nobody else may be inside
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                inside.fetch_sub(1, Ordering::SeqCst);

                drop(guard);
            }));
        }

        for handle in handles {
            handle.await.expect("task panicked");
        }

        assert_eq!(counter.load(Ordering::SeqCst), NUM_TASKS);
    }
}
