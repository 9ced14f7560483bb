// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! File locking and content-integrity verification.
//!
//! Local source files and the output artifact are the only resources shared
//! between concurrent chunk workers, so they are the only resources guarded by
//! explicit mutual exclusion. [`FileLockService`] hands out shared (read) and
//! exclusive (write) OS-level advisory locks and computes SHA-256 content
//! hashes so a file can be proven unchanged between two points in time.
//!
//! Lock bookkeeping is serialized by a single internal mutex; the file I/O
//! performed under an already-granted lock needs no further synchronization.
//! Every acquire, release, and failed acquire raises the corresponding
//! lifecycle event so external auditors see every local-file access.

use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{
    EventDispatcher, FileLockAcquiredArgs, FileLockFailedArgs, FileLockReleasedArgs,
};

/// Kind of a file lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileLockKind {
    /// Shared lock; coexists with other read locks, excludes write locks.
    Read,
    /// Exclusive lock; excludes every other lock on the path.
    Write,
}

impl fmt::Display for FileLockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Errors from file lock operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    /// The file to lock does not exist.
    #[error("File not found: {0:?}")]
    NotFound(PathBuf),

    /// The path is already locked (in-process or by another process).
    #[error("Could not acquire {kind} lock on {path:?}: already locked")]
    AlreadyLocked {
        /// Path that could not be locked.
        path: PathBuf,
        /// Requested lock kind.
        kind: FileLockKind,
    },

    /// Retried acquisition gave up after its time budget.
    #[error("Timed out acquiring {kind} lock on {path:?}")]
    Timeout {
        /// Path that could not be locked.
        path: PathBuf,
        /// Requested lock kind.
        kind: FileLockKind,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

struct LockEntry {
    path: PathBuf,
    kind: FileLockKind,
    file: std::fs::File,
}

type SharedRegistry = Arc<Mutex<HashMap<Uuid, LockEntry>>>;

/// An active lock on one file path.
///
/// Dropping the handle releases the OS lock and the bookkeeping entry.
/// [`release`](Self::release) is idempotent; a double release is a no-op.
pub struct FileLockHandle {
    lock_id: Uuid,
    path: PathBuf,
    kind: FileLockKind,
    acquired_at: DateTime<Utc>,
    content_hash: Option<String>,
    registry: SharedRegistry,
}

impl FileLockHandle {
    /// Unique id of this lock.
    pub fn lock_id(&self) -> Uuid {
        self.lock_id
    }

    /// Locked path (absolute).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock kind.
    pub fn kind(&self) -> FileLockKind {
        self.kind
    }

    /// When the lock was acquired.
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// SHA-256 of the file at acquisition time, when requested.
    pub fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    /// Whether the lock is still held.
    pub fn is_active(&self) -> bool {
        self.registry.lock().unwrap().contains_key(&self.lock_id)
    }

    /// Release the lock. Double release is a no-op.
    pub fn release(&self) {
        let entry = self.registry.lock().unwrap().remove(&self.lock_id);
        if let Some(entry) = entry {
            if let Err(e) = entry.file.unlock() {
                warn!(path = ?entry.path, error = %e, "failed to unlock file");
            }
            debug!(path = ?entry.path, lock_id = %self.lock_id, "lock released");
        }
    }
}

impl Drop for FileLockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for FileLockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLockHandle")
            .field("lock_id", &self.lock_id)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Compute the streaming SHA-256 of a file, lowercase hex encoded.
///
/// The file is read in 8 KiB chunks; it is never loaded into memory whole.
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Service managing file locks on local source and output files.
///
/// Invariants enforced in-process (and cross-process via OS advisory locks):
/// a write lock excludes and is excluded by every other lock on the path;
/// read locks coexist with read locks only.
pub struct FileLockService {
    registry: SharedRegistry,
    events: Arc<EventDispatcher>,
}

impl FileLockService {
    /// Create a service raising lock lifecycle events on `events`.
    pub fn new(events: Arc<EventDispatcher>) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Number of currently held locks.
    pub fn active_lock_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Acquire a shared read lock.
    ///
    /// Fails if the path does not exist or is exclusively held. When
    /// `compute_hash` is set, the file is hashed once before the handle is
    /// returned.
    pub async fn acquire_read_lock(
        &self,
        path: &Path,
        compute_hash: bool,
    ) -> Result<FileLockHandle, LockError> {
        let abs = std::path::absolute(path)?;
        if !abs.exists() {
            let err = LockError::NotFound(abs.clone());
            self.raise_failed(&abs, FileLockKind::Read, &err).await;
            return Err(err);
        }

        match self.lock_internal(&abs, FileLockKind::Read) {
            Ok(id) => {
                let hash = if compute_hash {
                    // Holding the shared lock, so the content cannot change
                    // under an exclusive writer while we stream it.
                    Some(self.hash_or_release(id, &abs).await?)
                } else {
                    None
                };
                Ok(self.finish_acquire(id, abs, FileLockKind::Read, hash).await)
            }
            Err(err) => {
                self.raise_failed(&abs, FileLockKind::Read, &err).await;
                Err(err)
            }
        }
    }

    /// Acquire an exclusive write lock.
    ///
    /// If the file pre-exists and `compute_hash` is set, the pre-write hash is
    /// computed first so integrity can be compared after the write. The file
    /// is created if it does not exist.
    pub async fn acquire_write_lock(
        &self,
        path: &Path,
        compute_hash: bool,
    ) -> Result<FileLockHandle, LockError> {
        let abs = std::path::absolute(path)?;
        let hash = if compute_hash && abs.exists() {
            Some(hash_file(&abs).await?)
        } else {
            None
        };

        match self.lock_internal(&abs, FileLockKind::Write) {
            Ok(id) => Ok(self.finish_acquire(id, abs, FileLockKind::Write, hash).await),
            Err(err) => {
                self.raise_failed(&abs, FileLockKind::Write, &err).await;
                Err(err)
            }
        }
    }

    /// Try to acquire a read lock, retrying on contention every 100 ms up to
    /// `timeout`. Returns `None` (not an error) when the lock could not be
    /// acquired in time.
    pub async fn try_acquire_read_lock(
        &self,
        path: &Path,
        timeout: Duration,
        compute_hash: bool,
    ) -> Option<FileLockHandle> {
        let abs = match std::path::absolute(path) {
            Ok(abs) => abs,
            Err(e) => {
                warn!(path = ?path, error = %e, "could not resolve path for read lock");
                return None;
            }
        };
        if !abs.exists() {
            let err = LockError::NotFound(abs.clone());
            self.raise_failed(&abs, FileLockKind::Read, &err).await;
            return None;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.lock_internal(&abs, FileLockKind::Read) {
                Ok(id) => {
                    let hash = if compute_hash {
                        match self.hash_or_release(id, &abs).await {
                            Ok(hash) => Some(hash),
                            Err(e) => {
                                warn!(path = ?abs, error = %e, "could not hash locked file");
                                return None;
                            }
                        }
                    } else {
                        None
                    };
                    return Some(self.finish_acquire(id, abs, FileLockKind::Read, hash).await);
                }
                Err(err @ LockError::AlreadyLocked { .. }) => {
                    if tokio::time::Instant::now() >= deadline {
                        let err = LockError::Timeout {
                            path: abs.clone(),
                            kind: FileLockKind::Read,
                        };
                        self.raise_failed(&abs, FileLockKind::Read, &err).await;
                        return None;
                    }
                    debug!(path = ?abs, "read lock contended, retrying: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(err) => {
                    self.raise_failed(&abs, FileLockKind::Read, &err).await;
                    return None;
                }
            }
        }
    }

    /// Verify that a file still matches an expected hash.
    ///
    /// A mismatch is an expected, reportable outcome: it returns `Ok(false)`,
    /// never an error.
    pub async fn verify_integrity(
        &self,
        path: &Path,
        expected_hash: &str,
    ) -> Result<bool, LockError> {
        let current = hash_file(path).await?;
        let matches = current.eq_ignore_ascii_case(expected_hash);
        if !matches {
            warn!(
                path = ?path,
                expected = &expected_hash[..expected_hash.len().min(16)],
                actual = &current[..16],
                "integrity check failed"
            );
        }
        Ok(matches)
    }

    /// Compute the SHA-256 of a file.
    pub async fn compute_hash(&self, path: &Path) -> Result<String, LockError> {
        Ok(hash_file(path).await?)
    }

    /// Release a lock, raising the lock-released event with held duration and
    /// before/after hashes.
    pub async fn release(&self, handle: FileLockHandle) {
        let hash_before = handle.content_hash.clone();
        // Hash again while the lock is still held; a differing hash means the
        // file changed under the lock (a writer in this process, or tampering
        // that bypassed advisory locking).
        let hash_after = if hash_before.is_some() && handle.path.exists() {
            hash_file(&handle.path).await.ok()
        } else {
            None
        };
        let was_modified = match (&hash_before, &hash_after) {
            (Some(before), Some(after)) => before != after,
            _ => false,
        };
        let held_ms = (Utc::now() - handle.acquired_at).num_milliseconds().max(0) as u64;

        let args = FileLockReleasedArgs {
            timestamp: Utc::now(),
            path: handle.path.clone(),
            lock_id: handle.lock_id,
            held_ms,
            was_modified,
            hash_before,
            hash_after,
        };
        handle.release();
        self.events.raise_file_lock_released(&args).await;
    }

    /// Best-effort release of every currently held lock.
    ///
    /// Used during shutdown/cleanup; individual release failures are logged,
    /// not escalated. Outstanding handles become inert.
    pub fn release_all_locks(&self) {
        let entries: Vec<(Uuid, LockEntry)> =
            self.registry.lock().unwrap().drain().collect();
        if !entries.is_empty() {
            info!(count = entries.len(), "releasing all active locks");
        }
        for (id, entry) in entries {
            if let Err(e) = entry.file.unlock() {
                error!(lock_id = %id, path = ?entry.path, error = %e, "error releasing lock");
            }
        }
    }

    /// Check in-process conflicts, open the file, and take the OS lock.
    /// Runs entirely under the bookkeeping mutex.
    fn lock_internal(&self, abs: &Path, kind: FileLockKind) -> Result<Uuid, LockError> {
        let mut registry = self.registry.lock().unwrap();

        for entry in registry.values() {
            if entry.path == abs
                && (kind == FileLockKind::Write || entry.kind == FileLockKind::Write)
            {
                return Err(LockError::AlreadyLocked {
                    path: abs.to_path_buf(),
                    kind,
                });
            }
        }

        let open_result = match kind {
            FileLockKind::Read => OpenOptions::new().read(true).open(abs),
            FileLockKind::Write => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(abs),
        };
        let file = open_result.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LockError::NotFound(abs.to_path_buf())
            } else {
                LockError::Io(e)
            }
        })?;

        let lock_result = match kind {
            FileLockKind::Read => fs2::FileExt::try_lock_shared(&file),
            FileLockKind::Write => fs2::FileExt::try_lock_exclusive(&file),
        };
        if let Err(e) = lock_result {
            return if e.kind() == fs2::lock_contended_error().kind() {
                Err(LockError::AlreadyLocked {
                    path: abs.to_path_buf(),
                    kind,
                })
            } else {
                Err(LockError::Io(e))
            };
        }

        let id = Uuid::new_v4();
        registry.insert(
            id,
            LockEntry {
                path: abs.to_path_buf(),
                kind,
                file,
            },
        );
        Ok(id)
    }

    /// Hash a freshly locked file, releasing the registry entry on failure.
    async fn hash_or_release(&self, id: Uuid, abs: &Path) -> Result<String, LockError> {
        match hash_file(abs).await {
            Ok(hash) => Ok(hash),
            Err(e) => {
                if let Some(entry) = self.registry.lock().unwrap().remove(&id) {
                    let _ = entry.file.unlock();
                }
                Err(LockError::Io(e))
            }
        }
    }

    async fn finish_acquire(
        &self,
        id: Uuid,
        abs: PathBuf,
        kind: FileLockKind,
        content_hash: Option<String>,
    ) -> FileLockHandle {
        let handle = FileLockHandle {
            lock_id: id,
            path: abs,
            kind,
            acquired_at: Utc::now(),
            content_hash,
            registry: self.registry.clone(),
        };
        debug!(
            path = ?handle.path,
            kind = %kind,
            lock_id = %id,
            "lock acquired"
        );
        self.events
            .raise_file_lock_acquired(&FileLockAcquiredArgs {
                timestamp: Utc::now(),
                path: handle.path.clone(),
                kind,
                lock_id: id,
                content_hash: handle.content_hash.clone(),
            })
            .await;
        handle
    }

    async fn raise_failed(&self, path: &Path, kind: FileLockKind, err: &LockError) {
        warn!(path = ?path, kind = %kind, error = %err, "lock acquisition failed");
        self.events
            .raise_file_lock_failed(&FileLockFailedArgs {
                timestamp: Utc::now(),
                path: path.to_path_buf(),
                kind,
                reason: err.to_string(),
            })
            .await;
    }
}

impl fmt::Debug for FileLockService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLockService")
            .field("active_locks", &self.active_lock_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CompilationEventHandler, Result as EventResult};
    use async_trait::async_trait;
    use std::io::Write as _;
    use std::sync::Mutex as StdMutex;

    fn service() -> FileLockService {
        FileLockService::new(Arc::new(EventDispatcher::new()))
    }

    fn temp_file_with(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_read_lock_on_missing_file_fails() {
        let svc = service();
        let result = svc
            .acquire_read_lock(Path::new("/nonexistent/source.txt"), false)
            .await;
        assert!(matches!(result, Err(LockError::NotFound(_))));
        assert_eq!(svc.active_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_read_locks_coexist() {
        let svc = service();
        let file = temp_file_with("||ads.example^\n");

        let first = svc.acquire_read_lock(file.path(), false).await.unwrap();
        let second = svc.acquire_read_lock(file.path(), false).await.unwrap();

        assert!(first.is_active());
        assert!(second.is_active());
        assert_eq!(svc.active_lock_count(), 2);
    }

    #[tokio::test]
    async fn test_write_lock_excluded_by_read_lock() {
        let svc = service();
        let file = temp_file_with("||ads.example^\n");

        let read = svc.acquire_read_lock(file.path(), false).await.unwrap();
        let write = svc.acquire_write_lock(file.path(), false).await;
        assert!(matches!(write, Err(LockError::AlreadyLocked { .. })));

        svc.release(read).await;
        let write = svc.acquire_write_lock(file.path(), false).await;
        assert!(write.is_ok());
    }

    #[tokio::test]
    async fn test_two_write_locks_never_both_succeed() {
        let svc = service();
        let file = temp_file_with("||ads.example^\n");

        let first = svc.acquire_write_lock(file.path(), false).await;
        let second = svc.acquire_write_lock(file.path(), false).await;
        assert!(first.is_ok());
        assert!(matches!(second, Err(LockError::AlreadyLocked { .. })));
    }

    #[tokio::test]
    async fn test_read_lock_excluded_by_write_lock() {
        let svc = service();
        let file = temp_file_with("||ads.example^\n");

        let _write = svc.acquire_write_lock(file.path(), false).await.unwrap();
        let read = svc.acquire_read_lock(file.path(), false).await;
        assert!(matches!(read, Err(LockError::AlreadyLocked { .. })));
    }

    #[tokio::test]
    async fn test_try_acquire_read_lock_times_out_under_write_lock() {
        let svc = service();
        let file = temp_file_with("||ads.example^\n");

        let _write = svc.acquire_write_lock(file.path(), false).await.unwrap();
        let handle = svc
            .try_acquire_read_lock(file.path(), Duration::from_millis(250), false)
            .await;
        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn test_try_acquire_read_lock_succeeds_when_free() {
        let svc = service();
        let file = temp_file_with("||ads.example^\n");

        let handle = svc
            .try_acquire_read_lock(file.path(), Duration::from_secs(1), true)
            .await
            .unwrap();
        assert!(handle.content_hash().is_some());
    }

    #[tokio::test]
    async fn test_compute_hash_known_value() {
        let svc = service();
        let file = temp_file_with("hello world");
        let hash = svc.compute_hash(file.path()).await.unwrap();
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn test_verify_integrity_detects_change_without_error() {
        let svc = service();
        let file = temp_file_with("||ads.example^\n");
        let hash = svc.compute_hash(file.path()).await.unwrap();

        assert!(svc.verify_integrity(file.path(), &hash).await.unwrap());
        // Case-insensitive comparison.
        assert!(
            svc.verify_integrity(file.path(), &hash.to_uppercase())
                .await
                .unwrap()
        );

        std::fs::write(file.path(), "||tracker.example^\n").unwrap();
        assert!(!svc.verify_integrity(file.path(), &hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_double_release_is_noop() {
        let svc = service();
        let file = temp_file_with("||ads.example^\n");

        let handle = svc.acquire_read_lock(file.path(), false).await.unwrap();
        handle.release();
        assert!(!handle.is_active());
        handle.release();
        assert_eq!(svc.active_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_handle_releases_lock() {
        let svc = service();
        let file = temp_file_with("||ads.example^\n");

        {
            let _handle = svc.acquire_write_lock(file.path(), false).await.unwrap();
            assert_eq!(svc.active_lock_count(), 1);
        }
        assert_eq!(svc.active_lock_count(), 0);
        assert!(svc.acquire_write_lock(file.path(), false).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_all_locks() {
        let svc = service();
        let a = temp_file_with("a\n");
        let b = temp_file_with("b\n");

        let ha = svc.acquire_read_lock(a.path(), false).await.unwrap();
        let _hb = svc.acquire_write_lock(b.path(), false).await.unwrap();
        assert_eq!(svc.active_lock_count(), 2);

        svc.release_all_locks();
        assert_eq!(svc.active_lock_count(), 0);
        assert!(!ha.is_active());
    }

    #[tokio::test]
    async fn test_write_lock_creates_missing_file_without_prehash() {
        let svc = service();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new-output.txt");

        let handle = svc.acquire_write_lock(&path, true).await.unwrap();
        assert!(path.exists());
        assert!(handle.content_hash().is_none());
    }

    /// Collects lock lifecycle events for assertions.
    #[derive(Default)]
    struct LockAudit {
        acquired: StdMutex<Vec<FileLockAcquiredArgs>>,
        released: StdMutex<Vec<FileLockReleasedArgs>>,
        failed: StdMutex<Vec<FileLockFailedArgs>>,
    }

    #[async_trait]
    impl CompilationEventHandler for LockAudit {
        async fn on_file_lock_acquired(&self, args: &FileLockAcquiredArgs) -> EventResult<()> {
            self.acquired.lock().unwrap().push(args.clone());
            Ok(())
        }

        async fn on_file_lock_released(&self, args: &FileLockReleasedArgs) -> EventResult<()> {
            self.released.lock().unwrap().push(args.clone());
            Ok(())
        }

        async fn on_file_lock_failed(&self, args: &FileLockFailedArgs) -> EventResult<()> {
            self.failed.lock().unwrap().push(args.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lock_lifecycle_events_carry_hashes() {
        let audit = Arc::new(LockAudit::default());
        let events = Arc::new(EventDispatcher::new());
        events.add_handler(audit.clone());
        let svc = FileLockService::new(events);

        let file = temp_file_with("||ads.example^\n");
        let handle = svc.acquire_read_lock(file.path(), true).await.unwrap();
        let lock_id = handle.lock_id();
        svc.release(handle).await;

        let acquired = audit.acquired.lock().unwrap();
        assert_eq!(acquired.len(), 1);
        assert_eq!(acquired[0].lock_id, lock_id);
        assert_eq!(acquired[0].kind, FileLockKind::Read);
        assert!(acquired[0].content_hash.is_some());

        let released = audit.released.lock().unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].lock_id, lock_id);
        assert!(!released[0].was_modified);
        assert_eq!(released[0].hash_before, released[0].hash_after);
    }

    #[tokio::test]
    async fn test_failed_lock_raises_event() {
        let audit = Arc::new(LockAudit::default());
        let events = Arc::new(EventDispatcher::new());
        events.add_handler(audit.clone());
        let svc = FileLockService::new(events);

        let file = temp_file_with("||ads.example^\n");
        let _write = svc.acquire_write_lock(file.path(), false).await.unwrap();
        let _ = svc.acquire_read_lock(file.path(), false).await;

        let failed = audit.failed.lock().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].kind, FileLockKind::Read);
        assert!(failed[0].reason.contains("already locked"));
    }
}
