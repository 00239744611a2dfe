//! Advisory-lock based mutual exclusion for mutating migration runs
//!
//! Every process that connects to the same database and derives the same lock
//! id contends for the same PostgreSQL session-level advisory lock. The lock is
//! independent of any transaction: it is taken before `BEGIN` and released
//! after `COMMIT`/`ROLLBACK`.

use crate::executor::Executor;
use crate::migration::{CancelToken, MigrationError};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Namespace the default lock id is derived from
pub const LOCK_NAMESPACE: &str = "tidemark";

/// How long to sleep between `pg_try_advisory_lock` attempts
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Derive a stable advisory lock id from a namespace string
///
/// First eight bytes of the SHA-256 digest, read big-endian.
pub fn derive_lock_id(namespace: &str) -> i64 {
    let digest = Sha256::digest(namespace.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Owns the advisory lock id used by the migration engine
///
/// Built once at startup and handed to the [`Migrator`](crate::migration::Migrator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockCoordinator {
    lock_id: i64,
    poll_interval: Duration,
}

impl Default for LockCoordinator {
    fn default() -> Self {
        Self::for_namespace(LOCK_NAMESPACE)
    }
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coordinator whose lock id is derived from `namespace`
    ///
    /// Processes using different namespaces do not exclude each other.
    pub fn for_namespace(namespace: &str) -> Self {
        Self {
            lock_id: derive_lock_id(namespace),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn lock_id(&self) -> i64 {
        self.lock_id
    }

    /// Run `work` while holding the advisory lock
    ///
    /// Blocks until the lock is free, the token is cancelled, or the token's
    /// deadline passes. The lock is released on every exit path of `work`,
    /// including errors and panics.
    ///
    /// # Errors
    ///
    /// - `MigrationError::Lock` if the lock query itself fails
    /// - `MigrationError::LockTimeout` if the deadline passes while waiting
    /// - `MigrationError::Cancelled` if the token is cancelled while waiting
    /// - whatever `work` returns
    pub fn with_exclusive<T, F>(
        &self,
        db: &dyn Executor,
        cancel: &CancelToken,
        work: F,
    ) -> Result<T, MigrationError>
    where
        F: FnOnce(&dyn Executor) -> Result<T, MigrationError>,
    {
        let guard = MigrationLockGuard::acquire(db, self, cancel)?;
        work(guard.executor())
    }

    /// Try to take the lock once without waiting
    fn try_acquire(&self, db: &dyn Executor) -> Result<bool, MigrationError> {
        // One row when the lock was granted, zero otherwise
        let rows = db
            .execute(
                "SELECT 1 WHERE pg_try_advisory_lock($1)",
                &[&self.lock_id],
            )
            .map_err(|source| MigrationError::Lock {
                lock_id: self.lock_id,
                source,
            })?;
        Ok(rows > 0)
    }

    fn release(&self, db: &dyn Executor) {
        match db.execute("SELECT pg_advisory_unlock($1)", &[&self.lock_id]) {
            Ok(_) => log::debug!("Released migration lock {}", self.lock_id),
            Err(e) => log::warn!("Failed to release migration lock {}: {e}", self.lock_id),
        }
    }
}

/// Lock guard that releases the advisory lock when dropped
pub struct MigrationLockGuard<'a> {
    executor: &'a dyn Executor,
    coordinator: &'a LockCoordinator,
}

impl<'a> MigrationLockGuard<'a> {
    /// Acquire the migration lock, polling until it is free
    ///
    /// # Errors
    ///
    /// See [`LockCoordinator::with_exclusive`].
    pub fn acquire(
        executor: &'a dyn Executor,
        coordinator: &'a LockCoordinator,
        cancel: &CancelToken,
    ) -> Result<Self, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::acquire_lock_span(coordinator.lock_id).entered();

        let start = Instant::now();
        let mut logged_wait = false;

        loop {
            match cancel.check() {
                Ok(()) => {}
                Err(MigrationError::DeadlineExceeded) => {
                    return Err(MigrationError::LockTimeout {
                        lock_id: coordinator.lock_id,
                        waited: start.elapsed(),
                    })
                }
                Err(e) => return Err(e),
            }

            if coordinator.try_acquire(executor)? {
                let waited = start.elapsed();
                log::debug!(
                    "Acquired migration lock {} after {:?}",
                    coordinator.lock_id,
                    waited
                );
                #[cfg(feature = "metrics")]
                METRICS.record_lock_wait(waited);
                return Ok(Self {
                    executor,
                    coordinator,
                });
            }

            if !logged_wait {
                log::info!(
                    "Migration lock {} is held by another process, waiting",
                    coordinator.lock_id
                );
                logged_wait = true;
            }

            let pause = match cancel.remaining() {
                Some(left) => coordinator.poll_interval.min(left),
                None => coordinator.poll_interval,
            };
            may::coroutine::sleep(pause);
        }
    }

    /// Get a reference to the underlying executor
    pub fn executor(&self) -> &'a dyn Executor {
        self.executor
    }
}

impl Drop for MigrationLockGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.release(self.executor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::RecordingExecutor;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    const TRY_LOCK: &str = "SELECT 1 WHERE pg_try_advisory_lock($1)";
    const UNLOCK: &str = "SELECT pg_advisory_unlock($1)";

    fn coordinator() -> LockCoordinator {
        LockCoordinator::new().with_poll_interval(Duration::from_millis(1))
    }

    #[test]
    fn test_lock_id_is_deterministic() {
        assert_eq!(derive_lock_id("tidemark"), derive_lock_id("tidemark"));
        assert_ne!(derive_lock_id("tidemark"), derive_lock_id("other"));
        assert_eq!(LockCoordinator::new().lock_id(), derive_lock_id(LOCK_NAMESPACE));
    }

    #[test]
    fn test_work_runs_between_lock_and_unlock() {
        let db = RecordingExecutor::new();
        let out = coordinator()
            .with_exclusive(&db, &CancelToken::new(), |db| {
                db.batch_execute("SELECT 42;")?;
                Ok(42)
            })
            .unwrap();

        assert_eq!(out, 42);
        assert_eq!(db.statements(), vec![TRY_LOCK, "SELECT 42;", UNLOCK]);
    }

    #[test]
    fn test_waits_while_lock_is_held_elsewhere() {
        let db = RecordingExecutor::new().lock_busy_for(3);
        coordinator()
            .with_exclusive(&db, &CancelToken::new(), |_| Ok(()))
            .unwrap();

        assert_eq!(db.count(TRY_LOCK), 4);
        assert_eq!(db.count(UNLOCK), 1);
    }

    #[test]
    fn test_released_when_work_fails() {
        let db = RecordingExecutor::new();
        let err = coordinator()
            .with_exclusive(&db, &CancelToken::new(), |_| -> Result<(), _> {
                Err(MigrationError::Cancelled)
            })
            .unwrap_err();

        assert!(matches!(err, MigrationError::Cancelled));
        assert_eq!(db.statements().last().map(String::as_str), Some(UNLOCK));
    }

    #[test]
    fn test_released_when_work_panics() {
        let db = RecordingExecutor::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            coordinator().with_exclusive(&db, &CancelToken::new(), |_| -> Result<(), _> {
                panic!("migration blew up")
            })
        }));

        assert!(result.is_err());
        assert_eq!(db.count(UNLOCK), 1);
    }

    #[test]
    fn test_deadline_while_waiting_is_a_lock_timeout() {
        let db = RecordingExecutor::new().lock_busy_for(usize::MAX);
        let cancel = CancelToken::with_timeout(Duration::from_millis(20));

        let err = coordinator()
            .with_exclusive(&db, &cancel, |_| Ok(()))
            .unwrap_err();

        assert!(matches!(err, MigrationError::LockTimeout { .. }), "got {err:?}");
        assert_eq!(db.count(UNLOCK), 0);
    }

    #[test]
    fn test_cancelled_before_acquire() {
        let db = RecordingExecutor::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = coordinator()
            .with_exclusive(&db, &cancel, |_| Ok(()))
            .unwrap_err();

        assert!(matches!(err, MigrationError::Cancelled));
        assert!(db.statements().is_empty());
    }

    #[test]
    fn test_lock_query_failure_is_a_lock_error() {
        let db = RecordingExecutor::new().fail_on("pg_try_advisory_lock");
        let err = coordinator()
            .with_exclusive(&db, &CancelToken::new(), |_| Ok(()))
            .unwrap_err();

        assert!(matches!(err, MigrationError::Lock { .. }), "got {err:?}");
    }
}
