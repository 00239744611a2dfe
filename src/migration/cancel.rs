//! Cancellation and deadlines for migration runs

use crate::migration::MigrationError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Caller-supplied cancellation signal with an optional deadline
///
/// Clones share the cancellation flag, so one clone can be handed to a signal
/// handler or another coroutine while the migrator holds the other.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that is never cancelled and has no deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::default(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Same flag, new deadline
    #[must_use]
    pub fn deadline_at(&self, deadline: Instant) -> Self {
        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail if the token was cancelled or its deadline has passed
    ///
    /// # Errors
    ///
    /// `MigrationError::Cancelled` or `MigrationError::DeadlineExceeded`.
    pub fn check(&self) -> Result<(), MigrationError> {
        if self.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }
        match self.remaining() {
            Some(left) if left.is_zero() => Err(MigrationError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}
