//! Migration-specific error types

use crate::executor::DbError;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Which script of a migration was running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Migration-specific errors
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Malformed migration filename, unreadable file or directory
    #[error("Migration parse error in {}: {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },

    /// Two migration files share the same numeric version prefix
    #[error(
        "Duplicate migration version {version}: {} and {}",
        .first.display(),
        .second.display()
    )]
    DuplicateVersion {
        version: i64,
        first: PathBuf,
        second: PathBuf,
    },

    /// A script that was about to run contains no executable SQL
    #[error("Migration '{name}' (version {version}) has an empty {direction} block")]
    Validation {
        version: i64,
        name: String,
        direction: Direction,
    },

    /// A migration script failed; the enclosing transaction was rolled back
    #[error("Migration '{name}' (version {version}) failed during {direction}: {source}")]
    Execution {
        version: i64,
        name: String,
        direction: Direction,
        #[source]
        source: DbError,
    },

    /// The advisory lock could not be acquired at all
    #[error("Failed to acquire migration lock {lock_id}: {source}")]
    Lock {
        lock_id: i64,
        #[source]
        source: DbError,
    },

    /// The caller's deadline expired while waiting for the advisory lock
    #[error(
        "Timed out after {waited:?} waiting for migration lock {lock_id}; \
         another process may be running migrations"
    )]
    LockTimeout { lock_id: i64, waited: Duration },

    /// The caller cancelled the operation
    #[error("Migration run cancelled")]
    Cancelled,

    /// The caller's deadline passed before the work finished
    #[error("Migration run exceeded its deadline")]
    DeadlineExceeded,

    /// The ledger records a version whose file is missing on disk
    #[error(
        "Applied migration version {version} has no migration file in {}",
        .dir.display()
    )]
    MissingFile { version: i64, dir: PathBuf },

    /// A migration name that cannot produce a file name
    #[error("Invalid migration name: {0}")]
    InvalidName(String),

    /// Filesystem failure outside of parsing (creating migration files)
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Ledger or transaction bookkeeping failed
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

impl MigrationError {
    pub(crate) fn parse(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        MigrationError::Parse {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
