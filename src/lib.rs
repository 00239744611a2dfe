//! # Tidemark
//!
//! Versioned SQL migrations for PostgreSQL on the `may` coroutine runtime.
//!
//! Migrations are plain `<version>_<name>.sql` files with an Up and a Down
//! section. The [`Migrator`] applies, rolls back and re-applies them inside
//! transactions, records applied versions in a ledger table, and serializes
//! concurrent runs with a PostgreSQL advisory lock.

pub mod config;
pub mod connection;
pub mod executor;
pub mod metrics;
pub mod migration;
pub mod transaction;

#[cfg(test)]
mod test_helpers;

pub use connection::{connect, validate_connection_string, ConnectionError};
pub use executor::{DbError, Executor, PostgresExecutor};
pub use migration::{
    CancelToken, Direction, Ledger, LockCoordinator, MigrationError, MigrationFile, Migrator,
    PgLedger, StatusEntry, TransactionMode,
};
pub use transaction::Transaction;
