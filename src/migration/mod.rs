//! Migration system for Tidemark
//!
//! This module provides the migration engine and its parts:
//! - [`file`]: parses `<version>_<name>.sql` files into ordered [`MigrationFile`]s
//! - [`ledger`]: the table recording which versions are applied
//! - [`lock`]: the advisory lock serializing mutating runs across processes
//! - [`Migrator`]: `up`, `down`, `redo`, `status`, `db_version`
//! - [`creator`]: scaffolding for new migration files
//!
//! # Example
//!
//! ```rust,no_run
//! use tidemark::{connect, CancelToken, Migrator, PostgresExecutor};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = PostgresExecutor::new(connect("host=localhost user=postgres dbname=app")?);
//! let migrator = Migrator::new("./migrations");
//!
//! // Give up if the lock and the migrations take longer than five minutes
//! let cancel = CancelToken::with_timeout(Duration::from_secs(300));
//! migrator.up(&executor, &cancel)?;
//!
//! for entry in migrator.status(&executor)? {
//!     println!("{}\t{}", entry.version, entry.applied);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod creator;
pub mod error;
pub mod file;
pub mod ledger;
pub mod lock;
pub mod migrator;
pub mod record;

pub use cancel::CancelToken;
pub use creator::create;
pub use error::{Direction, MigrationError};
pub use file::{discover_migrations, is_executable_sql, MigrationFile};
pub use ledger::{Ledger, PgLedger, DEFAULT_LEDGER_TABLE};
pub use lock::{LockCoordinator, MigrationLockGuard};
pub use migrator::{Migrator, TransactionMode};
pub use record::{AppliedRecord, StatusEntry};
