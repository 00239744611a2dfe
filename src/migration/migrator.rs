//! Migrator - Core migration execution engine

use crate::executor::Executor;
use crate::migration::file::discover_migrations;
use crate::migration::{
    CancelToken, Direction, Ledger, LockCoordinator, MigrationError, MigrationFile, PgLedger,
    StatusEntry,
};
use crate::transaction::Transaction;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// How pending migrations of one `up` call are grouped into transactions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionMode {
    /// One transaction for the whole batch: a failure on migration N also
    /// discards migrations 1..N-1 of the same call.
    #[default]
    Batch,
    /// One transaction per migration: earlier migrations of the batch stay
    /// committed when a later one fails. The lock is still held for the batch.
    PerMigration,
}

/// Core migration execution engine
///
/// The `Migrator` keeps no state between calls: every operation re-reads the
/// migrations directory and the ledger. Mutating operations (`up`, `down`,
/// `redo`) run under the [`LockCoordinator`]'s advisory lock and re-read the
/// ledger once the lock is held, so a caller that waited for another process
/// sees that process's work.
///
/// # Example
///
/// ```no_run
/// use tidemark::{connect, CancelToken, Migrator, PostgresExecutor};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let executor = PostgresExecutor::new(connect("host=localhost user=postgres dbname=app")?);
/// let migrator = Migrator::new("./migrations");
///
/// let applied = migrator.up(&executor, &CancelToken::new())?;
/// println!("applied {applied} migration(s), now at {}", migrator.db_version(&executor)?);
/// # Ok(())
/// # }
/// ```
pub struct Migrator<L: Ledger = PgLedger> {
    migrations_dir: PathBuf,
    ledger: L,
    lock: LockCoordinator,
    mode: TransactionMode,
}

impl Migrator<PgLedger> {
    /// Create a new Migrator with the default ledger table and lock
    pub fn new(migrations_dir: impl AsRef<Path>) -> Self {
        Self::with_parts(migrations_dir, PgLedger::new(), LockCoordinator::new())
    }
}

impl<L: Ledger> Migrator<L> {
    /// Create a Migrator from an explicit ledger and lock coordinator
    pub fn with_parts(migrations_dir: impl AsRef<Path>, ledger: L, lock: LockCoordinator) -> Self {
        Self {
            migrations_dir: migrations_dir.as_ref().to_path_buf(),
            ledger,
            lock,
            mode: TransactionMode::default(),
        }
    }

    #[must_use]
    pub fn with_transaction_mode(mut self, mode: TransactionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn lock(&self) -> &LockCoordinator {
        &self.lock
    }

    pub fn transaction_mode(&self) -> TransactionMode {
        self.mode
    }

    /// Parse every migration file, sorted by version
    ///
    /// # Errors
    ///
    /// `MigrationError::Parse` or `MigrationError::DuplicateVersion`.
    pub fn discover_migrations(&self) -> Result<Vec<MigrationFile>, MigrationError> {
        discover_migrations(&self.migrations_dir)
    }

    /// Apply every migration that is not in the ledger, in ascending version order
    ///
    /// Returns the number of migrations applied; `0` when already up to date.
    ///
    /// # Errors
    ///
    /// - `Parse`/`DuplicateVersion` before touching the database
    /// - `Validation` if a pending Up block has no executable SQL, before any
    ///   transaction opens
    /// - `Execution` if a script fails; the transaction is rolled back (see
    ///   [`TransactionMode`] for what that covers)
    /// - `Lock`, `LockTimeout`, `Cancelled`, `DeadlineExceeded`
    pub fn up(&self, db: &dyn Executor, cancel: &CancelToken) -> Result<usize, MigrationError> {
        let migrations = self.discover_migrations()?;

        let applied = self.ledger.applied_versions(db)?;
        let pending = pending_migrations(&migrations, &applied);
        validate(&pending, &[Direction::Up])?;
        if pending.is_empty() {
            log::info!("No pending migrations");
            return Ok(0);
        }

        self.lock.with_exclusive(db, cancel, |db| {
            self.ledger.ensure_table(db)?;

            // The ledger may have moved while we waited for the lock
            let applied = self.ledger.applied_versions(db)?;
            let pending = pending_migrations(&migrations, &applied);
            validate(&pending, &[Direction::Up])?;
            if pending.is_empty() {
                log::info!("No pending migrations");
                return Ok(0);
            }

            match self.mode {
                TransactionMode::Batch => {
                    self.in_transaction(db, cancel, |tx| {
                        for migration in &pending {
                            cancel.check()?;
                            self.apply(tx, migration)?;
                        }
                        Ok(())
                    })?;
                }
                TransactionMode::PerMigration => {
                    for migration in &pending {
                        self.in_transaction(db, cancel, |tx| self.apply(tx, migration))?;
                    }
                }
            }

            log::info!("Applied {} migration(s)", pending.len());
            Ok(pending.len())
        })
    }

    /// Roll back the highest applied migration
    ///
    /// Returns the rolled back version, or `None` if nothing was applied.
    ///
    /// # Errors
    ///
    /// - `MissingFile` if the ledger's latest version has no file on disk
    /// - `Validation` if its Down block has no executable SQL
    /// - `Execution`, `Lock`, `LockTimeout`, `Cancelled`, `DeadlineExceeded`
    pub fn down(
        &self,
        db: &dyn Executor,
        cancel: &CancelToken,
    ) -> Result<Option<i64>, MigrationError> {
        self.on_latest(db, cancel, &[Direction::Down], |tx, target| {
            self.run_script(tx, target, Direction::Down)?;
            self.ledger.mark_rolled_back(tx, target.version)
        })
    }

    /// Roll back and re-apply the highest applied migration in one transaction
    ///
    /// Returns the re-applied version, or `None` if nothing was applied.
    ///
    /// # Errors
    ///
    /// As [`Migrator::down`]; both blocks must contain executable SQL.
    pub fn redo(
        &self,
        db: &dyn Executor,
        cancel: &CancelToken,
    ) -> Result<Option<i64>, MigrationError> {
        self.on_latest(db, cancel, &[Direction::Down, Direction::Up], |tx, target| {
            self.run_script(tx, target, Direction::Down)?;
            self.run_script(tx, target, Direction::Up)?;
            self.ledger.mark_applied(tx, target.version, &target.name)
        })
    }

    /// Applied versions, ascending
    ///
    /// Reads the ledger only: no lock, no parsing, no DDL. Pending files are not
    /// listed, and a database that was never migrated reports nothing.
    ///
    /// # Errors
    ///
    /// `MigrationError::Database` if the ledger cannot be read.
    pub fn status(&self, db: &dyn Executor) -> Result<Vec<StatusEntry>, MigrationError> {
        Ok(self
            .ledger
            .applied_versions(db)?
            .into_iter()
            .map(|(version, applied)| StatusEntry { version, applied })
            .collect())
    }

    /// Highest applied version, `0` when nothing is applied
    ///
    /// # Errors
    ///
    /// `MigrationError::Database` if the ledger cannot be read.
    pub fn db_version(&self, db: &dyn Executor) -> Result<i64, MigrationError> {
        Ok(self.ledger.latest_applied(db)?.unwrap_or(0))
    }

    /// Shared driver for `down` and `redo`
    fn on_latest<F>(
        &self,
        db: &dyn Executor,
        cancel: &CancelToken,
        required: &[Direction],
        work: F,
    ) -> Result<Option<i64>, MigrationError>
    where
        F: Fn(&dyn Executor, &MigrationFile) -> Result<(), MigrationError>,
    {
        let migrations = self.discover_migrations()?;

        let Some(target) = self.latest_applied_file(db, &migrations)? else {
            log::info!("No applied migrations");
            return Ok(None);
        };
        validate(&[target], required)?;

        self.lock.with_exclusive(db, cancel, |db| {
            let Some(target) = self.latest_applied_file(db, &migrations)? else {
                return Ok(None);
            };
            validate(&[target], required)?;

            self.in_transaction(db, cancel, |tx| work(tx, target))?;
            Ok(Some(target.version))
        })
    }

    /// File of the highest applied version
    fn latest_applied_file<'m>(
        &self,
        db: &dyn Executor,
        migrations: &'m [MigrationFile],
    ) -> Result<Option<&'m MigrationFile>, MigrationError> {
        let Some(latest) = self.ledger.latest_applied(db)? else {
            return Ok(None);
        };
        migrations
            .iter()
            .find(|m| m.version == latest)
            .map(Some)
            .ok_or_else(|| MigrationError::MissingFile {
                version: latest,
                dir: self.migrations_dir.clone(),
            })
    }

    /// Run `work` in a transaction bounded by the token's deadline
    fn in_transaction<T, F>(
        &self,
        db: &dyn Executor,
        cancel: &CancelToken,
        work: F,
    ) -> Result<T, MigrationError>
    where
        F: FnOnce(&dyn Executor) -> Result<T, MigrationError>,
    {
        cancel.check()?;
        let tx = Transaction::begin(db)?;
        if let Some(left) = cancel.remaining() {
            tx.set_statement_timeout(left)?;
        }

        let executor: &dyn Executor = &tx;
        match work(executor) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    log::warn!("Rollback after failed migration also failed: {rollback_err}");
                }
                Err(e)
            }
        }
    }

    fn apply(&self, tx: &dyn Executor, migration: &MigrationFile) -> Result<(), MigrationError> {
        self.run_script(tx, migration, Direction::Up)?;
        self.ledger
            .mark_applied(tx, migration.version, &migration.name)
    }

    fn run_script(
        &self,
        tx: &dyn Executor,
        migration: &MigrationFile,
        direction: Direction,
    ) -> Result<(), MigrationError> {
        #[cfg(feature = "tracing")]
        let _span =
            tracing_helpers::migration_span(direction.as_str(), migration.version, &migration.name)
                .entered();

        let start = Instant::now();
        tx.batch_execute(migration.script(direction))
            .map_err(|source| {
                #[cfg(feature = "metrics")]
                METRICS.record_migration_failure(direction.as_str());
                MigrationError::Execution {
                    version: migration.version,
                    name: migration.name.clone(),
                    direction,
                    source,
                }
            })?;

        let elapsed = start.elapsed();
        #[cfg(feature = "metrics")]
        METRICS.record_migration(direction.as_str(), elapsed);

        log::info!(
            "{} {}_{} ({:?})",
            direction,
            migration.version,
            migration.name,
            elapsed
        );
        Ok(())
    }
}

/// Migrations with no ledger entry, in file (ascending version) order
fn pending_migrations<'m>(
    migrations: &'m [MigrationFile],
    applied: &BTreeMap<i64, bool>,
) -> Vec<&'m MigrationFile> {
    migrations
        .iter()
        .filter(|m| !applied.get(&m.version).copied().unwrap_or(false))
        .collect()
}

fn validate(migrations: &[&MigrationFile], required: &[Direction]) -> Result<(), MigrationError> {
    for migration in migrations {
        for direction in required {
            migration.ensure_executable(*direction)?;
        }
    }
    Ok(())
}
