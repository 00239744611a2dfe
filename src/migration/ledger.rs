//! Version ledger: the table recording which migrations are applied
//!
//! A row's presence means "applied"; there is no recorded-but-pending state.
//! The ledger keeps no transaction state of its own. Every write is issued on
//! the executor the caller passes in, which during `up`/`down`/`redo` is the
//! migration transaction, so the ledger changes atomically with the schema.
//!
//! Reads treat a missing table as an empty ledger. Only `ensure_table` creates
//! it, and the engine calls that while holding the migration lock.

use crate::executor::Executor;
use crate::migration::{AppliedRecord, MigrationError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

/// Default ledger table name
pub const DEFAULT_LEDGER_TABLE: &str = "tidemark_schema_migrations";

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern is valid")
});

/// Durable record of applied migrations
///
/// `PgLedger` is the production implementation; the trait exists so the engine
/// can be exercised without a database.
pub trait Ledger {
    /// Create the ledger table if it does not exist
    ///
    /// Callers hold the migration lock: concurrent `CREATE TABLE IF NOT EXISTS`
    /// on the same name can still fail with a unique violation in PostgreSQL.
    ///
    /// # Errors
    ///
    /// `MigrationError::Database` if the DDL fails.
    fn ensure_table(&self, db: &dyn Executor) -> Result<(), MigrationError>;

    /// Every applied migration, ascending by version
    ///
    /// Empty when the ledger table has not been created yet.
    ///
    /// # Errors
    ///
    /// `MigrationError::Database` if the query or row decoding fails.
    fn applied_records(&self, db: &dyn Executor) -> Result<Vec<AppliedRecord>, MigrationError>;

    /// Record `version` as applied now (upsert; safe to repeat)
    ///
    /// # Errors
    ///
    /// `MigrationError::Database` if the write fails.
    fn mark_applied(&self, db: &dyn Executor, version: i64, name: &str)
        -> Result<(), MigrationError>;

    /// Forget `version` (no-op if absent)
    ///
    /// # Errors
    ///
    /// `MigrationError::Database` if the write fails.
    fn mark_rolled_back(&self, db: &dyn Executor, version: i64) -> Result<(), MigrationError>;

    /// Applied versions as an ordered map of `version -> applied`
    ///
    /// # Errors
    ///
    /// Same as [`Ledger::applied_records`].
    fn applied_versions(&self, db: &dyn Executor) -> Result<BTreeMap<i64, bool>, MigrationError> {
        Ok(self
            .applied_records(db)?
            .into_iter()
            .map(|record| (record.version, true))
            .collect())
    }

    /// Highest applied version, if any
    ///
    /// # Errors
    ///
    /// Same as [`Ledger::applied_records`].
    fn latest_applied(&self, db: &dyn Executor) -> Result<Option<i64>, MigrationError> {
        Ok(self.applied_versions(db)?.keys().next_back().copied())
    }
}

/// PostgreSQL ledger table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgLedger {
    table: String,
}

impl Default for PgLedger {
    fn default() -> Self {
        Self {
            table: DEFAULT_LEDGER_TABLE.to_string(),
        }
    }
}

impl PgLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different ledger table
    ///
    /// The name is interpolated into SQL, so only plain identifiers are accepted.
    ///
    /// # Errors
    ///
    /// `MigrationError::InvalidName` if `table` is not a plain SQL identifier.
    pub fn with_table(table: impl Into<String>) -> Result<Self, MigrationError> {
        let table = table.into();
        if !IDENTIFIER.is_match(&table) {
            return Err(MigrationError::InvalidName(format!(
                "ledger table '{table}' must be a plain SQL identifier"
            )));
        }
        Ok(Self { table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn create_table_sql(&self) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                version    BIGINT      PRIMARY KEY,
                name       TEXT        NOT NULL,
                is_applied BOOLEAN     NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            self.table
        )
    }

    fn table_exists(&self, db: &dyn Executor) -> Result<bool, MigrationError> {
        let found = db.execute(
            "SELECT 1 WHERE to_regclass($1) IS NOT NULL",
            &[&self.table.as_str()],
        )?;
        Ok(found == 1)
    }
}

impl Ledger for PgLedger {
    fn ensure_table(&self, db: &dyn Executor) -> Result<(), MigrationError> {
        db.execute(&self.create_table_sql(), &[])?;
        Ok(())
    }

    fn applied_records(&self, db: &dyn Executor) -> Result<Vec<AppliedRecord>, MigrationError> {
        if !self.table_exists(db)? {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT version, name, applied_at FROM {} WHERE is_applied ORDER BY version ASC",
            self.table
        );

        let rows = db.query_all(&sql, &[])?;
        let mut records = rows
            .iter()
            .map(AppliedRecord::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // ORDER BY already sorts; keep the guarantee independent of the SQL
        records.sort_by_key(|r| r.version);
        Ok(records)
    }

    fn mark_applied(
        &self,
        db: &dyn Executor,
        version: i64,
        name: &str,
    ) -> Result<(), MigrationError> {
        let sql = format!(
            r#"
            INSERT INTO {} (version, name, is_applied)
            VALUES ($1, $2, true)
            ON CONFLICT (version) DO UPDATE
            SET name = EXCLUDED.name, is_applied = true, applied_at = now()
            "#,
            self.table
        );
        db.execute(&sql, &[&version, &name])?;
        Ok(())
    }

    fn mark_rolled_back(&self, db: &dyn Executor, version: i64) -> Result<(), MigrationError> {
        let sql = format!("DELETE FROM {} WHERE version = $1", self.table);
        db.execute(&sql, &[&version])?;
        Ok(())
    }
}
