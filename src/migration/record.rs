//! Rows of the version ledger and the status view built from them

use crate::executor::DbError;
use chrono::{DateTime, Utc};

/// One row of the ledger table: a migration that is currently applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedRecord {
    /// Migration version (primary key)
    pub version: i64,

    /// Migration name at the time it was applied
    pub name: String,

    /// When the migration was (last) applied
    pub applied_at: DateTime<Utc>,
}

impl AppliedRecord {
    #[must_use]
    pub fn new(version: i64, name: impl Into<String>, applied_at: DateTime<Utc>) -> Self {
        Self {
            version,
            name: name.into(),
            applied_at,
        }
    }

    /// Create an `AppliedRecord` from a ledger row
    ///
    /// Expected column order: `version`, `name`, `applied_at`
    ///
    /// # Errors
    ///
    /// Returns `DbError::Decode` if a column is missing or has an unexpected type.
    pub fn from_row(row: &may_postgres::Row) -> Result<Self, DbError> {
        let decode = |column: &str, e: may_postgres::Error| {
            DbError::Decode(format!("ledger column '{column}': {e}"))
        };

        let version: i64 = row.try_get(0).map_err(|e| decode("version", e))?;
        let name: String = row.try_get(1).map_err(|e| decode("name", e))?;
        let applied_at: DateTime<Utc> = row.try_get(2).map_err(|e| decode("applied_at", e))?;

        Ok(Self {
            version,
            name,
            applied_at,
        })
    }
}

/// One line of `status` output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEntry {
    pub version: i64,
    pub applied: bool,
}
