//! Executor Module
//!
//! Provides the `Executor` trait that abstracts statement execution over `may_postgres`.
//!
//! The migration engine, the version ledger and the lock coordinator only ever talk to
//! the database through this trait, so a transaction, a bare client, or a test double
//! can be swapped in without the engine noticing.

use may_postgres::types::ToSql;
use may_postgres::{Client, Error as PostgresError, Row};
use std::time::Instant;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Database error type
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `PostgreSQL` error from `may_postgres`
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] PostgresError),
    /// Row decoding error
    #[error("Decode error: {0}")]
    Decode(String),
    /// The transaction was already committed or rolled back
    #[error("Transaction is closed")]
    TransactionClosed,
    /// Other execution errors
    #[error("Execution error: {0}")]
    Other(String),
}

/// Trait for executing database operations
///
/// # Examples
///
/// ```no_run
/// use tidemark::{connect, Executor, PostgresExecutor};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = connect("host=localhost user=postgres dbname=app")?;
/// let executor = PostgresExecutor::new(client);
///
/// executor.batch_execute("CREATE TABLE x(id int); CREATE INDEX x_id ON x(id);")?;
/// let deleted = executor.execute("DELETE FROM x WHERE id = $1", &[&42i32])?;
/// # Ok(())
/// # }
/// ```
pub trait Executor {
    /// Execute a single SQL statement and return the number of rows affected
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the statement fails.
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, DbError>;

    /// Execute a script of zero or more `;`-separated statements
    ///
    /// Uses the simple query protocol, so no parameters are accepted. This is how
    /// migration scripts are run: as one opaque unit of SQL text.
    ///
    /// # Errors
    ///
    /// Returns `DbError` on the first failing statement.
    fn batch_execute(&self, script: &str) -> Result<(), DbError>;

    /// Execute a query and return all rows
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the query fails.
    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError>;
}

/// Implementation of `Executor` for `may_postgres::Client`
///
/// A `may_postgres::Client` is a single session, which matters here: the advisory
/// lock is session scoped, so the lock and the migration transaction must run on
/// the same executor.
pub struct PostgresExecutor {
    client: Client,
}

impl PostgresExecutor {
    /// Create a new executor from a `may_postgres::Client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Get a reference to the underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Consume the executor and return the underlying client
    pub fn into_client(self) -> Client {
        self.client
    }
}

impl Executor for PostgresExecutor {
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_query_span(query).entered();

        let start = Instant::now();
        let result = self.client.execute(query, params).map_err(|e| {
            #[cfg(feature = "metrics")]
            METRICS.record_query_error();
            DbError::Postgres(e)
        });

        log::trace!("execute ({:?}): {}", start.elapsed(), query);
        result
    }

    fn batch_execute(&self, script: &str) -> Result<(), DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_query_span(script).entered();

        let start = Instant::now();
        let result = self.client.batch_execute(script).map_err(|e| {
            #[cfg(feature = "metrics")]
            METRICS.record_query_error();
            DbError::Postgres(e)
        });

        log::trace!("batch_execute ({:?}): {} bytes", start.elapsed(), script.len());
        result
    }

    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_query_span(query).entered();

        let start = Instant::now();
        let result = self.client.query(query, params).map_err(|e| {
            #[cfg(feature = "metrics")]
            METRICS.record_query_error();
            DbError::Postgres(e)
        });

        log::trace!("query ({:?}): {}", start.elapsed(), query);
        result
    }
}
