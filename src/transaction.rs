//! Transaction Module
//!
//! A `Transaction` borrows an [`Executor`] and brackets its statements with
//! `BEGIN` and `COMMIT`/`ROLLBACK`. It implements `Executor` itself, so the
//! version ledger and migration scripts run inside it unchanged.
//!
//! Dropping a transaction that was neither committed nor rolled back issues a
//! `ROLLBACK`. That covers early `?` returns as well as panics unwinding through
//! the migration engine.

use crate::executor::{DbError, Executor};
use may_postgres::types::ToSql;
use may_postgres::Row;
use std::time::Duration;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// A database transaction on a borrowed executor
///
/// # Examples
///
/// ```no_run
/// use tidemark::{connect, Executor, PostgresExecutor, Transaction};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let executor = PostgresExecutor::new(connect("host=localhost user=postgres")?);
///
/// let tx = Transaction::begin(&executor)?;
/// tx.batch_execute("CREATE TABLE x(id int);")?;
/// tx.commit()?;
/// # Ok(())
/// # }
/// ```
pub struct Transaction<'a> {
    executor: &'a dyn Executor,
    closed: bool,
}

impl<'a> Transaction<'a> {
    /// Start a new transaction
    ///
    /// # Errors
    ///
    /// Returns `DbError` if `BEGIN` fails.
    pub fn begin(executor: &'a dyn Executor) -> Result<Self, DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::begin_transaction_span().entered();

        executor.execute("BEGIN", &[])?;
        Ok(Self {
            executor,
            closed: false,
        })
    }

    /// Bound every following statement in this transaction by `timeout`
    ///
    /// Uses `SET LOCAL`, so the setting disappears with the transaction.
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the setting cannot be applied.
    pub fn set_statement_timeout(&self, timeout: Duration) -> Result<(), DbError> {
        // 0 means "no timeout" to PostgreSQL, so never send it
        let millis = timeout.as_millis().max(1);
        let sql = format!("SET LOCAL statement_timeout = {millis}");
        self.execute(&sql, &[])?;
        Ok(())
    }

    /// Commit the transaction
    ///
    /// # Errors
    ///
    /// Returns `DbError` if `COMMIT` fails. The transaction counts as closed either way.
    pub fn commit(mut self) -> Result<(), DbError> {
        if self.closed {
            return Err(DbError::TransactionClosed);
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::commit_transaction_span().entered();

        self.closed = true;
        self.executor.execute("COMMIT", &[])?;
        Ok(())
    }

    /// Roll the transaction back
    ///
    /// # Errors
    ///
    /// Returns `DbError` if `ROLLBACK` fails.
    pub fn rollback(mut self) -> Result<(), DbError> {
        if self.closed {
            return Err(DbError::TransactionClosed);
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::rollback_transaction_span().entered();

        self.closed = true;
        self.executor.execute("ROLLBACK", &[])?;
        Ok(())
    }

    /// Check if the transaction is closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.executor.execute("ROLLBACK", &[]) {
                log::warn!("Failed to roll back abandoned transaction: {e}");
            }
        }
    }
}

impl Executor for Transaction<'_> {
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, DbError> {
        if self.closed {
            return Err(DbError::TransactionClosed);
        }
        self.executor.execute(query, params)
    }

    fn batch_execute(&self, script: &str) -> Result<(), DbError> {
        if self.closed {
            return Err(DbError::TransactionClosed);
        }
        self.executor.batch_execute(script)
    }

    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError> {
        if self.closed {
            return Err(DbError::TransactionClosed);
        }
        self.executor.query_all(query, params)
    }
}
