//! Test doubles for the executor and ledger seams

use crate::executor::{DbError, Executor};
use crate::migration::{AppliedRecord, Ledger, MigrationError, PgLedger};
use chrono::Utc;
use may_postgres::types::ToSql;
use may_postgres::Row;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

/// Executor that records every statement instead of running it
///
/// Statements are stored with whitespace collapsed, so multi-line SQL can be
/// compared against a single-line literal.
pub(crate) struct RecordingExecutor {
    statements: RefCell<Vec<String>>,
    lock_busy_polls: Cell<usize>,
    ledger_table: bool,
    fail_on: Option<String>,
}

impl RecordingExecutor {
    pub(crate) fn new() -> Self {
        Self {
            statements: RefCell::new(Vec::new()),
            lock_busy_polls: Cell::new(0),
            ledger_table: false,
            fail_on: None,
        }
    }

    /// Report the advisory lock as taken for the next `polls` attempts
    pub(crate) fn lock_busy_for(self, polls: usize) -> Self {
        self.lock_busy_polls.set(polls);
        self
    }

    /// Report the ledger table as present; by default it does not exist
    pub(crate) fn with_ledger_table(mut self) -> Self {
        self.ledger_table = true;
        self
    }

    /// Fail any statement containing `needle`
    pub(crate) fn fail_on(mut self, needle: &str) -> Self {
        self.fail_on = Some(needle.to_string());
        self
    }

    pub(crate) fn statements(&self) -> Vec<String> {
        self.statements.borrow().clone()
    }

    pub(crate) fn count(&self, statement: &str) -> usize {
        self.statements
            .borrow()
            .iter()
            .filter(|s| s.as_str() == statement)
            .count()
    }

    fn record(&self, sql: &str) -> Result<(), DbError> {
        let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ");
        self.statements.borrow_mut().push(normalized);
        match &self.fail_on {
            Some(needle) if sql.contains(needle.as_str()) => {
                Err(DbError::Other(format!("forced failure on '{needle}'")))
            }
            _ => Ok(()),
        }
    }
}

impl Executor for RecordingExecutor {
    fn execute(&self, query: &str, _params: &[&dyn ToSql]) -> Result<u64, DbError> {
        self.record(query)?;
        if query.contains("pg_try_advisory_lock") {
            let busy = self.lock_busy_polls.get();
            if busy > 0 {
                self.lock_busy_polls.set(busy.saturating_sub(1));
                return Ok(0);
            }
            return Ok(1);
        }
        if query.contains("to_regclass") {
            return Ok(u64::from(self.ledger_table));
        }
        Ok(0)
    }

    fn batch_execute(&self, script: &str) -> Result<(), DbError> {
        self.record(script)
    }

    fn query_all(&self, query: &str, _params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError> {
        self.record(query)?;
        Ok(Vec::new())
    }
}

/// Ledger with a fixed applied set whose writes go through `PgLedger`'s SQL
///
/// Reads never touch the executor; writes are recorded by it so tests can check
/// they land inside the migration transaction.
pub(crate) struct StubLedger {
    applied: RefCell<BTreeMap<i64, String>>,
    sql: PgLedger,
}

impl StubLedger {
    pub(crate) fn empty() -> Self {
        Self::with_applied(&[])
    }

    pub(crate) fn with_applied(applied: &[(i64, &str)]) -> Self {
        Self {
            applied: RefCell::new(
                applied
                    .iter()
                    .map(|(v, n)| (*v, (*n).to_string()))
                    .collect(),
            ),
            sql: PgLedger::new(),
        }
    }
}

impl Ledger for StubLedger {
    fn ensure_table(&self, _db: &dyn Executor) -> Result<(), MigrationError> {
        Ok(())
    }

    fn applied_records(&self, _db: &dyn Executor) -> Result<Vec<AppliedRecord>, MigrationError> {
        Ok(self
            .applied
            .borrow()
            .iter()
            .map(|(version, name)| AppliedRecord::new(*version, name.clone(), Utc::now()))
            .collect())
    }

    fn mark_applied(
        &self,
        db: &dyn Executor,
        version: i64,
        name: &str,
    ) -> Result<(), MigrationError> {
        self.sql.mark_applied(db, version, name)
    }

    fn mark_rolled_back(&self, db: &dyn Executor, version: i64) -> Result<(), MigrationError> {
        self.sql.mark_rolled_back(db, version)
    }
}
