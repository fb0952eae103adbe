// crates/sqlite-containers/src/transaction.rs
// ============================================================================
// Module: Transaction Controller
// Description: Begin/commit/rollback wrapper for multi-statement operations.
// Purpose: Guarantee that a failed operation leaves no partial writes.
// Dependencies: rusqlite, serde, tracing
// ============================================================================

//! ## Overview
//! [`TransactionController::run`] executes an operation body between
//! `BEGIN <mode>` and `COMMIT`. Any error or panic in the body rolls the whole
//! operation back before the error reaches the caller. When the caller already
//! opened a transaction with [`TransactionController::begin`], the body runs
//! inside a savepoint instead, so it stays all-or-nothing without ending the
//! outer transaction.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::panic;
use std::panic::AssertUnwindSafe;

use rusqlite::Connection;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::error::StoreError;
use crate::statement::BusyRetry;
use crate::statement::StatementHandle;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Savepoint name used for operations nested in a caller transaction.
const OPERATION_SAVEPOINT: &str = "sqlite_containers_operation";

// ============================================================================
// SECTION: Transaction Mode
// ============================================================================

/// Lock acquisition strategy for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// Locks are acquired lazily on first read or write.
    #[default]
    Deferred,
    /// A write lock is acquired immediately.
    Immediate,
    /// Readers and writers are excluded for the whole transaction.
    Exclusive,
}

impl TransactionMode {
    /// Returns the SQL keyword for `BEGIN <mode> TRANSACTION`.
    #[must_use]
    pub const fn sql_keyword(self) -> &'static str {
        match self {
            Self::Deferred => "DEFERRED",
            Self::Immediate => "IMMEDIATE",
            Self::Exclusive => "EXCLUSIVE",
        }
    }
}

// ============================================================================
// SECTION: Controller
// ============================================================================

/// How an operation body is scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// The controller owns a full transaction.
    Transaction,
    /// The body runs inside a savepoint of a caller transaction.
    Savepoint,
}

/// Pre-built transaction statements for one connection.
#[derive(Debug, Clone)]
pub struct TransactionController {
    /// `BEGIN DEFERRED TRANSACTION`.
    begin_deferred: StatementHandle,
    /// `BEGIN IMMEDIATE TRANSACTION`.
    begin_immediate: StatementHandle,
    /// `BEGIN EXCLUSIVE TRANSACTION`.
    begin_exclusive: StatementHandle,
    /// `COMMIT TRANSACTION`.
    commit: StatementHandle,
    /// `ROLLBACK TRANSACTION`.
    rollback: StatementHandle,
    /// Opens the operation savepoint.
    savepoint: StatementHandle,
    /// Releases the operation savepoint.
    release: StatementHandle,
    /// Undoes work since the operation savepoint.
    rollback_to: StatementHandle,
    /// Retry policy applied to every control statement.
    retry: BusyRetry,
}

impl TransactionController {
    /// Builds the controller and compiles its statements on `connection`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when a statement fails to compile.
    pub fn prepare(connection: &Connection, retry: BusyRetry) -> Result<Self, StoreError> {
        let begin = |mode: TransactionMode| {
            StatementHandle::new("begin", format!("BEGIN {} TRANSACTION", mode.sql_keyword()))
        };
        let controller = Self {
            begin_deferred: begin(TransactionMode::Deferred),
            begin_immediate: begin(TransactionMode::Immediate),
            begin_exclusive: begin(TransactionMode::Exclusive),
            commit: StatementHandle::new("commit", "COMMIT TRANSACTION"),
            rollback: StatementHandle::new("rollback", "ROLLBACK TRANSACTION"),
            savepoint: StatementHandle::new("savepoint", format!("SAVEPOINT {OPERATION_SAVEPOINT}")),
            release: StatementHandle::new(
                "release",
                format!("RELEASE SAVEPOINT {OPERATION_SAVEPOINT}"),
            ),
            rollback_to: StatementHandle::new(
                "rollback_to",
                format!("ROLLBACK TRANSACTION TO SAVEPOINT {OPERATION_SAVEPOINT}"),
            ),
            retry,
        };
        for handle in [
            &controller.begin_deferred,
            &controller.begin_immediate,
            &controller.begin_exclusive,
            &controller.commit,
            &controller.rollback,
        ] {
            handle.prepare(connection, &controller.retry)?;
        }
        Ok(controller)
    }

    /// Returns the retry policy shared by every statement of the session.
    #[must_use]
    pub const fn retry(&self) -> &BusyRetry {
        &self.retry
    }

    /// Returns true while a transaction is open on `connection`.
    #[must_use]
    pub fn in_transaction(connection: &Connection) -> bool {
        !connection.is_autocommit()
    }

    /// Opens a caller-controlled transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the engine refuses, for example because a
    /// transaction is already open.
    pub fn begin(&self, connection: &Connection, mode: TransactionMode) -> Result<(), StoreError> {
        let handle = match mode {
            TransactionMode::Deferred => &self.begin_deferred,
            TransactionMode::Immediate => &self.begin_immediate,
            TransactionMode::Exclusive => &self.begin_exclusive,
        };
        handle.execute(connection, &self.retry, &[]).map(drop)
    }

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when no transaction is open or commit fails.
    pub fn commit(&self, connection: &Connection) -> Result<(), StoreError> {
        self.commit.execute(connection, &self.retry, &[]).map(drop)
    }

    /// Rolls back the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when no transaction is open or rollback fails.
    pub fn rollback(&self, connection: &Connection) -> Result<(), StoreError> {
        self.rollback.execute(connection, &self.retry, &[]).map(drop)
    }

    /// Runs `body` atomically.
    ///
    /// A body error is returned unchanged after rollback; a panic in the body
    /// becomes [`StoreError::Aborted`].
    ///
    /// # Errors
    ///
    /// Returns the body's error, or [`StoreError`] when the transaction cannot
    /// be opened or committed.
    pub fn run<T>(
        &self,
        connection: &Connection,
        mode: TransactionMode,
        body: impl FnOnce() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let scope = if Self::in_transaction(connection) {
            self.savepoint.execute(connection, &self.retry, &[])?;
            Scope::Savepoint
        } else {
            self.begin(connection, mode)?;
            Scope::Transaction
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|_| {
            Err(StoreError::Aborted("operation body panicked".to_string()))
        });
        let finished = outcome.and_then(|value| self.finish(connection, scope).map(|()| value));
        if let Err(err) = &finished {
            warn!(error = %err, mode = mode.sql_keyword(), "rolling back failed operation");
            self.abandon(connection, scope);
        }
        finished
    }

    /// Commits or releases the operation scope.
    fn finish(&self, connection: &Connection, scope: Scope) -> Result<(), StoreError> {
        match scope {
            Scope::Transaction => self.commit(connection),
            Scope::Savepoint => self.release.execute(connection, &self.retry, &[]).map(drop),
        }
    }

    /// Undoes the operation scope; failures here are logged, not returned.
    fn abandon(&self, connection: &Connection, scope: Scope) {
        let result = match scope {
            // The engine may already have rolled back on its own (disk full).
            Scope::Transaction if !Self::in_transaction(connection) => Ok(()),
            Scope::Transaction => self.rollback(connection),
            Scope::Savepoint => self
                .rollback_to
                .execute(connection, &self.retry, &[])
                .and_then(|_| self.release.execute(connection, &self.retry, &[]))
                .map(drop),
        };
        if let Err(err) = result {
            warn!(error = %err, "rollback failed");
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        reason = "Test assertions use expect/unwrap for clarity."
    )]

    use std::time::Duration;

    use rusqlite::Connection;

    use super::TransactionController;
    use super::TransactionMode;
    use crate::error::StoreError;
    use crate::statement::BusyRetry;

    fn setup() -> (Connection, TransactionController) {
        let connection = Connection::open_in_memory().unwrap();
        connection.execute_batch("CREATE TABLE t (v INTEGER NOT NULL UNIQUE)").unwrap();
        let controller =
            TransactionController::prepare(&connection, BusyRetry::new(Duration::from_millis(1), None))
                .unwrap();
        (connection, controller)
    }

    fn rows(connection: &Connection) -> i64 {
        connection.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn body_error_rolls_back_every_write() {
        let (connection, controller) = setup();
        let result = controller.run(&connection, TransactionMode::Immediate, || {
            connection.execute("INSERT INTO t (v) VALUES (1)", [])?;
            connection.execute("INSERT INTO t (v) VALUES (1)", [])?;
            Ok(())
        });
        assert!(matches!(result, Err(StoreError::Engine { .. })));
        assert_eq!(rows(&connection), 0);
        assert!(connection.is_autocommit());
    }

    #[test]
    fn panic_becomes_aborted_and_rolls_back() {
        let (connection, controller) = setup();
        let result: Result<(), StoreError> =
            controller.run(&connection, TransactionMode::Deferred, || {
                connection.execute("INSERT INTO t (v) VALUES (1)", [])?;
                panic!("body exploded");
            });
        assert!(matches!(result, Err(StoreError::Aborted(_))));
        assert_eq!(rows(&connection), 0);
        assert!(connection.is_autocommit());
    }

    #[test]
    fn nested_run_uses_savepoint_inside_caller_transaction() {
        let (connection, controller) = setup();
        controller.begin(&connection, TransactionMode::Deferred).unwrap();
        connection.execute("INSERT INTO t (v) VALUES (1)", []).unwrap();
        let failed = controller.run(&connection, TransactionMode::Deferred, || {
            connection.execute("INSERT INTO t (v) VALUES (2)", [])?;
            connection.execute("INSERT INTO t (v) VALUES (2)", [])?;
            Ok(())
        });
        assert!(failed.is_err());
        assert!(!connection.is_autocommit());
        controller
            .run(&connection, TransactionMode::Deferred, || {
                connection.execute("INSERT INTO t (v) VALUES (3)", [])?;
                Ok(())
            })
            .unwrap();
        controller.commit(&connection).unwrap();
        let values: Vec<i64> = connection
            .prepare("SELECT v FROM t ORDER BY v")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(values, vec![1, 3]);
    }

    #[test]
    fn begin_inside_open_transaction_is_an_engine_error() {
        let (connection, controller) = setup();
        controller.begin(&connection, TransactionMode::Exclusive).unwrap();
        let error = controller.begin(&connection, TransactionMode::Deferred).unwrap_err();
        assert!(matches!(error, StoreError::Engine { .. }));
        controller.rollback(&connection).unwrap();
    }
}
