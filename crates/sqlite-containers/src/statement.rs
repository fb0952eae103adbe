// crates/sqlite-containers/src/statement.rs
// ============================================================================
// Module: Statement Handles
// Description: Cached prepared statements with statement-level busy retry.
// Purpose: Run single statements without surfacing transient lock contention.
// Dependencies: rusqlite, tracing
// ============================================================================

//! ## Overview
//! A [`StatementHandle`] names one SQL statement and runs it through the
//! connection's prepared-statement cache, so the statement is compiled once
//! per connection. The cached statement is reset and its bindings cleared
//! when it is returned to the cache, on every exit path including errors.
//!
//! Every run goes through [`BusyRetry`]: once the engine's own busy handler
//! gives up, the statement sleeps for the configured delay and runs again.
//! This retry is local to one statement and independent of transaction
//! rollback.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::thread;
use std::time::Duration;

use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::Row;
use rusqlite::ToSql;
use rusqlite::ffi;
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::StoreError;

// ============================================================================
// SECTION: Busy Retry
// ============================================================================

/// Statement-level retry policy for `SQLITE_BUSY`.
///
/// # Invariants
/// - `delay` is non-zero for validated configs.
/// - `max_retries == None` retries until the statement stops reporting busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyRetry {
    /// Sleep between attempts.
    delay: Duration,
    /// Optional retry ceiling.
    max_retries: Option<u32>,
}

impl BusyRetry {
    /// Creates a retry policy.
    #[must_use]
    pub const fn new(delay: Duration, max_retries: Option<u32>) -> Self {
        Self {
            delay,
            max_retries,
        }
    }

    /// Builds the retry policy described by a store config.
    #[must_use]
    pub const fn from_config(config: &StoreConfig) -> Self {
        Self::new(Duration::from_millis(config.busy_retry_delay_ms), config.max_busy_retries)
    }

    /// Returns the delay between attempts.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Returns the retry ceiling, if any.
    #[must_use]
    pub const fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    /// Runs `attempt` until it succeeds, fails with a non-busy error, or the
    /// retry ceiling is reached.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Busy`] when the ceiling is exceeded, otherwise
    /// the normalized error of the failing attempt.
    pub fn run<T>(
        &self,
        label: &str,
        mut attempt: impl FnMut() -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut retries: u32 = 0;
        loop {
            match attempt() {
                Ok(value) => return Ok(value),
                Err(err) if is_busy(&err) => {
                    if self.max_retries.is_some_and(|max| retries >= max) {
                        return Err(StoreError::Busy {
                            attempts: retries.saturating_add(1),
                        });
                    }
                    retries = retries.saturating_add(1);
                    debug!(
                        statement = label,
                        retry = retries,
                        "sqlite busy, retrying statement"
                    );
                    thread::sleep(self.delay);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Returns true when the engine reported transient lock contention.
///
/// A stale WAL read snapshot (`SQLITE_BUSY_SNAPSHOT`) never clears by waiting
/// and is not treated as transient.
#[must_use]
pub fn is_busy(error: &rusqlite::Error) -> bool {
    error.sqlite_error().is_some_and(|native| {
        matches!(native.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            && native.extended_code != ffi::SQLITE_BUSY_SNAPSHOT
    })
}

// ============================================================================
// SECTION: Statement Handle
// ============================================================================

/// One named SQL statement executed through the prepared-statement cache.
///
/// # Invariants
/// - `sql` holds exactly one statement.
/// - Handles never hold a live statement between calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementHandle {
    /// Short name used in logs.
    label: &'static str,
    /// Statement text.
    sql: String,
}

impl StatementHandle {
    /// Creates a statement handle.
    #[must_use]
    pub fn new(label: &'static str, sql: impl Into<String>) -> Self {
        Self {
            label,
            sql: sql.into(),
        }
    }

    /// Returns the log label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        self.label
    }

    /// Returns the statement text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Compiles the statement into the connection cache without running it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement does not compile.
    pub fn prepare(&self, connection: &Connection, retry: &BusyRetry) -> Result<(), StoreError> {
        retry.run(self.label, || connection.prepare_cached(&self.sql).map(drop))
    }

    /// Executes the statement and returns the number of changed rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn execute(
        &self,
        connection: &Connection,
        retry: &BusyRetry,
        params: &[&dyn ToSql],
    ) -> Result<usize, StoreError> {
        retry.run(self.label, || {
            let mut statement = connection.prepare_cached(&self.sql)?;
            statement.execute(params)
        })
    }

    /// Runs the statement and maps the first row, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement or the row mapping fails.
    pub fn query_optional<T>(
        &self,
        connection: &Connection,
        retry: &BusyRetry,
        params: &[&dyn ToSql],
        mut map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Option<T>, StoreError> {
        retry.run(self.label, || {
            let mut statement = connection.prepare_cached(&self.sql)?;
            let mut rows = statement.query(params)?;
            rows.next()?.map(&mut map).transpose()
        })
    }

    /// Runs the statement and maps every row.
    ///
    /// A busy failure midway discards the partial result and restarts the
    /// query.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement or a row mapping fails.
    pub fn query_all<T>(
        &self,
        connection: &Connection,
        retry: &BusyRetry,
        params: &[&dyn ToSql],
        mut map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>, StoreError> {
        retry.run(self.label, || {
            let mut statement = connection.prepare_cached(&self.sql)?;
            let mut rows = statement.query(params)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(map(row)?);
            }
            Ok(out)
        })
    }

    /// Runs a statement returning one non-negative integer, such as a count.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails, returns no row, or
    /// returns a negative value.
    pub fn query_scalar_u64(
        &self,
        connection: &Connection,
        retry: &BusyRetry,
        params: &[&dyn ToSql],
    ) -> Result<u64, StoreError> {
        self.query_optional(connection, retry, params, |row| column_u64(row, 0))?
            .ok_or_else(|| StoreError::engine(format!("{} returned no rows", self.label)))
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Reads a non-negative integer column as `u64`.
///
/// # Errors
///
/// Returns [`rusqlite::Error::IntegralValueOutOfRange`] for negative values.
pub fn column_u64(row: &Row<'_>, index: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(index)?;
    u64::try_from(raw).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(index, raw))
}

// ============================================================================
// SECTION: Tests
// ============================================================================
