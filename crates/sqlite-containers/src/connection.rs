// crates/sqlite-containers/src/connection.rs
// ============================================================================
// Module: Connection Manager
// Description: Owns the SQLite handle, its schema, and the instance mutex.
// Purpose: Serialize every operation of one store instance on one connection.
// Dependencies: rusqlite, tracing
// ============================================================================

//! ## Overview
//! [`Database`] is the shared foundation of every store variant. It holds one
//! mutex over an optional [`Session`]: the open connection, its config, its
//! transaction controller, and the schema object `S` returned by the store's
//! provisioning closure. Every logical operation runs under that mutex, so
//! cached statements are never interleaved across threads.
//!
//! A store may run one background task on its own thread. The task sees the
//! database only through [`BackgroundContext`], which takes the same mutex.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::StoreConfig;
use crate::config::ensure_parent_dir;
use crate::error::StoreError;
use crate::statement::BusyRetry;
use crate::transaction::TransactionController;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Prepared statements kept per connection.
const STATEMENT_CACHE_CAPACITY: usize = 64;

// ============================================================================
// SECTION: Session
// ============================================================================

/// Schema provisioning callback supplied by a store variant.
///
/// Runs once per connect, after pragmas, and returns the variant's schema
/// object (table names and statement handles).
pub type Provisioner<S> =
    Arc<dyn Fn(&Connection, &StoreConfig) -> Result<S, StoreError> + Send + Sync>;

/// One open connection and everything derived from it.
///
/// # Invariants
/// - Only reachable while the owning [`Database`] mutex is held.
/// - `schema` was provisioned against `connection` with `config`.
pub struct Session<S> {
    /// Native connection handle.
    connection: Connection,
    /// Configuration the connection was opened with.
    config: StoreConfig,
    /// Transaction statements for this connection.
    transactions: TransactionController,
    /// Schema object returned by the provisioner.
    schema: S,
}

impl<S> Session<S> {
    /// Returns the connection.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Returns the connection's configuration.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the transaction controller.
    #[must_use]
    pub const fn transactions(&self) -> &TransactionController {
        &self.transactions
    }

    /// Returns the statement retry policy.
    #[must_use]
    pub const fn retry(&self) -> &BusyRetry {
        self.transactions.retry()
    }

    /// Returns the provisioned schema.
    #[must_use]
    pub const fn schema(&self) -> &S {
        &self.schema
    }
}

impl<S> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("path", &self.config.path)
            .field("table_name", &self.config.table_name)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SECTION: Database
// ============================================================================

/// State shared with the background task.
struct Shared<S> {
    /// The instance mutex.
    session: Mutex<Option<Session<S>>>,
}

impl<S> Shared<S> {
    /// Locks the instance mutex.
    fn lock(&self) -> Result<MutexGuard<'_, Option<Session<S>>>, StoreError> {
        self.session.lock().map_err(|_| StoreError::Io("store mutex poisoned".to_string()))
    }

    /// Runs `operation` on the open session.
    fn with_session<T>(
        &self,
        operation: impl FnOnce(&Session<S>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.lock()?;
        let session = guard.as_ref().ok_or(StoreError::NotConnected)?;
        operation(session)
    }
}

/// Handle to the running background task.
struct Background {
    /// Set to ask the task to stop.
    shutdown: Arc<AtomicBool>,
    /// Task thread.
    thread: JoinHandle<()>,
}

/// Connection manager shared by every store variant.
///
/// # Invariants
/// - At most one connection is open at a time.
/// - At most one background task runs at a time.
pub struct Database<S> {
    /// Mutex-protected session.
    shared: Arc<Shared<S>>,
    /// Schema provisioning callback.
    provisioner: Provisioner<S>,
    /// Background task, if running.
    background: Mutex<Option<Background>>,
}

impl<S> fmt::Debug for Database<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl<S> Database<S> {
    /// Creates a disconnected database with the given provisioner.
    pub fn new(
        provisioner: impl Fn(&Connection, &StoreConfig) -> Result<S, StoreError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                session: Mutex::new(None),
            }),
            provisioner: Arc::new(provisioner),
            background: Mutex::new(None),
        }
    }

    /// Opens a connection with `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyConnected`] when a connection is open, or
    /// the error of validation, file creation, pragmas, or provisioning.
    pub fn connect(&self, config: StoreConfig) -> Result<(), StoreError> {
        let mut guard = self.shared.lock()?;
        if guard.is_some() {
            return Err(StoreError::AlreadyConnected);
        }
        *guard = Some(self.open_session(config)?);
        Ok(())
    }

    /// Closes any open connection and connects with `config`.
    ///
    /// A running background task keeps running against the new connection.
    ///
    /// # Errors
    ///
    /// Returns the error of opening the new connection; the store is left
    /// disconnected in that case.
    pub fn reconnect(&self, config: StoreConfig) -> Result<(), StoreError> {
        let mut guard = self.shared.lock()?;
        if let Some(previous) = guard.take() {
            close_session(previous);
        }
        *guard = Some(self.open_session(config)?);
        Ok(())
    }

    /// Stops the background task and closes the connection. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the mutex is poisoned.
    pub fn disconnect(&self) -> Result<(), StoreError> {
        self.stop_background()?;
        let mut guard = self.shared.lock()?;
        if let Some(session) = guard.take() {
            close_session(session);
        }
        Ok(())
    }

    /// Returns true while a connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.lock().is_ok_and(|guard| guard.is_some())
    }

    /// Runs `operation` under the instance mutex.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotConnected`] when no connection is open, or
    /// the operation's error.
    pub fn with_session<T>(
        &self,
        operation: impl FnOnce(&Session<S>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.shared.with_session(operation)
    }

    /// Opens, tunes, and provisions a new session.
    fn open_session(&self, config: StoreConfig) -> Result<Session<S>, StoreError> {
        config.validate()?;
        let connection = open_connection(&config)?;
        apply_pragmas(&connection, &config)?;
        let schema = (self.provisioner)(&connection, &config)?;
        let transactions =
            TransactionController::prepare(&connection, BusyRetry::from_config(&config))?;
        info!(
            path = %config.path.display(),
            in_memory = config.in_memory,
            read_only = config.read_only,
            table_name = config.table_name.as_str(),
            "sqlite store connected"
        );
        Ok(Session {
            connection,
            config,
            transactions,
            schema,
        })
    }
}

impl<S: Send + 'static> Database<S> {
    /// Runs `task` on its own thread.
    ///
    /// The task should poll [`BackgroundContext::is_shutdown`] and return once
    /// it is set; [`Database::disconnect`] and drop wait for it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] when a task is already running, or
    /// [`StoreError::Io`] when the thread cannot be spawned.
    pub fn spawn_background(
        &self,
        task: impl FnOnce(BackgroundContext<S>) + Send + 'static,
    ) -> Result<(), StoreError> {
        let mut slot = self.lock_background()?;
        if slot.as_ref().is_some_and(|running| !running.thread.is_finished()) {
            return Err(StoreError::Invalid("a background task is already running".to_string()));
        }
        if let Some(finished) = slot.take() {
            join_background(finished);
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let context = BackgroundContext {
            shared: Arc::downgrade(&self.shared),
            shutdown: Arc::clone(&shutdown),
        };
        let thread = thread::Builder::new()
            .name("sqlite-containers-background".to_string())
            .spawn(move || task(context))
            .map_err(|err| StoreError::Io(err.to_string()))?;
        debug!("background task started");
        *slot = Some(Background {
            shutdown,
            thread,
        });
        Ok(())
    }
}

impl<S> Database<S> {
    /// Locks the background slot.
    fn lock_background(&self) -> Result<MutexGuard<'_, Option<Background>>, StoreError> {
        self.background
            .lock()
            .map_err(|_| StoreError::Io("background mutex poisoned".to_string()))
    }

    /// Signals and joins the background task, if any.
    fn stop_background(&self) -> Result<(), StoreError> {
        let running = self.lock_background()?.take();
        if let Some(running) = running {
            running.shutdown.store(true, Ordering::Release);
            join_background(running);
        }
        Ok(())
    }
}

impl<S> Drop for Database<S> {
    fn drop(&mut self) {
        if let Err(err) = self.disconnect() {
            warn!(error = %err, "sqlite store disconnect failed during drop");
        }
    }
}

// ============================================================================
// SECTION: Background Context
// ============================================================================

/// The background task's view of the database.
pub struct BackgroundContext<S> {
    /// Session state; dangling once the database is dropped.
    shared: Weak<Shared<S>>,
    /// Shutdown flag set by disconnect and drop.
    shutdown: Arc<AtomicBool>,
}

impl<S> BackgroundContext<S> {
    /// Returns true once the task should stop.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire) || self.shared.strong_count() == 0
    }

    /// Sleeps for up to `period`, returning early when shutdown is requested.
    ///
    /// Returns true when the task should keep running.
    #[must_use]
    pub fn wait(&self, period: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(10);
        let mut remaining = period;
        while !remaining.is_zero() {
            if self.is_shutdown() {
                return false;
            }
            let step = remaining.min(SLICE);
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        !self.is_shutdown()
    }

    /// Runs `operation` under the instance mutex.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotConnected`] when the database is gone or
    /// disconnected, or the operation's error.
    pub fn with_session<T>(
        &self,
        operation: impl FnOnce(&Session<S>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let shared = self.shared.upgrade().ok_or(StoreError::NotConnected)?;
        shared.with_session(operation)
    }
}

impl<S> fmt::Debug for BackgroundContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundContext").field("shutdown", &self.is_shutdown()).finish()
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Waits for a background thread, logging a panic instead of propagating it.
fn join_background(background: Background) {
    if background.thread.join().is_err() {
        warn!("background task panicked");
    } else {
        debug!("background task stopped");
    }
}

/// Closes a session, logging close failures.
fn close_session<S>(session: Session<S>) {
    let path = session.config.path.display().to_string();
    drop(session.schema);
    if let Err((_, err)) = session.connection.close() {
        warn!(path = %path, error = %err, "sqlite close failed");
        return;
    }
    info!(path = %path, "sqlite store disconnected");
}

/// Opens an `SQLite` connection with the configured access mode.
fn open_connection(config: &StoreConfig) -> Result<Connection, StoreError> {
    let access = if config.read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
    };
    let flags = access | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = if config.in_memory {
        Connection::open_in_memory_with_flags(flags)?
    } else {
        if !config.read_only {
            ensure_parent_dir(&config.path)?;
        }
        Connection::open_with_flags(&config.path, flags)?
    };
    connection.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
    Ok(connection)
}

/// Applies the configured pragmas; `foreign_keys` is always switched on.
fn apply_pragmas(connection: &Connection, config: &StoreConfig) -> Result<(), StoreError> {
    connection.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    let mut pragmas = vec![
        format!("PRAGMA cache_size = {};", config.cache_size),
        format!("PRAGMA analysis_limit = {};", config.analysis_limit),
        format!("PRAGMA temp_store = {};", config.temp_store.pragma_value()),
        format!("PRAGMA locking_mode = {};", config.locking_mode.pragma_value()),
        "PRAGMA foreign_keys = ON;".to_string(),
    ];
    if !config.read_only {
        pragmas.extend([
            format!("PRAGMA page_size = {};", config.page_size),
            format!("PRAGMA wal_autocheckpoint = {};", config.wal_autocheckpoint),
            format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()),
            format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value()),
            format!("PRAGMA auto_vacuum = {};", config.auto_vacuum.pragma_value()),
        ]);
        if let Some(version) = config.user_version {
            pragmas.push(format!("PRAGMA user_version = {version};"));
        }
    }
    for pragma in &pragmas {
        connection.execute_batch(pragma)?;
        debug!(pragma = pragma.as_str(), "applied sqlite pragma");
    }
    Ok(())
}

// ============================================================================
// SECTION: Tests
// ============================================================================
