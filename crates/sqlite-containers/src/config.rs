// crates/sqlite-containers/src/config.rs
// ============================================================================
// Module: Store Configuration
// Description: Connection, pragma, and transaction settings for a store.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: serde, toml
// ============================================================================

//! ## Overview
//! A [`StoreConfig`] describes one logical table family inside one database
//! file: where the file lives, how the engine is tuned, and which transaction
//! mode operations use by default. Configuration is validated before any file
//! is touched. The table name is spliced into SQL text, so it is restricted
//! to plain identifiers.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::StoreError;
use crate::transaction::TransactionMode;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default busy timeout handed to the engine (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 1_000;
/// Largest busy timeout the engine accepts (ms); `i32::MAX`.
const MAX_BUSY_TIMEOUT_MS: u64 = 2_147_483_647;
/// Default sleep between busy retries (ms).
const DEFAULT_BUSY_RETRY_DELAY_MS: u64 = 50;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum table name length.
const MAX_TABLE_NAME_LENGTH: usize = 64;
/// Maximum configuration file size in bytes.
const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Smallest page size accepted by `SQLite`.
const MIN_PAGE_SIZE: u32 = 512;
/// Largest page size accepted by `SQLite`.
const MAX_PAGE_SIZE: u32 = 65_536;

// ============================================================================
// SECTION: Pragma Modes
// ============================================================================

/// `SQLite` journal mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `journal_mode` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    /// Rollback journal deleted at commit.
    #[default]
    Delete,
    /// Rollback journal truncated at commit.
    Truncate,
    /// Rollback journal header zeroed at commit.
    Persist,
    /// Rollback journal kept in memory.
    Memory,
    /// Write-ahead log.
    Wal,
    /// No journal.
    Off,
}

impl JournalMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Delete => "DELETE",
            Self::Truncate => "TRUNCATE",
            Self::Persist => "PERSIST",
            Self::Memory => "MEMORY",
            Self::Wal => "WAL",
            Self::Off => "OFF",
        }
    }
}

/// `SQLite` sync mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `synchronous` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// No syncing.
    Off,
    /// Sync at critical moments only.
    Normal,
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Full plus directory sync after unlinking the journal.
    Extra,
}

impl SyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Normal => "NORMAL",
            Self::Full => "FULL",
            Self::Extra => "EXTRA",
        }
    }
}

/// `SQLite` locking mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockingMode {
    /// Locks released at the end of each transaction.
    #[default]
    Normal,
    /// Locks held until the connection closes.
    Exclusive,
}

impl LockingMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Exclusive => "EXCLUSIVE",
        }
    }
}

/// `SQLite` auto-vacuum configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutoVacuumMode {
    /// Freed pages stay in the file.
    #[default]
    None,
    /// Freed pages are returned on every commit.
    Full,
    /// Freed pages are returned on `PRAGMA incremental_vacuum`.
    Incremental,
}

impl AutoVacuumMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Full => "FULL",
            Self::Incremental => "INCREMENTAL",
        }
    }
}

/// Storage used by the engine for temporary tables and indices.
///
/// Staging tables live here, so `Memory` keeps reconciliation off disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TempStore {
    /// Compile-time default of the engine.
    #[default]
    Default,
    /// Temporary files.
    File,
    /// Memory.
    Memory,
}

impl TempStore {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::File => "FILE",
            Self::Memory => "MEMORY",
        }
    }
}

// ============================================================================
// SECTION: Config
// ============================================================================

/// Configuration for one store instance.
///
/// # Invariants
/// - `path` must resolve to a file path (not a directory) unless `in_memory`.
/// - `table_name` is empty or a plain SQL identifier.
/// - Durations are interpreted as milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the `SQLite` database file.
    #[serde(default)]
    pub path: PathBuf,
    /// Logical table name prefix; empty selects the default table names.
    #[serde(default)]
    pub table_name: String,
    /// Open the database read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Use a private in-memory database instead of `path`.
    #[serde(default)]
    pub in_memory: bool,
    /// Busy timeout handed to the engine's busy handler.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Sleep between statement retries once the busy handler gives up.
    #[serde(default = "default_busy_retry_delay_ms")]
    pub busy_retry_delay_ms: u64,
    /// Optional ceiling on statement retries; `None` retries until success.
    #[serde(default)]
    pub max_busy_retries: Option<u32>,
    /// Database page size in bytes.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Page cache size (pages when positive, KiB when negative).
    #[serde(default = "default_cache_size")]
    pub cache_size: i64,
    /// Row limit used by `ANALYZE`.
    #[serde(default = "default_analysis_limit")]
    pub analysis_limit: u32,
    /// WAL auto-checkpoint threshold in pages.
    #[serde(default = "default_wal_autocheckpoint")]
    pub wal_autocheckpoint: u32,
    /// Optional `user_version` stamped on connect.
    #[serde(default)]
    pub user_version: Option<i64>,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: JournalMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SyncMode,
    /// `SQLite` locking mode.
    #[serde(default)]
    pub locking_mode: LockingMode,
    /// `SQLite` auto-vacuum mode.
    #[serde(default)]
    pub auto_vacuum: AutoVacuumMode,
    /// Temporary storage location.
    #[serde(default)]
    pub temp_store: TempStore,
    /// Transaction mode used when an operation is not given one.
    #[serde(default)]
    pub default_transaction_mode: TransactionMode,
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

/// Returns the default busy retry delay.
const fn default_busy_retry_delay_ms() -> u64 {
    DEFAULT_BUSY_RETRY_DELAY_MS
}

/// Returns the default page size.
const fn default_page_size() -> u32 {
    4_096
}

/// Returns the default page cache size.
const fn default_cache_size() -> i64 {
    2_000
}

/// Returns the default `ANALYZE` row limit.
const fn default_analysis_limit() -> u32 {
    1_000
}

/// Returns the default WAL auto-checkpoint threshold.
const fn default_wal_autocheckpoint() -> u32 {
    1_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            table_name: String::new(),
            read_only: false,
            in_memory: false,
            busy_timeout_ms: default_busy_timeout_ms(),
            busy_retry_delay_ms: default_busy_retry_delay_ms(),
            max_busy_retries: None,
            page_size: default_page_size(),
            cache_size: default_cache_size(),
            analysis_limit: default_analysis_limit(),
            wal_autocheckpoint: default_wal_autocheckpoint(),
            user_version: None,
            journal_mode: JournalMode::default(),
            sync_mode: SyncMode::default(),
            locking_mode: LockingMode::default(),
            auto_vacuum: AutoVacuumMode::default(),
            temp_store: TempStore::default(),
            default_transaction_mode: TransactionMode::default(),
        }
    }
}

impl StoreConfig {
    /// Returns a file-backed config with defaults for everything else.
    #[must_use]
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Returns an in-memory config with defaults for everything else.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            in_memory: true,
            ..Self::default()
        }
    }

    /// Sets the logical table name.
    #[must_use]
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the file cannot be read, parsed, or
    /// validated.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        validate_path(path)?;
        let bytes = fs::read(path).map_err(|err| StoreError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(StoreError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| StoreError::Invalid("config file must be utf-8".to_string()))?;
        Self::from_toml_str(content)
    }

    /// Parses and validates configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] when parsing or validation fails.
    pub fn from_toml_str(content: &str) -> Result<Self, StoreError> {
        let config: Self = toml::from_str(content)
            .map_err(|err| StoreError::Invalid(format!("config parse error: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] when configuration is invalid.
    pub fn validate(&self) -> Result<(), StoreError> {
        if !self.in_memory {
            validate_path(&self.path)?;
        }
        validate_table_name(&self.table_name)?;
        if self.busy_timeout_ms > MAX_BUSY_TIMEOUT_MS {
            return Err(StoreError::Invalid(format!(
                "busy_timeout_ms must be at most {MAX_BUSY_TIMEOUT_MS}"
            )));
        }
        if self.busy_retry_delay_ms == 0 {
            return Err(StoreError::Invalid(
                "busy_retry_delay_ms must be greater than zero".to_string(),
            ));
        }
        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE ..= MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return Err(StoreError::Invalid(format!(
                "page_size must be a power of two between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}"
            )));
        }
        if self.read_only && self.in_memory {
            return Err(StoreError::Invalid(
                "an in-memory database cannot be opened read-only".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Validates store paths for safety limits.
fn validate_path(path: &Path) -> Result<(), StoreError> {
    if path.as_os_str().is_empty() {
        return Err(StoreError::Invalid("store path must not be empty".to_string()));
    }
    let path_string = path.display().to_string();
    if path_string.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(StoreError::Invalid("store path exceeds length limit".to_string()));
    }
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(StoreError::Invalid(
                "store path contains an overlong component".to_string(),
            ));
        }
    }
    if path.is_dir() {
        return Err(StoreError::Invalid("store path must be a file, not a directory".to_string()));
    }
    Ok(())
}

/// Validates that a table name is safe to splice into SQL.
fn validate_table_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() {
        return Ok(());
    }
    if name.len() > MAX_TABLE_NAME_LENGTH {
        return Err(StoreError::Invalid(format!(
            "table_name exceeds {MAX_TABLE_NAME_LENGTH} characters"
        )));
    }
    let mut chars = name.chars();
    let leading_ok = chars.next().is_some_and(|first| first.is_ascii_alphabetic() || first == '_');
    if !leading_ok || !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return Err(StoreError::Invalid(
            "table_name must be a plain identifier ([A-Za-z_][A-Za-z0-9_]*)".to_string(),
        ));
    }
    Ok(())
}

/// Ensures the parent directory for the store exists.
pub(crate) fn ensure_parent_dir(path: &Path) -> Result<(), StoreError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(parent).map_err(|err| StoreError::Io(err.to_string()))
}

// ============================================================================
// SECTION: Tests
// ============================================================================
