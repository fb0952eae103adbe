// crates/sqlite-containers/src/error.rs
// ============================================================================
// Module: Store Errors
// Description: Single error family for every SQLite container operation.
// Purpose: Normalize engine, consistency, and lifecycle failures for callers.
// Dependencies: rusqlite, thiserror
// ============================================================================

//! ## Overview
//! Every public operation returns [`StoreError`]. Engine failures keep the
//! native extended result code so callers can branch on it; everything else
//! carries a short message. Messages never embed raw key or value payloads.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Code reported when an error did not originate inside the engine.
pub const NO_ENGINE_CODE: i32 = -1;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors produced by SQLite container stores.
///
/// # Invariants
/// - `Engine::code` is the extended result code reported by `SQLite`, or
///   [`NO_ENGINE_CODE`] for driver-side failures.
/// - Error messages avoid embedding raw key or value payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// `SQLite` engine error (constraint violation, I/O failure, disk full).
    #[error("sqlite engine error (code {code}): {message}")]
    Engine {
        /// Native extended result code.
        code: i32,
        /// Engine or driver message.
        message: String,
    },
    /// Engine stayed busy past the configured retry ceiling.
    #[error("sqlite engine busy after {attempts} attempts")]
    Busy {
        /// Number of attempts made before giving up.
        attempts: u32,
    },
    /// Persisted relation disagrees with what the operation just wrote.
    #[error("inconsistent relation: {0}")]
    Inconsistent(String),
    /// Operation body failed in an unrecognized way and was rolled back.
    #[error("operation aborted: {0}")]
    Aborted(String),
    /// File system or synchronization failure.
    #[error("store io error: {0}")]
    Io(String),
    /// Invalid configuration or data.
    #[error("invalid store data: {0}")]
    Invalid(String),
    /// Operation requires an open connection.
    #[error("store is not connected")]
    NotConnected,
    /// Connect was called on an already-open store.
    #[error("store is already connected; use reconnect to apply a new config")]
    AlreadyConnected,
}

impl StoreError {
    /// Returns the native engine code when the error came from `SQLite`.
    #[must_use]
    pub const fn code(&self) -> Option<i32> {
        match self {
            Self::Engine {
                code, ..
            } if *code != NO_ENGINE_CODE => Some(*code),
            _ => None,
        }
    }

    /// Builds an engine error without a native code.
    pub(crate) fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            code: NO_ENGINE_CODE,
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        let code = error.sqlite_error().map_or(NO_ENGINE_CODE, |native| native.extended_code);
        Self::Engine {
            code,
            message: error.to_string(),
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
