// crates/sqlite-containers/src/lib.rs
// ============================================================================
// Module: SQLite Containers
// Description: Persist in-memory multi-value containers in SQLite.
// Purpose: Keep a normalized relation exactly in sync with a pair multiset.
// Dependencies: rusqlite, serde, thiserror, toml, tracing
// ============================================================================

//! ## Overview
//! This crate stores key to multi-value containers in a single `SQLite` file.
//! Keys and values are deduplicated into their own tables and linked by a
//! junction table that records how many times each pair occurs. The
//! [`KeyMultiValueStore`] reconciles that relation against any iterable of
//! `(key, value)` pairs: the engine computes additions, removals, and count
//! corrections with staging tables and anti-joins inside one transaction,
//! retrying statements through transient lock contention.
//!
//! Building blocks ([`Database`], [`TransactionController`],
//! [`StatementHandle`]) are public so other container shapes can reuse them.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod column;
pub mod config;
pub mod connection;
pub mod error;
pub mod frequency;
pub mod multi_value;
pub mod statement;
pub mod transaction;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use column::ByteRecord;
pub use column::ColumnValue;
pub use column::Record;
pub use column::fixed_bytes;
pub use config::AutoVacuumMode;
pub use config::JournalMode;
pub use config::LockingMode;
pub use config::StoreConfig;
pub use config::SyncMode;
pub use config::TempStore;
pub use connection::BackgroundContext;
pub use connection::Database;
pub use connection::Session;
pub use error::StoreError;
pub use frequency::ByteIdentity;
pub use frequency::ColumnIdentity;
pub use frequency::FrequencyMap;
pub use frequency::HashedIdentity;
pub use frequency::Identity;
pub use frequency::KeyFrequencies;
pub use frequency::StructuralIdentity;
pub use multi_value::Association;
pub use multi_value::KeyMultiValueStore;
pub use multi_value::MultiValueSchema;
pub use multi_value::ReconcileReport;
pub use multi_value::Relation;
pub use statement::BusyRetry;
pub use statement::StatementHandle;
pub use transaction::TransactionController;
pub use transaction::TransactionMode;
