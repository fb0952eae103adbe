// crates/sqlite-containers/src/multi_value/mod.rs
// ============================================================================
// Module: Key Multi-Value Store
// Description: Persistent multimap with per-pair occurrence counts.
// Purpose: Mirror an in-memory multiset of pairs in a normalized relation.
// Dependencies: rusqlite, tracing
// ============================================================================

//! ## Overview
//! [`KeyMultiValueStore`] persists a many-to-many relation from keys to values
//! in which each `(key, value)` pair carries an occurrence count. The main
//! operation is [`KeyMultiValueStore::reconcile`]: afterwards the relation
//! holds exactly the distinct pairs of the source, each with its multiplicity.
//! [`KeyMultiValueStore::append`] adds to the relation instead.
//!
//! Every operation runs under the instance mutex; mutating operations run in
//! one transaction (or a savepoint inside a caller transaction).

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod ops;
pub mod reconcile;
pub mod schema;

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::marker::PhantomData;

use rusqlite::types::Value;
use tracing::warn;

pub use self::ops::Relation;
pub use self::reconcile::ReconcileReport;
pub use self::schema::MultiValueSchema;
pub use self::schema::TableNames;
use crate::column::ColumnValue;
use crate::config::StoreConfig;
use crate::connection::BackgroundContext;
use crate::connection::Database;
use crate::error::StoreError;
use crate::frequency::FrequencyMap;
use crate::frequency::Identity;
use crate::frequency::ColumnIdentity;
use crate::transaction::TransactionMode;

// ============================================================================
// SECTION: Types
// ============================================================================

/// One persisted pair with its occurrence count.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Association<K, V> {
    /// Key payload.
    pub key: K,
    /// Value payload.
    pub value: V,
    /// Occurrences of the pair; always at least 1.
    pub count: u64,
}

/// Persistent key to multi-value relation.
///
/// `KI` and `VI` decide when two keys or values are the same while a source
/// is counted; they default to the stored column encoding.
///
/// # Invariants
/// - After a successful reconcile the relation is in bijection with the
///   distinct pairs of the source, with matching counts.
/// - Key and value rows are unique; pairs reference existing rows.
pub struct KeyMultiValueStore<K, V, KI = ColumnIdentity, VI = ColumnIdentity> {
    /// Connection manager.
    database: Database<MultiValueSchema>,
    /// Key identity policy.
    key_identity: KI,
    /// Value identity policy.
    value_identity: VI,
    /// Payload types.
    payload: PhantomData<fn() -> (K, V)>,
}

impl<K, V, KI, VI> std::fmt::Debug for KeyMultiValueStore<K, V, KI, VI> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMultiValueStore")
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl<K, V> KeyMultiValueStore<K, V>
where
    K: ColumnValue,
    V: ColumnValue,
{
    /// Opens a store grouping keys and values by their column encoding.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the config is invalid or the database
    /// cannot be opened and provisioned.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Self::open_with_identity(config, ColumnIdentity, ColumnIdentity)
    }
}

impl<K, V, KI, VI> KeyMultiValueStore<K, V, KI, VI>
where
    K: ColumnValue,
    V: ColumnValue,
    KI: Identity<K>,
    VI: Identity<V>,
{
    /// Opens a store with explicit identity policies.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the config is invalid or the database
    /// cannot be opened and provisioned.
    pub fn open_with_identity(
        config: StoreConfig,
        key_identity: KI,
        value_identity: VI,
    ) -> Result<Self, StoreError> {
        let (key_type, value_type) = (K::SQL_TYPE, V::SQL_TYPE);
        let database = Database::new(move |connection, config| {
            MultiValueSchema::provision(connection, config, key_type, value_type)
        });
        database.connect(config)?;
        Ok(Self {
            database,
            key_identity,
            value_identity,
            payload: PhantomData,
        })
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Closes the current connection and opens one with `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the new connection cannot be opened.
    pub fn reconnect(&self, config: StoreConfig) -> Result<(), StoreError> {
        self.database.reconnect(config)
    }

    /// Stops the background task and closes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the mutex is poisoned.
    pub fn disconnect(&self) -> Result<(), StoreError> {
        self.database.disconnect()
    }

    /// Returns true while a connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.database.is_connected()
    }

    /// Returns the active configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotConnected`] when disconnected.
    pub fn config(&self) -> Result<StoreConfig, StoreError> {
        self.database.with_session(|session| Ok(session.config().clone()))
    }

    /// Runs `task` on a background thread; see [`Database::spawn_background`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when a task is running or cannot be spawned.
    pub fn spawn_background(
        &self,
        task: impl FnOnce(BackgroundContext<MultiValueSchema>) + Send + 'static,
    ) -> Result<(), StoreError> {
        self.database.spawn_background(task)
    }

    // ------------------------------------------------------------------------
    // Reconcile and append
    // ------------------------------------------------------------------------

    /// Makes the relation equal `pairs`, using the default transaction mode.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when reconciliation fails; the relation is then
    /// unchanged.
    pub fn reconcile(
        &self,
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Result<ReconcileReport, StoreError> {
        let source = FrequencyMap::build(pairs, &self.key_identity, &self.value_identity);
        self.reconcile_map(&source, None)
    }

    /// Makes the relation equal `pairs` inside a `mode` transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when reconciliation fails; the relation is then
    /// unchanged.
    pub fn reconcile_with(
        &self,
        pairs: impl IntoIterator<Item = (K, V)>,
        mode: TransactionMode,
    ) -> Result<ReconcileReport, StoreError> {
        let source = FrequencyMap::build(pairs, &self.key_identity, &self.value_identity);
        self.reconcile_map(&source, Some(mode))
    }

    /// Makes the relation equal a map-of-collections source.
    ///
    /// Keys with empty collections are dropped from the relation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when reconciliation fails; the relation is then
    /// unchanged.
    pub fn reconcile_groups<G>(
        &self,
        groups: impl IntoIterator<Item = (K, G)>,
    ) -> Result<ReconcileReport, StoreError>
    where
        K: Clone,
        G: IntoIterator<Item = V>,
    {
        let source = FrequencyMap::from_groups(groups, &self.key_identity, &self.value_identity);
        self.reconcile_map(&source, None)
    }

    /// Makes the relation equal an already counted source.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when reconciliation fails; the relation is then
    /// unchanged.
    pub fn reconcile_map(
        &self,
        source: &FrequencyMap<K, V>,
        mode: Option<TransactionMode>,
    ) -> Result<ReconcileReport, StoreError> {
        self.mutate(mode, |relation| reconcile::reconcile(relation, source))
    }

    /// Adds one occurrence of every pair, using the default transaction mode.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the append fails; the relation is then
    /// unchanged.
    pub fn append(&self, pairs: impl IntoIterator<Item = (K, V)>) -> Result<u64, StoreError> {
        self.mutate(None, |relation| reconcile::append(relation, pairs))
    }

    /// Adds one occurrence of every pair inside a `mode` transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the append fails; the relation is then
    /// unchanged.
    pub fn append_with(
        &self,
        pairs: impl IntoIterator<Item = (K, V)>,
        mode: TransactionMode,
    ) -> Result<u64, StoreError> {
        self.mutate(Some(mode), |relation| reconcile::append(relation, pairs))
    }

    /// Adds one occurrence of `(key, value)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the insert fails.
    pub fn insert(&self, key: K, value: V) -> Result<(), StoreError> {
        self.append([(key, value)]).map(drop)
    }

    /// Adds one occurrence of `(key, value)` inside a `mode` transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the insert fails.
    pub fn insert_with(&self, key: K, value: V, mode: TransactionMode) -> Result<(), StoreError> {
        self.append_with([(key, value)], mode).map(drop)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Returns every pair with its count, in insertion (id) order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read or decoding fails.
    pub fn load(&self) -> Result<Vec<Association<K, V>>, StoreError> {
        let rows = self.read(|relation| relation.load())?;
        rows.into_iter()
            .map(|(key, value, count)| {
                Ok(Association {
                    key: K::from_sql_value(key)?,
                    value: V::from_sql_value(value)?,
                    count,
                })
            })
            .collect()
    }

    /// Returns the values of `key` with their counts, or `None` when the key
    /// holds no pairs.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read or decoding fails.
    pub fn find(&self, key: &K) -> Result<Option<Vec<(V, u64)>>, StoreError> {
        let key = key.to_sql_value()?;
        let rows = self.read(|relation| relation.find(&key))?;
        if rows.is_empty() {
            return Ok(None);
        }
        decode_values(rows).map(Some)
    }

    /// Returns the count of `(key, value)`, or 0 when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    pub fn count(&self, key: &K, value: &V) -> Result<u64, StoreError> {
        let (key, value) = (key.to_sql_value()?, value.to_sql_value()?);
        self.read(|relation| relation.count(&key, &value))
    }

    /// Returns the number of keys holding at least one pair.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    pub fn len(&self) -> Result<u64, StoreError> {
        self.read(|relation| relation.count_keys())
    }

    /// Returns true when the relation holds no pairs.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    // ------------------------------------------------------------------------
    // Corrections
    // ------------------------------------------------------------------------

    /// Sets the count of an existing pair; a count of 0 removes it.
    ///
    /// Returns false when the pair does not exist (nothing is created).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the update fails.
    pub fn set_count(&self, key: &K, value: &V, count: u64) -> Result<bool, StoreError> {
        let (key, value) = (key.to_sql_value()?, value.to_sql_value()?);
        if count == 0 {
            return self.read(|relation| relation.remove_pair(&key, &value));
        }
        self.read(|relation| relation.set_count(&key, &value, count))
    }

    /// Removes one pair regardless of its count; returns false when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the delete fails.
    pub fn remove_pair(&self, key: &K, value: &V) -> Result<bool, StoreError> {
        let (key, value) = (key.to_sql_value()?, value.to_sql_value()?);
        self.read(|relation| relation.remove_pair(&key, &value))
    }

    /// Removes a key and all of its pairs; returns false when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the delete fails.
    pub fn remove(&self, key: &K) -> Result<bool, StoreError> {
        let key = key.to_sql_value()?;
        self.read(|relation| relation.remove_key(&key))
    }

    /// Removes every pair, key, and value, using the default transaction mode.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the clear fails; the relation is then
    /// unchanged.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.mutate(None, |relation| relation.clear())
    }

    /// Removes every pair, key, and value inside a `mode` transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the clear fails; the relation is then
    /// unchanged.
    pub fn clear_with(&self, mode: TransactionMode) -> Result<(), StoreError> {
        self.mutate(Some(mode), |relation| relation.clear())
    }

    // ------------------------------------------------------------------------
    // Explicit transactions
    // ------------------------------------------------------------------------

    /// Opens a caller-controlled transaction; later operations join it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when a transaction is already open.
    pub fn begin(&self, mode: TransactionMode) -> Result<(), StoreError> {
        self.database
            .with_session(|session| session.transactions().begin(session.connection(), mode))
    }

    /// Commits the caller-controlled transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when no transaction is open or commit fails.
    pub fn commit(&self) -> Result<(), StoreError> {
        self.database.with_session(|session| session.transactions().commit(session.connection()))
    }

    /// Rolls back the caller-controlled transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when no transaction is open or rollback fails.
    pub fn rollback(&self) -> Result<(), StoreError> {
        self.database.with_session(|session| {
            warn!("rolling back caller transaction");
            session.transactions().rollback(session.connection())
        })
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Runs single-statement work under the instance mutex.
    fn read<T>(
        &self,
        operation: impl FnOnce(&Relation<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.database.with_session(|session| operation(&Relation::new(session)))
    }

    /// Runs multi-statement work atomically under the instance mutex.
    fn mutate<T>(
        &self,
        mode: Option<TransactionMode>,
        operation: impl FnOnce(&Relation<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.database.with_session(|session| {
            let mode = mode.unwrap_or(session.config().default_transaction_mode);
            let relation = Relation::new(session);
            session.transactions().run(session.connection(), mode, || operation(&relation))
        })
    }
}

impl<K, V, KI, VI> KeyMultiValueStore<K, V, KI, VI>
where
    K: ColumnValue + Clone,
    V: ColumnValue + Clone,
    KI: Identity<K>,
    VI: Identity<V>,
{
    /// Returns the relation as a multiset: each pair repeated `count` times.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read or decoding fails.
    pub fn load_pairs(&self) -> Result<Vec<(K, V)>, StoreError> {
        let associations = self.load()?;
        let mut pairs = Vec::new();
        for association in associations {
            let repeat = usize::try_from(association.count).map_err(|_| {
                StoreError::Invalid("pair count exceeds addressable memory".to_string())
            })?;
            pairs.extend(std::iter::repeat_n((association.key, association.value), repeat));
        }
        Ok(pairs)
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Decodes `(value, count)` rows.
fn decode_values<V: ColumnValue>(rows: Vec<(Value, u64)>) -> Result<Vec<(V, u64)>, StoreError> {
    rows.into_iter().map(|(value, count)| Ok((V::from_sql_value(value)?, count))).collect()
}
