// crates/sqlite-containers/src/multi_value/schema.rs
// ============================================================================
// Module: Multi-Value Schema
// Description: Normalized key/value/junction tables plus staging tables.
// Purpose: Provision the relation and compile every statement it needs.
// Dependencies: rusqlite, tracing
// ============================================================================

//! ## Overview
//! A multi-value relation is stored in three durable tables: deduplicated
//! keys, deduplicated values, and a junction table holding one row per
//! distinct `(key, value)` pair with its occurrence count. Both junction
//! columns cascade on delete, so purging a key or value removes its pairs.
//!
//! Three connection-scoped `TEMPORARY` tables stage the keys, values, and id
//! pairs of the reconciliation input; they only ever feed anti-joins.
//!
//! Cascades depend on `PRAGMA foreign_keys`, so provisioning refuses a
//! connection on which it is off.

// ============================================================================
// SECTION: Imports
// ============================================================================

use rusqlite::Connection;
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::statement::BusyRetry;
use crate::statement::StatementHandle;

// ============================================================================
// SECTION: Table Names
// ============================================================================

/// Physical table names for one logical relation.
///
/// # Invariants
/// - Derived from a validated table name, so safe to splice into SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    /// Deduplicated keys.
    pub keys: String,
    /// Deduplicated values.
    pub values: String,
    /// Junction table with counts.
    pub key_value: String,
    /// Staged keys.
    pub temp_keys: String,
    /// Staged values.
    pub temp_values: String,
    /// Staged id pairs.
    pub temp_key_value: String,
}

impl TableNames {
    /// Derives table names from a logical name; empty selects the defaults.
    #[must_use]
    pub fn for_table(table_name: &str) -> Self {
        if table_name.is_empty() {
            return Self {
                keys: "keys_store".to_string(),
                values: "values_store".to_string(),
                key_value: "key_value_store".to_string(),
                temp_keys: "keys_temp_store".to_string(),
                temp_values: "values_temp_store".to_string(),
                temp_key_value: "key_value_temp_store".to_string(),
            };
        }
        Self {
            keys: format!("{table_name}_keys"),
            values: format!("{table_name}_values"),
            key_value: format!("{table_name}_key_value"),
            temp_keys: format!("{table_name}_temp_keys"),
            temp_values: format!("{table_name}_temp_values"),
            temp_key_value: format!("{table_name}_temp_key_value"),
        }
    }

    /// Returns the DDL creating every table of the relation.
    fn ddl(&self, key_type: &str, value_type: &str) -> String {
        let Self {
            keys,
            values,
            key_value,
            temp_keys,
            temp_values,
            temp_key_value,
        } = self;
        format!(
            "CREATE TABLE IF NOT EXISTS {keys} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key {key_type} NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS {values} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                value {value_type} NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS {key_value} (
                key_id INTEGER NOT NULL,
                value_id INTEGER NOT NULL,
                value_count INTEGER NOT NULL DEFAULT 1 CHECK (value_count >= 1),
                PRIMARY KEY (key_id, value_id),
                FOREIGN KEY (key_id) REFERENCES {keys}(id) ON DELETE CASCADE,
                FOREIGN KEY (value_id) REFERENCES {values}(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS {key_value}_value_idx ON {key_value} (value_id);
            CREATE TEMPORARY TABLE IF NOT EXISTS {temp_keys} (
                id INTEGER PRIMARY KEY,
                key {key_type} NOT NULL UNIQUE
            );
            CREATE TEMPORARY TABLE IF NOT EXISTS {temp_values} (
                id INTEGER PRIMARY KEY,
                value {value_type} NOT NULL UNIQUE
            );
            CREATE TEMPORARY TABLE IF NOT EXISTS {temp_key_value} (
                key_id INTEGER NOT NULL,
                value_id INTEGER NOT NULL,
                PRIMARY KEY (key_id, value_id)
            );"
        )
    }
}

// ============================================================================
// SECTION: Schema
// ============================================================================

/// Provisioned relation: table names plus one handle per statement.
#[derive(Debug, Clone)]
pub struct MultiValueSchema {
    /// Physical table names.
    pub(crate) tables: TableNames,
    /// `INSERT OR IGNORE` into keys.
    pub(crate) insert_key: StatementHandle,
    /// `INSERT OR IGNORE` into values.
    pub(crate) insert_value: StatementHandle,
    /// `INSERT OR IGNORE` into staged keys.
    pub(crate) stage_key: StatementHandle,
    /// `INSERT OR IGNORE` into staged values.
    pub(crate) stage_value: StatementHandle,
    /// `INSERT OR IGNORE` into staged id pairs.
    pub(crate) stage_pair: StatementHandle,
    /// Key id by payload.
    pub(crate) key_id: StatementHandle,
    /// Value id by payload.
    pub(crate) value_id: StatementHandle,
    /// Pair count by ids.
    pub(crate) pair_count: StatementHandle,
    /// Pair count update by ids.
    pub(crate) set_pair_count: StatementHandle,
    /// New pair with the default count.
    pub(crate) insert_pair: StatementHandle,
    /// Keys anti-join purge.
    pub(crate) purge_keys: StatementHandle,
    /// Values anti-join purge.
    pub(crate) purge_values: StatementHandle,
    /// Pairs anti-join purge.
    pub(crate) purge_pairs: StatementHandle,
    /// Staged value count.
    pub(crate) count_staged_values: StatementHandle,
    /// Clears staged keys.
    pub(crate) clear_temp_keys: StatementHandle,
    /// Clears staged values.
    pub(crate) clear_temp_values: StatementHandle,
    /// Clears staged pairs.
    pub(crate) clear_temp_pairs: StatementHandle,
    /// Full relation, in id order.
    pub(crate) load: StatementHandle,
    /// Values and counts of one key.
    pub(crate) find: StatementHandle,
    /// Count by payloads.
    pub(crate) count_by_payload: StatementHandle,
    /// Count update by payloads.
    pub(crate) set_count_by_payload: StatementHandle,
    /// Pair delete by payloads.
    pub(crate) remove_pair: StatementHandle,
    /// Key delete by payload (cascades).
    pub(crate) remove_key: StatementHandle,
    /// Keys holding at least one pair.
    pub(crate) count_keys: StatementHandle,
    /// Clears pairs.
    pub(crate) clear_pairs: StatementHandle,
    /// Clears keys.
    pub(crate) clear_keys: StatementHandle,
    /// Clears values.
    pub(crate) clear_values: StatementHandle,
}

impl MultiValueSchema {
    /// Creates the relation's tables and compiles its statements.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] when foreign keys are off, or
    /// [`StoreError::Engine`] when DDL or statement compilation fails.
    pub fn provision(
        connection: &Connection,
        config: &StoreConfig,
        key_type: &str,
        value_type: &str,
    ) -> Result<Self, StoreError> {
        let foreign_keys: i64 =
            connection.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        if foreign_keys != 1 {
            return Err(StoreError::Invalid(
                "foreign key enforcement is off; cascades would strand pairs".to_string(),
            ));
        }
        let tables = TableNames::for_table(&config.table_name);
        connection.execute_batch(&tables.ddl(key_type, value_type))?;
        let schema = Self::statements(tables);
        let retry = BusyRetry::from_config(config);
        for handle in schema.handles() {
            handle.prepare(connection, &retry)?;
        }
        debug!(
            keys = schema.tables.keys.as_str(),
            values = schema.tables.values.as_str(),
            key_value = schema.tables.key_value.as_str(),
            key_type,
            value_type,
            "multi-value relation provisioned"
        );
        Ok(schema)
    }

    /// Returns the physical table names.
    #[must_use]
    pub const fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Builds every statement handle for `tables`.
    fn statements(tables: TableNames) -> Self {
        let TableNames {
            keys,
            values,
            key_value,
            temp_keys,
            temp_values,
            temp_key_value,
        } = &tables;
        let joined = format!(
            "FROM {key_value} AS kv JOIN {keys} AS k ON k.id = kv.key_id JOIN {values} AS v ON \
             v.id = kv.value_id"
        );
        let by_payload = format!(
            "key_id = (SELECT id FROM {keys} WHERE key = ?1) AND value_id = (SELECT id FROM \
             {values} WHERE value = ?2)"
        );
        Self {
            insert_key: StatementHandle::new(
                "insert_key",
                format!("INSERT OR IGNORE INTO {keys} (key) VALUES (?1)"),
            ),
            insert_value: StatementHandle::new(
                "insert_value",
                format!("INSERT OR IGNORE INTO {values} (value) VALUES (?1)"),
            ),
            stage_key: StatementHandle::new(
                "stage_key",
                format!("INSERT OR IGNORE INTO {temp_keys} (key) VALUES (?1)"),
            ),
            stage_value: StatementHandle::new(
                "stage_value",
                format!("INSERT OR IGNORE INTO {temp_values} (value) VALUES (?1)"),
            ),
            stage_pair: StatementHandle::new(
                "stage_pair",
                format!("INSERT OR IGNORE INTO {temp_key_value} (key_id, value_id) VALUES (?1, ?2)"),
            ),
            key_id: StatementHandle::new("key_id", format!("SELECT id FROM {keys} WHERE key = ?1")),
            value_id: StatementHandle::new(
                "value_id",
                format!("SELECT id FROM {values} WHERE value = ?1"),
            ),
            pair_count: StatementHandle::new(
                "pair_count",
                format!("SELECT value_count FROM {key_value} WHERE key_id = ?1 AND value_id = ?2"),
            ),
            set_pair_count: StatementHandle::new(
                "set_pair_count",
                format!("UPDATE {key_value} SET value_count = ?3 WHERE key_id = ?1 AND value_id = ?2"),
            ),
            insert_pair: StatementHandle::new(
                "insert_pair",
                format!("INSERT INTO {key_value} (key_id, value_id) VALUES (?1, ?2)"),
            ),
            purge_keys: StatementHandle::new(
                "purge_keys",
                format!("DELETE FROM {keys} WHERE key NOT IN (SELECT key FROM {temp_keys})"),
            ),
            purge_values: StatementHandle::new(
                "purge_values",
                format!("DELETE FROM {values} WHERE value NOT IN (SELECT value FROM {temp_values})"),
            ),
            purge_pairs: StatementHandle::new(
                "purge_pairs",
                format!(
                    "DELETE FROM {key_value} WHERE NOT EXISTS (SELECT 1 FROM {temp_key_value} AS s \
                     WHERE s.key_id = {key_value}.key_id AND s.value_id = {key_value}.value_id)"
                ),
            ),
            count_staged_values: StatementHandle::new(
                "count_staged_values",
                format!("SELECT COUNT(*) FROM {temp_values}"),
            ),
            clear_temp_keys: StatementHandle::new(
                "clear_temp_keys",
                format!("DELETE FROM {temp_keys}"),
            ),
            clear_temp_values: StatementHandle::new(
                "clear_temp_values",
                format!("DELETE FROM {temp_values}"),
            ),
            clear_temp_pairs: StatementHandle::new(
                "clear_temp_pairs",
                format!("DELETE FROM {temp_key_value}"),
            ),
            load: StatementHandle::new(
                "load",
                format!("SELECT k.key, v.value, kv.value_count {joined} ORDER BY k.id, v.id"),
            ),
            find: StatementHandle::new(
                "find",
                format!("SELECT v.value, kv.value_count {joined} WHERE k.key = ?1 ORDER BY v.id"),
            ),
            count_by_payload: StatementHandle::new(
                "count_by_payload",
                format!("SELECT value_count FROM {key_value} WHERE {by_payload}"),
            ),
            set_count_by_payload: StatementHandle::new(
                "set_count_by_payload",
                format!("UPDATE {key_value} SET value_count = ?3 WHERE {by_payload}"),
            ),
            remove_pair: StatementHandle::new(
                "remove_pair",
                format!("DELETE FROM {key_value} WHERE {by_payload}"),
            ),
            remove_key: StatementHandle::new(
                "remove_key",
                format!("DELETE FROM {keys} WHERE key = ?1"),
            ),
            count_keys: StatementHandle::new(
                "count_keys",
                format!("SELECT COUNT(DISTINCT key_id) FROM {key_value}"),
            ),
            clear_pairs: StatementHandle::new("clear_pairs", format!("DELETE FROM {key_value}")),
            clear_keys: StatementHandle::new("clear_keys", format!("DELETE FROM {keys}")),
            clear_values: StatementHandle::new("clear_values", format!("DELETE FROM {values}")),
            tables,
        }
    }

    /// Returns every statement handle, in declaration order.
    fn handles(&self) -> [&StatementHandle; 27] {
        [
            &self.insert_key,
            &self.insert_value,
            &self.stage_key,
            &self.stage_value,
            &self.stage_pair,
            &self.key_id,
            &self.value_id,
            &self.pair_count,
            &self.set_pair_count,
            &self.insert_pair,
            &self.purge_keys,
            &self.purge_values,
            &self.purge_pairs,
            &self.count_staged_values,
            &self.clear_temp_keys,
            &self.clear_temp_values,
            &self.clear_temp_pairs,
            &self.load,
            &self.find,
            &self.count_by_payload,
            &self.set_count_by_payload,
            &self.remove_pair,
            &self.remove_key,
            &self.count_keys,
            &self.clear_pairs,
            &self.clear_keys,
            &self.clear_values,
        ]
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
