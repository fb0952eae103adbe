// crates/sqlite-containers/src/multi_value/ops.rs
// ============================================================================
// Module: Relation Operations
// Description: Single-statement operations over the multi-value relation.
// Purpose: Give reconciliation and the store one method per statement.
// Dependencies: rusqlite
// ============================================================================

//! ## Overview
//! [`Relation`] binds a session's connection, retry policy, and schema so
//! every operation is one call. Operations take payloads already encoded as
//! engine values; ids are the surrogate `INTEGER PRIMARY KEY` of the key and
//! value tables.

// ============================================================================
// SECTION: Imports
// ============================================================================

use rusqlite::Connection;
use rusqlite::ToSql;
use rusqlite::types::Value;

use crate::connection::Session;
use crate::error::StoreError;
use crate::multi_value::schema::MultiValueSchema;
use crate::statement::BusyRetry;
use crate::statement::StatementHandle;
use crate::statement::column_u64;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Surrogate id of a key or value row.
pub type RowId = i64;

/// Converts a count to its column representation.
fn count_param(count: u64) -> Result<i64, StoreError> {
    i64::try_from(count)
        .map_err(|_| StoreError::Invalid("count exceeds the storable range".to_string()))
}

/// Operations over one provisioned relation.
#[derive(Debug, Clone, Copy)]
pub struct Relation<'s> {
    /// Open connection.
    connection: &'s Connection,
    /// Statement retry policy.
    retry: &'s BusyRetry,
    /// Provisioned statements.
    schema: &'s MultiValueSchema,
}

impl<'s> Relation<'s> {
    /// Binds the relation of an open session.
    #[must_use]
    pub const fn new(session: &'s Session<MultiValueSchema>) -> Self {
        Self {
            connection: session.connection(),
            retry: session.retry(),
            schema: session.schema(),
        }
    }

    /// Executes `handle` and returns the changed row count.
    fn run(&self, handle: &StatementHandle, params: &[&dyn ToSql]) -> Result<u64, StoreError> {
        let changed = handle.execute(self.connection, self.retry, params)?;
        Ok(u64::try_from(changed).unwrap_or(u64::MAX))
    }

    /// Runs a single-id lookup.
    fn lookup_id(
        &self,
        handle: &StatementHandle,
        payload: &Value,
    ) -> Result<Option<RowId>, StoreError> {
        handle.query_optional(self.connection, self.retry, &[payload], |row| row.get(0))
    }

    // ------------------------------------------------------------------------
    // Collaborator operations
    // ------------------------------------------------------------------------

    /// Inserts a key row unless one already exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn insert_key_if_absent(&self, key: &Value) -> Result<(), StoreError> {
        self.run(&self.schema.insert_key, &[key]).map(drop)
    }

    /// Inserts a value row unless one already exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn insert_value_if_absent(&self, value: &Value) -> Result<(), StoreError> {
        self.run(&self.schema.insert_value, &[value]).map(drop)
    }

    /// Returns the id of a key row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn get_key_id(&self, key: &Value) -> Result<Option<RowId>, StoreError> {
        self.lookup_id(&self.schema.key_id, key)
    }

    /// Returns the id of a value row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn get_value_id(&self, value: &Value) -> Result<Option<RowId>, StoreError> {
        self.lookup_id(&self.schema.value_id, value)
    }

    /// Returns the count of a pair, or 0 when the pair has no row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn get_pair_count(&self, key_id: RowId, value_id: RowId) -> Result<u64, StoreError> {
        let count = self.schema.pair_count.query_optional(
            self.connection,
            self.retry,
            &[&key_id, &value_id],
            |row| column_u64(row, 0),
        )?;
        Ok(count.unwrap_or(0))
    }

    /// Sets the count of an existing pair; returns false when no row matched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when `count` is out of range or the statement
    /// fails.
    pub fn set_pair_count(
        &self,
        key_id: RowId,
        value_id: RowId,
        count: u64,
    ) -> Result<bool, StoreError> {
        let count = count_param(count)?;
        Ok(self.run(&self.schema.set_pair_count, &[&key_id, &value_id, &count])? > 0)
    }

    /// Inserts a pair with the default count of 1.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the pair exists or the statement fails.
    pub fn insert_pair(&self, key_id: RowId, value_id: RowId) -> Result<(), StoreError> {
        self.run(&self.schema.insert_pair, &[&key_id, &value_id]).map(drop)
    }

    /// Deletes keys absent from staging; returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn purge_keys_not_in_staging(&self) -> Result<u64, StoreError> {
        self.run(&self.schema.purge_keys, &[])
    }

    /// Deletes values absent from staging; returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn purge_values_not_in_staging(&self) -> Result<u64, StoreError> {
        self.run(&self.schema.purge_values, &[])
    }

    /// Deletes pairs absent from staging; returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn purge_pairs_not_in_staging(&self) -> Result<u64, StoreError> {
        self.run(&self.schema.purge_pairs, &[])
    }

    /// Empties all three staging tables.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when a statement fails.
    pub fn clear_staging(&self) -> Result<(), StoreError> {
        self.run(&self.schema.clear_temp_keys, &[])?;
        self.run(&self.schema.clear_temp_values, &[])?;
        self.run(&self.schema.clear_temp_pairs, &[])?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Staging
    // ------------------------------------------------------------------------

    /// Stages a key for the purge anti-join.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn stage_key(&self, key: &Value) -> Result<(), StoreError> {
        self.run(&self.schema.stage_key, &[key]).map(drop)
    }

    /// Stages a value for the purge anti-join.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn stage_value(&self, value: &Value) -> Result<(), StoreError> {
        self.run(&self.schema.stage_value, &[value]).map(drop)
    }

    /// Stages an id pair for the stale-pair anti-join.
    ///
    /// Returns false when the pair was already staged in this run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn stage_pair(&self, key_id: RowId, value_id: RowId) -> Result<bool, StoreError> {
        Ok(self.run(&self.schema.stage_pair, &[&key_id, &value_id])? > 0)
    }

    /// Returns the number of staged values.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn count_staged_values(&self) -> Result<u64, StoreError> {
        self.schema.count_staged_values.query_scalar_u64(self.connection, self.retry, &[])
    }

    // ------------------------------------------------------------------------
    // Reads and corrections by payload
    // ------------------------------------------------------------------------

    /// Returns every `(key, value, count)` row in key-id, value-id order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn load(&self) -> Result<Vec<(Value, Value, u64)>, StoreError> {
        self.schema.load.query_all(self.connection, self.retry, &[], |row| {
            Ok((row.get(0)?, row.get(1)?, column_u64(row, 2)?))
        })
    }

    /// Returns the values and counts of one key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn find(&self, key: &Value) -> Result<Vec<(Value, u64)>, StoreError> {
        self.schema.find.query_all(self.connection, self.retry, &[key], |row| {
            Ok((row.get(0)?, column_u64(row, 1)?))
        })
    }

    /// Returns the count of a pair by payload, or 0 when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn count(&self, key: &Value, value: &Value) -> Result<u64, StoreError> {
        let count = self.schema.count_by_payload.query_optional(
            self.connection,
            self.retry,
            &[key, value],
            |row| column_u64(row, 0),
        )?;
        Ok(count.unwrap_or(0))
    }

    /// Sets the count of a pair by payload; returns false when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when `count` is out of range or the statement
    /// fails.
    pub fn set_count(&self, key: &Value, value: &Value, count: u64) -> Result<bool, StoreError> {
        let count = count_param(count)?;
        Ok(self.run(&self.schema.set_count_by_payload, &[key, value, &count])? > 0)
    }

    /// Deletes a pair by payload; returns false when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn remove_pair(&self, key: &Value, value: &Value) -> Result<bool, StoreError> {
        Ok(self.run(&self.schema.remove_pair, &[key, value])? > 0)
    }

    /// Deletes a key row and, by cascade, its pairs; returns false when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn remove_key(&self, key: &Value) -> Result<bool, StoreError> {
        Ok(self.run(&self.schema.remove_key, &[key])? > 0)
    }

    /// Returns the number of keys holding at least one pair.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the statement fails.
    pub fn count_keys(&self) -> Result<u64, StoreError> {
        self.schema.count_keys.query_scalar_u64(self.connection, self.retry, &[])
    }

    /// Deletes every pair, key, and value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when a statement fails.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.run(&self.schema.clear_pairs, &[])?;
        self.run(&self.schema.clear_keys, &[])?;
        self.run(&self.schema.clear_values, &[])?;
        Ok(())
    }
}
