// crates/sqlite-containers/src/multi_value/reconcile.rs
// ============================================================================
// Module: Reconciliation Engine
// Description: Diff-based rewrite of the relation to match a frequency map.
// Purpose: Make the persisted relation equal a source multiset of pairs.
// Dependencies: rusqlite, tracing
// ============================================================================

//! ## Overview
//! [`reconcile`] makes the junction table equal a [`FrequencyMap`] without
//! reading the existing relation into memory. The engine computes the diff:
//!
//! 1. Clear the staging tables.
//! 2. Upsert and stage every key and value of the source.
//! 3. Resolve ids, insert pairs that have no row yet, and stage every id pair.
//!    Source entries that resolve to the same id pair add their counts.
//! 4. Purge keys, values, and pairs that are not staged (anti-joins).
//! 5. Clear the staging tables.
//! 6. Set every pair's count to its multiplicity in the source.
//!
//! Callers run it inside one transaction; a failure at any step rolls the
//! whole rewrite back. An id that cannot be found right after its row was
//! upserted is reported as [`StoreError::Inconsistent`].
//!
//! [`append`] is the additive counterpart: no staging, no purge, counts are
//! incremented.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::collections::HashSet;

use rusqlite::types::Value;
use tracing::debug;

use crate::column::ColumnValue;
use crate::error::StoreError;
use crate::frequency::FrequencyMap;
use crate::multi_value::ops::Relation;
use crate::multi_value::ops::RowId;

// ============================================================================
// SECTION: Report
// ============================================================================

/// Summary of one successful reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Distinct key rows the source maps to.
    pub keys: u64,
    /// Distinct value rows the source maps to, across all keys.
    pub values: u64,
    /// Distinct pair rows the source maps to.
    pub pairs: u64,
    /// Pairs in the source, duplicates included.
    pub occurrences: u64,
    /// Pairs that had no row before this run.
    pub created_pairs: u64,
    /// Key rows removed because the source no longer mentions them.
    pub purged_keys: u64,
    /// Value rows removed because the source no longer mentions them.
    pub purged_values: u64,
    /// Pair rows removed although both their key and value survived.
    pub stale_pairs: u64,
}

// ============================================================================
// SECTION: Encoding
// ============================================================================

/// One source key with its encoded values and counts.
struct EncodedKey {
    /// Encoded key.
    key: Value,
    /// Encoded values with their counts.
    values: Vec<(Value, u64)>,
}

/// Encodes the whole source up front so no step fails halfway on bad data.
fn encode<K, V>(source: &FrequencyMap<K, V>) -> Result<Vec<EncodedKey>, StoreError>
where
    K: ColumnValue,
    V: ColumnValue,
{
    source
        .iter()
        .map(|entry| {
            let values = entry
                .values()
                .iter()
                .map(|(value, count)| Ok((value.to_sql_value()?, *count)))
                .collect::<Result<Vec<_>, StoreError>>()?;
            Ok(EncodedKey {
                key: entry.key().to_sql_value()?,
                values,
            })
        })
        .collect()
}

/// Upserts a key and returns its id.
fn resolve_key(relation: &Relation<'_>, key: &Value) -> Result<RowId, StoreError> {
    relation.insert_key_if_absent(key)?;
    relation
        .get_key_id(key)?
        .ok_or_else(|| StoreError::Inconsistent("key row missing right after upsert".to_string()))
}

/// Upserts a value and returns its id.
fn resolve_value(relation: &Relation<'_>, value: &Value) -> Result<RowId, StoreError> {
    relation.insert_value_if_absent(value)?;
    relation
        .get_value_id(value)?
        .ok_or_else(|| StoreError::Inconsistent("value row missing right after upsert".to_string()))
}

/// Converts a collection size for the report.
fn as_count(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

// ============================================================================
// SECTION: Reconcile
// ============================================================================

/// Rewrites the relation to equal `source`.
///
/// Must run inside a transaction; partial progress is only undone by rolling
/// it back.
///
/// # Errors
///
/// Returns [`StoreError::Invalid`] when a payload cannot be encoded,
/// [`StoreError::Inconsistent`] when an id lookup or count update misses a
/// row it just wrote, or [`StoreError::Engine`] on engine failure.
pub fn reconcile<K, V>(
    relation: &Relation<'_>,
    source: &FrequencyMap<K, V>,
) -> Result<ReconcileReport, StoreError>
where
    K: ColumnValue,
    V: ColumnValue,
{
    let encoded = encode(source)?;
    let mut report = ReconcileReport {
        occurrences: source.total_occurrences(),
        ..ReconcileReport::default()
    };

    // 1. Residue from an earlier aborted run would corrupt the anti-joins.
    relation.clear_staging()?;

    // 2. The keep set must be complete before anything is purged.
    for entry in &encoded {
        relation.insert_key_if_absent(&entry.key)?;
        relation.stage_key(&entry.key)?;
        for (value, _) in &entry.values {
            relation.insert_value_if_absent(value)?;
            relation.stage_value(value)?;
        }
    }
    report.values = relation.count_staged_values()?;

    // 3. Create missing pairs; existing counts are left for step 6. Entries
    // the identity policy kept apart but the engine stores as one row merge.
    let mut resolved: Vec<(RowId, RowId, u64)> = Vec::with_capacity(source.distinct_pairs());
    let mut positions: HashMap<(RowId, RowId), usize> = HashMap::new();
    for entry in &encoded {
        let key_id = relation.get_key_id(&entry.key)?.ok_or_else(|| {
            StoreError::Inconsistent("staged key has no key row".to_string())
        })?;
        for (value, count) in &entry.values {
            let value_id = relation.get_value_id(value)?.ok_or_else(|| {
                StoreError::Inconsistent("staged value has no value row".to_string())
            })?;
            if relation.get_pair_count(key_id, value_id)? == 0 {
                relation.insert_pair(key_id, value_id)?;
                report.created_pairs += 1;
            }
            if relation.stage_pair(key_id, value_id)? {
                positions.insert((key_id, value_id), resolved.len());
                resolved.push((key_id, value_id, *count));
                continue;
            }
            let merged = positions
                .get(&(key_id, value_id))
                .and_then(|&at| resolved.get_mut(at))
                .ok_or_else(|| {
                    StoreError::Inconsistent("staged pair missing from this run".to_string())
                })?;
            merged.2 = merged.2.saturating_add(*count);
        }
    }
    report.keys = as_count(
        resolved.iter().map(|(key_id, _, _)| *key_id).collect::<HashSet<RowId>>().len(),
    );
    report.pairs = as_count(resolved.len());

    // 4. Key and value purges cascade into pairs.
    report.purged_keys = relation.purge_keys_not_in_staging()?;
    report.purged_values = relation.purge_values_not_in_staging()?;
    report.stale_pairs = relation.purge_pairs_not_in_staging()?;

    // 5.
    relation.clear_staging()?;

    // 6.
    for (key_id, value_id, count) in resolved {
        if !relation.set_pair_count(key_id, value_id, count)? {
            return Err(StoreError::Inconsistent(
                "pair row vanished before its count was set".to_string(),
            ));
        }
    }

    debug!(
        keys = report.keys,
        values = report.values,
        pairs = report.pairs,
        created_pairs = report.created_pairs,
        purged_keys = report.purged_keys,
        purged_values = report.purged_values,
        stale_pairs = report.stale_pairs,
        "relation reconciled"
    );
    Ok(report)
}

// ============================================================================
// SECTION: Append
// ============================================================================

/// Adds one occurrence of every pair; returns the number of pairs applied.
///
/// Must run inside a transaction.
///
/// # Errors
///
/// Returns [`StoreError::Invalid`] when a payload cannot be encoded,
/// [`StoreError::Inconsistent`] when an id lookup misses a row it just
/// upserted, or [`StoreError::Engine`] on engine failure.
pub fn append<K, V>(
    relation: &Relation<'_>,
    pairs: impl IntoIterator<Item = (K, V)>,
) -> Result<u64, StoreError>
where
    K: ColumnValue,
    V: ColumnValue,
{
    let mut applied: u64 = 0;
    for (key, value) in pairs {
        let key_id = resolve_key(relation, &key.to_sql_value()?)?;
        let value_id = resolve_value(relation, &value.to_sql_value()?)?;
        match relation.get_pair_count(key_id, value_id)? {
            0 => relation.insert_pair(key_id, value_id)?,
            count => {
                relation.set_pair_count(key_id, value_id, count.saturating_add(1))?;
            }
        }
        applied += 1;
    }
    debug!(pairs = applied, "pairs appended");
    Ok(applied)
}
