// crates/sqlite-containers/src/frequency.rs
// ============================================================================
// Module: Frequency Map
// Description: Identity strategies and the key -> (value -> count) builder.
// Purpose: Turn any pair source into the canonical input of reconciliation.
// Dependencies: rusqlite
// ============================================================================

//! ## Overview
//! Reconciliation diffs the database against a [`FrequencyMap`]: every
//! distinct key, and under it every distinct value with its occurrence count.
//! What "distinct" means is a policy supplied by the caller through
//! [`Identity`], so types without `PartialEq` (opaque records) can still be
//! grouped, for example by their byte image via [`ByteIdentity`].
//!
//! Strategies that can [`Identity::digest`] a value are bucketed by digest;
//! the rest fall back to a linear scan of previously seen entries. Stores
//! default to [`ColumnIdentity`], which groups payloads exactly as the engine
//! stores them.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::hash::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;

use rusqlite::types::Value;

use crate::column::ByteRecord;
use crate::column::ColumnValue;
use crate::column::Record;

// ============================================================================
// SECTION: Identity Strategies
// ============================================================================

/// Decides whether two payloads denote the same key or value.
///
/// # Invariants
/// - `same` is an equivalence relation.
/// - When `digest` returns `Some` for both arguments, `same(a, b)` implies
///   equal digests.
pub trait Identity<T> {
    /// Returns true when `a` and `b` are the same payload.
    fn same(&self, a: &T, b: &T) -> bool;

    /// Returns a bucketing digest, or `None` to force a linear scan.
    fn digest(&self, _value: &T) -> Option<u64> {
        None
    }
}

/// Identity through the stored column encoding, with hash bucketing.
///
/// Two payloads are the same exactly when the engine would store them in one
/// row. Payloads that cannot be encoded are never the same as anything; the
/// store rejects them before writing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnIdentity;

impl<T: ColumnValue> Identity<T> for ColumnIdentity {
    fn same(&self, a: &T, b: &T) -> bool {
        match (a.to_sql_value(), b.to_sql_value()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    fn digest(&self, value: &T) -> Option<u64> {
        let encoded = value.to_sql_value().ok()?;
        let mut hasher = DefaultHasher::new();
        match encoded {
            Value::Null => hasher.write_u8(0),
            Value::Integer(integer) => {
                hasher.write_u8(1);
                hasher.write_i64(integer);
            }
            Value::Real(real) => {
                hasher.write_u8(2);
                // Signed zeros compare equal.
                let bits = real.to_bits();
                hasher.write_u64(if bits << 1 == 0 { 0 } else { bits });
            }
            Value::Text(text) => {
                hasher.write_u8(3);
                hasher.write(text.as_bytes());
            }
            Value::Blob(blob) => {
                hasher.write_u8(4);
                hasher.write(&blob);
            }
        }
        Some(hasher.finish())
    }
}

/// Identity through `PartialEq`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StructuralIdentity;

impl<T: PartialEq> Identity<T> for StructuralIdentity {
    fn same(&self, a: &T, b: &T) -> bool {
        a == b
    }
}

/// Identity through `Eq` with hash bucketing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashedIdentity;

impl<T: Hash + Eq> Identity<T> for HashedIdentity {
    fn same(&self, a: &T, b: &T) -> bool {
        a == b
    }

    fn digest(&self, value: &T) -> Option<u64> {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        Some(hasher.finish())
    }
}

/// Identity through the byte image of a [`ByteRecord`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteIdentity;

impl<T: ByteRecord> Identity<Record<T>> for ByteIdentity {
    fn same(&self, a: &Record<T>, b: &Record<T>) -> bool {
        a.0.to_bytes() == b.0.to_bytes()
    }

    fn digest(&self, value: &Record<T>) -> Option<u64> {
        let mut hasher = DefaultHasher::new();
        hasher.write(&value.0.to_bytes());
        Some(hasher.finish())
    }
}

impl<T, F> Identity<T> for F
where
    F: Fn(&T, &T) -> bool,
{
    fn same(&self, a: &T, b: &T) -> bool {
        self(a, b)
    }
}

// ============================================================================
// SECTION: Lookup Index
// ============================================================================

/// Positions of previously seen payloads, bucketed by digest when possible.
#[derive(Debug, Default)]
struct SeenIndex {
    /// Positions keyed by digest.
    by_digest: HashMap<u64, Vec<usize>>,
    /// Positions whose payload had no digest.
    undigested: Vec<usize>,
}

impl SeenIndex {
    /// Returns the position of an equal payload, or records `next` as new.
    fn locate<'p, T: 'p, I: Identity<T>>(
        &mut self,
        identity: &I,
        candidate: &T,
        next: usize,
        payload_at: impl Fn(usize) -> Option<&'p T>,
    ) -> Option<usize> {
        let digest = identity.digest(candidate);
        let bucket = match digest {
            Some(digest) => self.by_digest.entry(digest).or_default(),
            None => &mut self.undigested,
        };
        let found = bucket.iter().copied().find(|&position| {
            payload_at(position).is_some_and(|seen| identity.same(seen, candidate))
        });
        if found.is_none() {
            bucket.push(next);
        }
        found
    }
}

// ============================================================================
// SECTION: Frequency Map
// ============================================================================

/// One key and the counted values paired with it.
///
/// # Invariants
/// - `values` is non-empty and holds pairwise-distinct values.
/// - Every count is at least 1.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyFrequencies<K, V> {
    /// The key.
    key: K,
    /// Distinct values with their occurrence counts, in first-seen order.
    values: Vec<(V, u64)>,
}

impl<K, V> KeyFrequencies<K, V> {
    /// Returns the key.
    #[must_use]
    pub const fn key(&self) -> &K {
        &self.key
    }

    /// Returns the counted values.
    #[must_use]
    pub fn values(&self) -> &[(V, u64)] {
        &self.values
    }

    /// Returns the number of occurrences across all values of this key.
    #[must_use]
    pub fn occurrences(&self) -> u64 {
        self.values.iter().map(|(_, count)| *count).fold(0, u64::saturating_add)
    }
}

/// Canonical reconciliation input: `key -> (value -> count)`.
///
/// # Invariants
/// - Keys are pairwise distinct under the key identity and appear in
///   first-seen order.
/// - No key has an empty value list.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyMap<K, V> {
    /// Per-key frequencies.
    entries: Vec<KeyFrequencies<K, V>>,
}

impl<K, V> Default for FrequencyMap<K, V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

/// Builder state while folding pairs into a map.
struct Accumulator<'a, K, V, KI, VI> {
    /// Key identity policy.
    key_identity: &'a KI,
    /// Value identity policy.
    value_identity: &'a VI,
    /// Index over `entries` keys.
    keys: SeenIndex,
    /// Per-key index over that key's values.
    values: Vec<SeenIndex>,
    /// Entries built so far.
    entries: Vec<KeyFrequencies<K, V>>,
}

impl<'a, K, V, KI, VI> Accumulator<'a, K, V, KI, VI>
where
    KI: Identity<K>,
    VI: Identity<V>,
{
    /// Starts an empty accumulator.
    fn new(key_identity: &'a KI, value_identity: &'a VI) -> Self {
        Self {
            key_identity,
            value_identity,
            keys: SeenIndex::default(),
            values: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Counts one occurrence of `(key, value)`.
    fn push(&mut self, key: K, value: V) {
        let next = self.entries.len();
        let entries = &self.entries;
        let slot = self.keys.locate(self.key_identity, &key, next, |at| {
            entries.get(at).map(KeyFrequencies::key)
        });
        let slot = slot.unwrap_or_else(|| {
            self.entries.push(KeyFrequencies {
                key,
                values: Vec::new(),
            });
            self.values.push(SeenIndex::default());
            next
        });
        let (Some(entry), Some(index)) = (self.entries.get_mut(slot), self.values.get_mut(slot))
        else {
            return;
        };
        let next_value = entry.values.len();
        let values = &entry.values;
        let found = index.locate(self.value_identity, &value, next_value, |at| {
            values.get(at).map(|(seen, _)| seen)
        });
        match found.and_then(|at| entry.values.get_mut(at)) {
            Some((_, count)) => *count = count.saturating_add(1),
            None => entry.values.push((value, 1)),
        }
    }

    /// Returns the finished map.
    fn finish(self) -> FrequencyMap<K, V> {
        FrequencyMap {
            entries: self.entries,
        }
    }
}

impl<K, V> FrequencyMap<K, V> {
    /// Counts a source of `(key, value)` pairs, duplicates included.
    #[must_use]
    pub fn build<KI, VI>(
        pairs: impl IntoIterator<Item = (K, V)>,
        key_identity: &KI,
        value_identity: &VI,
    ) -> Self
    where
        KI: Identity<K>,
        VI: Identity<V>,
    {
        let mut accumulator = Accumulator::new(key_identity, value_identity);
        for (key, value) in pairs {
            accumulator.push(key, value);
        }
        accumulator.finish()
    }

    /// Counts a map-of-collections source.
    ///
    /// A key whose collection is empty contributes nothing; repeated keys
    /// merge their collections.
    #[must_use]
    pub fn from_groups<G, KI, VI>(
        groups: impl IntoIterator<Item = (K, G)>,
        key_identity: &KI,
        value_identity: &VI,
    ) -> Self
    where
        K: Clone,
        G: IntoIterator<Item = V>,
        KI: Identity<K>,
        VI: Identity<V>,
    {
        let mut accumulator = Accumulator::new(key_identity, value_identity);
        for (key, group) in groups {
            for value in group {
                accumulator.push(key.clone(), value);
            }
        }
        accumulator.finish()
    }

    /// Returns the number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when the source held no pairs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of distinct `(key, value)` pairs.
    #[must_use]
    pub fn distinct_pairs(&self) -> usize {
        self.entries.iter().map(|entry| entry.values.len()).sum()
    }

    /// Returns the number of pairs in the source, duplicates included.
    #[must_use]
    pub fn total_occurrences(&self) -> u64 {
        self.entries.iter().map(KeyFrequencies::occurrences).fold(0, u64::saturating_add)
    }

    /// Iterates over keys in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = &KeyFrequencies<K, V>> {
        self.entries.iter()
    }
}

impl<'a, K, V> IntoIterator for &'a FrequencyMap<K, V> {
    type Item = &'a KeyFrequencies<K, V>;
    type IntoIter = std::slice::Iter<'a, KeyFrequencies<K, V>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
