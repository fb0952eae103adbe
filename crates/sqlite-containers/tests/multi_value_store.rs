// crates/sqlite-containers/tests/multi_value_store.rs
// ============================================================================
// Module: Multi-Value Store Tests
// Description: Validate reconciliation, append, reads, and lifecycle.
// Purpose: Ensure the persisted relation mirrors its source exactly.
// Dependencies: sqlite-containers, rusqlite, tempfile
// ============================================================================

//! ## Overview
//! End-to-end tests for [`KeyMultiValueStore`] against real database files.
//! Raw connections inspect the key, value, and junction tables directly, and
//! tamper with the schema to force engine failures mid-reconciliation.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::mpsc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use rusqlite::Connection;
use rusqlite::types::Value;
use sqlite_containers::ByteIdentity;
use sqlite_containers::ByteRecord;
use sqlite_containers::ColumnIdentity;
use sqlite_containers::KeyMultiValueStore;
use sqlite_containers::Record;
use sqlite_containers::Relation;
use sqlite_containers::StoreConfig;
use sqlite_containers::StoreError;
use sqlite_containers::StructuralIdentity;
use sqlite_containers::TransactionMode;
use sqlite_containers::fixed_bytes;
use tempfile::TempDir;

mod common;
use crate::common::TagStore;
use crate::common::config_in;
use crate::common::init_tracing;
use crate::common::open_store;
use crate::common::pairs;
use crate::common::raw_count;
use crate::common::raw_keys;
use crate::common::raw_values;
use crate::common::snapshot;
use crate::common::store_path;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// RGB pixel without `PartialEq`; stored by byte image.
#[derive(Debug, Clone, Copy)]
struct Pixel {
    r: u8,
    g: u8,
    b: u8,
}

impl ByteRecord for Pixel {
    fn to_bytes(&self) -> Vec<u8> {
        vec![self.r, self.g, self.b]
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let [r, g, b] = fixed_bytes::<3>(bytes)?;
        Ok(Self {
            r,
            g,
            b,
        })
    }
}

/// Key identity that tells signed zeros apart.
fn bitwise(a: &f64, b: &f64) -> bool {
    a.to_bits() == b.to_bits()
}

fn triples(raw: &[(i64, &str, u64)]) -> Vec<(i64, String, u64)> {
    let mut rows: Vec<(i64, String, u64)> =
        raw.iter().map(|(key, value, count)| (*key, (*value).to_string(), *count)).collect();
    rows.sort();
    rows
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[test]
fn reconcile_counts_duplicate_pairs() {
    let (_temp, store) = open_store();
    let report = store.reconcile(pairs(&[(1, "a"), (1, "a"), (2, "b")])).unwrap();
    assert_eq!(snapshot(&store), triples(&[(1, "a", 2), (2, "b", 1)]));
    assert_eq!(report.keys, 2);
    assert_eq!(report.values, 2);
    assert_eq!(report.pairs, 2);
    assert_eq!(report.occurrences, 3);
    assert_eq!(report.created_pairs, 2);
}

#[test]
fn reconcile_is_idempotent() {
    let (_temp, store) = open_store();
    let source = pairs(&[(1, "a"), (1, "b"), (1, "b"), (3, "a"), (4, "d")]);
    store.reconcile(source.clone()).unwrap();
    let first = snapshot(&store);
    let report = store.reconcile(source).unwrap();
    assert_eq!(snapshot(&store), first);
    assert_eq!(report.created_pairs, 0);
    assert_eq!(report.purged_keys, 0);
    assert_eq!(report.purged_values, 0);
    assert_eq!(report.stale_pairs, 0);
}

#[test]
fn reconcile_purges_keys_and_values_of_disjoint_source() {
    let (temp, store) = open_store();
    store.reconcile(pairs(&[(1, "a"), (2, "b"), (2, "c")])).unwrap();
    let report = store.reconcile(pairs(&[(7, "x"), (8, "y"), (8, "y")])).unwrap();
    assert_eq!(report.purged_keys, 2);
    assert_eq!(report.purged_values, 3);
    let path = store_path(&temp);
    assert_eq!(raw_keys(&path), vec![7, 8]);
    assert_eq!(raw_values(&path), vec!["x".to_string(), "y".to_string()]);
    assert_eq!(snapshot(&store), triples(&[(7, "x", 1), (8, "y", 2)]));
}

#[test]
fn reconcile_with_empty_source_wipes_relation() {
    let (temp, store) = open_store();
    store.reconcile(pairs(&[(1, "a"), (1, "a"), (2, "b")])).unwrap();
    store.reconcile(Vec::new()).unwrap();
    let path = store_path(&temp);
    assert_eq!(raw_count(&path, "tags_keys"), 0);
    assert_eq!(raw_count(&path, "tags_values"), 0);
    assert_eq!(raw_count(&path, "tags_key_value"), 0);
    assert!(store.is_empty().unwrap());
}

#[test]
fn append_accumulates_while_reconcile_replaces() {
    let (_temp, appended) = open_store();
    let source = pairs(&[(1, "a"), (1, "a"), (2, "b")]);
    assert_eq!(appended.append(source.clone()).unwrap(), 3);
    appended.append(source.clone()).unwrap();
    assert_eq!(snapshot(&appended), triples(&[(1, "a", 4), (2, "b", 2)]));

    let (_temp, reconciled) = open_store();
    reconciled.reconcile(source.clone()).unwrap();
    reconciled.reconcile(source).unwrap();
    assert_eq!(snapshot(&reconciled), triples(&[(1, "a", 2), (2, "b", 1)]));
}

#[test]
fn reconcile_replaces_swapped_pairs() {
    let (temp, store) = open_store();
    store.reconcile(pairs(&[(1, "a"), (2, "b")])).unwrap();
    let report = store.reconcile(pairs(&[(1, "b"), (2, "a")])).unwrap();
    assert_eq!(report.stale_pairs, 2);
    assert_eq!(report.created_pairs, 2);
    assert_eq!(snapshot(&store), triples(&[(1, "b", 1), (2, "a", 1)]));
    assert_eq!(raw_count(&store_path(&temp), "tags_key_value"), 2);
}

#[test]
fn reconcile_sets_counts_instead_of_adding() {
    let (_temp, store) = open_store();
    store.reconcile(pairs(&[(1, "a"), (1, "a"), (1, "a"), (2, "b")])).unwrap();
    store.reconcile(pairs(&[(1, "a"), (2, "b"), (2, "b")])).unwrap();
    assert_eq!(snapshot(&store), triples(&[(1, "a", 1), (2, "b", 2)]));
}

#[test]
fn reconcile_groups_ignores_keys_without_values() {
    let (temp, store) = open_store();
    store.reconcile(pairs(&[(1, "a"), (3, "c")])).unwrap();
    let groups = vec![
        (1, vec!["a".to_string(), "a".to_string()]),
        (2, Vec::new()),
        (3, Vec::new()),
    ];
    store.reconcile_groups(groups).unwrap();
    assert_eq!(snapshot(&store), triples(&[(1, "a", 2)]));
    assert_eq!(raw_keys(&store_path(&temp)), vec![1]);
}

#[test]
fn reconcile_discards_staging_residue_from_earlier_work() {
    let (temp, store) = open_store();
    store.reconcile(pairs(&[(1, "a"), (2, "b")])).unwrap();

    let (sender, receiver) = mpsc::channel();
    store
        .spawn_background(move |context| {
            let staged = context.with_session(|session| {
                let relation = Relation::new(session);
                let key = Value::Integer(2);
                let value = Value::Text("b".to_string());
                let key_id = relation.get_key_id(&key)?.unwrap();
                let value_id = relation.get_value_id(&value)?.unwrap();
                relation.stage_key(&key)?;
                relation.stage_value(&value)?;
                relation.stage_pair(key_id, value_id)
            });
            sender.send(staged).unwrap();
        })
        .unwrap();
    assert!(receiver.recv_timeout(Duration::from_secs(5)).unwrap().unwrap());

    let report = store.reconcile(pairs(&[(1, "a")])).unwrap();
    assert_eq!(report.purged_keys, 1);
    assert_eq!(report.purged_values, 1);
    assert_eq!(snapshot(&store), triples(&[(1, "a", 1)]));
    let path = store_path(&temp);
    assert_eq!(raw_keys(&path), vec![1]);
    assert_eq!(raw_values(&path), vec!["a".to_string()]);
}

#[test]
fn identity_finer_than_storage_merges_counts() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let store: KeyMultiValueStore<f64, String, fn(&f64, &f64) -> bool, ColumnIdentity> =
        KeyMultiValueStore::open_with_identity(
            config_in(&temp, "zeros.sqlite"),
            bitwise as fn(&f64, &f64) -> bool,
            ColumnIdentity,
        )
        .unwrap();
    let source = vec![(0.0, "a".to_string()), (-0.0, "a".to_string()), (-0.0, "a".to_string())];
    let report = store.reconcile(source.clone()).unwrap();
    assert_eq!(report.keys, 1);
    assert_eq!(report.pairs, 1);
    assert_eq!(report.occurrences, 3);
    assert_eq!(report.created_pairs, 1);
    let rows: Vec<(String, u64)> =
        store.load().unwrap().into_iter().map(|row| (row.value, row.count)).collect();
    assert_eq!(rows, vec![("a".to_string(), 3)]);

    store.reconcile(source).unwrap();
    assert_eq!(store.count(&0.0, &"a".to_string()).unwrap(), 3);
}

#[test]
fn default_identity_groups_signed_zeros_like_storage() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let store: KeyMultiValueStore<f64, String> =
        KeyMultiValueStore::open(config_in(&temp, "zeros.sqlite")).unwrap();
    let report = store.reconcile([(0.0, "a".to_string()), (-0.0, "a".to_string())]).unwrap();
    assert_eq!(report.pairs, 1);
    assert_eq!(store.count(&-0.0, &"a".to_string()).unwrap(), 2);
}

#[test]
fn read_only_store_loads_and_rejects_reconcile() {
    let (temp, store) = open_store();
    store.reconcile(pairs(&[(1, "a"), (1, "a")])).unwrap();
    store.disconnect().unwrap();

    let reader = TagStore::open(StoreConfig {
        read_only: true,
        ..config_in(&temp, "store.sqlite")
    })
    .unwrap();
    assert_eq!(snapshot(&reader), triples(&[(1, "a", 2)]));
    let error = reader.reconcile(pairs(&[(2, "b")])).unwrap_err();
    // SQLITE_READONLY
    assert_eq!(error.code(), Some(8));
    assert_eq!(snapshot(&reader), triples(&[(1, "a", 2)]));
}

#[test]
fn oversized_busy_timeout_is_rejected_at_open() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let config = StoreConfig {
        busy_timeout_ms: 3_000_000_000,
        ..config_in(&temp, "store.sqlite")
    };
    assert!(matches!(TagStore::open(config), Err(StoreError::Invalid(_))));
    assert!(!store_path(&temp).exists());
}

#[test]
fn engine_failure_mid_reconcile_leaves_relation_unchanged() {
    let (temp, store) = open_store();
    store.reconcile(pairs(&[(1, "a"), (1, "a"), (2, "b")])).unwrap();
    let before = snapshot(&store);
    let path = store_path(&temp);
    let tamper = Connection::open(&path).unwrap();
    tamper
        .execute_batch(
            "CREATE TRIGGER reject_key_99 BEFORE INSERT ON tags_key_value
             WHEN NEW.key_id = (SELECT id FROM tags_keys WHERE key = 99)
             BEGIN SELECT RAISE(ABORT, 'forced failure'); END;",
        )
        .unwrap();

    let error = store.reconcile(pairs(&[(3, "c"), (99, "z"), (4, "d")])).unwrap_err();
    // SQLITE_CONSTRAINT_TRIGGER
    assert_eq!(error.code(), Some(1811));
    assert_eq!(snapshot(&store), before);
    assert_eq!(raw_keys(&path), vec![1, 2]);
    assert_eq!(raw_values(&path), vec!["a".to_string(), "b".to_string()]);

    tamper.execute_batch("DROP TRIGGER reject_key_99;").unwrap();
    store.reconcile(pairs(&[(3, "c"), (99, "z")])).unwrap();
    assert_eq!(snapshot(&store), triples(&[(3, "c", 1), (99, "z", 1)]));
}

#[test]
fn unencodable_value_mid_append_rolls_back() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let store: KeyMultiValueStore<i64, f64> =
        KeyMultiValueStore::open(config_in(&temp, "floats.sqlite")).unwrap();
    store.append([(1, 0.5)]).unwrap();
    let error = store.append([(2, 1.5), (3, f64::NAN)]).unwrap_err();
    assert!(matches!(error, StoreError::Invalid(_)));
    let rows: Vec<(i64, f64, u64)> = store
        .load()
        .unwrap()
        .into_iter()
        .map(|association| (association.key, association.value, association.count))
        .collect();
    assert_eq!(rows, vec![(1, 0.5, 1)]);
}

#[test]
fn point_reads_and_corrections() {
    let (_temp, store) = open_store();
    store.reconcile(pairs(&[(1, "a"), (1, "a"), (1, "b"), (2, "c")])).unwrap();

    assert_eq!(
        store.find(&1).unwrap(),
        Some(vec![("a".to_string(), 2), ("b".to_string(), 1)])
    );
    assert_eq!(store.find(&9).unwrap(), None);
    assert_eq!(store.count(&1, &"a".to_string()).unwrap(), 2);
    assert_eq!(store.count(&2, &"a".to_string()).unwrap(), 0);
    assert_eq!(store.len().unwrap(), 2);

    assert!(store.set_count(&1, &"b".to_string(), 5).unwrap());
    assert_eq!(store.count(&1, &"b".to_string()).unwrap(), 5);
    assert!(!store.set_count(&2, &"a".to_string(), 3).unwrap());
    assert_eq!(store.count(&2, &"a".to_string()).unwrap(), 0);
    assert!(store.set_count(&1, &"a".to_string(), 0).unwrap());
    assert_eq!(store.find(&1).unwrap(), Some(vec![("b".to_string(), 5)]));

    assert!(store.remove_pair(&2, &"c".to_string()).unwrap());
    assert!(!store.remove_pair(&2, &"c".to_string()).unwrap());
    assert_eq!(store.find(&2).unwrap(), None);
    assert_eq!(store.len().unwrap(), 1);

    assert!(store.remove(&1).unwrap());
    assert!(!store.remove(&1).unwrap());
    assert!(store.is_empty().unwrap());
}

#[test]
fn insert_increments_existing_pairs() {
    let (_temp, store) = open_store();
    store.insert(1, "a".to_string()).unwrap();
    store.insert_with(1, "a".to_string(), TransactionMode::Immediate).unwrap();
    store.insert(1, "b".to_string()).unwrap();
    assert_eq!(snapshot(&store), triples(&[(1, "a", 2), (1, "b", 1)]));
}

#[test]
fn load_pairs_expands_counts() {
    let (_temp, store) = open_store();
    store.reconcile(pairs(&[(2, "b"), (1, "a"), (2, "b")])).unwrap();
    let mut expanded = store.load_pairs().unwrap();
    expanded.sort();
    assert_eq!(expanded, pairs(&[(1, "a"), (2, "b"), (2, "b")]));
}

#[test]
fn clear_empties_every_table() {
    let (temp, store) = open_store();
    store.reconcile(pairs(&[(1, "a"), (2, "b")])).unwrap();
    store.clear_with(TransactionMode::Exclusive).unwrap();
    let path = store_path(&temp);
    assert_eq!(raw_count(&path, "tags_keys"), 0);
    assert_eq!(raw_count(&path, "tags_values"), 0);
    assert_eq!(raw_count(&path, "tags_key_value"), 0);
    store.append(pairs(&[(1, "a")])).unwrap();
    store.clear().unwrap();
    assert!(store.is_empty().unwrap());
}

#[test]
fn default_table_names_when_unnamed() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("plain.sqlite");
    let store: TagStore = KeyMultiValueStore::open(StoreConfig::for_path(&path)).unwrap();
    store.reconcile(pairs(&[(1, "a"), (2, "a")])).unwrap();
    assert_eq!(raw_count(&path, "keys_store"), 2);
    assert_eq!(raw_count(&path, "values_store"), 1);
    assert_eq!(raw_count(&path, "key_value_store"), 2);
}

#[test]
fn reconnect_switches_database_files() {
    let (temp, store) = open_store();
    store.reconcile(pairs(&[(1, "a")])).unwrap();
    store.reconnect(config_in(&temp, "other.sqlite")).unwrap();
    assert!(store.config().unwrap().path.ends_with("other.sqlite"));
    assert!(store.is_empty().unwrap());
    store.reconnect(config_in(&temp, "store.sqlite")).unwrap();
    assert_eq!(snapshot(&store), triples(&[(1, "a", 1)]));
}

#[test]
fn disconnected_store_reports_not_connected() {
    let (_temp, store) = open_store();
    store.disconnect().unwrap();
    assert!(!store.is_connected());
    assert_eq!(store.reconcile(Vec::new()).unwrap_err(), StoreError::NotConnected);
    assert_eq!(store.load().unwrap_err(), StoreError::NotConnected);
    store.disconnect().unwrap();
}

#[test]
fn data_survives_reopen() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    {
        let store = TagStore::open(config_in(&temp, "store.sqlite")).unwrap();
        store.reconcile(pairs(&[(5, "e"), (5, "e")])).unwrap();
    }
    let store = TagStore::open(config_in(&temp, "store.sqlite")).unwrap();
    assert_eq!(snapshot(&store), triples(&[(5, "e", 2)]));
}

#[test]
fn caller_transaction_rollback_discards_operations() {
    let (_temp, store) = open_store();
    store.reconcile(pairs(&[(1, "a")])).unwrap();

    store.begin(TransactionMode::Immediate).unwrap();
    store.reconcile(pairs(&[(2, "b"), (3, "c")])).unwrap();
    store.append(pairs(&[(2, "b")])).unwrap();
    assert_eq!(snapshot(&store), triples(&[(2, "b", 2), (3, "c", 1)]));
    store.rollback().unwrap();
    assert_eq!(snapshot(&store), triples(&[(1, "a", 1)]));

    store.begin(TransactionMode::Deferred).unwrap();
    assert!(matches!(store.begin(TransactionMode::Deferred), Err(StoreError::Engine { .. })));
    store.append(pairs(&[(1, "a")])).unwrap();
    store.commit().unwrap();
    assert_eq!(snapshot(&store), triples(&[(1, "a", 2)]));
}

#[test]
fn failed_operation_inside_caller_transaction_only_undoes_itself() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let store: KeyMultiValueStore<i64, f64> =
        KeyMultiValueStore::open(config_in(&temp, "floats.sqlite")).unwrap();
    store.begin(TransactionMode::Immediate).unwrap();
    store.append([(1, 0.25)]).unwrap();
    assert!(store.append([(2, 0.5), (3, f64::NAN)]).is_err());
    store.commit().unwrap();
    let keys: Vec<i64> = store.load().unwrap().into_iter().map(|row| row.key).collect();
    assert_eq!(keys, vec![1]);
}

#[test]
fn opaque_records_are_grouped_by_bytes() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let store: KeyMultiValueStore<String, Record<Pixel>, StructuralIdentity, ByteIdentity> =
        KeyMultiValueStore::open_with_identity(
            config_in(&temp, "pixels.sqlite"),
            StructuralIdentity,
            ByteIdentity,
        )
        .unwrap();
    let red = Record(Pixel {
        r: 255,
        g: 0,
        b: 0,
    });
    let blue = Record(Pixel {
        r: 0,
        g: 0,
        b: 255,
    });
    let report = store
        .reconcile([
            ("sprite".to_string(), red),
            ("sprite".to_string(), red),
            ("sprite".to_string(), blue),
            ("icon".to_string(), blue),
        ])
        .unwrap();
    assert_eq!(report.values, 2);
    let found = store.find(&"sprite".to_string()).unwrap().unwrap();
    let found: Vec<(Vec<u8>, u64)> =
        found.into_iter().map(|(pixel, count)| (pixel.0.to_bytes(), count)).collect();
    assert_eq!(found, vec![(vec![255, 0, 0], 2), (vec![0, 0, 255], 1)]);
    assert_eq!(store.count(&"icon".to_string(), &blue).unwrap(), 1);
}

#[test]
fn background_task_shares_the_instance_mutex() {
    let (_temp, store) = open_store();
    let observed = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&observed);
    store
        .spawn_background(move |context| {
            while context.wait(Duration::from_millis(5)) {
                if let Ok(keys) = context.with_session(|session| Relation::new(session).count_keys())
                {
                    sink.store(keys, Ordering::SeqCst);
                }
            }
        })
        .unwrap();
    store.reconcile(pairs(&[(1, "a"), (2, "b"), (3, "c")])).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while observed.load(Ordering::SeqCst) != 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(observed.load(Ordering::SeqCst), 3);
    store.disconnect().unwrap();
}

#[test]
fn busy_store_retries_until_lock_is_released() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let holder = TagStore::open(config_in(&temp, "store.sqlite")).unwrap();
    let waiter_config = StoreConfig {
        busy_timeout_ms: 0,
        busy_retry_delay_ms: 5,
        ..config_in(&temp, "store.sqlite")
    };
    let waiter = TagStore::open(waiter_config).unwrap();

    holder.begin(TransactionMode::Exclusive).unwrap();
    holder.append(pairs(&[(1, "held")])).unwrap();
    let started = Instant::now();
    let handle = thread::spawn(move || {
        let report = waiter.reconcile_with(pairs(&[(2, "b")]), TransactionMode::Immediate);
        (report, started.elapsed(), waiter)
    });
    thread::sleep(Duration::from_millis(100));
    holder.commit().unwrap();

    let (report, waited, waiter) = handle.join().unwrap();
    report.unwrap();
    assert!(waited >= Duration::from_millis(100));
    assert_eq!(snapshot(&waiter), triples(&[(2, "b", 1)]));
}

#[test]
fn busy_retry_ceiling_surfaces_busy_error() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let holder = TagStore::open(config_in(&temp, "store.sqlite")).unwrap();
    let waiter_config = StoreConfig {
        busy_timeout_ms: 0,
        busy_retry_delay_ms: 1,
        max_busy_retries: Some(2),
        ..config_in(&temp, "store.sqlite")
    };
    let waiter = TagStore::open(waiter_config).unwrap();

    holder.begin(TransactionMode::Exclusive).unwrap();
    let error = waiter.reconcile_with(pairs(&[(2, "b")]), TransactionMode::Immediate).unwrap_err();
    assert_eq!(error, StoreError::Busy { attempts: 3 });
    holder.rollback().unwrap();
    waiter.reconcile_with(pairs(&[(2, "b")]), TransactionMode::Immediate).unwrap();
}
