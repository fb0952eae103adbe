// crates/sqlite-containers/tests/common/mod.rs
// ============================================================================
// Module: Test Helpers
// Description: Shared fixtures for SQLite container integration tests.
// Purpose: Build temp-dir backed stores and inspect their raw tables.
// Dependencies: sqlite-containers, rusqlite, tempfile, tracing-subscriber
// ============================================================================

#![allow(dead_code, reason = "Each test binary uses a different subset of helpers.")]

use std::path::Path;
use std::path::PathBuf;
use std::sync::Once;

use rusqlite::Connection;
use sqlite_containers::KeyMultiValueStore;
use sqlite_containers::StoreConfig;
use tempfile::TempDir;

/// Store type used by most scenarios.
pub type TagStore = KeyMultiValueStore<i64, String>;

/// Installs a test-writer tracing subscriber once per binary.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Returns a config for `name` inside `temp`.
pub fn config_in(temp: &TempDir, name: &str) -> StoreConfig {
    StoreConfig::for_path(temp.path().join(name)).with_table_name("tags")
}

/// Opens a fresh tag store in a new temp dir.
pub fn open_store() -> (TempDir, TagStore) {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let store = TagStore::open(config_in(&temp, "store.sqlite")).unwrap();
    (temp, store)
}

/// Returns the store file path of `open_store`.
pub fn store_path(temp: &TempDir) -> PathBuf {
    temp.path().join("store.sqlite")
}

/// Builds owned `(key, value)` pairs.
pub fn pairs(raw: &[(i64, &str)]) -> Vec<(i64, String)> {
    raw.iter().map(|(key, value)| (*key, (*value).to_string())).collect()
}

/// Reads the relation as sorted `(key, value, count)` triples.
pub fn snapshot(store: &TagStore) -> Vec<(i64, String, u64)> {
    let mut rows: Vec<(i64, String, u64)> = store
        .load()
        .unwrap()
        .into_iter()
        .map(|association| (association.key, association.value, association.count))
        .collect();
    rows.sort();
    rows
}

/// Counts rows of a table through an independent connection.
pub fn raw_count(path: &Path, table: &str) -> i64 {
    let connection = Connection::open(path).unwrap();
    connection.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0)).unwrap()
}

/// Returns the sorted key column of the key table.
pub fn raw_keys(path: &Path) -> Vec<i64> {
    let connection = Connection::open(path).unwrap();
    let mut statement = connection.prepare("SELECT key FROM tags_keys ORDER BY key").unwrap();
    statement.query_map([], |row| row.get(0)).unwrap().collect::<Result<_, _>>().unwrap()
}

/// Returns the sorted value column of the value table.
pub fn raw_values(path: &Path) -> Vec<String> {
    let connection = Connection::open(path).unwrap();
    let mut statement = connection.prepare("SELECT value FROM tags_values ORDER BY value").unwrap();
    statement.query_map([], |row| row.get(0)).unwrap().collect::<Result<_, _>>().unwrap()
}
