//! `SQLite` crash writer for reconciliation durability tests.
// crates/sqlite-containers/src/bin/reconcile_crash_writer.rs
// ============================================================================
// Binary: Reconcile Crash Writer
// Description: Aborts the process inside an uncommitted reconciliation.
// Purpose: Support durability tests for rollback/crash recovery behavior.
// Dependencies: sqlite-containers
// ============================================================================

use std::env;
use std::path::PathBuf;

use sqlite_containers::JournalMode;
use sqlite_containers::KeyMultiValueStore;
use sqlite_containers::StoreConfig;
use sqlite_containers::SyncMode;
use sqlite_containers::TransactionMode;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let path = args.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing sqlite path")
    })?;
    let table_name = args.next().unwrap_or_default();

    let config = StoreConfig {
        journal_mode: JournalMode::Wal,
        sync_mode: SyncMode::Full,
        ..StoreConfig::for_path(PathBuf::from(path)).with_table_name(table_name)
    };
    let store: KeyMultiValueStore<i64, String> = KeyMultiValueStore::open(config)?;

    store.begin(TransactionMode::Immediate)?;
    store.reconcile((100 .. 110).map(|key| (key, format!("crash-{key}"))))?;
    store.append([(1, "a".to_string()), (1, "a".to_string())])?;

    std::process::abort();
}
