// crates/sqlite-containers/tests/crash_recovery.rs
// ============================================================================
// Module: Crash Recovery Tests
// Description: Abort a writer process mid-transaction and reopen the store.
// Purpose: Ensure uncommitted reconciliation never reaches the file.
// Dependencies: sqlite-containers, tempfile
// ============================================================================

//! Durability tests driven by the `reconcile_crash_writer` binary.

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

use std::process::Command;

use sqlite_containers::JournalMode;
use sqlite_containers::StoreConfig;
use sqlite_containers::SyncMode;
use tempfile::TempDir;

mod common;
use crate::common::TagStore;
use crate::common::config_in;
use crate::common::init_tracing;
use crate::common::pairs;
use crate::common::snapshot;
use crate::common::store_path;

fn wal_config(temp: &TempDir) -> StoreConfig {
    StoreConfig {
        journal_mode: JournalMode::Wal,
        sync_mode: SyncMode::Full,
        ..config_in(temp, "store.sqlite")
    }
}

#[test]
fn aborted_writer_leaves_committed_relation_intact() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let baseline = {
        let store = TagStore::open(wal_config(&temp)).unwrap();
        store.reconcile(pairs(&[(1, "a"), (1, "a"), (2, "b")])).unwrap();
        snapshot(&store)
    };

    let status = Command::new(env!("CARGO_BIN_EXE_reconcile_crash_writer"))
        .arg(store_path(&temp))
        .arg("tags")
        .status()
        .unwrap();
    assert!(!status.success(), "crash writer exited cleanly: {status:?}");

    let store = TagStore::open(wal_config(&temp)).unwrap();
    assert_eq!(snapshot(&store), baseline);
    store.reconcile(pairs(&[(3, "c")])).unwrap();
    assert_eq!(store.len().unwrap(), 1);
}
