// crates/stage-relay-store-sqlite/tests/sqlite_store.rs
// ============================================================================
// Module: SQLite Store Tests
// Description: Validate SQLite RevisionStore behavior.
// Purpose: Ensure durable, gap-free, integrity-checked revision storage.
// Dependencies: stage-relay-store-sqlite, stage-relay-core, rusqlite, tempfile
// ============================================================================

//! ## Overview
//! Conformance tests for the SQLite-backed revision store. Exercises
//! sequencing, durability across reopen, stale flags, dataset deletion,
//! concurrent writers, and tampered storage.

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

use std::collections::BTreeSet;
use std::path::Path;
use std::thread;

use rusqlite::Connection;
use rusqlite::params;
use stage_relay_core::Artifact;
use stage_relay_core::DatasetId;
use stage_relay_core::RevisionStore;
use stage_relay_core::Stage;
use stage_relay_core::StaleMark;
use stage_relay_core::StoreError;
use stage_relay_core::hashing::DEFAULT_HASH_ALGORITHM;
use stage_relay_core::hashing::hash_bytes;
use stage_relay_store_sqlite::SqliteRevisionStore;
use stage_relay_store_sqlite::SqliteStoreConfig;
use stage_relay_store_sqlite::SqliteStoreError;
use stage_relay_store_sqlite::SqliteStoreMode;
use tempfile::TempDir;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Opens a store at `path` with default settings.
fn open(path: &Path) -> SqliteRevisionStore {
    SqliteRevisionStore::new(&SqliteStoreConfig::at(path)).unwrap()
}

/// Returns a dataset id for tests.
fn dataset(raw: u64) -> DatasetId {
    DatasetId::from_raw(raw).unwrap()
}

// ============================================================================
// SECTION: Tests
// ============================================================================

/// Verifies two appends yield sequences 1 and 2 with the latter as latest.
#[test]
fn sqlite_append_latest_history() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir.path().join("store.db"));

    let first = store.append(dataset(42), Stage::Bathy, Artifact::from("A")).unwrap();
    let second = store.append(dataset(42), Stage::Bathy, Artifact::from("B")).unwrap();
    assert_eq!((first.sequence, second.sequence), (1, 2));

    let latest = store.latest(dataset(42), Stage::Bathy).unwrap();
    assert_eq!(latest.artifact, Artifact::from("B"));
    assert_eq!(latest.content_hash, hash_bytes(DEFAULT_HASH_ALGORITHM, b"B"));
    assert!(!latest.stale);

    let history = store.history(dataset(42), Stage::Bathy).unwrap();
    let bodies: Vec<&[u8]> = history.iter().map(|rev| rev.artifact.as_bytes()).collect();
    assert_eq!(bodies, vec![b"A".as_slice(), b"B".as_slice()]);
    assert_eq!(store.revision(dataset(42), Stage::Bathy, 1).unwrap().artifact, Artifact::from("A"));
}

/// Verifies missing keys report not found through the store interface.
#[test]
fn sqlite_missing_revision_is_not_found() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir.path().join("store.db"));
    assert_eq!(
        store.latest(dataset(1), Stage::Heatflow).unwrap_err(),
        StoreError::NotFound {
            dataset_id: dataset(1),
            stage: Stage::Heatflow,
        }
    );
    assert!(store.history(dataset(1), Stage::Heatflow).unwrap().is_empty());
    assert!(store.revision(dataset(1), Stage::Heatflow, 3).is_err());
}

/// Verifies revisions and stale flags survive reopening the database.
#[test]
fn sqlite_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("store.db");
    {
        let store = open(&path);
        store.append(dataset(7), Stage::Routing, Artifact::from("r1")).unwrap();
        store.append(dataset(7), Stage::Heatflow, Artifact::from("h1")).unwrap();
        assert_eq!(
            store.mark_stale(dataset(7), Stage::Heatflow).unwrap(),
            StaleMark::Marked {
                sequence: 1,
            }
        );
    }
    let reopened = open(&path);
    assert!(reopened.latest(dataset(7), Stage::Heatflow).unwrap().stale);
    assert_eq!(
        reopened.mark_stale(dataset(7), Stage::Heatflow).unwrap(),
        StaleMark::AlreadyStale {
            sequence: 1,
        }
    );
    let next = reopened.append(dataset(7), Stage::Routing, Artifact::from("r2")).unwrap();
    assert_eq!(next.sequence, 2);
    assert_eq!(
        reopened.stages_present(dataset(7)).unwrap(),
        BTreeSet::from([Stage::Routing, Stage::Heatflow])
    );
}

/// Verifies a fresh append clears staleness for the key.
#[test]
fn sqlite_fresh_append_is_not_stale() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir.path().join("store.db"));
    assert_eq!(store.mark_stale(dataset(3), Stage::Pft).unwrap(), StaleMark::NoRevision);
    store.append(dataset(3), Stage::Pft, Artifact::from("p1")).unwrap();
    store.mark_stale(dataset(3), Stage::Pft).unwrap();
    let fresh = store.append(dataset(3), Stage::Pft, Artifact::from("p2")).unwrap();
    assert!(!fresh.stale);
    assert!(!store.latest(dataset(3), Stage::Pft).unwrap().stale);
    assert!(store.revision(dataset(3), Stage::Pft, 1).unwrap().stale);
}

/// Verifies dataset deletion removes every revision of that dataset only.
#[test]
fn sqlite_delete_dataset() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir.path().join("store.db"));
    store.append(dataset(5), Stage::Raw, Artifact::from("raw")).unwrap();
    store.append(dataset(5), Stage::Regrid, Artifact::from("g1")).unwrap();
    store.append(dataset(5), Stage::Regrid, Artifact::from("g2")).unwrap();
    store.append(dataset(6), Stage::Regrid, Artifact::from("other")).unwrap();

    assert_eq!(store.delete_dataset(dataset(5)).unwrap(), 3);
    assert!(store.stages_present(dataset(5)).unwrap().is_empty());
    assert_eq!(store.latest(dataset(6), Stage::Regrid).unwrap().sequence, 1);
}

/// Verifies two handles on one file produce gap-free sequences.
#[test]
fn sqlite_concurrent_writers_are_gap_free() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.db");
    open(&path);
    let handles: Vec<_> = (0 .. 4)
        .map(|worker| {
            let store = open(&path);
            thread::spawn(move || {
                for round in 0 .. 10 {
                    let body = format!("{worker}-{round}");
                    store.append(dataset(1), Stage::Subbasins, Artifact::from(body.as_str())).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let store = open(&path);
    let sequences: Vec<u64> =
        store.history(dataset(1), Stage::Subbasins).unwrap().iter().map(|rev| rev.sequence).collect();
    assert_eq!(sequences, (1 ..= 40).collect::<Vec<u64>>());
}

/// Verifies tampered artifacts fail closed.
#[test]
fn sqlite_detects_tampered_artifact() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.db");
    let store = open(&path);
    store.append(dataset(9), Stage::Mosaix, Artifact::from("weights")).unwrap();

    let connection = Connection::open(&path).unwrap();
    connection
        .execute(
            "UPDATE revisions SET artifact = ?1 WHERE dataset_id = 9",
            params![b"tampered".to_vec()],
        )
        .unwrap();

    let err = store.latest(dataset(9), Stage::Mosaix).unwrap_err();
    assert!(matches!(err, StoreError::Corrupt(_)));
}

/// Verifies an unknown schema version is rejected.
#[test]
fn sqlite_rejects_schema_version_mismatch() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.db");
    open(&path);
    let connection = Connection::open(&path).unwrap();
    connection.execute("UPDATE store_meta SET version = 99", params![]).unwrap();
    drop(connection);

    let err = SqliteRevisionStore::new(&SqliteStoreConfig::at(&path)).err().unwrap();
    assert!(matches!(err, SqliteStoreError::VersionMismatch(_)));
}

/// Verifies directory paths are rejected.
#[test]
fn sqlite_rejects_directory_path() {
    let dir = TempDir::new().unwrap();
    let err = SqliteRevisionStore::new(&SqliteStoreConfig::at(dir.path())).err().unwrap();
    assert!(matches!(err, SqliteStoreError::Invalid(_)));
}

/// Verifies the delete journal mode also works.
#[test]
fn sqlite_delete_journal_mode() {
    let dir = TempDir::new().unwrap();
    let config = SqliteStoreConfig {
        journal_mode: SqliteStoreMode::Delete,
        ..SqliteStoreConfig::at(dir.path().join("store.db"))
    };
    let store = SqliteRevisionStore::new(&config).unwrap();
    store.append(dataset(2), Stage::Soils, Artifact::from("s")).unwrap();
    assert_eq!(store.latest(dataset(2), Stage::Soils).unwrap().sequence, 1);
}
