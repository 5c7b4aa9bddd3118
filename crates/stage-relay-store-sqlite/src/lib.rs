// crates/stage-relay-store-sqlite/src/lib.rs
// ============================================================================
// Module: SQLite Revision Store
// Description: Durable RevisionStore backend using SQLite WAL.
// Purpose: Persist stage revisions across dispatcher and worker restarts.
// Dependencies: stage-relay-core, rusqlite
// ============================================================================

//! ## Overview
//! This crate provides a SQLite-backed [`RevisionStore`] implementation.
//! Every append inserts a new row under an immediate transaction, so
//! sequence numbers stay gap-free even with several processes sharing one
//! database file. Reads verify artifact hashes and fail closed on mismatch.
//!
//! [`RevisionStore`]: stage_relay_core::RevisionStore

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use store::MAX_ARTIFACT_BYTES;
pub use store::SqliteRevisionStore;
pub use store::SqliteStoreConfig;
pub use store::SqliteStoreError;
pub use store::SqliteStoreMode;
pub use store::SqliteSyncMode;
