// crates/stage-relay-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Revision Store
// Description: Durable RevisionStore backed by SQLite WAL.
// Purpose: Persist append-only stage revisions with integrity checks.
// Dependencies: stage-relay-core, rusqlite, serde, thiserror, tracing
// ============================================================================

//! ## Overview
//! This module implements a durable [`RevisionStore`] using `SQLite`. Each
//! append inserts one row into the `revisions` table keyed by
//! `(dataset_id, stage, sequence)`. The next sequence is computed inside an
//! immediate transaction, which takes the database write lock up front.
//! Loads verify the stored content hash and fail closed on corruption.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::TransactionBehavior;
use rusqlite::params;
use serde::Deserialize;
use stage_relay_core::Artifact;
use stage_relay_core::DatasetId;
use stage_relay_core::Revision;
use stage_relay_core::RevisionHistory;
use stage_relay_core::RevisionStore;
use stage_relay_core::Stage;
use stage_relay_core::StaleMark;
use stage_relay_core::StoreError;
use stage_relay_core::Timestamp;
use stage_relay_core::hashing::DEFAULT_HASH_ALGORITHM;
use stage_relay_core::hashing::HashAlgorithm;
use stage_relay_core::hashing::HashDigest;
use stage_relay_core::hashing::hash_bytes;
use thiserror::Error;
use tracing::debug;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// `SQLite` schema version for the store.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum artifact size accepted by the store.
pub const MAX_ARTIFACT_BYTES: usize = 256 * 1024 * 1024;
/// Columns selected when loading a revision.
const REVISION_COLUMNS: &str =
    "sequence, length(artifact), content_hash, hash_algorithm, appended_at, stale";

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteStoreMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode.
    Delete,
}

impl SqliteStoreMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for the `SQLite` revision store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteStoreConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteStoreMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

impl SqliteStoreConfig {
    /// Returns a configuration with defaults for `path`.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: SqliteStoreMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// `SQLite` store errors.
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// Store I/O error.
    #[error("sqlite store io error: {0}")]
    Io(String),
    /// `SQLite` engine error.
    #[error("sqlite store db error: {0}")]
    Db(String),
    /// Store corruption or hash mismatch.
    #[error("sqlite store corruption: {0}")]
    Corrupt(String),
    /// Store schema version mismatch.
    #[error("sqlite store version mismatch: {0}")]
    VersionMismatch(String),
    /// Invalid store data.
    #[error("sqlite store invalid data: {0}")]
    Invalid(String),
    /// Artifact exceeded the size limit.
    #[error("sqlite store artifact too large: {actual_bytes} bytes (max {max_bytes})")]
    TooLarge {
        /// Maximum allowed bytes.
        max_bytes: usize,
        /// Actual artifact size in bytes.
        actual_bytes: usize,
    },
    /// Requested revision does not exist.
    #[error("no revision for dataset {dataset_id} stage {stage}")]
    NotFound {
        /// Requested dataset.
        dataset_id: DatasetId,
        /// Requested stage.
        stage: Stage,
    },
}

impl From<rusqlite::Error> for SqliteStoreError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Db(error.to_string())
    }
}

impl From<SqliteStoreError> for StoreError {
    fn from(error: SqliteStoreError) -> Self {
        match error {
            SqliteStoreError::Io(message) => Self::Io(message),
            SqliteStoreError::Db(message) => Self::Store(message),
            SqliteStoreError::Corrupt(message) => Self::Corrupt(message),
            SqliteStoreError::VersionMismatch(message) => Self::VersionMismatch(message),
            SqliteStoreError::Invalid(message) => Self::Invalid(message),
            SqliteStoreError::TooLarge {
                max_bytes,
                actual_bytes,
            } => Self::Invalid(format!(
                "artifact exceeds size limit: {actual_bytes} bytes (max {max_bytes})"
            )),
            SqliteStoreError::NotFound {
                dataset_id,
                stage,
            } => Self::NotFound {
                dataset_id,
                stage,
            },
        }
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// `SQLite`-backed revision store with WAL support.
#[derive(Clone)]
pub struct SqliteRevisionStore {
    /// Shared `SQLite` connection guarded by a mutex.
    connection: Arc<Mutex<Connection>>,
}

impl SqliteRevisionStore {
    /// Opens an `SQLite`-backed revision store.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the database cannot be opened or
    /// initialized.
    pub fn new(config: &SqliteStoreConfig) -> Result<Self, SqliteStoreError> {
        validate_store_path(&config.path)?;
        ensure_parent_dir(&config.path)?;
        let mut connection = open_connection(config)?;
        initialize_schema(&mut connection)?;
        debug!(path = %config.path.display(), "opened sqlite revision store");
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Locks the shared connection.
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SqliteStoreError> {
        self.connection.lock().map_err(|_| SqliteStoreError::Db("mutex poisoned".to_string()))
    }

    /// Appends a revision under an immediate transaction.
    fn append_revision(
        &self,
        dataset_id: DatasetId,
        stage: Stage,
        artifact: Artifact,
    ) -> Result<Revision, SqliteStoreError> {
        if artifact.len() > MAX_ARTIFACT_BYTES {
            return Err(SqliteStoreError::TooLarge {
                max_bytes: MAX_ARTIFACT_BYTES,
                actual_bytes: artifact.len(),
            });
        }
        let dataset_key = dataset_key(dataset_id)?;
        let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, artifact.as_bytes());
        let appended_at = Timestamp::now();
        let millis = appended_at.as_unix_millis().unwrap_or_default();
        let sequence = {
            let mut guard = self.lock()?;
            let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let latest: Option<i64> = tx.query_row(
                "SELECT MAX(sequence) FROM revisions WHERE dataset_id = ?1 AND stage = ?2",
                params![dataset_key, stage.as_str()],
                |row| row.get(0),
            )?;
            let sequence = match latest {
                None => 1,
                Some(value) if value < 1 => {
                    return Err(SqliteStoreError::Corrupt(format!(
                        "invalid sequence {value} for dataset {dataset_id} stage {stage}"
                    )));
                }
                Some(value) => value.checked_add(1).ok_or_else(|| {
                    SqliteStoreError::Corrupt(format!(
                        "sequence overflow for dataset {dataset_id} stage {stage}"
                    ))
                })?,
            };
            tx.execute(
                "INSERT INTO revisions (dataset_id, stage, sequence, artifact, content_hash, \
                 hash_algorithm, appended_at, stale) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
                params![
                    dataset_key,
                    stage.as_str(),
                    sequence,
                    artifact.as_bytes(),
                    digest.value,
                    digest.algorithm.as_str(),
                    millis
                ],
            )?;
            tx.commit()?;
            drop(guard);
            sequence
        };
        Ok(Revision {
            dataset_id,
            stage,
            sequence: sequence_from_sql(sequence)?,
            artifact,
            content_hash: digest,
            appended_at,
            stale: false,
        })
    }

    /// Loads the latest revision, or a specific one when `sequence` is set.
    fn load_revision(
        &self,
        dataset_id: DatasetId,
        stage: Stage,
        sequence: Option<u64>,
    ) -> Result<Revision, SqliteStoreError> {
        let dataset_key = dataset_key(dataset_id)?;
        let guard = self.lock()?;
        let metadata = match sequence {
            None => guard
                .query_row(
                    &format!(
                        "SELECT {REVISION_COLUMNS} FROM revisions WHERE dataset_id = ?1 AND \
                         stage = ?2 ORDER BY sequence DESC LIMIT 1"
                    ),
                    params![dataset_key, stage.as_str()],
                    RevisionRow::from_row,
                )
                .optional()?,
            Some(sequence) => guard
                .query_row(
                    &format!(
                        "SELECT {REVISION_COLUMNS} FROM revisions WHERE dataset_id = ?1 AND \
                         stage = ?2 AND sequence = ?3"
                    ),
                    params![dataset_key, stage.as_str(), sequence_to_sql(sequence)?],
                    RevisionRow::from_row,
                )
                .optional()?,
        };
        let Some(metadata) = metadata else {
            return Err(SqliteStoreError::NotFound {
                dataset_id,
                stage,
            });
        };
        let bytes = load_artifact(&guard, dataset_key, stage, &metadata)?;
        drop(guard);
        metadata.into_revision(dataset_id, stage, bytes)
    }

    /// Loads every revision for a key, oldest first.
    fn load_history(
        &self,
        dataset_id: DatasetId,
        stage: Stage,
    ) -> Result<RevisionHistory, SqliteStoreError> {
        let dataset_key = dataset_key(dataset_id)?;
        let guard = self.lock()?;
        let mut statement = guard.prepare(&format!(
            "SELECT {REVISION_COLUMNS} FROM revisions WHERE dataset_id = ?1 AND stage = ?2 ORDER \
             BY sequence ASC"
        ))?;
        let rows = statement
            .query_map(params![dataset_key, stage.as_str()], RevisionRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(statement);
        let mut revisions = Vec::with_capacity(rows.len());
        for metadata in rows {
            let bytes = load_artifact(&guard, dataset_key, stage, &metadata)?;
            revisions.push(metadata.into_revision(dataset_id, stage, bytes)?);
        }
        drop(guard);
        Ok(RevisionHistory::new(revisions))
    }

    /// Lists stages with at least one revision.
    fn load_stages(&self, dataset_id: DatasetId) -> Result<BTreeSet<Stage>, SqliteStoreError> {
        let dataset_key = dataset_key(dataset_id)?;
        let guard = self.lock()?;
        let mut statement =
            guard.prepare("SELECT DISTINCT stage FROM revisions WHERE dataset_id = ?1")?;
        let names = statement
            .query_map(params![dataset_key], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(statement);
        drop(guard);
        names
            .into_iter()
            .map(|name| {
                name.parse::<Stage>().map_err(|err| SqliteStoreError::Corrupt(err.to_string()))
            })
            .collect()
    }

    /// Sets the stale flag on the latest revision.
    fn set_stale(
        &self,
        dataset_id: DatasetId,
        stage: Stage,
    ) -> Result<StaleMark, SqliteStoreError> {
        let dataset_key = dataset_key(dataset_id)?;
        let mut guard = self.lock()?;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let latest: Option<(i64, bool)> = tx
            .query_row(
                "SELECT sequence, stale FROM revisions WHERE dataset_id = ?1 AND stage = ?2 \
                 ORDER BY sequence DESC LIMIT 1",
                params![dataset_key, stage.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let mark = match latest {
            None => StaleMark::NoRevision,
            Some((sequence, true)) => StaleMark::AlreadyStale {
                sequence: sequence_from_sql(sequence)?,
            },
            Some((sequence, false)) => {
                tx.execute(
                    "UPDATE revisions SET stale = 1 WHERE dataset_id = ?1 AND stage = ?2 AND \
                     sequence = ?3",
                    params![dataset_key, stage.as_str(), sequence],
                )?;
                StaleMark::Marked {
                    sequence: sequence_from_sql(sequence)?,
                }
            }
        };
        tx.commit()?;
        drop(guard);
        Ok(mark)
    }

    /// Deletes all revisions of a dataset.
    fn remove_dataset(&self, dataset_id: DatasetId) -> Result<usize, SqliteStoreError> {
        let dataset_key = dataset_key(dataset_id)?;
        let guard = self.lock()?;
        let removed =
            guard.execute("DELETE FROM revisions WHERE dataset_id = ?1", params![dataset_key])?;
        drop(guard);
        Ok(removed)
    }
}

impl RevisionStore for SqliteRevisionStore {
    fn append(
        &self,
        dataset_id: DatasetId,
        stage: Stage,
        artifact: Artifact,
    ) -> Result<Revision, StoreError> {
        self.append_revision(dataset_id, stage, artifact).map_err(StoreError::from)
    }

    fn latest(&self, dataset_id: DatasetId, stage: Stage) -> Result<Revision, StoreError> {
        self.load_revision(dataset_id, stage, None).map_err(StoreError::from)
    }

    fn revision(
        &self,
        dataset_id: DatasetId,
        stage: Stage,
        sequence: u64,
    ) -> Result<Revision, StoreError> {
        self.load_revision(dataset_id, stage, Some(sequence)).map_err(StoreError::from)
    }

    fn history(&self, dataset_id: DatasetId, stage: Stage) -> Result<RevisionHistory, StoreError> {
        self.load_history(dataset_id, stage).map_err(StoreError::from)
    }

    fn stages_present(&self, dataset_id: DatasetId) -> Result<BTreeSet<Stage>, StoreError> {
        self.load_stages(dataset_id).map_err(StoreError::from)
    }

    fn mark_stale(&self, dataset_id: DatasetId, stage: Stage) -> Result<StaleMark, StoreError> {
        self.set_stale(dataset_id, stage).map_err(StoreError::from)
    }

    fn delete_dataset(&self, dataset_id: DatasetId) -> Result<usize, StoreError> {
        self.remove_dataset(dataset_id).map_err(StoreError::from)
    }
}

// ============================================================================
// SECTION: Rows
// ============================================================================

/// Revision metadata read ahead of the artifact blob.
struct RevisionRow {
    /// Stored sequence number.
    sequence: i64,
    /// Stored artifact length in bytes.
    length: i64,
    /// Hex content hash.
    content_hash: String,
    /// Hash algorithm label.
    hash_algorithm: String,
    /// Append time in unix milliseconds.
    appended_at: i64,
    /// Stale flag.
    stale: bool,
}

impl RevisionRow {
    /// Maps a row selected with [`REVISION_COLUMNS`].
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence: row.get(0)?,
            length: row.get(1)?,
            content_hash: row.get(2)?,
            hash_algorithm: row.get(3)?,
            appended_at: row.get(4)?,
            stale: row.get(5)?,
        })
    }

    /// Verifies the artifact against the stored hash and builds the revision.
    fn into_revision(
        self,
        dataset_id: DatasetId,
        stage: Stage,
        bytes: Vec<u8>,
    ) -> Result<Revision, SqliteStoreError> {
        let algorithm = HashAlgorithm::from_label(&self.hash_algorithm).ok_or_else(|| {
            SqliteStoreError::Invalid(format!("unsupported hash algorithm: {}", self.hash_algorithm))
        })?;
        let actual = hash_bytes(algorithm, &bytes);
        if actual.value != self.content_hash {
            return Err(SqliteStoreError::Corrupt(format!(
                "hash mismatch for dataset {dataset_id} stage {stage} sequence {}",
                self.sequence
            )));
        }
        Ok(Revision {
            dataset_id,
            stage,
            sequence: sequence_from_sql(self.sequence)?,
            artifact: Artifact::from_bytes(bytes),
            content_hash: HashDigest {
                algorithm,
                value: self.content_hash,
            },
            appended_at: Timestamp::UnixMillis(self.appended_at),
            stale: self.stale,
        })
    }
}

/// Loads an artifact blob after enforcing the size limit.
fn load_artifact(
    connection: &Connection,
    dataset_key: i64,
    stage: Stage,
    metadata: &RevisionRow,
) -> Result<Vec<u8>, SqliteStoreError> {
    let length = usize::try_from(metadata.length)
        .map_err(|_| SqliteStoreError::Invalid("negative artifact length".to_string()))?;
    if length > MAX_ARTIFACT_BYTES {
        return Err(SqliteStoreError::TooLarge {
            max_bytes: MAX_ARTIFACT_BYTES,
            actual_bytes: length,
        });
    }
    let bytes = connection.query_row(
        "SELECT artifact FROM revisions WHERE dataset_id = ?1 AND stage = ?2 AND sequence = ?3",
        params![dataset_key, stage.as_str(), metadata.sequence],
        |row| row.get(0),
    )?;
    Ok(bytes)
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Converts a dataset id into its `SQLite` integer key.
fn dataset_key(dataset_id: DatasetId) -> Result<i64, SqliteStoreError> {
    i64::try_from(dataset_id.get())
        .map_err(|_| SqliteStoreError::Invalid(format!("dataset id {dataset_id} out of range")))
}

/// Converts a sequence number into its `SQLite` integer form.
fn sequence_to_sql(sequence: u64) -> Result<i64, SqliteStoreError> {
    i64::try_from(sequence)
        .map_err(|_| SqliteStoreError::Invalid(format!("sequence {sequence} out of range")))
}

/// Converts a stored sequence number back to `u64`.
fn sequence_from_sql(sequence: i64) -> Result<u64, SqliteStoreError> {
    u64::try_from(sequence)
        .map_err(|_| SqliteStoreError::Corrupt(format!("negative sequence {sequence}")))
}

/// Ensures the parent directory for the store exists.
fn ensure_parent_dir(path: &Path) -> Result<(), SqliteStoreError> {
    let Some(parent) = path.parent() else {
        return Err(SqliteStoreError::Io("store path missing parent directory".to_string()));
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent).map_err(|err| SqliteStoreError::Io(err.to_string()))
}

/// Validates store paths for safety limits.
fn validate_store_path(path: &Path) -> Result<(), SqliteStoreError> {
    let path_string = path.display().to_string();
    if path_string.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(SqliteStoreError::Invalid("store path exceeds length limit".to_string()));
    }
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(SqliteStoreError::Invalid(
                "store path contains an overlong component".to_string(),
            ));
        }
    }
    if path.is_dir() {
        return Err(SqliteStoreError::Invalid(
            "store path must be a file, not a directory".to_string(),
        ));
    }
    Ok(())
}

/// Opens an `SQLite` connection with durable defaults.
fn open_connection(config: &SqliteStoreConfig) -> Result<Connection, SqliteStoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(&config.path, flags)?;
    apply_pragmas(&connection, config)?;
    Ok(connection)
}

/// Applies `SQLite` pragmas required for durability.
fn apply_pragmas(
    connection: &Connection,
    config: &SqliteStoreConfig,
) -> Result<(), SqliteStoreError> {
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value()))?;
    connection.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    Ok(())
}

/// Initializes the `SQLite` schema or validates the existing version.
fn initialize_schema(connection: &mut Connection) -> Result<(), SqliteStoreError> {
    let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| row.get(0))
        .optional()?;
    match version {
        None => {
            tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS revisions (
                    dataset_id INTEGER NOT NULL,
                    stage TEXT NOT NULL,
                    sequence INTEGER NOT NULL,
                    artifact BLOB NOT NULL,
                    content_hash TEXT NOT NULL,
                    hash_algorithm TEXT NOT NULL,
                    appended_at INTEGER NOT NULL,
                    stale INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (dataset_id, stage, sequence)
                );
                CREATE INDEX IF NOT EXISTS idx_revisions_dataset
                    ON revisions (dataset_id);",
            )?;
        }
        Some(value) if value == SCHEMA_VERSION => {}
        Some(value) => {
            return Err(SqliteStoreError::VersionMismatch(format!(
                "unsupported schema version: {value}"
            )));
        }
    }
    tx.commit()?;
    Ok(())
}
