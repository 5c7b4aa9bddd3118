// crates/stage-relay-core/src/core/revision.rs
// ============================================================================
// Module: Stage Relay Revisions
// Description: Immutable, sequence-numbered stage artifacts.
// Purpose: Model the append-only revision history of each (dataset, stage).
// Dependencies: serde
// ============================================================================

//! ## Overview
//! A [`Revision`] is one run's output for a (dataset, stage) key. Sequence
//! numbers start at 1 and grow by exactly one per append. The only mutable
//! attribute is the `stale` flag on the latest revision, which records that an
//! upstream stage has rerun since this artifact was produced.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::hashing::HashDigest;
use crate::core::identifiers::DatasetId;
use crate::core::stage::Stage;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Artifact
// ============================================================================

/// Opaque artifact bytes produced by a worker run.
///
/// Workers decide the encoding; the preprocessing workers store a file path to
/// the produced `NetCDF` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Artifact(Vec<u8>);

impl Artifact {
    /// Creates an artifact from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the artifact bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the artifact and returns its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Returns the artifact length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true when the artifact is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Artifact {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Artifact {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

// ============================================================================
// SECTION: Revision
// ============================================================================

/// Immutable, sequence-numbered artifact from one run of a stage.
///
/// # Invariants
/// - `sequence >= 1` and is unique within `(dataset_id, stage)`.
/// - `content_hash` is the digest of `artifact` computed at append time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Owning dataset.
    pub dataset_id: DatasetId,
    /// Producing stage.
    pub stage: Stage,
    /// 1-based sequence number within the (dataset, stage) key.
    pub sequence: u64,
    /// Artifact content.
    pub artifact: Artifact,
    /// Digest of the artifact content.
    pub content_hash: HashDigest,
    /// Append time.
    pub appended_at: Timestamp,
    /// True when an upstream stage reran after this revision was produced.
    pub stale: bool,
}

// ============================================================================
// SECTION: History
// ============================================================================

/// Ordered revision history for one (dataset, stage) key, oldest first.
///
/// The history is a snapshot; iterating it any number of times yields the
/// same sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionHistory {
    /// Revisions ordered by ascending sequence number.
    revisions: Vec<Revision>,
}

impl RevisionHistory {
    /// Builds a history from revisions, ordering them by sequence number.
    #[must_use]
    pub fn new(mut revisions: Vec<Revision>) -> Self {
        revisions.sort_by_key(|revision| revision.sequence);
        Self {
            revisions,
        }
    }

    /// Returns an iterator over the revisions, oldest first.
    pub fn iter(&self) -> std::slice::Iter<'_, Revision> {
        self.revisions.iter()
    }

    /// Returns the number of revisions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    /// Returns true when the history is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// Returns the newest revision, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&Revision> {
        self.revisions.last()
    }

    /// Returns the revisions as a slice, oldest first.
    #[must_use]
    pub fn as_slice(&self) -> &[Revision] {
        &self.revisions
    }
}

impl<'a> IntoIterator for &'a RevisionHistory {
    type Item = &'a Revision;
    type IntoIter = std::slice::Iter<'a, Revision>;

    fn into_iter(self) -> Self::IntoIter {
        self.revisions.iter()
    }
}

impl IntoIterator for RevisionHistory {
    type Item = Revision;
    type IntoIter = std::vec::IntoIter<Revision>;

    fn into_iter(self) -> Self::IntoIter {
        self.revisions.into_iter()
    }
}

// ============================================================================
// SECTION: Staleness
// ============================================================================

/// Result of marking a stage's latest revision stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleMark {
    /// The latest revision was fresh and is now stale.
    Marked {
        /// Sequence number of the revision that was marked.
        sequence: u64,
    },
    /// The latest revision was already stale.
    AlreadyStale {
        /// Sequence number of the stale revision.
        sequence: u64,
    },
    /// The stage has no revision for the dataset yet.
    NoRevision,
}
