// crates/stage-relay-core/src/runtime/store.rs
// ============================================================================
// Module: Stage Relay In-Memory Store
// Description: Simple in-memory revision store for tests and local runs.
// Purpose: Provide a deterministic store implementation without external deps.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! This module provides an in-memory implementation of [`RevisionStore`] and
//! a clonable [`SharedRevisionStore`] wrapper. A single mutex serializes
//! appends, which keeps sequence numbers gap-free under concurrency.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::core::Artifact;
use crate::core::DEFAULT_HASH_ALGORITHM;
use crate::core::DatasetId;
use crate::core::Revision;
use crate::core::RevisionHistory;
use crate::core::Stage;
use crate::core::StaleMark;
use crate::core::Timestamp;
use crate::core::hashing::hash_bytes;
use crate::interfaces::RevisionStore;
use crate::interfaces::StoreError;

// ============================================================================
// SECTION: In-Memory Store
// ============================================================================

/// Revisions keyed by (dataset, stage), each list ordered by sequence.
type RevisionMap = BTreeMap<(DatasetId, Stage), Vec<Revision>>;

/// In-memory revision store for tests and examples.
#[derive(Debug, Default, Clone)]
pub struct InMemoryRevisionStore {
    /// Revision lists protected by a mutex.
    revisions: Arc<Mutex<RevisionMap>>,
}

impl InMemoryRevisionStore {
    /// Creates a new, empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the revision map.
    fn lock(&self) -> Result<MutexGuard<'_, RevisionMap>, StoreError> {
        self.revisions
            .lock()
            .map_err(|_| StoreError::Store("revision store mutex poisoned".to_string()))
    }
}

impl RevisionStore for InMemoryRevisionStore {
    fn append(
        &self,
        dataset_id: DatasetId,
        stage: Stage,
        artifact: Artifact,
    ) -> Result<Revision, StoreError> {
        let mut guard = self.lock()?;
        let entries = guard.entry((dataset_id, stage)).or_default();
        let sequence = entries.last().map_or(1, |latest| latest.sequence + 1);
        let revision = Revision {
            dataset_id,
            stage,
            sequence,
            content_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, artifact.as_bytes()),
            artifact,
            appended_at: Timestamp::now(),
            stale: false,
        };
        entries.push(revision.clone());
        drop(guard);
        Ok(revision)
    }

    fn latest(&self, dataset_id: DatasetId, stage: Stage) -> Result<Revision, StoreError> {
        self.lock()?
            .get(&(dataset_id, stage))
            .and_then(|entries| entries.last())
            .cloned()
            .ok_or(StoreError::NotFound {
                dataset_id,
                stage,
            })
    }

    fn revision(
        &self,
        dataset_id: DatasetId,
        stage: Stage,
        sequence: u64,
    ) -> Result<Revision, StoreError> {
        self.lock()?
            .get(&(dataset_id, stage))
            .and_then(|entries| entries.iter().find(|revision| revision.sequence == sequence))
            .cloned()
            .ok_or(StoreError::NotFound {
                dataset_id,
                stage,
            })
    }

    fn history(&self, dataset_id: DatasetId, stage: Stage) -> Result<RevisionHistory, StoreError> {
        let entries = self.lock()?.get(&(dataset_id, stage)).cloned().unwrap_or_default();
        Ok(RevisionHistory::new(entries))
    }

    fn stages_present(&self, dataset_id: DatasetId) -> Result<BTreeSet<Stage>, StoreError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|((dataset, _), entries)| *dataset == dataset_id && !entries.is_empty())
            .map(|((_, stage), _)| *stage)
            .collect())
    }

    fn mark_stale(&self, dataset_id: DatasetId, stage: Stage) -> Result<StaleMark, StoreError> {
        let mut guard = self.lock()?;
        let Some(latest) = guard.get_mut(&(dataset_id, stage)).and_then(|entries| entries.last_mut())
        else {
            return Ok(StaleMark::NoRevision);
        };
        if latest.stale {
            return Ok(StaleMark::AlreadyStale {
                sequence: latest.sequence,
            });
        }
        latest.stale = true;
        Ok(StaleMark::Marked {
            sequence: latest.sequence,
        })
    }

    fn delete_dataset(&self, dataset_id: DatasetId) -> Result<usize, StoreError> {
        let mut guard = self.lock()?;
        let mut removed = 0;
        guard.retain(|(dataset, _), entries| {
            if *dataset == dataset_id {
                removed += entries.len();
                false
            } else {
                true
            }
        });
        drop(guard);
        Ok(removed)
    }
}

// ============================================================================
// SECTION: Shared Store Wrapper
// ============================================================================

/// Shared revision store backed by an `Arc` trait object.
#[derive(Clone)]
pub struct SharedRevisionStore {
    /// Inner store implementation.
    inner: Arc<dyn RevisionStore + Send + Sync>,
}

impl SharedRevisionStore {
    /// Wraps a revision store in a shared, clonable wrapper.
    #[must_use]
    pub fn from_store(store: impl RevisionStore + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Wraps an existing shared store.
    #[must_use]
    pub const fn new(store: Arc<dyn RevisionStore + Send + Sync>) -> Self {
        Self {
            inner: store,
        }
    }
}

impl RevisionStore for SharedRevisionStore {
    fn append(
        &self,
        dataset_id: DatasetId,
        stage: Stage,
        artifact: Artifact,
    ) -> Result<Revision, StoreError> {
        self.inner.append(dataset_id, stage, artifact)
    }

    fn latest(&self, dataset_id: DatasetId, stage: Stage) -> Result<Revision, StoreError> {
        self.inner.latest(dataset_id, stage)
    }

    fn revision(
        &self,
        dataset_id: DatasetId,
        stage: Stage,
        sequence: u64,
    ) -> Result<Revision, StoreError> {
        self.inner.revision(dataset_id, stage, sequence)
    }

    fn history(&self, dataset_id: DatasetId, stage: Stage) -> Result<RevisionHistory, StoreError> {
        self.inner.history(dataset_id, stage)
    }

    fn stages_present(&self, dataset_id: DatasetId) -> Result<BTreeSet<Stage>, StoreError> {
        self.inner.stages_present(dataset_id)
    }

    fn mark_stale(&self, dataset_id: DatasetId, stage: Stage) -> Result<StaleMark, StoreError> {
        self.inner.mark_stale(dataset_id, stage)
    }

    fn delete_dataset(&self, dataset_id: DatasetId) -> Result<usize, StoreError> {
        self.inner.delete_dataset(dataset_id)
    }
}
