// crates/stage-relay-core/src/interfaces/mod.rs
// ============================================================================
// Module: Stage Relay Interfaces
// Description: Backend-agnostic interfaces for revision storage and messaging.
// Purpose: Define the contract surfaces used by the Stage Relay runtime.
// Dependencies: crate::core, async-trait, thiserror
// ============================================================================

//! ## Overview
//! Interfaces define how Stage Relay integrates with storage and message
//! brokers without embedding backend-specific details. Implementations must
//! fail closed: a failed append or publish is reported, never swallowed.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::Artifact;
use crate::core::DatasetId;
use crate::core::MessageKind;
use crate::core::Revision;
use crate::core::RevisionHistory;
use crate::core::Stage;
use crate::core::StaleMark;
use crate::core::WorkerPoolId;

// ============================================================================
// SECTION: Revision Store
// ============================================================================

/// Revision store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No revision exists for the requested key.
    #[error("no revision for dataset {dataset_id} stage {stage}")]
    NotFound {
        /// Requested dataset.
        dataset_id: DatasetId,
        /// Requested stage.
        stage: Stage,
    },
    /// Store I/O error.
    #[error("store io error: {0}")]
    Io(String),
    /// Store corruption or integrity failure.
    #[error("store corruption: {0}")]
    Corrupt(String),
    /// Store schema version mismatch.
    #[error("store version mismatch: {0}")]
    VersionMismatch(String),
    /// Store rejected the input as invalid.
    #[error("store invalid data: {0}")]
    Invalid(String),
    /// Store backend error.
    #[error("store error: {0}")]
    Store(String),
}

/// Append-only, per-(dataset, stage) versioned artifact storage.
///
/// # Invariants
/// - `append` is the only content mutator and always creates a new revision.
/// - Sequence numbers per key start at 1 and increase by one with no gaps,
///   including under concurrent appends.
/// - A freshly appended revision is never stale.
pub trait RevisionStore {
    /// Appends a new revision for `(dataset_id, stage)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the revision cannot be persisted.
    fn append(
        &self,
        dataset_id: DatasetId,
        stage: Stage,
        artifact: Artifact,
    ) -> Result<Revision, StoreError>;

    /// Returns the revision with the highest sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the stage has no revision.
    fn latest(&self, dataset_id: DatasetId, stage: Stage) -> Result<Revision, StoreError>;

    /// Returns a specific revision by sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the revision does not exist.
    fn revision(
        &self,
        dataset_id: DatasetId,
        stage: Stage,
        sequence: u64,
    ) -> Result<Revision, StoreError>;

    /// Returns all revisions for the key, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read. An unknown key
    /// yields an empty history.
    fn history(&self, dataset_id: DatasetId, stage: Stage) -> Result<RevisionHistory, StoreError>;

    /// Returns the stages with at least one revision for the dataset.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn stages_present(&self, dataset_id: DatasetId) -> Result<BTreeSet<Stage>, StoreError>;

    /// Marks the latest revision of the key stale. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the flag cannot be persisted.
    fn mark_stale(&self, dataset_id: DatasetId, stage: Stage) -> Result<StaleMark, StoreError>;

    /// Deletes every revision of the dataset and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the deletion fails.
    fn delete_dataset(&self, dataset_id: DatasetId) -> Result<usize, StoreError>;
}

// ============================================================================
// SECTION: Message Bus
// ============================================================================

/// Message bus errors. All are treated as transient by the dispatch service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// Connection to the broker is unavailable or was lost.
    #[error("broker connection error: {0}")]
    Connection(String),
    /// Publishing a message failed.
    #[error("publish failed: {0}")]
    Publish(String),
    /// Acknowledging a delivery failed.
    #[error("acknowledge failed: {0}")]
    Ack(String),
    /// The delivery stream ended.
    #[error("delivery stream closed")]
    Closed,
}

/// Broker-assigned delivery tag used for acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

/// Inbound message pulled from the dispatcher queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker delivery tag.
    pub tag: DeliveryTag,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Raw message body.
    pub body: Vec<u8>,
    /// True when the broker has delivered this message before.
    pub redelivered: bool,
}

/// Outbound message produced by a dispatch cycle.
///
/// # Invariants
/// - `persistent` is always true for dispatcher output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Routing key `<namespace>.<stage>.<pool>`.
    pub routing_key: String,
    /// Message body.
    pub body: Vec<u8>,
    /// Target stage.
    pub stage: Stage,
    /// Target worker pool.
    pub pool: WorkerPoolId,
    /// Message kind carried by the body.
    pub kind: MessageKind,
    /// Broker persistence flag (delivery mode 2).
    pub persistent: bool,
}

/// Publish/acknowledge surface of a topic-routed message bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes a message and waits for the broker to accept it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] when the broker does not accept the message.
    async fn publish(&self, message: &OutboundMessage) -> Result<(), BusError>;

    /// Acknowledges a delivery so the broker drops it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] when the acknowledgement cannot be sent.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), BusError>;
}
