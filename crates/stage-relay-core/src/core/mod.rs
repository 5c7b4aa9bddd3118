// crates/stage-relay-core/src/core/mod.rs
// ============================================================================
// Module: Stage Relay Core Types
// Description: Canonical pipeline, topology, and message structures.
// Purpose: Provide stable, serializable types shared by every Stage Relay crate.
// Dependencies: serde, sha2
// ============================================================================

//! ## Overview
//! Core types define datasets, stages, revisions, the dependency graph, the
//! routing table, and the wire envelope. Topology types are immutable once
//! constructed and validate their invariants eagerly.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod envelope;
pub mod graph;
pub mod hashing;
pub mod identifiers;
pub mod revision;
pub mod routing;
pub mod stage;
pub mod time;
pub mod topology;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use envelope::CompletionNotice;
pub use envelope::DatasetRef;
pub use envelope::EnvelopeError;
pub use envelope::InboundKind;
pub use envelope::InvalidationNotice;
pub use envelope::MessageEnvelope;
pub use envelope::MessageKind;
pub use envelope::RoutingKeyScheme;
pub use graph::DependencyGraph;
pub use graph::GraphError;
pub use hashing::DEFAULT_HASH_ALGORITHM;
pub use hashing::HashAlgorithm;
pub use hashing::HashDigest;
pub use identifiers::DatasetId;
pub use identifiers::WorkerPoolId;
pub use revision::Artifact;
pub use revision::Revision;
pub use revision::RevisionHistory;
pub use revision::StaleMark;
pub use routing::RoutingError;
pub use routing::RoutingTable;
pub use stage::Stage;
pub use stage::StageError;
pub use time::Timestamp;
pub use topology::Topology;
pub use topology::TopologyError;
