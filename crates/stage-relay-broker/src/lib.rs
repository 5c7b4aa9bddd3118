// crates/stage-relay-broker/src/lib.rs
// ============================================================================
// Module: Stage Relay Broker Library
// Description: Transports, consume loop, and worker harness for Stage Relay.
// Purpose: Attach the dispatcher and worker pools to a topic-routed broker.
// Dependencies: stage-relay-{core, config, store-sqlite}, lapin, tokio, tracing
// ============================================================================

//! ## Overview
//! Stage Relay Broker connects the transport-agnostic dispatcher to a real
//! message bus. It provides an AMQP transport built on lapin, an in-memory
//! topic exchange with the same delivery semantics, the reconnecting
//! [`ConsumerService`], and the [`WorkerRuntime`] harness for worker pools.
//! Invariants:
//! - Deliveries are acknowledged only by their handler, after every publish
//!   of the cycle succeeded.
//! - Every published message is persistent.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod service;
pub mod topic;
pub mod transport;
pub mod worker;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use service::Backoff;
pub use service::ConsumerService;
pub use service::DeliveryHandler;
pub use service::DispatchService;
pub use service::ServiceError;
pub use service::ServiceReport;
pub use service::WorkerService;
pub use topic::topic_matches;
pub use transport::AmqpConnector;
pub use transport::AmqpSession;
pub use transport::BusConnector;
pub use transport::BusSession;
pub use transport::DEFAULT_PREFETCH;
pub use transport::MemoryConnector;
pub use transport::MemoryExchange;
pub use transport::MemorySession;
pub use transport::QueueBinding;
pub use transport::QueuedMessage;
pub use worker::InvalidationPolicy;
pub use worker::StageRequest;
pub use worker::StageWorker;
pub use worker::WorkerError;
pub use worker::WorkerOutcome;
pub use worker::WorkerRuntime;
pub use worker::upstream_of;
