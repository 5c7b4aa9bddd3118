// crates/stage-relay-broker/src/transport/mod.rs
// ============================================================================
// Module: Stage Relay Transports
// Description: Connector and session traits over a topic-routed broker.
// Purpose: Let the consumer service run against AMQP or an in-memory exchange.
// Dependencies: stage-relay-core, async-trait
// ============================================================================

//! ## Overview
//! A [`BusConnector`] opens a [`BusSession`]: one consumer on one queue with
//! its bindings declared. Sessions publish and acknowledge through
//! [`stage_relay_core::MessageBus`] and pull deliveries one at a time.
//! Invariants:
//! - Connecting declares the exchange, the queue, and every binding pattern.
//! - Dropping a session releases its unacknowledged deliveries for
//!   redelivery.

// ============================================================================
// SECTION: Imports
// ============================================================================

use async_trait::async_trait;
use stage_relay_core::BusError;
use stage_relay_core::Delivery;
use stage_relay_core::MessageBus;
use stage_relay_core::RoutingKeyScheme;
use stage_relay_core::WorkerPoolId;

// ============================================================================
// SECTION: Queue Bindings
// ============================================================================

/// Unacknowledged deliveries a consumer may hold at once.
pub const DEFAULT_PREFETCH: u16 = 1;

/// Queue declaration and the topic patterns bound to it.
///
/// # Invariants
/// - The queue is durable.
/// - `prefetch` is at least 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    /// Topic exchange name.
    pub exchange: String,
    /// Queue name.
    pub queue: String,
    /// Binding patterns.
    pub patterns: Vec<String>,
    /// Consumer prefetch count.
    pub prefetch: u16,
}

impl QueueBinding {
    /// Builds the dispatcher's inbound queue binding.
    #[must_use]
    pub fn dispatcher(
        scheme: &RoutingKeyScheme,
        exchange: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            patterns: scheme.dispatcher_bindings().to_vec(),
            prefetch: DEFAULT_PREFETCH,
        }
    }

    /// Builds the queue binding of a worker pool.
    ///
    /// The queue is named `<namespace>_<pool>_queue`.
    #[must_use]
    pub fn worker(
        scheme: &RoutingKeyScheme,
        exchange: impl Into<String>,
        pool: &WorkerPoolId,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: format!("{}_{}_queue", scheme.namespace(), pool.as_str()),
            patterns: vec![scheme.worker_binding(pool)],
            prefetch: DEFAULT_PREFETCH,
        }
    }
}

// ============================================================================
// SECTION: Sessions
// ============================================================================

/// Consumer session on one queue.
#[async_trait]
pub trait BusSession: MessageBus {
    /// Waits for the next delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] when the connection is lost or the consumer is
    /// cancelled.
    async fn next_delivery(&mut self) -> Result<Delivery, BusError>;
}

/// Opens consumer sessions against a broker.
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Session type produced by this connector.
    type Session: BusSession + 'static;

    /// Connects, declares the binding, and starts consuming.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Connection`] when the broker is unreachable or
    /// rejects a declaration.
    async fn connect(&self, binding: &QueueBinding) -> Result<Self::Session, BusError>;

    /// Returns a log-safe description of the broker target.
    fn describe(&self) -> String;
}

// ============================================================================
// SECTION: Implementations
// ============================================================================

pub mod amqp;
pub mod memory;

pub use amqp::AmqpConnector;
pub use amqp::AmqpSession;
pub use memory::MemoryConnector;
pub use memory::MemoryExchange;
pub use memory::MemorySession;
pub use memory::QueuedMessage;
