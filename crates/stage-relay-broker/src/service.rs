// crates/stage-relay-broker/src/service.rs
// ============================================================================
// Module: Stage Relay Consumer Service
// Description: Reconnecting consume loop driving a delivery handler.
// Purpose: Keep the dispatcher and worker runtimes attached to the broker.
// Dependencies: stage-relay-{core, config, store-sqlite}, async-trait, tokio, tracing
// ============================================================================

//! ## Overview
//! [`ConsumerService`] connects through a [`BusConnector`], pulls one
//! delivery at a time, and hands it to a [`DeliveryHandler`]. Connection
//! loss and handler failures drop the session so the broker redelivers the
//! unacknowledged message, then the service reconnects after an exponential
//! [`Backoff`].
//! Invariants:
//! - Shutdown is observed only between deliveries; an in-flight delivery
//!   always finishes its cycle first.
//! - The backoff resets after every successful connect.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stage_relay_config::ConfigError;
use stage_relay_config::ReconnectConfig;
use stage_relay_config::StageRelayConfig;
use stage_relay_core::BusError;
use stage_relay_core::Delivery;
use stage_relay_core::DispatchError;
use stage_relay_core::Dispatcher;
use stage_relay_core::MessageBus;
use stage_relay_core::SharedRevisionStore;
use stage_relay_store_sqlite::SqliteRevisionStore;
use stage_relay_store_sqlite::SqliteStoreError;
use thiserror::Error;
use tracing::info;
use tracing::warn;

use crate::transport::BusConnector;
use crate::transport::BusSession;
use crate::transport::QueueBinding;
use crate::worker::WorkerError;
use crate::worker::WorkerRuntime;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Consumer service errors.
///
/// # Invariants
/// - `Config` and `Store` are fatal at startup; the remaining variants are
///   transient and trigger a reconnect.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Configuration could not be turned into a topology.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The staleness ledger could not be opened.
    #[error("revision store unavailable: {0}")]
    Store(#[from] SqliteStoreError),
    /// A dispatch cycle aborted.
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
    /// A worker delivery aborted.
    #[error("worker failed: {0}")]
    Worker(#[from] WorkerError),
    /// The bus failed outside a handler.
    #[error("bus failure: {0}")]
    Bus(#[from] BusError),
}

// ============================================================================
// SECTION: Delivery Handlers
// ============================================================================

/// Processes one delivery, acknowledging it on success.
#[async_trait]
pub trait DeliveryHandler: Send {
    /// Handles a delivery using `bus` for publishes and the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] when the delivery was left unacknowledged.
    async fn handle_delivery(
        &mut self,
        bus: &dyn MessageBus,
        delivery: Delivery,
    ) -> Result<(), ServiceError>;
}

#[async_trait]
impl DeliveryHandler for Dispatcher {
    async fn handle_delivery(
        &mut self,
        bus: &dyn MessageBus,
        delivery: Delivery,
    ) -> Result<(), ServiceError> {
        self.handle(bus, delivery).await?;
        Ok(())
    }
}

#[async_trait]
impl DeliveryHandler for WorkerRuntime {
    async fn handle_delivery(
        &mut self,
        bus: &dyn MessageBus,
        delivery: Delivery,
    ) -> Result<(), ServiceError> {
        self.handle(bus, delivery).await?;
        Ok(())
    }
}

// ============================================================================
// SECTION: Backoff
// ============================================================================

/// Exponential reconnect delay bounded by a maximum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    /// First delay after a reset.
    initial: Duration,
    /// Upper bound.
    max: Duration,
    /// Delay returned by the next call.
    next: Duration,
}

impl Backoff {
    /// Creates a backoff starting at `initial` and capped at `max`.
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Creates a backoff from reconnect settings.
    #[must_use]
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Returns the current delay and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    /// Restarts from the initial delay.
    pub const fn reset(&mut self) {
        self.next = self.initial;
    }
}

// ============================================================================
// SECTION: Consumer Service
// ============================================================================

/// Counters describing a service run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceReport {
    /// Successful connects.
    pub connections: u64,
    /// Connect attempts that failed.
    pub failed_connects: u64,
    /// Deliveries handled and acknowledged.
    pub processed: u64,
    /// Deliveries whose cycle aborted without acknowledgement.
    pub aborted: u64,
}

/// Reconnecting consume loop.
pub struct ConsumerService<C, H> {
    /// Broker connector.
    connector: C,
    /// Queue and bindings consumed.
    binding: QueueBinding,
    /// Delivery handler.
    handler: H,
    /// Reconnect delay.
    backoff: Backoff,
}

/// Consumer service driving the dispatcher.
pub type DispatchService<C> = ConsumerService<C, Dispatcher>;

/// Consumer service driving a worker runtime.
pub type WorkerService<C> = ConsumerService<C, WorkerRuntime>;

impl<C, H> ConsumerService<C, H>
where
    C: BusConnector,
    H: DeliveryHandler,
{
    /// Creates a consumer service.
    #[must_use]
    pub const fn new(connector: C, binding: QueueBinding, handler: H, backoff: Backoff) -> Self {
        Self {
            connector,
            binding,
            handler,
            backoff,
        }
    }

    /// Returns the consumed binding.
    #[must_use]
    pub const fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    /// Returns the delivery handler.
    #[must_use]
    pub const fn handler(&self) -> &H {
        &self.handler
    }

    /// Runs until `shutdown` resolves.
    pub async fn run<F>(&mut self, shutdown: F) -> ServiceReport
    where
        F: Future<Output = ()> + Send,
    {
        let mut report = ServiceReport::default();
        let target = self.connector.describe();
        tokio::pin!(shutdown);
        loop {
            let connected = tokio::select! {
                biased;
                () = &mut shutdown => break,
                connected = self.connector.connect(&self.binding) => connected,
            };
            match connected {
                Ok(mut session) => {
                    report.connections += 1;
                    self.backoff.reset();
                    info!(target_broker = %target, queue = %self.binding.queue, "consumer connected");
                    let stopped = self.consume(&mut session, &mut shutdown, &mut report).await;
                    drop(session);
                    if stopped {
                        break;
                    }
                }
                Err(err) => {
                    report.failed_connects += 1;
                    warn!(target_broker = %target, error = %err, "broker connect failed");
                }
            }
            if self.pause(&mut shutdown).await {
                break;
            }
        }
        info!(
            queue = %self.binding.queue,
            processed = report.processed,
            aborted = report.aborted,
            "consumer stopped"
        );
        report
    }

    /// Consumes deliveries until shutdown or a failure.
    ///
    /// Returns true when shutdown was requested.
    async fn consume<F>(
        &mut self,
        session: &mut C::Session,
        shutdown: &mut Pin<&mut F>,
        report: &mut ServiceReport,
    ) -> bool
    where
        F: Future<Output = ()> + Send,
    {
        loop {
            let next = tokio::select! {
                biased;
                () = &mut *shutdown => return true,
                next = session.next_delivery() => next,
            };
            let delivery = match next {
                Ok(delivery) => delivery,
                Err(err) => {
                    warn!(queue = %self.binding.queue, error = %err, "delivery stream interrupted");
                    return false;
                }
            };
            match self.handler.handle_delivery(&*session, delivery).await {
                Ok(()) => report.processed += 1,
                Err(err) => {
                    report.aborted += 1;
                    warn!(
                        queue = %self.binding.queue,
                        error = %err,
                        "delivery left unacknowledged; reconnecting"
                    );
                    return false;
                }
            }
        }
    }

    /// Sleeps for the next backoff delay.
    ///
    /// Returns true when shutdown was requested during the pause.
    async fn pause<F>(&mut self, shutdown: &mut Pin<&mut F>) -> bool
    where
        F: Future<Output = ()> + Send,
    {
        let delay = self.backoff.next_delay();
        tokio::select! {
            biased;
            () = &mut *shutdown => true,
            () = tokio::time::sleep(delay) => false,
        }
    }
}

impl<C> ConsumerService<C, Dispatcher>
where
    C: BusConnector,
{
    /// Builds the dispatch service described by a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Config`] when the topology is invalid and
    /// [`ServiceError::Store`] when the configured ledger cannot be opened.
    pub fn from_config(config: &StageRelayConfig, connector: C) -> Result<Self, ServiceError> {
        let scheme = config.routing_key_scheme()?;
        let topology = Arc::new(config.build_topology()?);
        let binding =
            QueueBinding::dispatcher(&scheme, &config.broker.exchange, &config.broker.queue);
        let mut dispatcher = Dispatcher::new(scheme, topology);
        if let Some(store) = &config.store {
            let ledger = SqliteRevisionStore::new(store)?;
            info!(path = %store.path.display(), "staleness ledger attached");
            dispatcher = dispatcher.with_ledger(SharedRevisionStore::from_store(ledger));
        }
        Ok(Self::new(connector, binding, dispatcher, Backoff::from_config(&config.broker.reconnect)))
    }
}
