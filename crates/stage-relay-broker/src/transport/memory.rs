// crates/stage-relay-broker/src/transport/memory.rs
// ============================================================================
// Module: Stage Relay In-Memory Exchange
// Description: Process-local topic exchange with durable-queue semantics.
// Purpose: Run the dispatcher and worker harness without a broker.
// Dependencies: stage-relay-core, async-trait, tokio, tracing
// ============================================================================

//! ## Overview
//! [`MemoryExchange`] models the subset of an AMQP topic exchange the relay
//! relies on: queues with topic bindings, per-consumer prefetch, explicit
//! acknowledgement, and redelivery of unacknowledged messages when a
//! consumer goes away. Fault hooks fail publishes and connects on demand and
//! sever every open session.
//! Invariants:
//! - A message is delivered to every queue with a matching binding.
//! - A delivery stays unacknowledged until its session acks it; it is
//!   requeued with `redelivered = true` if the session is dropped or severed.
//! - A session never holds more unacknowledged deliveries than its prefetch.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use async_trait::async_trait;
use stage_relay_core::BusError;
use stage_relay_core::Delivery;
use stage_relay_core::DeliveryTag;
use stage_relay_core::MessageBus;
use stage_relay_core::OutboundMessage;
use tokio::sync::watch;
use tracing::debug;

use crate::topic::topic_matches;
use crate::transport::BusConnector;
use crate::transport::BusSession;
use crate::transport::QueueBinding;

// ============================================================================
// SECTION: Exchange State
// ============================================================================

/// Message held by a queue or recorded as published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Message body.
    pub body: Vec<u8>,
    /// Delivery mode 2 flag.
    pub persistent: bool,
    /// True once the message has been delivered and requeued.
    pub redelivered: bool,
}

/// Delivery handed to a session and not yet acknowledged.
#[derive(Debug)]
struct Unacked {
    /// Owning session.
    session: u64,
    /// Delivered message.
    message: QueuedMessage,
}

/// One declared queue.
#[derive(Debug, Default)]
struct QueueState {
    /// Binding patterns.
    patterns: Vec<String>,
    /// Messages awaiting delivery.
    ready: VecDeque<QueuedMessage>,
    /// Delivered messages keyed by delivery tag.
    unacked: BTreeMap<u64, Unacked>,
}

impl QueueState {
    /// Counts unacknowledged deliveries held by a session.
    fn held_by(&self, session: u64) -> usize {
        self.unacked.values().filter(|entry| entry.session == session).count()
    }

    /// Moves unacknowledged deliveries back to the head of the queue.
    ///
    /// `None` requeues deliveries of every session.
    fn requeue(&mut self, session: Option<u64>) -> usize {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, entry)| session.is_none_or(|id| entry.session == id))
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags.iter().rev() {
            if let Some(entry) = self.unacked.remove(tag) {
                let mut message = entry.message;
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }
        tags.len()
    }
}

/// Mutable exchange state.
#[derive(Debug, Default)]
struct ExchangeState {
    /// Declared queues by name.
    queues: BTreeMap<String, QueueState>,
    /// Messages published through sessions, in publish order.
    published: Vec<QueuedMessage>,
    /// Last delivery tag handed out.
    next_tag: u64,
    /// Last session id handed out.
    next_session: u64,
    /// Connection generation; bumped when sessions are severed.
    epoch: u64,
    /// Session publishes left to fail.
    publish_faults: usize,
    /// Connects left to fail.
    connect_faults: usize,
}

impl ExchangeState {
    /// Declares a queue or extends its bindings.
    fn declare(&mut self, binding: &QueueBinding) {
        let queue = self.queues.entry(binding.queue.clone()).or_default();
        for pattern in &binding.patterns {
            if !queue.patterns.contains(pattern) {
                queue.patterns.push(pattern.clone());
            }
        }
    }

    /// Appends a message to every queue with a matching binding.
    fn route(&mut self, message: &QueuedMessage) -> usize {
        let mut routed = 0;
        for queue in self.queues.values_mut() {
            if queue.patterns.iter().any(|pattern| topic_matches(pattern, &message.routing_key)) {
                queue.ready.push_back(message.clone());
                routed += 1;
            }
        }
        routed
    }
}

// ============================================================================
// SECTION: Memory Exchange
// ============================================================================

/// Shared in-memory topic exchange.
#[derive(Debug, Clone)]
pub struct MemoryExchange {
    /// Exchange state.
    state: Arc<Mutex<ExchangeState>>,
    /// Change counter waking idle sessions.
    changes: Arc<watch::Sender<u64>>,
}

impl Default for MemoryExchange {
    fn default() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(ExchangeState::default())),
            changes: Arc::new(changes),
        }
    }
}

impl MemoryExchange {
    /// Creates an empty exchange.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the exchange state.
    fn lock(&self) -> Result<MutexGuard<'_, ExchangeState>, BusError> {
        self.state
            .lock()
            .map_err(|_| BusError::Connection("memory exchange mutex poisoned".to_string()))
    }

    /// Wakes sessions waiting for deliveries.
    fn notify(&self) {
        self.changes.send_modify(|counter| *counter = counter.wrapping_add(1));
    }

    /// Declares a queue and its bindings without opening a session.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] when the exchange state is unavailable.
    pub fn declare(&self, binding: &QueueBinding) -> Result<(), BusError> {
        self.lock()?.declare(binding);
        Ok(())
    }

    /// Publishes a message as an external producer would.
    ///
    /// Returns the number of queues the message reached. Fault injection does
    /// not apply.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] when the exchange state is unavailable.
    pub fn inject(&self, routing_key: &str, body: impl Into<Vec<u8>>) -> Result<usize, BusError> {
        let message = QueuedMessage {
            routing_key: routing_key.to_string(),
            body: body.into(),
            persistent: true,
            redelivered: false,
        };
        let routed = self.lock()?.route(&message);
        self.notify();
        Ok(routed)
    }

    /// Fails the next `count` session publishes.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] when the exchange state is unavailable.
    pub fn fail_next_publishes(&self, count: usize) -> Result<(), BusError> {
        self.lock()?.publish_faults = count;
        Ok(())
    }

    /// Fails the next `count` connects.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] when the exchange state is unavailable.
    pub fn fail_next_connects(&self, count: usize) -> Result<(), BusError> {
        self.lock()?.connect_faults = count;
        Ok(())
    }

    /// Severs every open session and requeues their unacknowledged deliveries.
    ///
    /// Returns the number of requeued deliveries.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] when the exchange state is unavailable.
    pub fn sever(&self) -> Result<usize, BusError> {
        let mut guard = self.lock()?;
        guard.epoch += 1;
        let requeued = guard.queues.values_mut().map(|queue| queue.requeue(None)).sum();
        drop(guard);
        self.notify();
        Ok(requeued)
    }

    /// Returns the messages waiting in a queue.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] when the exchange state is unavailable.
    pub fn ready(&self, queue: &str) -> Result<Vec<QueuedMessage>, BusError> {
        Ok(self
            .lock()?
            .queues
            .get(queue)
            .map(|state| state.ready.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Removes and returns the messages waiting in a queue.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] when the exchange state is unavailable.
    pub fn drain(&self, queue: &str) -> Result<Vec<QueuedMessage>, BusError> {
        Ok(self
            .lock()?
            .queues
            .get_mut(queue)
            .map(|state| state.ready.drain(..).collect())
            .unwrap_or_default())
    }

    /// Returns the number of unacknowledged deliveries of a queue.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] when the exchange state is unavailable.
    pub fn unacked(&self, queue: &str) -> Result<usize, BusError> {
        Ok(self.lock()?.queues.get(queue).map_or(0, |state| state.unacked.len()))
    }

    /// Returns every message published through a session.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] when the exchange state is unavailable.
    pub fn published(&self) -> Result<Vec<QueuedMessage>, BusError> {
        Ok(self.lock()?.published.clone())
    }
}

// ============================================================================
// SECTION: Connector
// ============================================================================

/// Connector opening sessions on a [`MemoryExchange`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    /// Target exchange.
    exchange: MemoryExchange,
}

impl MemoryConnector {
    /// Creates a connector for the exchange.
    #[must_use]
    pub const fn new(exchange: MemoryExchange) -> Self {
        Self {
            exchange,
        }
    }

    /// Returns the target exchange.
    #[must_use]
    pub const fn exchange(&self) -> &MemoryExchange {
        &self.exchange
    }
}

#[async_trait]
impl BusConnector for MemoryConnector {
    type Session = MemorySession;

    async fn connect(&self, binding: &QueueBinding) -> Result<MemorySession, BusError> {
        let mut guard = self.exchange.lock()?;
        if guard.connect_faults > 0 {
            guard.connect_faults -= 1;
            return Err(BusError::Connection("injected connect fault".to_string()));
        }
        guard.declare(binding);
        guard.next_session += 1;
        let session = guard.next_session;
        let epoch = guard.epoch;
        drop(guard);
        debug!(queue = %binding.queue, session, "memory session opened");
        Ok(MemorySession {
            exchange: self.exchange.clone(),
            queue: binding.queue.clone(),
            session,
            epoch,
            prefetch: usize::from(binding.prefetch.max(1)),
            changes: self.exchange.changes.subscribe(),
        })
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

// ============================================================================
// SECTION: Session
// ============================================================================

/// Consumer session on one queue of a [`MemoryExchange`].
pub struct MemorySession {
    /// Shared exchange.
    exchange: MemoryExchange,
    /// Consumed queue.
    queue: String,
    /// Session id owning unacknowledged deliveries.
    session: u64,
    /// Connection generation at connect time.
    epoch: u64,
    /// Maximum unacknowledged deliveries.
    prefetch: usize,
    /// Change notifications.
    changes: watch::Receiver<u64>,
}

impl MemorySession {
    /// Locks the exchange, failing when the session was severed.
    fn live_state(&self) -> Result<MutexGuard<'_, ExchangeState>, BusError> {
        let guard = self.exchange.lock()?;
        if guard.epoch != self.epoch {
            return Err(BusError::Connection("connection severed".to_string()));
        }
        Ok(guard)
    }

    /// Takes the next ready message when the prefetch window allows it.
    fn try_take(&self) -> Result<Option<Delivery>, BusError> {
        let mut guard = self.live_state()?;
        let state = &mut *guard;
        let tag = state.next_tag + 1;
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Err(BusError::Closed);
        };
        if queue.held_by(self.session) >= self.prefetch {
            return Ok(None);
        }
        let Some(message) = queue.ready.pop_front() else {
            return Ok(None);
        };
        queue.unacked.insert(
            tag,
            Unacked {
                session: self.session,
                message: message.clone(),
            },
        );
        state.next_tag = tag;
        drop(guard);
        Ok(Some(Delivery {
            tag: DeliveryTag(tag),
            routing_key: message.routing_key,
            body: message.body,
            redelivered: message.redelivered,
        }))
    }
}

#[async_trait]
impl MessageBus for MemorySession {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), BusError> {
        let mut guard = self.live_state()?;
        if guard.publish_faults > 0 {
            guard.publish_faults -= 1;
            return Err(BusError::Publish(format!(
                "injected fault publishing {}",
                message.routing_key
            )));
        }
        let queued = QueuedMessage {
            routing_key: message.routing_key.clone(),
            body: message.body.clone(),
            persistent: message.persistent,
            redelivered: false,
        };
        let routed = guard.route(&queued);
        guard.published.push(queued);
        drop(guard);
        if routed == 0 {
            debug!(routing_key = %message.routing_key, "message matched no binding");
        }
        self.exchange.notify();
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BusError> {
        let mut guard = self.live_state()?;
        let removed = guard.queues.get_mut(&self.queue).and_then(|queue| {
            match queue.unacked.get(&tag.0) {
                Some(entry) if entry.session == self.session => queue.unacked.remove(&tag.0),
                _ => None,
            }
        });
        drop(guard);
        if removed.is_none() {
            return Err(BusError::Ack(format!("unknown delivery tag {}", tag.0)));
        }
        self.exchange.notify();
        Ok(())
    }
}

#[async_trait]
impl BusSession for MemorySession {
    async fn next_delivery(&mut self) -> Result<Delivery, BusError> {
        loop {
            drop(self.changes.borrow_and_update());
            if let Some(delivery) = self.try_take()? {
                return Ok(delivery);
            }
            self.changes.changed().await.map_err(|_| BusError::Closed)?;
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let requeued = self.exchange.state.lock().map_or(0, |mut guard| {
            guard.queues.get_mut(&self.queue).map_or(0, |queue| queue.requeue(Some(self.session)))
        });
        if requeued > 0 {
            self.exchange.notify();
        }
    }
}
