// crates/stage-relay-core/src/runtime/dispatcher.rs
// ============================================================================
// Module: Stage Relay Dispatcher
// Description: Single-message state machine for routing and cascading.
// Purpose: Route task requests and fan out invalidations on completion.
// Dependencies: crate::{core, interfaces, runtime}, serde_json, thiserror, tracing
// ============================================================================

//! ## Overview
//! The dispatcher handles exactly one delivery per cycle:
//! `Idle -> Classifying -> {Routing | Cascading} -> Publishing ->
//! Acknowledging -> Idle`.
//!
//! Invariants:
//! - A delivery is acknowledged only after every outbound publish succeeded.
//! - Malformed and unroutable deliveries are acknowledged with a diagnostic
//!   and never retried.
//! - Invalidations follow declared graph edges only and never carry the
//!   upstream payload.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::core::DatasetRef;
use crate::core::EnvelopeError;
use crate::core::InboundKind;
use crate::core::InvalidationNotice;
use crate::core::MessageKind;
use crate::core::RoutingError;
use crate::core::RoutingKeyScheme;
use crate::core::Stage;
use crate::core::StaleMark;
use crate::core::Topology;
use crate::core::envelope::dataset_ref_from_body;
use crate::interfaces::BusError;
use crate::interfaces::Delivery;
use crate::interfaces::DeliveryTag;
use crate::interfaces::MessageBus;
use crate::interfaces::OutboundMessage;
use crate::interfaces::RevisionStore;
use crate::interfaces::StoreError;
use crate::runtime::store::SharedRevisionStore;

// ============================================================================
// SECTION: States
// ============================================================================

/// Dispatcher state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchState {
    /// Waiting for the next delivery.
    Idle,
    /// Parsing the routing key.
    Classifying,
    /// Resolving the worker pool for a task request.
    Routing,
    /// Resolving downstream stages for a completion signal.
    Cascading,
    /// Publishing outbound messages.
    Publishing,
    /// Acknowledging the inbound delivery.
    Acknowledging,
}

impl DispatchState {
    /// Returns a stable label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Classifying => "classifying",
            Self::Routing => "routing",
            Self::Cascading => "cascading",
            Self::Publishing => "publishing",
            Self::Acknowledging => "acknowledging",
        }
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SECTION: Diagnostics
// ============================================================================

/// Reason a delivery was dropped without publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Routing key shape was not recognized.
    MalformedRoutingKey,
    /// Routing key named a stage outside the closed set.
    UnknownStage,
    /// Stage has no worker pool.
    UnroutableStage,
    /// Completion body lacked a usable dataset id.
    MalformedBody,
}

impl DiagnosticKind {
    /// Returns a stable label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MalformedRoutingKey => "malformed_routing_key",
            Self::UnknownStage => "unknown_stage",
            Self::UnroutableStage => "unroutable_stage",
            Self::MalformedBody => "malformed_body",
        }
    }
}

/// Diagnostic emitted for a rejected delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Diagnostic category.
    pub kind: DiagnosticKind,
    /// Inbound routing key.
    pub routing_key: String,
    /// Human-readable detail.
    pub detail: String,
}

impl Diagnostic {
    /// Builds a diagnostic from an envelope error.
    fn from_envelope(routing_key: &str, error: &EnvelopeError) -> Self {
        let kind = match error {
            EnvelopeError::UnknownStage {
                ..
            } => DiagnosticKind::UnknownStage,
            EnvelopeError::MalformedBody(_) => DiagnosticKind::MalformedBody,
            EnvelopeError::MalformedRoutingKey {
                ..
            }
            | EnvelopeError::InvalidSegment(_) => DiagnosticKind::MalformedRoutingKey,
        };
        Self {
            kind,
            routing_key: routing_key.to_string(),
            detail: error.to_string(),
        }
    }

    /// Builds a diagnostic from a routing error.
    fn from_routing(routing_key: &str, error: &RoutingError) -> Self {
        Self {
            kind: DiagnosticKind::UnroutableStage,
            routing_key: routing_key.to_string(),
            detail: error.to_string(),
        }
    }
}

// ============================================================================
// SECTION: Errors and Outcomes
// ============================================================================

/// Transient dispatch failures. The delivery is left unacknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Publishing an outbound message failed.
    #[error("publish to {routing_key} failed: {source}")]
    Publish {
        /// Outbound routing key.
        routing_key: String,
        /// Underlying bus error.
        source: BusError,
    },
    /// Acknowledging the delivery failed.
    #[error("acknowledge of delivery {tag} failed: {source}")]
    Ack {
        /// Delivery tag.
        tag: u64,
        /// Underlying bus error.
        source: BusError,
    },
    /// The staleness ledger rejected an update.
    #[error("staleness ledger update failed: {0}")]
    Ledger(StoreError),
    /// An invalidation body could not be encoded.
    #[error("invalidation encoding failed: {0}")]
    Encode(String),
}

/// Result of one dispatch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Classification of the delivery, when it was recognized.
    pub inbound: Option<InboundKind>,
    /// Messages published during the cycle, in publish order.
    pub published: Vec<OutboundMessage>,
    /// Diagnostics for rejected deliveries.
    pub diagnostics: Vec<Diagnostic>,
    /// True when the delivery was acknowledged.
    pub acknowledged: bool,
}

/// Work resolved by the classification and lookup states.
enum Plan {
    /// Publish these messages, then acknowledge.
    Publish(Vec<OutboundMessage>),
    /// Acknowledge without publishing.
    Reject(Diagnostic),
}

// ============================================================================
// SECTION: Dispatcher
// ============================================================================

/// Task-routing and cascading-invalidation dispatcher.
///
/// # Invariants
/// - The topology is immutable and shared; the dispatcher never mutates it.
/// - One delivery is handled at a time (`handle` takes `&mut self`).
pub struct Dispatcher {
    /// Routing key layout.
    scheme: RoutingKeyScheme,
    /// Validated graph and routing table.
    topology: Arc<Topology>,
    /// Optional store whose downstream revisions are marked stale on cascade.
    ledger: Option<SharedRevisionStore>,
    /// Current state.
    state: DispatchState,
    /// States entered during the most recent cycle.
    transitions: Vec<DispatchState>,
}

impl Dispatcher {
    /// Creates a dispatcher for a routing key scheme and topology.
    #[must_use]
    pub const fn new(scheme: RoutingKeyScheme, topology: Arc<Topology>) -> Self {
        Self {
            scheme,
            topology,
            ledger: None,
            state: DispatchState::Idle,
            transitions: Vec::new(),
        }
    }

    /// Attaches a staleness ledger.
    #[must_use]
    pub fn with_ledger(mut self, ledger: SharedRevisionStore) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Returns the routing key scheme.
    #[must_use]
    pub const fn scheme(&self) -> &RoutingKeyScheme {
        &self.scheme
    }

    /// Returns the topology.
    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> DispatchState {
        self.state
    }

    /// Returns the states entered during the most recent cycle.
    #[must_use]
    pub fn last_cycle(&self) -> &[DispatchState] {
        &self.transitions
    }

    /// Handles one delivery end to end.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] when a publish, the ledger, or the
    /// acknowledgement fails. The delivery is not acknowledged in that case
    /// and the broker will redeliver it.
    pub async fn handle<B>(
        &mut self,
        bus: &B,
        delivery: Delivery,
    ) -> Result<DispatchOutcome, DispatchError>
    where
        B: MessageBus + ?Sized,
    {
        self.transitions.clear();
        self.enter(DispatchState::Idle);
        let result = self.run_cycle(bus, &delivery).await;
        self.enter(DispatchState::Idle);
        if let Err(err) = &result {
            warn!(
                routing_key = %delivery.routing_key,
                redelivered = delivery.redelivered,
                error = %err,
                "dispatch cycle aborted without acknowledgement"
            );
        }
        result
    }

    /// Runs the non-idle states of a cycle.
    async fn run_cycle<B>(
        &mut self,
        bus: &B,
        delivery: &Delivery,
    ) -> Result<DispatchOutcome, DispatchError>
    where
        B: MessageBus + ?Sized,
    {
        self.enter(DispatchState::Classifying);
        let key = delivery.routing_key.as_str();
        let (inbound, plan) = match self.scheme.classify(key) {
            Ok(inbound @ InboundKind::TaskRequest(stage)) => {
                self.enter(DispatchState::Routing);
                (Some(inbound), self.plan_route(stage, delivery))
            }
            Ok(inbound @ InboundKind::CompletionSignal(stage)) => {
                self.enter(DispatchState::Cascading);
                (Some(inbound), self.plan_cascade(stage, delivery)?)
            }
            Err(err) => (None, Plan::Reject(Diagnostic::from_envelope(key, &err))),
        };

        let mut outcome = DispatchOutcome {
            inbound,
            published: Vec::new(),
            diagnostics: Vec::new(),
            acknowledged: false,
        };
        match plan {
            Plan::Publish(messages) => {
                self.enter(DispatchState::Publishing);
                for message in messages {
                    bus.publish(&message).await.map_err(|source| DispatchError::Publish {
                        routing_key: message.routing_key.clone(),
                        source,
                    })?;
                    debug!(
                        routing_key = %message.routing_key,
                        stage = %message.stage,
                        pool = %message.pool,
                        kind = message.kind.as_str(),
                        "published"
                    );
                    outcome.published.push(message);
                }
            }
            Plan::Reject(diagnostic) => {
                warn!(
                    routing_key = %diagnostic.routing_key,
                    diagnostic = diagnostic.kind.as_str(),
                    detail = %diagnostic.detail,
                    "delivery rejected"
                );
                outcome.diagnostics.push(diagnostic);
            }
        }

        self.enter(DispatchState::Acknowledging);
        acknowledge(bus, delivery.tag).await?;
        outcome.acknowledged = true;
        Ok(outcome)
    }

    /// Resolves the routing path for a task request.
    fn plan_route(&self, stage: Stage, delivery: &Delivery) -> Plan {
        let key = delivery.routing_key.as_str();
        let pool = match self.topology.routing().route(stage) {
            Ok(pool) => pool.clone(),
            Err(err) => return Plan::Reject(Diagnostic::from_routing(key, &err)),
        };
        let dataset_id = dataset_ref_from_body(&delivery.body).ok().map(|id| id.to_string());
        let routing_key = self.scheme.worker_key(stage, &pool);
        info!(
            dataset_id = dataset_id.as_deref(),
            stage = %stage,
            routing_key = %routing_key,
            pool = %pool,
            "routing task request"
        );
        Plan::Publish(vec![OutboundMessage {
            routing_key,
            body: delivery.body.clone(),
            stage,
            pool,
            kind: MessageKind::Request,
            persistent: true,
        }])
    }

    /// Resolves the cascading path for a completion signal.
    fn plan_cascade(&self, stage: Stage, delivery: &Delivery) -> Result<Plan, DispatchError> {
        let key = delivery.routing_key.as_str();
        let dataset_id = match dataset_ref_from_body(&delivery.body) {
            Ok(dataset_id) => dataset_id,
            Err(err) => return Ok(Plan::Reject(Diagnostic::from_envelope(key, &err))),
        };
        let downstream = self.topology.graph().cascade_from(stage);
        let mut messages = Vec::with_capacity(downstream.len());
        for target in downstream {
            let pool = match self.topology.routing().route(*target) {
                Ok(pool) => pool.clone(),
                Err(err) => return Ok(Plan::Reject(Diagnostic::from_routing(key, &err))),
            };
            let notice = InvalidationNotice::new(dataset_id.clone(), *target);
            let body = serde_json::to_vec(&notice)
                .map_err(|err| DispatchError::Encode(err.to_string()))?;
            messages.push(OutboundMessage {
                routing_key: self.scheme.worker_key(*target, &pool),
                body,
                stage: *target,
                pool,
                kind: MessageKind::Invalidation,
                persistent: true,
            });
        }
        if let Some(ledger) = &self.ledger {
            mark_downstream_stale(ledger, &dataset_id, &messages)?;
        }
        info!(
            dataset_id = %dataset_id,
            stage = %stage,
            routing_key = %key,
            invalidations = messages.len(),
            "cascading completion"
        );
        Ok(Plan::Publish(messages))
    }

    /// Records a state transition.
    fn enter(&mut self, state: DispatchState) {
        self.state = state;
        self.transitions.push(state);
    }
}

/// Marks every cascade target stale in the ledger.
///
/// References without a store key have no revisions to mark; the cascade is
/// still published.
fn mark_downstream_stale(
    ledger: &SharedRevisionStore,
    dataset_ref: &DatasetRef,
    messages: &[OutboundMessage],
) -> Result<(), DispatchError> {
    let Some(dataset_id) = dataset_ref.dataset_id() else {
        debug!(dataset_id = %dataset_ref, "dataset reference has no ledger key");
        return Ok(());
    };
    for message in messages {
        let mark = ledger.mark_stale(dataset_id, message.stage).map_err(DispatchError::Ledger)?;
        if let StaleMark::Marked {
            sequence,
        } = mark
        {
            debug!(
                dataset_id = dataset_id.get(),
                stage = %message.stage,
                sequence,
                "marked revision stale"
            );
        }
    }
    Ok(())
}

/// Acknowledges a delivery, wrapping bus failures.
async fn acknowledge<B>(bus: &B, tag: DeliveryTag) -> Result<(), DispatchError>
where
    B: MessageBus + ?Sized,
{
    bus.ack(tag).await.map_err(|source| DispatchError::Ack {
        tag: tag.0,
        source,
    })
}
