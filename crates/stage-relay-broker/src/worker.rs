// crates/stage-relay-broker/src/worker.rs
// ============================================================================
// Module: Stage Relay Worker Runtime
// Description: Harness implementing the worker-pool side of the protocol.
// Purpose: Run stage computations against fresh inputs and emit completions.
// Dependencies: stage-relay-core, async-trait, serde_json, thiserror, tracing
// ============================================================================

//! ## Overview
//! [`WorkerRuntime`] consumes the messages the dispatcher routes to one
//! worker pool. Requests run the pool's [`StageWorker`] against the latest
//! revisions of the stage's declared inputs, append the result, and publish a
//! completion signal `{datasetId, sequence}`. Invalidation notices mark the
//! stage stale and, under [`InvalidationPolicy::Recompute`], run it again.
//!
//! A request that finds a missing or stale input is deferred: the runtime
//! remembers it and reruns it when the stage's next invalidation arrives,
//! which the dispatcher sends once the input completes again. Deferred
//! requests live in memory only; a restarted runtime forgets them.
//! Invariants:
//! - A stage never computes from a missing or stale input revision.
//! - A deferred request is rerun on the stage's next invalidation under
//!   every [`InvalidationPolicy`].
//! - A completion is published only after the append succeeded.
//! - A failed computation emits nothing and is not retried.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use async_trait::async_trait;
use serde_json::Value;
use stage_relay_core::Artifact;
use stage_relay_core::BusError;
use stage_relay_core::CompletionNotice;
use stage_relay_core::DatasetId;
use stage_relay_core::Delivery;
use stage_relay_core::DependencyGraph;
use stage_relay_core::MessageBus;
use stage_relay_core::MessageEnvelope;
use stage_relay_core::MessageKind;
use stage_relay_core::OutboundMessage;
use stage_relay_core::Revision;
use stage_relay_core::RevisionStore;
use stage_relay_core::RoutingKeyScheme;
use stage_relay_core::SharedRevisionStore;
use stage_relay_core::Stage;
use stage_relay_core::StaleMark;
use stage_relay_core::StoreError;
use stage_relay_core::WorkerPoolId;
use thiserror::Error;
use tracing::info;
use tracing::warn;

use crate::transport::QueueBinding;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Worker runtime failures that leave the delivery unacknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// The stage computation failed.
    #[error("stage {stage} computation failed: {reason}")]
    Compute {
        /// Stage being computed.
        stage: Stage,
        /// Human-readable reason.
        reason: String,
    },
    /// The revision store rejected a read or write.
    #[error("revision store failure: {0}")]
    Store(#[from] StoreError),
    /// Publishing the completion signal failed.
    #[error("completion publish failed: {0}")]
    Publish(BusError),
    /// Acknowledging the delivery failed.
    #[error("acknowledge failed: {0}")]
    Ack(BusError),
    /// The completion body could not be encoded.
    #[error("completion encoding failed: {0}")]
    Encode(String),
}

// ============================================================================
// SECTION: Stage Workers
// ============================================================================

/// Inputs handed to a stage computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRequest {
    /// Dataset being processed.
    pub dataset_id: DatasetId,
    /// Stage being computed.
    pub stage: Stage,
    /// Latest fresh revision of each declared input.
    pub inputs: BTreeMap<Stage, Revision>,
    /// Body of the triggering message.
    pub payload: Value,
}

/// Stage computation plugged into a [`WorkerRuntime`].
#[async_trait]
pub trait StageWorker: Send + Sync {
    /// Returns the input stages `stage` is computed from.
    fn inputs(&self, stage: Stage) -> Vec<Stage>;

    /// Computes the stage artifact.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Compute`] when the computation fails.
    async fn compute(&self, request: &StageRequest) -> Result<Artifact, WorkerError>;
}

/// Returns the stages whose cascade names `stage`, in declaration order.
///
/// Workers whose inputs follow the invalidation graph use this as their
/// [`StageWorker::inputs`].
#[must_use]
pub fn upstream_of(graph: &DependencyGraph, stage: Stage) -> Vec<Stage> {
    graph
        .edges()
        .filter(|(_, downstream)| downstream.contains(&stage))
        .map(|(upstream, _)| upstream)
        .collect()
}

// ============================================================================
// SECTION: Outcomes
// ============================================================================

/// Reaction to an invalidation notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidationPolicy {
    /// Mark the stage stale and wait for an explicit request.
    #[default]
    MarkStale,
    /// Mark the stage stale and recompute it immediately.
    Recompute,
}

/// Result of handling one worker delivery. Every outcome is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// The stage ran, appended a revision, and signalled completion.
    Completed {
        /// Dataset processed.
        dataset_id: DatasetId,
        /// Stage computed.
        stage: Stage,
        /// Sequence of the appended revision.
        sequence: u64,
    },
    /// The stage was marked stale without recomputing.
    MarkedStale {
        /// Dataset affected.
        dataset_id: DatasetId,
        /// Stage affected.
        stage: Stage,
        /// Effect on the latest revision.
        mark: StaleMark,
    },
    /// An input stage has no revision yet; the request is deferred.
    MissingInput {
        /// Dataset processed.
        dataset_id: DatasetId,
        /// Stage requested.
        stage: Stage,
        /// Input without a revision.
        input: Stage,
    },
    /// An input stage's latest revision is stale; the request is deferred.
    StaleInput {
        /// Dataset processed.
        dataset_id: DatasetId,
        /// Stage requested.
        stage: Stage,
        /// Stale input.
        input: Stage,
        /// Sequence of the stale input revision.
        sequence: u64,
    },
    /// The computation failed; nothing was emitted.
    Failed {
        /// Dataset processed.
        dataset_id: DatasetId,
        /// Stage requested.
        stage: Stage,
        /// Failure detail.
        reason: String,
    },
    /// The delivery could not be decoded.
    Rejected {
        /// Inbound routing key.
        routing_key: String,
        /// Decode failure detail.
        detail: String,
    },
}

// ============================================================================
// SECTION: Worker Runtime
// ============================================================================

/// Request bodies waiting for an input, keyed by dataset and stage.
type DeferredRequests = BTreeMap<(DatasetId, Stage), Value>;

/// Worker-pool protocol harness around a [`StageWorker`].
pub struct WorkerRuntime {
    /// Routing key layout.
    scheme: RoutingKeyScheme,
    /// Pool this runtime consumes for.
    pool: WorkerPoolId,
    /// Revision store inputs are read from and results appended to.
    store: SharedRevisionStore,
    /// Stage computation.
    worker: Arc<dyn StageWorker>,
    /// Reaction to invalidation notices.
    policy: InvalidationPolicy,
    /// Requests deferred on a missing or stale input.
    deferred: Mutex<DeferredRequests>,
}

impl WorkerRuntime {
    /// Creates a runtime for a worker pool.
    #[must_use]
    pub fn new(
        scheme: RoutingKeyScheme,
        pool: WorkerPoolId,
        store: SharedRevisionStore,
        worker: Arc<dyn StageWorker>,
    ) -> Self {
        Self {
            scheme,
            pool,
            store,
            worker,
            policy: InvalidationPolicy::default(),
            deferred: Mutex::new(BTreeMap::new()),
        }
    }

    /// Sets the invalidation policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: InvalidationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the worker pool.
    #[must_use]
    pub const fn pool(&self) -> &WorkerPoolId {
        &self.pool
    }

    /// Returns the (dataset, stage) keys of deferred requests.
    #[must_use]
    pub fn deferred(&self) -> Vec<(DatasetId, Stage)> {
        self.deferred_requests().keys().copied().collect()
    }

    /// Locks the deferred request table.
    fn deferred_requests(&self) -> MutexGuard<'_, DeferredRequests> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the queue binding this runtime consumes from.
    #[must_use]
    pub fn binding(&self, exchange: impl Into<String>) -> QueueBinding {
        QueueBinding::worker(&self.scheme, exchange, &self.pool)
    }

    /// Handles one delivery end to end.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the store, the completion publish, or the
    /// acknowledgement fails. The delivery is left unacknowledged.
    pub async fn handle<B>(&self, bus: &B, delivery: Delivery) -> Result<WorkerOutcome, WorkerError>
    where
        B: MessageBus + ?Sized,
    {
        let outcome = match self.decode(&delivery) {
            Ok((dataset_id, envelope)) => self.process(bus, dataset_id, envelope).await?,
            Err(outcome) => outcome,
        };
        bus.ack(delivery.tag).await.map_err(WorkerError::Ack)?;
        Ok(outcome)
    }

    /// Decodes the stage and body of a delivery and maps its store key.
    fn decode(&self, delivery: &Delivery) -> Result<(DatasetId, MessageEnvelope), WorkerOutcome> {
        let rejected = |detail: String| {
            warn!(
                routing_key = %delivery.routing_key,
                pool = %self.pool,
                detail = %detail,
                "worker delivery rejected"
            );
            WorkerOutcome::Rejected {
                routing_key: delivery.routing_key.clone(),
                detail,
            }
        };
        let stage = self
            .scheme
            .worker_stage(&delivery.routing_key)
            .map_err(|err| rejected(err.to_string()))?;
        let envelope = MessageEnvelope::decode(stage, MessageKind::Request, &delivery.body)
            .map_err(|err| rejected(err.to_string()))?;
        let dataset_id = envelope.dataset_id.dataset_id().ok_or_else(|| {
            rejected(format!("dataset id {} has no revision store key", envelope.dataset_id))
        })?;
        Ok((dataset_id, envelope))
    }

    /// Applies a decoded message.
    async fn process<B>(
        &self,
        bus: &B,
        dataset_id: DatasetId,
        mut envelope: MessageEnvelope,
    ) -> Result<WorkerOutcome, WorkerError>
    where
        B: MessageBus + ?Sized,
    {
        let stage = envelope.stage;
        if envelope.kind == MessageKind::Invalidation {
            let mark = self.store.mark_stale(dataset_id, stage)?;
            info!(
                dataset_id = dataset_id.get(),
                stage = %stage,
                pool = %self.pool,
                "stage invalidated"
            );
            let deferred = self.deferred_requests().remove(&(dataset_id, stage));
            match deferred {
                Some(payload) => {
                    info!(
                        dataset_id = dataset_id.get(),
                        stage = %stage,
                        pool = %self.pool,
                        "rerunning deferred request"
                    );
                    envelope.payload = payload;
                }
                None if self.policy == InvalidationPolicy::MarkStale => {
                    return Ok(WorkerOutcome::MarkedStale {
                        dataset_id,
                        stage,
                        mark,
                    });
                }
                None => {}
            }
        }
        let outcome = self.compute(bus, dataset_id, envelope).await?;
        if !matches!(
            outcome,
            WorkerOutcome::MissingInput { .. } | WorkerOutcome::StaleInput { .. }
        ) {
            self.deferred_requests().remove(&(dataset_id, stage));
        }
        Ok(outcome)
    }

    /// Remembers a request to rerun on the stage's next invalidation.
    fn defer(&self, dataset_id: DatasetId, stage: Stage, payload: Value) {
        self.deferred_requests().insert((dataset_id, stage), payload);
    }

    /// Runs the stage against fresh inputs and signals completion.
    async fn compute<B>(
        &self,
        bus: &B,
        dataset_id: DatasetId,
        envelope: MessageEnvelope,
    ) -> Result<WorkerOutcome, WorkerError>
    where
        B: MessageBus + ?Sized,
    {
        let stage = envelope.stage;
        let mut inputs = BTreeMap::new();
        for input in self.worker.inputs(stage) {
            match self.store.latest(dataset_id, input) {
                Ok(revision) if revision.stale => {
                    warn!(
                        dataset_id = dataset_id.get(),
                        stage = %stage,
                        input = %input,
                        sequence = revision.sequence,
                        "input revision stale; deferring until the next invalidation"
                    );
                    self.defer(dataset_id, stage, envelope.payload);
                    return Ok(WorkerOutcome::StaleInput {
                        dataset_id,
                        stage,
                        input,
                        sequence: revision.sequence,
                    });
                }
                Ok(revision) => {
                    inputs.insert(input, revision);
                }
                Err(StoreError::NotFound {
                    ..
                }) => {
                    warn!(
                        dataset_id = dataset_id.get(),
                        stage = %stage,
                        input = %input,
                        "input revision missing; deferring until the next invalidation"
                    );
                    self.defer(dataset_id, stage, envelope.payload);
                    return Ok(WorkerOutcome::MissingInput {
                        dataset_id,
                        stage,
                        input,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }

        let request = StageRequest {
            dataset_id,
            stage,
            inputs,
            payload: envelope.payload,
        };
        let artifact = match self.worker.compute(&request).await {
            Ok(artifact) => artifact,
            Err(err) => {
                warn!(
                    dataset_id = dataset_id.get(),
                    stage = %stage,
                    pool = %self.pool,
                    error = %err,
                    "stage computation failed"
                );
                return Ok(WorkerOutcome::Failed {
                    dataset_id,
                    stage,
                    reason: err.to_string(),
                });
            }
        };

        let revision = self.store.append(dataset_id, stage, artifact)?;
        let notice = CompletionNotice {
            dataset_id: envelope.dataset_id,
            sequence: Some(revision.sequence),
        };
        let body = serde_json::to_vec(&notice).map_err(|err| WorkerError::Encode(err.to_string()))?;
        let message = OutboundMessage {
            routing_key: self.scheme.completion_key(stage),
            body,
            stage,
            pool: self.pool.clone(),
            kind: MessageKind::Completion,
            persistent: true,
        };
        bus.publish(&message).await.map_err(WorkerError::Publish)?;
        info!(
            dataset_id = dataset_id.get(),
            stage = %stage,
            sequence = revision.sequence,
            routing_key = %message.routing_key,
            "stage completed"
        );
        Ok(WorkerOutcome::Completed {
            dataset_id,
            stage,
            sequence: revision.sequence,
        })
    }
}
