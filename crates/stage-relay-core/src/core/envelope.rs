// crates/stage-relay-core/src/core/envelope.rs
// ============================================================================
// Module: Stage Relay Message Envelope
// Description: Routing-key scheme, inbound classification, and wire bodies.
// Purpose: Define the protocol shared by the dispatcher and worker pools.
// Dependencies: serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! Messages travel over a topic exchange. Routing keys follow
//! `<namespace>.<stage>` for task requests and
//! `<namespace>.<stage>.<completion_suffix>` for completion signals. The
//! dispatcher republishes to `<namespace>.<stage>.<worker_pool>`.
//! Bodies are JSON objects carrying at least `datasetId`; invalidation
//! notices add `stage` and `invalidated: true`.
//! Invariants:
//! - Classification never guesses: any other key shape is rejected.
//! - Invalidation bodies never carry the upstream artifact payload.
//! - `datasetId` is opaque on the wire: a string or number is echoed
//!   unchanged; only revision stores map it to a [`DatasetId`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

use crate::core::identifiers::DatasetId;
use crate::core::identifiers::WorkerPoolId;
use crate::core::routing::is_topic_segment;
use crate::core::stage::Stage;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// JSON field carrying the dataset identifier.
pub const DATASET_ID_FIELD: &str = "datasetId";
/// JSON field flagging an invalidation notice.
pub const INVALIDATED_FIELD: &str = "invalidated";
/// JSON field naming the invalidated stage.
pub const STAGE_FIELD: &str = "stage";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Protocol errors for routing keys and message bodies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// Routing key does not match the request or completion shape.
    #[error("malformed routing key '{key}': {reason}")]
    MalformedRoutingKey {
        /// Offending routing key.
        key: String,
        /// Human-readable reason.
        reason: String,
    },
    /// Routing key names a stage outside the closed stage set.
    #[error("routing key '{key}' names unknown stage '{stage}'")]
    UnknownStage {
        /// Offending routing key.
        key: String,
        /// Unrecognized stage segment.
        stage: String,
    },
    /// Namespace or suffix cannot be used as a routing key segment.
    #[error("invalid routing key segment '{0}'")]
    InvalidSegment(String),
    /// Message body is not a JSON object with a usable dataset id.
    #[error("malformed message body: {0}")]
    MalformedBody(String),
}

// ============================================================================
// SECTION: Message Kinds
// ============================================================================

/// Protocol message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Request to run a stage.
    Request,
    /// Signal that a stage run finished and appended a revision.
    Completion,
    /// Notice that a stage's latest revision is stale.
    Invalidation,
}

impl MessageKind {
    /// Returns a stable label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Completion => "completion",
            Self::Invalidation => "invalidation",
        }
    }
}

/// Classification of an inbound dispatcher routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    /// `<namespace>.<stage>`: route to the owning worker pool.
    TaskRequest(Stage),
    /// `<namespace>.<stage>.<suffix>`: cascade invalidations downstream.
    CompletionSignal(Stage),
}

impl InboundKind {
    /// Returns the stage named by the routing key.
    #[must_use]
    pub const fn stage(self) -> Stage {
        match self {
            Self::TaskRequest(stage) | Self::CompletionSignal(stage) => stage,
        }
    }
}

// ============================================================================
// SECTION: Routing Key Scheme
// ============================================================================

/// Routing key layout for one pipeline namespace.
///
/// # Invariants
/// - `namespace` and `completion_suffix` are valid topic segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKeyScheme {
    /// Leading routing key segment.
    namespace: String,
    /// Trailing segment marking completion signals.
    completion_suffix: String,
}

impl RoutingKeyScheme {
    /// Creates a routing key scheme.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::InvalidSegment`] when either part contains
    /// separators, wildcards, or whitespace.
    pub fn new(
        namespace: impl Into<String>,
        completion_suffix: impl Into<String>,
    ) -> Result<Self, EnvelopeError> {
        let namespace = namespace.into();
        let completion_suffix = completion_suffix.into();
        for segment in [&namespace, &completion_suffix] {
            if !is_topic_segment(segment) {
                return Err(EnvelopeError::InvalidSegment(segment.clone()));
            }
        }
        Ok(Self {
            namespace,
            completion_suffix,
        })
    }

    /// Returns the namespace segment.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the completion suffix segment.
    #[must_use]
    pub fn completion_suffix(&self) -> &str {
        &self.completion_suffix
    }

    /// Classifies an inbound routing key.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::MalformedRoutingKey`] for any shape other than
    /// request or completion, and [`EnvelopeError::UnknownStage`] for stage
    /// names outside the closed set.
    pub fn classify(&self, key: &str) -> Result<InboundKind, EnvelopeError> {
        let segments: Vec<&str> = key.split('.').collect();
        let malformed = |reason: &str| EnvelopeError::MalformedRoutingKey {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(malformed("empty segment"));
        }
        if segments.first() != Some(&self.namespace.as_str()) {
            return Err(malformed("namespace mismatch"));
        }
        let (stage_segment, completion) = match segments.as_slice() {
            [_, stage] => (*stage, false),
            [_, stage, suffix] if *suffix == self.completion_suffix => (*stage, true),
            [_, _, _] => return Err(malformed("unexpected suffix")),
            _ => return Err(malformed("expected two or three segments")),
        };
        let stage = stage_segment.parse::<Stage>().map_err(|_| EnvelopeError::UnknownStage {
            key: key.to_string(),
            stage: stage_segment.to_string(),
        })?;
        Ok(if completion {
            InboundKind::CompletionSignal(stage)
        } else {
            InboundKind::TaskRequest(stage)
        })
    }

    /// Returns the task request key for `stage`.
    #[must_use]
    pub fn request_key(&self, stage: Stage) -> String {
        format!("{}.{}", self.namespace, stage.as_str())
    }

    /// Returns the completion signal key for `stage`.
    #[must_use]
    pub fn completion_key(&self, stage: Stage) -> String {
        format!("{}.{}.{}", self.namespace, stage.as_str(), self.completion_suffix)
    }

    /// Returns the key the dispatcher publishes to for a worker pool.
    #[must_use]
    pub fn worker_key(&self, stage: Stage, pool: &WorkerPoolId) -> String {
        format!("{}.{}.{}", self.namespace, stage.as_str(), pool.as_str())
    }

    /// Returns the binding patterns of the dispatcher's inbound queue.
    #[must_use]
    pub fn dispatcher_bindings(&self) -> [String; 2] {
        [
            format!("{}.*", self.namespace),
            format!("{}.*.{}", self.namespace, self.completion_suffix),
        ]
    }

    /// Returns the binding pattern of a worker pool's queue.
    #[must_use]
    pub fn worker_binding(&self, pool: &WorkerPoolId) -> String {
        format!("{}.*.{}", self.namespace, pool.as_str())
    }

    /// Extracts the stage from a worker-pool routing key.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] when the key is not `<namespace>.<stage>.<pool>`.
    pub fn worker_stage(&self, key: &str) -> Result<Stage, EnvelopeError> {
        let segments: Vec<&str> = key.split('.').collect();
        let [namespace, stage, _pool] = segments.as_slice() else {
            return Err(EnvelopeError::MalformedRoutingKey {
                key: key.to_string(),
                reason: "expected three segments".to_string(),
            });
        };
        if *namespace != self.namespace {
            return Err(EnvelopeError::MalformedRoutingKey {
                key: key.to_string(),
                reason: "namespace mismatch".to_string(),
            });
        }
        stage.parse::<Stage>().map_err(|_| EnvelopeError::UnknownStage {
            key: key.to_string(),
            stage: (*stage).to_string(),
        })
    }
}

// ============================================================================
// SECTION: Dataset References
// ============================================================================

/// Dataset identifier as carried on the wire.
///
/// # Invariants
/// - Holds a JSON string or number, exactly as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct DatasetRef(Value);

impl DatasetRef {
    /// Wraps a JSON value when it is a string or number.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        Self::try_from(value.clone()).ok()
    }

    /// Returns the raw JSON value.
    #[must_use]
    pub const fn as_value(&self) -> &Value {
        &self.0
    }

    /// Maps the reference to a revision store key.
    ///
    /// Positive integers and strings holding one map; anything else has no
    /// store key.
    #[must_use]
    pub fn dataset_id(&self) -> Option<DatasetId> {
        let raw = match &self.0 {
            Value::Number(number) => number.as_u64(),
            Value::String(text) => text.trim().parse::<u64>().ok(),
            _ => None,
        };
        raw.and_then(DatasetId::from_raw)
    }
}

impl TryFrom<Value> for DatasetRef {
    type Error = EnvelopeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(_) | Value::Number(_) => Ok(Self(value)),
            _ => Err(EnvelopeError::MalformedBody(format!(
                "{DATASET_ID_FIELD} must be a string or number"
            ))),
        }
    }
}

impl From<DatasetRef> for Value {
    fn from(value: DatasetRef) -> Self {
        value.0
    }
}

impl From<DatasetId> for DatasetRef {
    fn from(value: DatasetId) -> Self {
        Self(Value::from(value.get()))
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(text) => f.write_str(text),
            other => fmt::Display::fmt(other, f),
        }
    }
}

// ============================================================================
// SECTION: Wire Bodies
// ============================================================================

/// Synthetic invalidation notice published by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationNotice {
    /// Dataset whose stage became stale, echoed from the completion.
    pub dataset_id: DatasetRef,
    /// Stage that became stale.
    pub stage: Stage,
    /// Always true; distinguishes notices from requests on worker queues.
    pub invalidated: bool,
}

impl InvalidationNotice {
    /// Creates an invalidation notice for `stage`.
    #[must_use]
    pub fn new(dataset_id: DatasetRef, stage: Stage) -> Self {
        Self {
            dataset_id,
            stage,
            invalidated: true,
        }
    }
}

/// Completion signal body emitted by worker pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionNotice {
    /// Dataset the stage ran for.
    pub dataset_id: DatasetRef,
    /// Sequence number of the appended revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

// ============================================================================
// SECTION: Message Envelope
// ============================================================================

/// Decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// Dataset the message concerns.
    pub dataset_id: DatasetRef,
    /// Stage the message concerns.
    pub stage: Stage,
    /// Message kind.
    pub kind: MessageKind,
    /// Full JSON body as received.
    pub payload: Value,
}

impl MessageEnvelope {
    /// Decodes a message body for a known stage.
    ///
    /// Bodies shaped like an [`InvalidationNotice`] for `stage` (the
    /// `invalidated: true` flag together with a matching `stage` field)
    /// decode as [`MessageKind::Invalidation`] regardless of `default_kind`.
    /// A request payload that only carries the flag stays a request.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::MalformedBody`] when the body is not a JSON
    /// object with a string or number `datasetId`.
    pub fn decode(
        stage: Stage,
        default_kind: MessageKind,
        body: &[u8],
    ) -> Result<Self, EnvelopeError> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|err| EnvelopeError::MalformedBody(err.to_string()))?;
        let object = payload
            .as_object()
            .ok_or_else(|| EnvelopeError::MalformedBody("body is not a json object".to_string()))?;
        let dataset_id = dataset_ref_field(object)?;
        let kind =
            if is_invalidation(object, stage) { MessageKind::Invalidation } else { default_kind };
        Ok(Self {
            dataset_id,
            stage,
            kind,
            payload,
        })
    }
}

/// Reads the opaque dataset reference from a JSON body.
///
/// # Errors
///
/// Returns [`EnvelopeError::MalformedBody`] when the field is missing or is
/// not a string or number.
pub fn dataset_ref_from_body(body: &[u8]) -> Result<DatasetRef, EnvelopeError> {
    let payload: Value = serde_json::from_slice(body)
        .map_err(|err| EnvelopeError::MalformedBody(err.to_string()))?;
    let object = payload
        .as_object()
        .ok_or_else(|| EnvelopeError::MalformedBody("body is not a json object".to_string()))?;
    dataset_ref_field(object)
}

/// Extracts the dataset reference field from a JSON object.
fn dataset_ref_field(object: &Map<String, Value>) -> Result<DatasetRef, EnvelopeError> {
    object.get(DATASET_ID_FIELD).and_then(DatasetRef::from_value).ok_or_else(|| {
        EnvelopeError::MalformedBody(format!("{DATASET_ID_FIELD} must be a string or number"))
    })
}

/// Returns true when the body is an invalidation notice for `stage`.
fn is_invalidation(object: &Map<String, Value>, stage: Stage) -> bool {
    matches!(object.get(INVALIDATED_FIELD), Some(Value::Bool(true)))
        && matches!(object.get(STAGE_FIELD), Some(Value::String(name)) if name == stage.as_str())
}
