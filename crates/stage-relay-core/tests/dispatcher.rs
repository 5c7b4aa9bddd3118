// crates/stage-relay-core/tests/dispatcher.rs
// ============================================================================
// Module: Dispatcher Tests
// Description: End-to-end dispatch cycles against a recording bus.
// Purpose: Validate routing, cascading, diagnostics, and ack ordering.
// Dependencies: stage-relay-core, tokio
// ============================================================================

//! ## Overview
//! Drives the dispatcher state machine with a bus that records publishes and
//! acknowledgements in order, and can be told to fail a publish.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;
use stage_relay_core::Artifact;
use stage_relay_core::BusError;
use stage_relay_core::DatasetId;
use stage_relay_core::Delivery;
use stage_relay_core::DeliveryTag;
use stage_relay_core::DependencyGraph;
use stage_relay_core::DiagnosticKind;
use stage_relay_core::DispatchError;
use stage_relay_core::DispatchState;
use stage_relay_core::Dispatcher;
use stage_relay_core::InMemoryRevisionStore;
use stage_relay_core::InboundKind;
use stage_relay_core::MessageBus;
use stage_relay_core::MessageKind;
use stage_relay_core::OutboundMessage;
use stage_relay_core::RevisionStore;
use stage_relay_core::RoutingKeyScheme;
use stage_relay_core::RoutingTable;
use stage_relay_core::SharedRevisionStore;
use stage_relay_core::Stage;
use stage_relay_core::Topology;
use stage_relay_core::WorkerPoolId;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

/// Bus event recorded in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BusEvent {
    Publish(String),
    Ack(u64),
}

/// Bus that records calls and optionally fails the Nth publish.
#[derive(Default)]
struct RecordingBus {
    events: Mutex<Vec<BusEvent>>,
    published: Mutex<Vec<OutboundMessage>>,
    fail_publish_at: Mutex<Option<usize>>,
}

impl RecordingBus {
    fn failing_at(index: usize) -> Self {
        let bus = Self::default();
        *bus.fail_publish_at.lock().unwrap() = Some(index);
        bus
    }

    fn heal(&self) {
        *self.fail_publish_at.lock().unwrap() = None;
    }

    fn events(&self) -> Vec<BusEvent> {
        self.events.lock().unwrap().clone()
    }

    fn published(&self) -> Vec<OutboundMessage> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), BusError> {
        let mut published = self.published.lock().unwrap();
        if *self.fail_publish_at.lock().unwrap() == Some(published.len()) {
            return Err(BusError::Publish("injected failure".to_string()));
        }
        published.push(message.clone());
        self.events.lock().unwrap().push(BusEvent::Publish(message.routing_key.clone()));
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BusError> {
        self.events.lock().unwrap().push(BusEvent::Ack(tag.0));
        Ok(())
    }
}

/// Builds the preprocessing topology.
fn preprocessing_topology() -> Arc<Topology> {
    let graph = DependencyGraph::new([
        (Stage::Regrid, vec![Stage::InternalOceans, Stage::Routing]),
        (Stage::InternalOceans, vec![Stage::Routing]),
        (
            Stage::Routing,
            vec![
                Stage::Pft,
                Stage::PassageProblems,
                Stage::Subbasins,
                Stage::Heatflow,
                Stage::Ahmcoef,
            ],
        ),
        (Stage::PassageProblems, vec![Stage::Subbasins, Stage::Heatflow, Stage::Ahmcoef]),
    ])
    .unwrap();
    let routing = RoutingTable::new([
        (
            WorkerPoolId::new("python"),
            vec![Stage::Regrid, Stage::Routing, Stage::Heatflow, Stage::Ahmcoef, Stage::Pft],
        ),
        (WorkerPoolId::new("fortran"), vec![Stage::Mosaix]),
        (
            WorkerPoolId::new("panel"),
            vec![Stage::InternalOceans, Stage::PassageProblems, Stage::Subbasins],
        ),
    ])
    .unwrap();
    Arc::new(Topology::new(graph, routing).unwrap())
}

/// Builds a dispatcher over the preprocessing topology.
fn dispatcher() -> Dispatcher {
    let scheme = RoutingKeyScheme::new("preprocessing", "done").unwrap();
    Dispatcher::new(scheme, preprocessing_topology())
}

/// Builds a delivery.
fn delivery(tag: u64, key: &str, body: &Value) -> Delivery {
    Delivery {
        tag: DeliveryTag(tag),
        routing_key: key.to_string(),
        body: serde_json::to_vec(body).unwrap(),
        redelivered: false,
    }
}

/// Decodes an outbound body as JSON.
fn body_json(message: &OutboundMessage) -> Value {
    serde_json::from_slice(&message.body).unwrap()
}

// ============================================================================
// SECTION: Routing Path
// ============================================================================

/// Verifies a task request is republished unchanged to the owning pool.
#[tokio::test]
async fn task_request_routes_to_owning_pool() {
    let bus = RecordingBus::default();
    let mut dispatcher = dispatcher();
    let inbound = delivery(1, "preprocessing.heatflow", &json!({"datasetId": 42}));
    let raw_body = inbound.body.clone();

    let outcome = dispatcher.handle(&bus, inbound).await.unwrap();

    assert_eq!(outcome.inbound, Some(InboundKind::TaskRequest(Stage::Heatflow)));
    assert!(outcome.acknowledged);
    assert!(outcome.diagnostics.is_empty());
    assert_eq!(outcome.published.len(), 1);
    let message = &outcome.published[0];
    assert_eq!(message.routing_key, "preprocessing.heatflow.python");
    assert_eq!(message.pool, WorkerPoolId::new("python"));
    assert_eq!(message.kind, MessageKind::Request);
    assert!(message.persistent);
    assert_eq!(message.body, raw_body);
}

/// Verifies request routing ignores the body entirely.
#[tokio::test]
async fn task_request_routing_ignores_body() {
    let bus = RecordingBus::default();
    let mut dispatcher = dispatcher();
    let inbound = Delivery {
        tag: DeliveryTag(9),
        routing_key: "preprocessing.subbasins".to_string(),
        body: b"not json at all".to_vec(),
        redelivered: false,
    };

    let outcome = dispatcher.handle(&bus, inbound).await.unwrap();

    assert_eq!(outcome.published.len(), 1);
    assert_eq!(outcome.published[0].routing_key, "preprocessing.subbasins.panel");
    assert_eq!(outcome.published[0].body, b"not json at all".to_vec());
}

/// Verifies an unroutable stage publishes nothing, reports once, and acks.
#[tokio::test]
async fn unroutable_stage_is_acknowledged_with_diagnostic() {
    let bus = RecordingBus::default();
    let mut dispatcher = dispatcher();

    let outcome = dispatcher
        .handle(&bus, delivery(3, "preprocessing.bathy", &json!({"datasetId": 42})))
        .await
        .unwrap();

    assert!(outcome.published.is_empty());
    assert_eq!(outcome.diagnostics.len(), 1);
    assert_eq!(outcome.diagnostics[0].kind, DiagnosticKind::UnroutableStage);
    assert!(outcome.acknowledged);
    assert_eq!(bus.events(), vec![BusEvent::Ack(3)]);
}

// ============================================================================
// SECTION: Cascading Path
// ============================================================================

/// Verifies a routing completion fans out five invalidations.
#[tokio::test]
async fn routing_completion_invalidates_five_stages() {
    let bus = RecordingBus::default();
    let mut dispatcher = dispatcher();

    let outcome = dispatcher
        .handle(
            &bus,
            delivery(4, "preprocessing.routing.done", &json!({"datasetId": 42, "sequence": 3})),
        )
        .await
        .unwrap();

    let keys: Vec<&str> =
        outcome.published.iter().map(|message| message.routing_key.as_str()).collect();
    assert_eq!(
        keys,
        vec![
            "preprocessing.pft.python",
            "preprocessing.passage_problems.panel",
            "preprocessing.subbasins.panel",
            "preprocessing.heatflow.python",
            "preprocessing.ahmcoef.python",
        ]
    );
    for message in &outcome.published {
        assert_eq!(message.kind, MessageKind::Invalidation);
        assert!(message.persistent);
        assert_eq!(
            body_json(message),
            json!({"datasetId": 42, "stage": message.stage.as_str(), "invalidated": true})
        );
    }
}

/// Verifies a regrid completion yields exactly two invalidations.
#[tokio::test]
async fn regrid_completion_invalidates_direct_dependents_only() {
    let bus = RecordingBus::default();
    let mut dispatcher = dispatcher();

    let outcome = dispatcher
        .handle(&bus, delivery(5, "preprocessing.regrid.done", &json!({"datasetId": 7})))
        .await
        .unwrap();

    let stages: Vec<Stage> = outcome.published.iter().map(|message| message.stage).collect();
    assert_eq!(stages, vec![Stage::InternalOceans, Stage::Routing]);
}

/// Verifies a leaf completion publishes nothing but is acknowledged.
#[tokio::test]
async fn leaf_completion_is_acknowledged_without_publishes() {
    let bus = RecordingBus::default();
    let mut dispatcher = dispatcher();

    let outcome = dispatcher
        .handle(&bus, delivery(6, "preprocessing.heatflow.done", &json!({"datasetId": 7})))
        .await
        .unwrap();

    assert!(outcome.published.is_empty());
    assert!(outcome.diagnostics.is_empty());
    assert_eq!(bus.events(), vec![BusEvent::Ack(6)]);
}

/// Verifies the upstream payload is never forwarded with invalidations.
#[tokio::test]
async fn invalidations_drop_upstream_payload() {
    let bus = RecordingBus::default();
    let mut dispatcher = dispatcher();

    let outcome = dispatcher
        .handle(
            &bus,
            delivery(
                7,
                "preprocessing.passage_problems.done",
                &json!({"datasetId": "12", "grid": [1, 2, 3]}),
            ),
        )
        .await
        .unwrap();

    assert_eq!(outcome.published.len(), 3);
    for message in &outcome.published {
        let body = body_json(message);
        assert!(body.get("grid").is_none());
        assert_eq!(body["datasetId"], json!("12"));
    }
}

/// Verifies a completion without a dataset id is rejected with a diagnostic.
#[tokio::test]
async fn completion_without_dataset_id_is_rejected() {
    let bus = RecordingBus::default();
    let mut dispatcher = dispatcher();

    let outcome = dispatcher
        .handle(&bus, delivery(8, "preprocessing.routing.done", &json!({"invalidated": "yes"})))
        .await
        .unwrap();

    assert!(outcome.published.is_empty());
    assert_eq!(outcome.diagnostics[0].kind, DiagnosticKind::MalformedBody);
    assert!(outcome.acknowledged);
}

/// Verifies opaque dataset ids cascade and are echoed unchanged.
#[tokio::test]
async fn opaque_dataset_ids_cascade_unchanged() {
    for (tag, dataset_id) in [(20, json!("ds-42")), (21, json!(0)), (22, json!(42.0))] {
        let bus = RecordingBus::default();
        let mut dispatcher = dispatcher();

        let body = json!({"datasetId": dataset_id.clone()});
        let outcome = dispatcher
            .handle(&bus, delivery(tag, "preprocessing.routing.done", &body))
            .await
            .unwrap();

        assert!(outcome.diagnostics.is_empty());
        assert_eq!(outcome.published.len(), 5);
        for message in &outcome.published {
            let body = body_json(message);
            assert_eq!(body["datasetId"], dataset_id);
            assert_eq!(body["stage"], json!(message.stage.as_str()));
            assert_eq!(body["invalidated"], json!(true));
        }
        assert!(outcome.acknowledged);
    }
}

/// Verifies a dataset id without a store key still cascades with a ledger.
#[tokio::test]
async fn ledger_skips_ids_without_store_key() {
    let store = InMemoryRevisionStore::new();
    let dataset = DatasetId::from_raw(42).unwrap();
    store.append(dataset, Stage::Heatflow, Artifact::from("q")).unwrap();
    let bus = RecordingBus::default();
    let mut dispatcher = dispatcher().with_ledger(SharedRevisionStore::from_store(store.clone()));

    let outcome = dispatcher
        .handle(&bus, delivery(23, "preprocessing.routing.done", &json!({"datasetId": "ds-42"})))
        .await
        .unwrap();

    assert_eq!(outcome.published.len(), 5);
    assert!(outcome.acknowledged);
    assert!(!store.latest(dataset, Stage::Heatflow).unwrap().stale);
}

/// Verifies the ledger marks downstream revisions stale before publishing.
#[tokio::test]
async fn ledger_marks_downstream_stale() {
    let store = InMemoryRevisionStore::new();
    let dataset = DatasetId::from_raw(42).unwrap();
    store.append(dataset, Stage::Heatflow, Artifact::from("q")).unwrap();
    store.append(dataset, Stage::Routing, Artifact::from("r")).unwrap();
    let bus = RecordingBus::default();
    let mut dispatcher = dispatcher().with_ledger(SharedRevisionStore::from_store(store.clone()));

    dispatcher
        .handle(&bus, delivery(10, "preprocessing.routing.done", &json!({"datasetId": 42})))
        .await
        .unwrap();

    assert!(store.latest(dataset, Stage::Heatflow).unwrap().stale);
    assert!(!store.latest(dataset, Stage::Routing).unwrap().stale);
    let fresh = store.append(dataset, Stage::Heatflow, Artifact::from("q2")).unwrap();
    assert!(!fresh.stale);
    assert!(!store.latest(dataset, Stage::Heatflow).unwrap().stale);
}

// ============================================================================
// SECTION: Rejections
// ============================================================================

/// Verifies malformed keys are acknowledged and never published.
#[tokio::test]
async fn malformed_keys_are_acknowledged_with_diagnostics() {
    let cases = [
        ("other.heatflow", DiagnosticKind::MalformedRoutingKey),
        ("preprocessing", DiagnosticKind::MalformedRoutingKey),
        ("preprocessing..done", DiagnosticKind::MalformedRoutingKey),
        ("preprocessing.heatflow.finished", DiagnosticKind::MalformedRoutingKey),
        ("preprocessing.heatflow.done.extra", DiagnosticKind::MalformedRoutingKey),
        ("preprocessing.ahmcoeaf", DiagnosticKind::UnknownStage),
    ];
    for (index, (key, kind)) in cases.into_iter().enumerate() {
        let bus = RecordingBus::default();
        let mut dispatcher = dispatcher();
        let tag = u64::try_from(index).unwrap();
        let outcome =
            dispatcher.handle(&bus, delivery(tag, key, &json!({"datasetId": 1}))).await.unwrap();
        assert!(outcome.inbound.is_none(), "{key}");
        assert!(outcome.published.is_empty(), "{key}");
        assert_eq!(outcome.diagnostics[0].kind, kind, "{key}");
        assert_eq!(bus.events(), vec![BusEvent::Ack(tag)], "{key}");
    }
}

// ============================================================================
// SECTION: Acknowledgement Ordering
// ============================================================================

/// Verifies the ack follows every publish.
#[tokio::test]
async fn ack_follows_all_publishes() {
    let bus = RecordingBus::default();
    let mut dispatcher = dispatcher();

    dispatcher
        .handle(&bus, delivery(11, "preprocessing.regrid.done", &json!({"datasetId": 1})))
        .await
        .unwrap();

    assert_eq!(
        bus.events(),
        vec![
            BusEvent::Publish("preprocessing.internal_oceans.panel".to_string()),
            BusEvent::Publish("preprocessing.routing.python".to_string()),
            BusEvent::Ack(11),
        ]
    );
}

/// Verifies a publish failure leaves the delivery unacknowledged, and a
/// redelivery completes the cascade.
#[tokio::test]
async fn publish_failure_skips_ack_and_redelivery_succeeds() {
    let bus = RecordingBus::failing_at(1);
    let mut dispatcher = dispatcher();
    let inbound = delivery(12, "preprocessing.regrid.done", &json!({"datasetId": 1}));

    let err = dispatcher.handle(&bus, inbound.clone()).await.unwrap_err();
    assert!(matches!(err, DispatchError::Publish { .. }));
    assert!(!bus.events().iter().any(|event| matches!(event, BusEvent::Ack(_))));
    assert_eq!(dispatcher.state(), DispatchState::Idle);

    bus.heal();
    let redelivery = Delivery {
        redelivered: true,
        ..inbound
    };
    let outcome = dispatcher.handle(&bus, redelivery).await.unwrap();
    assert!(outcome.acknowledged);
    assert_eq!(outcome.published.len(), 2);
    // internal_oceans went out twice: once per attempt.
    assert_eq!(bus.published().len(), 3);
}

/// Verifies duplicate deliveries are processed independently.
#[tokio::test]
async fn duplicate_delivery_is_tolerated() {
    let bus = RecordingBus::default();
    let mut dispatcher = dispatcher();
    let inbound = delivery(13, "preprocessing.routing.done", &json!({"datasetId": 5}));

    let first = dispatcher.handle(&bus, inbound.clone()).await.unwrap();
    let second = dispatcher.handle(&bus, inbound).await.unwrap();

    assert_eq!(first.published, second.published);
    assert_eq!(bus.published().len(), 10);
}

/// Verifies the recorded transitions for each path.
#[tokio::test]
async fn transitions_follow_state_machine() {
    let bus = RecordingBus::default();
    let mut dispatcher = dispatcher();

    dispatcher
        .handle(&bus, delivery(14, "preprocessing.heatflow", &json!({"datasetId": 1})))
        .await
        .unwrap();
    assert_eq!(
        dispatcher.last_cycle(),
        &[
            DispatchState::Idle,
            DispatchState::Classifying,
            DispatchState::Routing,
            DispatchState::Publishing,
            DispatchState::Acknowledging,
            DispatchState::Idle,
        ]
    );

    dispatcher
        .handle(&bus, delivery(15, "preprocessing.routing.done", &json!({"datasetId": 1})))
        .await
        .unwrap();
    assert_eq!(
        dispatcher.last_cycle(),
        &[
            DispatchState::Idle,
            DispatchState::Classifying,
            DispatchState::Cascading,
            DispatchState::Publishing,
            DispatchState::Acknowledging,
            DispatchState::Idle,
        ]
    );

    dispatcher.handle(&bus, delivery(16, "nope", &json!({}))).await.unwrap();
    assert_eq!(
        dispatcher.last_cycle(),
        &[
            DispatchState::Idle,
            DispatchState::Classifying,
            DispatchState::Acknowledging,
            DispatchState::Idle,
        ]
    );
    assert_eq!(dispatcher.state(), DispatchState::Idle);
}
