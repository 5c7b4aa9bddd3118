// crates/stage-relay-broker/tests/memory_exchange.rs
// ============================================================================
// Module: Memory Exchange Tests
// Description: Delivery semantics of the in-memory topic exchange.
// Purpose: Validate fan-out, prefetch, acknowledgement, and redelivery.
// Dependencies: stage-relay-broker, stage-relay-core, tokio
// ============================================================================

//! ## Overview
//! Exercises [`stage_relay_broker::MemoryExchange`] through its connector
//! and session surfaces.

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

use std::time::Duration;

use stage_relay_broker::BusConnector;
use stage_relay_broker::BusSession;
use stage_relay_broker::MemoryConnector;
use stage_relay_broker::MemoryExchange;
use stage_relay_broker::QueueBinding;
use stage_relay_core::BusError;
use stage_relay_core::DeliveryTag;
use stage_relay_core::MessageBus;
use stage_relay_core::MessageKind;
use stage_relay_core::OutboundMessage;
use stage_relay_core::RoutingKeyScheme;
use stage_relay_core::Stage;
use stage_relay_core::WorkerPoolId;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

fn scheme() -> RoutingKeyScheme {
    RoutingKeyScheme::new("preprocessing", "done").unwrap()
}

fn dispatcher_binding() -> QueueBinding {
    QueueBinding::dispatcher(&scheme(), "preprocessing", "preprocessing_task_queue")
}

fn python_binding() -> QueueBinding {
    QueueBinding::worker(&scheme(), "preprocessing", &WorkerPoolId::new("python"))
}

fn outbound(routing_key: &str) -> OutboundMessage {
    OutboundMessage {
        routing_key: routing_key.to_string(),
        body: br#"{"datasetId":42}"#.to_vec(),
        stage: Stage::Heatflow,
        pool: WorkerPoolId::new("python"),
        kind: MessageKind::Request,
        persistent: true,
    }
}

// ============================================================================
// SECTION: Routing
// ============================================================================

/// Tests that worker bindings are named after the namespace and pool.
#[test]
fn worker_binding_names_queue_after_pool() {
    let binding = python_binding();
    assert_eq!(binding.queue, "preprocessing_python_queue");
    assert_eq!(binding.patterns, vec!["preprocessing.*.python".to_string()]);
    assert_eq!(binding.prefetch, 1);
}

/// Tests that a message reaches every queue with a matching binding.
#[test]
fn inject_fans_out_to_matching_queues() {
    let exchange = MemoryExchange::new();
    exchange.declare(&dispatcher_binding()).unwrap();
    exchange.declare(&python_binding()).unwrap();

    assert_eq!(exchange.inject("preprocessing.heatflow", "{}").unwrap(), 1);
    assert_eq!(exchange.inject("preprocessing.heatflow.python", "{}").unwrap(), 1);
    assert_eq!(exchange.inject("preprocessing.heatflow.done", "{}").unwrap(), 1);
    assert_eq!(exchange.inject("other.heatflow", "{}").unwrap(), 0);

    assert_eq!(exchange.ready("preprocessing_task_queue").unwrap().len(), 2);
    assert_eq!(exchange.ready("preprocessing_python_queue").unwrap().len(), 1);
}

/// Tests that session publishes are recorded and routed.
#[tokio::test]
async fn session_publish_routes_and_records() {
    let exchange = MemoryExchange::new();
    exchange.declare(&python_binding()).unwrap();
    let session = MemoryConnector::new(exchange.clone()).connect(&dispatcher_binding()).await.unwrap();

    session.publish(&outbound("preprocessing.heatflow.python")).await.unwrap();

    let queued = exchange.drain("preprocessing_python_queue").unwrap();
    assert_eq!(queued.len(), 1);
    assert!(queued[0].persistent);
    assert!(!queued[0].redelivered);
    assert_eq!(exchange.published().unwrap().len(), 1);
}

// ============================================================================
// SECTION: Acknowledgement
// ============================================================================

/// Tests that prefetch 1 withholds the next message until the ack.
#[tokio::test]
async fn prefetch_one_withholds_next_until_ack() {
    let exchange = MemoryExchange::new();
    let mut session =
        MemoryConnector::new(exchange.clone()).connect(&dispatcher_binding()).await.unwrap();
    exchange.inject("preprocessing.regrid", "{\"datasetId\":1}").unwrap();
    exchange.inject("preprocessing.routing", "{\"datasetId\":1}").unwrap();

    let first = session.next_delivery().await.unwrap();
    assert_eq!(first.routing_key, "preprocessing.regrid");
    let blocked = tokio::time::timeout(Duration::from_millis(20), session.next_delivery()).await;
    assert!(blocked.is_err(), "second delivery arrived before the ack");

    session.ack(first.tag).await.unwrap();
    let second = session.next_delivery().await.unwrap();
    assert_eq!(second.routing_key, "preprocessing.routing");
}

/// Tests that a waiting session wakes when a message arrives.
#[tokio::test]
async fn idle_session_wakes_on_publish() {
    let exchange = MemoryExchange::new();
    let mut session =
        MemoryConnector::new(exchange.clone()).connect(&dispatcher_binding()).await.unwrap();
    let injector = exchange.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        injector.inject("preprocessing.bathy", "{}").unwrap();
    });

    let delivery =
        tokio::time::timeout(Duration::from_secs(5), session.next_delivery()).await.unwrap().unwrap();
    assert_eq!(delivery.routing_key, "preprocessing.bathy");
    handle.await.unwrap();
}

/// Tests that acking an unknown tag fails.
#[tokio::test]
async fn ack_of_unknown_tag_fails() {
    let exchange = MemoryExchange::new();
    let session = MemoryConnector::new(exchange).connect(&dispatcher_binding()).await.unwrap();
    let err = session.ack(DeliveryTag(99)).await.unwrap_err();
    assert!(matches!(err, BusError::Ack(_)));
}

// ============================================================================
// SECTION: Redelivery
// ============================================================================

/// Tests that dropping a session requeues its unacked delivery.
#[tokio::test]
async fn dropped_session_requeues_as_redelivered() {
    let exchange = MemoryExchange::new();
    let connector = MemoryConnector::new(exchange.clone());
    let mut session = connector.connect(&dispatcher_binding()).await.unwrap();
    exchange.inject("preprocessing.heatflow", "{\"datasetId\":42}").unwrap();
    let first = session.next_delivery().await.unwrap();
    assert!(!first.redelivered);
    assert_eq!(exchange.unacked("preprocessing_task_queue").unwrap(), 1);

    drop(session);
    assert_eq!(exchange.unacked("preprocessing_task_queue").unwrap(), 0);

    let mut session = connector.connect(&dispatcher_binding()).await.unwrap();
    let again = session.next_delivery().await.unwrap();
    assert!(again.redelivered);
    assert_eq!(again.body, first.body);
    assert_ne!(again.tag, first.tag);
}

/// Tests that severing fails open sessions and requeues their deliveries.
#[tokio::test]
async fn sever_fails_sessions_and_requeues() {
    let exchange = MemoryExchange::new();
    let connector = MemoryConnector::new(exchange.clone());
    let mut session = connector.connect(&dispatcher_binding()).await.unwrap();
    exchange.inject("preprocessing.heatflow", "{\"datasetId\":42}").unwrap();
    let delivery = session.next_delivery().await.unwrap();

    assert_eq!(exchange.sever().unwrap(), 1);
    assert!(matches!(session.ack(delivery.tag).await, Err(BusError::Connection(_))));
    assert!(matches!(session.next_delivery().await, Err(BusError::Connection(_))));

    let mut fresh = connector.connect(&dispatcher_binding()).await.unwrap();
    assert!(fresh.next_delivery().await.unwrap().redelivered);
}

// ============================================================================
// SECTION: Fault Injection
// ============================================================================

/// Tests that injected publish faults fail only the requested publishes.
#[tokio::test]
async fn publish_faults_are_consumed_in_order() {
    let exchange = MemoryExchange::new();
    let session = MemoryConnector::new(exchange.clone()).connect(&python_binding()).await.unwrap();
    exchange.fail_next_publishes(1).unwrap();

    let err = session.publish(&outbound("preprocessing.heatflow.python")).await.unwrap_err();
    assert!(matches!(err, BusError::Publish(_)));
    session.publish(&outbound("preprocessing.heatflow.python")).await.unwrap();
    assert_eq!(exchange.ready("preprocessing_python_queue").unwrap().len(), 1);
}

/// Tests that injected connect faults surface as connection errors.
#[tokio::test]
async fn connect_faults_surface_as_connection_errors() {
    let exchange = MemoryExchange::new();
    let connector = MemoryConnector::new(exchange.clone());
    exchange.fail_next_connects(1).unwrap();

    assert!(matches!(
        connector.connect(&dispatcher_binding()).await,
        Err(BusError::Connection(_))
    ));
    assert!(connector.connect(&dispatcher_binding()).await.is_ok());
    assert_eq!(connector.describe(), "memory://");
}
