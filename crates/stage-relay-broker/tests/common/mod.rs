// crates/stage-relay-broker/tests/common/mod.rs
// ============================================================================
// Module: Broker Test Helpers
// Description: Shared fixtures for broker integration tests.
// Purpose: Build configurations, scripted workers, and polling helpers.
// Dependencies: stage-relay-broker, stage-relay-config, stage-relay-core, tokio
// ============================================================================

//! ## Overview
//! Fixtures shared by the broker integration tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use stage_relay_broker::StageRequest;
use stage_relay_broker::StageWorker;
use stage_relay_broker::WorkerError;
use stage_relay_broker::upstream_of;
use stage_relay_config::StageRelayConfig;
use stage_relay_core::Artifact;
use stage_relay_core::DatasetId;
use stage_relay_core::DependencyGraph;
use stage_relay_core::RoutingKeyScheme;
use stage_relay_core::Stage;

/// Dispatcher inbound queue of the default configuration.
pub const DISPATCH_QUEUE: &str = "preprocessing_task_queue";
/// Queue bound by the python worker pool.
pub const PYTHON_QUEUE: &str = "preprocessing_python_queue";
/// Queue bound by the panel worker pool.
pub const PANEL_QUEUE: &str = "preprocessing_panel_queue";
/// Queue bound by the fortran worker pool.
pub const FORTRAN_QUEUE: &str = "preprocessing_fortran_queue";

/// Default configuration with millisecond reconnect delays.
pub fn fast_config() -> StageRelayConfig {
    let mut config = StageRelayConfig::default();
    config.broker.reconnect.initial_delay_ms = 1;
    config.broker.reconnect.max_delay_ms = 4;
    config
}

/// Routing key scheme of the default configuration.
pub fn scheme() -> RoutingKeyScheme {
    fast_config().routing_key_scheme().unwrap()
}

/// Dependency graph of the default configuration.
pub fn default_graph() -> DependencyGraph {
    fast_config().build_topology().unwrap().graph().clone()
}

/// Shorthand for a dataset id.
pub fn dataset(raw: u64) -> DatasetId {
    DatasetId::from_raw(raw).unwrap()
}

/// Polls `condition` until it holds, failing after five seconds.
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Worker whose inputs follow the invalidation graph and whose artifacts
/// name the input revisions they were computed from.
pub struct ScriptedWorker {
    graph: DependencyGraph,
    failing: Option<Stage>,
    calls: Mutex<Vec<(DatasetId, Stage)>>,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self {
            graph: default_graph(),
            failing: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_on(stage: Stage) -> Self {
        Self {
            failing: Some(stage),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> Vec<(DatasetId, Stage)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageWorker for ScriptedWorker {
    fn inputs(&self, stage: Stage) -> Vec<Stage> {
        upstream_of(&self.graph, stage)
    }

    async fn compute(&self, request: &StageRequest) -> Result<Artifact, WorkerError> {
        self.calls.lock().unwrap().push((request.dataset_id, request.stage));
        if self.failing == Some(request.stage) {
            return Err(WorkerError::Compute {
                stage: request.stage,
                reason: "scripted failure".to_string(),
            });
        }
        let inputs: Vec<String> = request
            .inputs
            .iter()
            .map(|(stage, revision)| format!("{stage}@{}", revision.sequence))
            .collect();
        Ok(Artifact::from(format!("{}<-[{}]", request.stage, inputs.join(",")).as_str()))
    }
}
