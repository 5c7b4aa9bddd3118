// crates/stage-relay-core/src/core/routing.rs
// ============================================================================
// Module: Stage Relay Routing Table
// Description: Static stage-to-worker-pool table.
// Purpose: Resolve the single worker pool that owns each stage.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! [`RoutingTable`] maps each routable stage to exactly one worker pool. The
//! table is built from pool declarations (pool → stages) and rejects a stage
//! claimed by two pools. Lookups for stages without an entry fail with
//! [`RoutingError::UnroutableStage`] rather than silently matching nothing.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use thiserror::Error;

use crate::core::identifiers::WorkerPoolId;
use crate::core::stage::Stage;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Routing table errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// The stage has no routing entry.
    #[error("unroutable stage: {0}")]
    UnroutableStage(Stage),
    /// A stage was declared under two different pools.
    #[error("stage {stage} is routed to both {first} and {second}")]
    DuplicateRoute {
        /// Stage declared twice.
        stage: Stage,
        /// Pool from the first declaration.
        first: WorkerPoolId,
        /// Pool from the conflicting declaration.
        second: WorkerPoolId,
    },
    /// A pool identifier is not usable as a routing key segment.
    #[error("invalid worker pool id '{0}': must be non-empty and contain no '.', '*', '#', or whitespace")]
    InvalidPoolId(String),
}

// ============================================================================
// SECTION: Routing Table
// ============================================================================

/// Immutable stage-to-worker-pool table.
///
/// # Invariants
/// - Each stage maps to at most one pool.
/// - Every pool identifier is a valid topic segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    /// Owning pool keyed by stage.
    routes: BTreeMap<Stage, WorkerPoolId>,
}

impl RoutingTable {
    /// Builds a routing table from `(pool, stages)` declarations.
    ///
    /// Declaring the same stage twice under the same pool is harmless.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::DuplicateRoute`] when a stage is claimed by two
    /// pools and [`RoutingError::InvalidPoolId`] for unusable pool names.
    pub fn new<I, S>(pools: I) -> Result<Self, RoutingError>
    where
        I: IntoIterator<Item = (WorkerPoolId, S)>,
        S: IntoIterator<Item = Stage>,
    {
        let mut routes: BTreeMap<Stage, WorkerPoolId> = BTreeMap::new();
        for (pool, stages) in pools {
            if !is_topic_segment(pool.as_str()) {
                return Err(RoutingError::InvalidPoolId(pool.as_str().to_string()));
            }
            for stage in stages {
                match routes.get(&stage) {
                    Some(existing) if *existing != pool => {
                        return Err(RoutingError::DuplicateRoute {
                            stage,
                            first: existing.clone(),
                            second: pool,
                        });
                    }
                    Some(_) => {}
                    None => {
                        routes.insert(stage, pool.clone());
                    }
                }
            }
        }
        Ok(Self {
            routes,
        })
    }

    /// Returns the worker pool owning `stage`.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::UnroutableStage`] when no pool owns the stage.
    pub fn route(&self, stage: Stage) -> Result<&WorkerPoolId, RoutingError> {
        self.routes.get(&stage).ok_or(RoutingError::UnroutableStage(stage))
    }

    /// Returns true when `stage` has a routing entry.
    #[must_use]
    pub fn is_routable(&self, stage: Stage) -> bool {
        self.routes.contains_key(&stage)
    }

    /// Iterates over `(stage, pool)` entries in stage order.
    pub fn entries(&self) -> impl Iterator<Item = (Stage, &WorkerPoolId)> {
        self.routes.iter().map(|(stage, pool)| (*stage, pool))
    }

    /// Returns the stages owned by `pool`, in stage order.
    #[must_use]
    pub fn stages_for(&self, pool: &WorkerPoolId) -> Vec<Stage> {
        self.routes
            .iter()
            .filter(|(_, owner)| *owner == pool)
            .map(|(stage, _)| *stage)
            .collect()
    }
}

/// Returns true when `value` can be used as a single topic routing-key word.
#[must_use]
pub fn is_topic_segment(value: &str) -> bool {
    !value.is_empty()
        && !value.chars().any(|ch| ch == '.' || ch == '*' || ch == '#' || ch.is_whitespace())
}
