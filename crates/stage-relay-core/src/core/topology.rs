// crates/stage-relay-core/src/core/topology.rs
// ============================================================================
// Module: Stage Relay Topology
// Description: Validated pairing of dependency graph and routing table.
// Purpose: Provide the immutable configuration injected into dispatchers.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! [`Topology`] binds a [`DependencyGraph`] to a [`RoutingTable`] and checks the
//! cross-table invariant: every stage the graph mentions must have a worker
//! pool, otherwise a cascade could target a stage nobody recomputes.
//! A topology is built once at startup and shared behind an `Arc`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

use crate::core::graph::DependencyGraph;
use crate::core::graph::GraphError;
use crate::core::routing::RoutingError;
use crate::core::routing::RoutingTable;
use crate::core::stage::Stage;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Topology configuration errors. All are fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    /// Dependency graph is invalid.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// Routing table is invalid.
    #[error(transparent)]
    Routing(#[from] RoutingError),
    /// A stage referenced by the graph has no routing entry.
    #[error("stage {0} appears in the dependency graph but has no worker pool")]
    UnroutableGraphStage(Stage),
}

// ============================================================================
// SECTION: Topology
// ============================================================================

/// Immutable, validated pipeline topology.
///
/// # Invariants
/// - The graph is acyclic.
/// - Every stage referenced by the graph is routable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Stage dependency graph.
    graph: DependencyGraph,
    /// Stage routing table.
    routing: RoutingTable,
}

impl Topology {
    /// Validates and builds a topology.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError`] when the graph is cyclic or references a stage
    /// without a routing entry.
    pub fn new(graph: DependencyGraph, routing: RoutingTable) -> Result<Self, TopologyError> {
        graph.validate()?;
        if let Some(stage) =
            graph.referenced_stages().into_iter().find(|stage| !routing.is_routable(*stage))
        {
            return Err(TopologyError::UnroutableGraphStage(stage));
        }
        Ok(Self {
            graph,
            routing,
        })
    }

    /// Returns the dependency graph.
    #[must_use]
    pub const fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Returns the routing table.
    #[must_use]
    pub const fn routing(&self) -> &RoutingTable {
        &self.routing
    }
}
