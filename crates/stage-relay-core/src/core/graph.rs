// crates/stage-relay-core/src/core/graph.rs
// ============================================================================
// Module: Stage Relay Dependency Graph
// Description: Static stage-to-downstream table with eager cycle detection.
// Purpose: Compute single-hop cascading invalidation sets.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! [`DependencyGraph`] maps each stage to the stages that consume its output.
//! A completion for stage `S` invalidates exactly [`DependencyGraph::cascade_from`]
//! of `S`; deeper stages are reached only when those downstream stages rerun
//! and complete in turn.
//! Invariants:
//! - The graph is acyclic; construction fails with the offending cycle path.
//! - Downstream lists keep first-discovery order and contain no duplicates.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;

use thiserror::Error;

use crate::core::stage::Stage;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Dependency graph configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The declared edges contain a cycle.
    #[error("dependency cycle detected: {}", render_path(.path))]
    CycleDetected {
        /// Stages along the cycle; the first and last entries are equal.
        path: Vec<Stage>,
    },
}

/// Renders a stage path as `a -> b -> c`.
fn render_path(path: &[Stage]) -> String {
    path.iter().map(|stage| stage.as_str()).collect::<Vec<_>>().join(" -> ")
}

// ============================================================================
// SECTION: Dependency Graph
// ============================================================================

/// Immutable stage dependency graph.
///
/// # Invariants
/// - Acyclic (validated at construction).
/// - Every downstream list is duplicate-free and in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// Direct downstream stages keyed by upstream stage.
    edges: BTreeMap<Stage, Vec<Stage>>,
}

impl DependencyGraph {
    /// Builds and validates a graph from `(stage, downstream)` declarations.
    ///
    /// Repeated declarations for the same stage are merged in order.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CycleDetected`] when the edges form a cycle.
    pub fn new<I, D>(declarations: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = (Stage, D)>,
        D: IntoIterator<Item = Stage>,
    {
        let mut edges: BTreeMap<Stage, Vec<Stage>> = BTreeMap::new();
        for (stage, downstream) in declarations {
            let entry = edges.entry(stage).or_default();
            for target in downstream {
                if !entry.contains(&target) {
                    entry.push(target);
                }
            }
        }
        let graph = Self {
            edges,
        };
        graph.validate()?;
        Ok(graph)
    }

    /// Returns an empty graph (no stage invalidates another).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Verifies the graph is acyclic.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CycleDetected`] with the first cycle found.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut visited: BTreeSet<Stage> = BTreeSet::new();
        for &root in self.edges.keys() {
            if visited.contains(&root) {
                continue;
            }
            let mut stack: Vec<Stage> = Vec::new();
            self.visit(root, &mut stack, &mut visited)?;
        }
        Ok(())
    }

    /// Depth-first visit tracking the active path for cycle reporting.
    fn visit(
        &self,
        stage: Stage,
        stack: &mut Vec<Stage>,
        visited: &mut BTreeSet<Stage>,
    ) -> Result<(), GraphError> {
        if let Some(position) = stack.iter().position(|active| *active == stage) {
            let mut path = stack[position ..].to_vec();
            path.push(stage);
            return Err(GraphError::CycleDetected {
                path,
            });
        }
        if visited.contains(&stage) {
            return Ok(());
        }
        stack.push(stage);
        for &next in self.cascade_from(stage) {
            self.visit(next, stack, visited)?;
        }
        stack.pop();
        visited.insert(stage);
        Ok(())
    }

    /// Returns the stages directly downstream of `stage`, in declaration order.
    #[must_use]
    pub fn cascade_from(&self, stage: Stage) -> &[Stage] {
        self.edges.get(&stage).map_or(&[], Vec::as_slice)
    }

    /// Returns every stage a cascade from `stage` eventually reaches.
    ///
    /// Breadth-first, deterministic, excluding `stage` itself. The dispatcher
    /// never uses this; it exists for inspection tooling.
    #[must_use]
    pub fn downstream_closure(&self, stage: Stage) -> Vec<Stage> {
        let mut seen: BTreeSet<Stage> = BTreeSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<Stage> = self.cascade_from(stage).iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if next == stage || !seen.insert(next) {
                continue;
            }
            order.push(next);
            queue.extend(self.cascade_from(next).iter().copied());
        }
        order
    }

    /// Iterates over `(stage, downstream)` declarations in stage order.
    pub fn edges(&self) -> impl Iterator<Item = (Stage, &[Stage])> {
        self.edges.iter().map(|(stage, downstream)| (*stage, downstream.as_slice()))
    }

    /// Returns every stage mentioned by the graph, as source or target.
    #[must_use]
    pub fn referenced_stages(&self) -> BTreeSet<Stage> {
        let mut stages = BTreeSet::new();
        for (stage, downstream) in &self.edges {
            stages.insert(*stage);
            stages.extend(downstream.iter().copied());
        }
        stages
    }
}
