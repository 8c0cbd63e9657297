//! Workflow topology: the node registry, ordered edges, and validation.
//!
//! A [`Workflow`] is the compiled, immutable description of a graph: nodes
//! keyed by id, per-node ordered edge lists (insertion order is the edge
//! index), a start node, and the run's reducer. Construction goes through
//! [`WorkflowBuilder`]; [`WorkflowBuilder::build`] validates the configuration
//! once, before any execution.
//!
//! Routing at runtime: an explicit [`Route`](crate::types::Route) returned by
//! a node overrides edge evaluation entirely; otherwise
//! [`Workflow::next_for`] evaluates each outgoing edge's predicate in edge
//! order against the merged state.

mod builder;
mod edges;

pub use builder::WorkflowBuilder;
pub use edges::{Edge, EdgePredicate};

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::node::Node;
use crate::reducer::Reducer;
use crate::types::NodeId;

/// Configuration errors detected when compiling a topology.
#[derive(Debug, Error, Diagnostic)]
pub enum TopologyError {
    #[error("duplicate node id: {node}")]
    #[diagnostic(
        code(treadle::topology::duplicate_node),
        help("Each node id may be registered once; rename one of the `{node}` nodes.")
    )]
    DuplicateNode { node: NodeId },

    #[error("no start node designated")]
    #[diagnostic(
        code(treadle::topology::no_start),
        help("Call WorkflowBuilder::start_at before build().")
    )]
    NoStartNode,

    #[error("start node is not registered: {node}")]
    #[diagnostic(code(treadle::topology::unknown_start))]
    UnknownStartNode { node: NodeId },

    #[error("edge references unregistered node: {node} (from {from})")]
    #[diagnostic(
        code(treadle::topology::unknown_edge_target),
        help("Register `{node}` with add_node or remove the edge.")
    )]
    UnknownEdgeTarget { from: NodeId, node: NodeId },

    #[error("edge originates at unregistered node: {node}")]
    #[diagnostic(code(treadle::topology::unknown_edge_source))]
    UnknownEdgeSource { node: NodeId },

    #[error("node {node} has no outgoing edges and does not declare stop capability")]
    #[diagnostic(
        code(treadle::topology::dead_end),
        help(
            "Give `{node}` an outgoing edge, or mark its policy with .stops() if it terminates branches."
        )
    )]
    DeadEndNode { node: NodeId },

    #[error("no reducer installed")]
    #[diagnostic(
        code(treadle::topology::no_reducer),
        help("Call WorkflowBuilder::reducer before build().")
    )]
    NoReducer,
}

/// Compiled, validated workflow graph.
pub struct Workflow<S> {
    nodes: FxHashMap<NodeId, Arc<dyn Node<S>>>,
    edges: FxHashMap<NodeId, Vec<Edge<S>>>,
    start: NodeId,
    reducer: Arc<dyn Reducer<S>>,
}

impl<S> Workflow<S> {
    pub(crate) fn compile(
        nodes: FxHashMap<NodeId, Arc<dyn Node<S>>>,
        edges: FxHashMap<NodeId, Vec<Edge<S>>>,
        start: NodeId,
        reducer: Arc<dyn Reducer<S>>,
    ) -> Result<Self, TopologyError> {
        let workflow = Self {
            nodes,
            edges,
            start,
            reducer,
        };
        workflow.validate()?;
        Ok(workflow)
    }

    /// Run the structural checks: the start node exists, every edge endpoint
    /// is registered, and every node either has outgoing edges or declares
    /// stop capability in its policy.
    fn validate(&self) -> Result<(), TopologyError> {
        if !self.nodes.contains_key(&self.start) {
            return Err(TopologyError::UnknownStartNode {
                node: self.start.clone(),
            });
        }

        // Sorted iteration so the first reported error is deterministic.
        let mut sources: Vec<&NodeId> = self.edges.keys().collect();
        sources.sort();
        for from in sources {
            if !self.nodes.contains_key(from) {
                return Err(TopologyError::UnknownEdgeSource { node: from.clone() });
            }
            for edge in &self.edges[from] {
                if !self.nodes.contains_key(&edge.to) {
                    return Err(TopologyError::UnknownEdgeTarget {
                        from: from.clone(),
                        node: edge.to.clone(),
                    });
                }
            }
        }

        let mut ids: Vec<&NodeId> = self.nodes.keys().collect();
        ids.sort();
        for id in ids {
            let has_edges = self.edges.get(id).is_some_and(|out| !out.is_empty());
            if !has_edges && !self.nodes[id].policy().declares_stop {
                return Err(TopologyError::DeadEndNode { node: id.clone() });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn start(&self) -> &NodeId {
        &self.start
    }

    #[must_use]
    pub fn reducer(&self) -> &Arc<dyn Reducer<S>> {
        &self.reducer
    }

    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Arc<dyn Node<S>>> {
        self.nodes.get(id)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn has_out_edges(&self, id: &NodeId) -> bool {
        self.edges.get(id).is_some_and(|out| !out.is_empty())
    }

    /// Successors of `id` for the given state: each outgoing edge whose
    /// predicate holds, in edge order, tagged with its edge index.
    ///
    /// Only consulted when the node returned no explicit route.
    #[must_use]
    pub fn next_for(&self, id: &NodeId, state: &S) -> Vec<(NodeId, u32)> {
        let Some(out) = self.edges.get(id) else {
            return Vec::new();
        };
        out.iter()
            .enumerate()
            .filter(|(_, edge)| edge.matches(state))
            .map(|(index, edge)| (edge.to.clone(), index as u32))
            .collect()
    }
}

impl<S> std::fmt::Debug for Workflow<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("start", &self.start)
            .field("nodes", &self.nodes.len())
            .field(
                "edges",
                &self.edges.values().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}
