//! Fluent construction of workflow topologies.
//!
//! `WorkflowBuilder` accumulates nodes, edges, the start node, and the run's
//! reducer, then validates everything in [`build`](WorkflowBuilder::build).
//! Configuration mistakes (duplicate ids, dangling edges, missing start,
//! dead-end nodes) surface as [`TopologyError`]s at build time, before any
//! execution starts.
//!
//! # Examples
//!
//! ```rust
//! use treadle::prelude::*;
//! use serde_json::json;
//!
//! struct Inc;
//!
//! #[async_trait::async_trait]
//! impl Node<JsonState> for Inc {
//!     async fn run(
//!         &self,
//!         _ctx: NodeContext,
//!         state: JsonState,
//!     ) -> Result<NodeResult<JsonState>, NodeError> {
//!         let next = state.get_i64("count") + 1;
//!         Ok(NodeResult::stop().with_delta(JsonState::new().with("count", json!(next))))
//!     }
//!
//!     fn policy(&self) -> NodePolicy<JsonState> {
//!         NodePolicy::default().stops()
//!     }
//! }
//!
//! let workflow = WorkflowBuilder::new()
//!     .add_node("inc", Inc)
//!     .start_at("inc")
//!     .reducer(merge_json)
//!     .build()
//!     .expect("valid topology");
//! assert_eq!(workflow.start().as_str(), "inc");
//! ```

use rustc_hash::FxHashMap;
use std::sync::Arc;

use super::edges::{Edge, EdgePredicate};
use super::{TopologyError, Workflow};
use crate::node::Node;
use crate::reducer::Reducer;
use crate::types::NodeId;

/// Builder for [`Workflow`] topologies.
pub struct WorkflowBuilder<S> {
    nodes: FxHashMap<NodeId, Arc<dyn Node<S>>>,
    edges: FxHashMap<NodeId, Vec<Edge<S>>>,
    start: Option<NodeId>,
    reducer: Option<Arc<dyn Reducer<S>>>,
    duplicates: Vec<NodeId>,
}

impl<S> Default for WorkflowBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> WorkflowBuilder<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: FxHashMap::default(),
            edges: FxHashMap::default(),
            start: None,
            reducer: None,
            duplicates: Vec::new(),
        }
    }

    /// Register a node. Duplicate ids are reported at build time.
    #[must_use]
    pub fn add_node(mut self, id: impl Into<NodeId>, node: impl Node<S> + 'static) -> Self {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            self.duplicates.push(id);
        } else {
            self.nodes.insert(id, Arc::new(node));
        }
        self
    }

    /// Add an unconditional edge. Insertion order per source node defines the
    /// edge index.
    #[must_use]
    pub fn connect(mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        self.edges
            .entry(from.into())
            .or_default()
            .push(Edge::always(to.into()));
        self
    }

    /// Add an edge gated by a predicate over the merged state.
    #[must_use]
    pub fn connect_when(
        mut self,
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        predicate: impl Fn(&S) -> bool + Send + Sync + 'static,
    ) -> Self {
        let predicate: EdgePredicate<S> = Arc::new(predicate);
        self.edges
            .entry(from.into())
            .or_default()
            .push(Edge::when(to.into(), predicate));
        self
    }

    /// Designate the node that seeds every run of this workflow.
    #[must_use]
    pub fn start_at(mut self, id: impl Into<NodeId>) -> Self {
        self.start = Some(id.into());
        self
    }

    /// Install the run's reducer.
    #[must_use]
    pub fn reducer(mut self, reducer: impl Reducer<S> + 'static) -> Self {
        self.reducer = Some(Arc::new(reducer));
        self
    }

    /// Validate and compile the topology.
    pub fn build(self) -> Result<Workflow<S>, TopologyError> {
        if let Some(dup) = self.duplicates.into_iter().next() {
            return Err(TopologyError::DuplicateNode { node: dup });
        }
        let start = self.start.ok_or(TopologyError::NoStartNode)?;
        let reducer = self.reducer.ok_or(TopologyError::NoReducer)?;
        Workflow::compile(self.nodes, self.edges, start, reducer)
    }
}
