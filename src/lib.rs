//! # Treadle: deterministic graph workflow engine
//!
//! Treadle executes directed graphs of user-defined nodes that consume a typed
//! state value, produce a partial update (a delta), and route control onward.
//! Three guarantees hold for every run:
//!
//! - **Deterministic concurrent execution.** For a fixed graph, initial
//!   state, and RNG seed, the final state is byte-identical regardless of
//!   worker scheduling or completion order. Sibling results merge in the
//!   canonical order of their provenance-derived order keys.
//! - **Exactly-once step commit.** Each step's transition commits atomically
//!   under a content-derived idempotency key; crash recovery and retry never
//!   duplicate a commit.
//! - **Faithful replay.** Recorded external I/O substitutes for live calls;
//!   strict replay reproduces the original execution or fails loudly at the
//!   first divergence.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use std::sync::Arc;
//! use treadle::prelude::*;
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
//!         let count = state.get_i64("count") + 1;
//!         let delta = JsonState::new().with("count", json!(count));
//!         let result = if count < 3 {
//!             NodeResult::goto("inc").with_delta(delta)
//!         } else {
//!             NodeResult::stop().with_delta(delta)
//!         };
//!         Ok(result)
//!     }
//!
//!     fn policy(&self) -> NodePolicy<JsonState> {
//!         NodePolicy::default().stops()
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let workflow = WorkflowBuilder::new()
//!     .add_node("inc", Inc)
//!     .start_at("inc")
//!     .reducer(merge_json)
//!     .build()?;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let runner = Runner::new(workflow, store);
//! let final_state = runner
//!     .run(RunId::from("demo"), JsonState::new().with("count", json!(0)))
//!     .await?;
//! assert_eq!(final_state.get_i64("count"), 3);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module guide
//!
//! - [`types`] — node/run identifiers and routes
//! - [`ordering`] — provenance-derived order keys
//! - [`frontier`] — the bounded, order-keyed work queue
//! - [`topology`] — graph construction and validation
//! - [`node`] — the node contract and execution context
//! - [`reducer`] / [`state`] — state accumulation
//! - [`retry`] — per-node retry policy with deterministic jitter
//! - [`rng`] — seeded, replay-stable randomness
//! - [`recorder`] — recorded I/O capture and lookup
//! - [`checkpoint`] — work items, checkpoints, idempotency keys
//! - [`store`] — the persistence contract and its backends
//! - [`scheduler`] — the worker pool, coordinator, and run entry points
//! - [`replay`] — divergence payloads and the bisect diagnostic
//! - [`events`] — the transactional outbox and event sinks
//! - [`errors`] — the run-level failure taxonomy

pub mod checkpoint;
pub mod errors;
pub mod events;
pub mod frontier;
pub mod node;
pub mod ordering;
pub mod recorder;
pub mod reducer;
pub mod replay;
pub mod retry;
pub mod rng;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod topology;
pub mod types;

/// One-stop imports for building and running workflows.
pub mod prelude {
    pub use crate::checkpoint::{Checkpoint, WorkItem};
    pub use crate::errors::RunError;
    pub use crate::node::{Node, NodeContext, NodeError, NodePolicy, NodeResult};
    pub use crate::ordering::{OrderKey, compute_order_key};
    pub use crate::reducer::Reducer;
    pub use crate::retry::RetryPolicy;
    pub use crate::scheduler::{ReplayMode, Runner, RunOptions};
    pub use crate::state::{JsonState, WorkflowState, merge_json};
    pub use crate::store::{CheckpointStore, InMemoryStore, StoreError};
    #[cfg(feature = "sqlite")]
    pub use crate::store::SqliteStore;
    pub use crate::topology::{Workflow, WorkflowBuilder};
    pub use crate::types::{NodeId, Route, RunId, StepId};
}
