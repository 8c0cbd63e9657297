//! Run-level failure taxonomy.
//!
//! Recoverable conditions — idempotency violations on commit, retryable node
//! errors — are handled inside the scheduler and never reach the caller.
//! Everything here is terminal for the run; the last committed checkpoint
//! stays durable, and variants marked *resumable* leave the run in a state
//! that `run_with_checkpoint` can pick up.

use miette::Diagnostic;
use thiserror::Error;

use crate::node::NodeError;
use crate::replay::Divergence;
use crate::store::StoreError;
use crate::topology::TopologyError;
use crate::types::{NodeId, RunId, StepId};

/// Terminal failure of a run.
#[derive(Debug, Error, Diagnostic)]
pub enum RunError {
    /// The step ceiling was reached. Resumable.
    #[error("run {run_id}: max steps exceeded ({max_steps})")]
    #[diagnostic(
        code(treadle::run::max_steps),
        help("Raise max_steps or check the graph for an unbounded loop.")
    )]
    MaxStepsExceeded { run_id: RunId, max_steps: u64 },

    /// The frontier stayed full past the backpressure timeout. Resumable: the
    /// final checkpoint carries the complete successor batch.
    #[error("run {run_id}: backpressure timeout while enqueuing step {step_id}")]
    #[diagnostic(
        code(treadle::run::backpressure_timeout),
        help(
            "The fan-out exceeded queue_depth for longer than backpressure_timeout. \
             Resume from the last checkpoint, or raise queue_depth."
        )
    )]
    BackpressureTimeout { run_id: RunId, step_id: StepId },

    /// The wall-clock budget ran out between steps. Resumable.
    #[error("run {run_id}: wall clock budget exhausted at step {step_id}")]
    #[diagnostic(code(treadle::run::wall_clock))]
    WallClockBudgetExceeded { run_id: RunId, step_id: StepId },

    /// Every route in a step dead-ended without a `Stop`: a topology bug.
    #[error("run {run_id}: no progress possible after step {step_id}")]
    #[diagnostic(
        code(treadle::run::no_progress),
        help(
            "Nodes {nodes:?} produced no successors and no Stop route; \
             check their edge predicates."
        )
    )]
    NoProgress {
        run_id: RunId,
        step_id: StepId,
        nodes: Vec<NodeId>,
    },

    /// Strict replay diverged from the recorded execution.
    #[error("replay mismatch at step {} node {}", .0.step_id, .0.node)]
    #[diagnostic(
        code(treadle::run::replay_mismatch),
        help("Use replay::locate_divergence to pinpoint the first diverging step.")
    )]
    ReplayMismatch(Box<Divergence>),

    /// A node exhausted its retry budget.
    #[error("run {run_id}: node {node} failed after {attempts} attempts at step {step_id}")]
    #[diagnostic(code(treadle::run::max_attempts))]
    MaxAttemptsExceeded {
        run_id: RunId,
        step_id: StepId,
        node: NodeId,
        attempts: u32,
        #[source]
        source: NodeError,
    },

    /// A node failed with a non-retryable error.
    #[error("run {run_id}: node {node} failed at step {step_id}")]
    #[diagnostic(code(treadle::run::node_failed))]
    NodeFailed {
        run_id: RunId,
        step_id: StepId,
        node: NodeId,
        #[source]
        source: NodeError,
    },

    /// Unrecoverable persistence failure.
    #[error(transparent)]
    #[diagnostic(code(treadle::run::store))]
    Store(#[from] StoreError),

    /// Topology validation failed before execution.
    #[error(transparent)]
    #[diagnostic(code(treadle::run::topology))]
    Topology(#[from] TopologyError),

    /// The root context was canceled; the latest checkpoint is preserved.
    /// Resumable.
    #[error("run {run_id}: canceled after step {last_committed_step}")]
    #[diagnostic(code(treadle::run::canceled))]
    Canceled {
        run_id: RunId,
        last_committed_step: StepId,
    },

    /// Engine invariant violation (worker channel closed unexpectedly, etc.).
    #[error("internal engine error: {message}")]
    #[diagnostic(code(treadle::run::internal))]
    Internal { message: String },
}

impl RunError {
    /// Whether `run_with_checkpoint` on the latest checkpoint can continue
    /// this run.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            RunError::MaxStepsExceeded { .. }
                | RunError::BackpressureTimeout { .. }
                | RunError::WallClockBudgetExceeded { .. }
                | RunError::Canceled { .. }
        )
    }
}
