//! Replay verification payloads and divergence diagnostics.
//!
//! Replay itself is a mode of the scheduler (see
//! [`Runner::replay_run`](crate::scheduler::Runner::replay_run)): recorded
//! external I/O substitutes for live calls, and every node execution is
//! verified against its recorded outcome — request digests, output hashes,
//! and routes. In strict mode the first divergence is fatal and carries a
//! [`Divergence`] payload; in lenient mode it is logged and execution
//! continues live.
//!
//! Two diagnostics build on the store's `load_checkpoint` contract:
//! [`locate_divergence`] replays from step 0 and reports the first diverging
//! step (strict replay verifies steps in order, so the first failure *is* the
//! first divergence), and [`last_matching_checkpoint`] binary-searches the
//! persisted checkpoints for the latest one that still replays cleanly — the
//! earliest trustworthy resume point, found in `O(log n)` replays.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::RunError;
use crate::scheduler::Runner;
use crate::state::WorkflowState;
use crate::types::{NodeId, RunId, StepId};

/// Where and how a strict replay diverged from the recorded execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Divergence {
    pub step_id: StepId,
    pub node: NodeId,
    pub attempt: u32,
    /// Recorded hash (or request digest, for I/O-level mismatches). `None`
    /// when the recording had no entry at all.
    pub expected_output_hash: Option<String>,
    pub actual_output_hash: Option<String>,
    pub expected_route: Option<String>,
    pub actual_route: Option<String>,
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step {} node {} attempt {}: expected {:?}/{:?}, got {:?}/{:?}",
            self.step_id,
            self.node,
            self.attempt,
            self.expected_output_hash,
            self.expected_route,
            self.actual_output_hash,
            self.actual_route
        )
    }
}

/// Replay the run from its step-0 checkpoint and report the first diverging
/// step, or `None` when the recording still matches end to end.
///
/// Requires the step-0 checkpoint to exist in the store (commit one with
/// [`Checkpoint::initial`](crate::checkpoint::Checkpoint::initial) for
/// replay-from-scratch support); the cumulative recorded I/O is taken from
/// the checkpoint at `max_step`.
pub async fn locate_divergence<S: WorkflowState>(
    runner: &Runner<S>,
    run_id: &RunId,
    max_step: StepId,
) -> Result<Option<Divergence>, RunError> {
    let latest = runner.store().load_checkpoint(run_id, max_step).await?;
    replay_from(runner, run_id, &latest, 0).await
}

/// Binary-search persisted checkpoints for the latest step whose checkpoint
/// still replays without divergence.
///
/// Replay from any checkpoint *before* the first divergent step fails, and
/// from any checkpoint *at or after* it succeeds (the divergent work is
/// already baked into the checkpoint), so the boundary is well defined.
/// Returns `0` even when step 0 itself no longer replays — in that case
/// nothing after the initial state is trustworthy.
pub async fn last_matching_checkpoint<S: WorkflowState>(
    runner: &Runner<S>,
    run_id: &RunId,
    max_step: StepId,
) -> Result<StepId, RunError> {
    let latest = runner.store().load_checkpoint(run_id, max_step).await?;

    if replay_from(runner, run_id, &latest, 0).await?.is_none() {
        return Ok(max_step);
    }
    if max_step == 0 {
        return Ok(0);
    }

    // Invariant: replay from `lo` fails, replay from `hi` succeeds.
    let mut lo: StepId = 0;
    let mut hi = max_step;
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        match replay_from(runner, run_id, &latest, mid).await? {
            Some(_) => lo = mid,
            None => hi = mid,
        }
    }
    Ok(hi)
}

async fn replay_from<S: WorkflowState>(
    runner: &Runner<S>,
    run_id: &RunId,
    latest: &crate::checkpoint::Checkpoint<S>,
    step: StepId,
) -> Result<Option<Divergence>, RunError> {
    let mut checkpoint = runner.store().load_checkpoint(run_id, step).await?;
    checkpoint.recorded_ios = latest.recorded_ios.clone();
    match runner.replay_run(checkpoint).await {
        Ok(_) => Ok(None),
        Err(RunError::ReplayMismatch(divergence)) => Ok(Some(*divergence)),
        Err(other) => Err(other),
    }
}
