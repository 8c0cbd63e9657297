//! The durable unit of progress: work items, checkpoints, and the step-level
//! idempotency key.
//!
//! A checkpoint captures everything needed to resume or replay a run after the
//! step it closes: the merged state, the full frontier of pending work items,
//! the RNG seed, the cumulative recorded I/O, and a content-derived
//! idempotency key that makes the commit exactly-once — two attempts to commit
//! the same step produce the same key, and the store rejects the second.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ordering::{OrderKey, compute_order_key, seed_order_key};
use crate::recorder::RecordedIo;
use crate::types::{NodeId, RunId, StepId};

/// Domain separator for idempotency-key digests.
const KEY_DOMAIN: &[u8] = b"treadle.step.v1";

/// A scheduled invocation of a node with a by-value state snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkItem<S> {
    /// Step at which this item will execute; all siblings of a batch share it.
    pub step_id: StepId,
    pub order_key: OrderKey,
    pub node: NodeId,
    /// Accumulated state at the moment of enqueue, captured by value.
    pub snapshot: S,
    /// Zero-based attempt counter; retries advance it in place, never
    /// re-enqueue.
    pub attempt: u32,
    pub parent: NodeId,
    pub edge_index: u32,
}

impl<S> WorkItem<S> {
    /// The run's first work item: the start node, parented to the root
    /// sentinel at edge index 0.
    pub fn seed(node: NodeId, snapshot: S) -> Self {
        Self {
            step_id: 1,
            order_key: seed_order_key(),
            node,
            snapshot,
            attempt: 0,
            parent: NodeId::root(),
            edge_index: 0,
        }
    }

    /// A successor item enqueued when `parent` routed to `node` along
    /// `edge_index`.
    pub fn successor(
        step_id: StepId,
        parent: NodeId,
        edge_index: u32,
        node: NodeId,
        snapshot: S,
    ) -> Self {
        Self {
            step_id,
            order_key: compute_order_key(&parent, edge_index),
            node,
            snapshot,
            attempt: 0,
            parent,
            edge_index,
        }
    }

    /// Canonical comparison: order key, then step, then the hash-collision
    /// tiebreak `(parent, edge_index)`, then node.
    #[must_use]
    pub fn canonical_cmp(&self, other: &Self) -> std::cmp::Ordering {
        (
            self.order_key,
            self.step_id,
            &self.parent,
            self.edge_index,
            &self.node,
        )
            .cmp(&(
                other.order_key,
                other.step_id,
                &other.parent,
                other.edge_index,
                &other.node,
            ))
    }
}

/// Sort a frontier into canonical order.
pub fn sort_frontier<S>(items: &mut [WorkItem<S>]) {
    items.sort_by(|a, b| a.canonical_cmp(b));
}

/// Durable record of one committed step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint<S> {
    pub run_id: RunId,
    pub step_id: StepId,
    /// Accumulated state after this step's merge.
    pub state: S,
    /// Pending work items at the commit point, canonically sorted.
    pub frontier: Vec<WorkItem<S>>,
    pub rng_seed: i64,
    /// Cumulative recorded I/O for steps 1..=`step_id`.
    pub recorded_ios: Vec<RecordedIo>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub label: Option<String>,
}

impl<S: Serialize> Checkpoint<S> {
    /// Assemble a checkpoint, sorting the frontier canonically and deriving
    /// the idempotency key from content.
    pub fn assemble(
        run_id: RunId,
        step_id: StepId,
        state: S,
        mut frontier: Vec<WorkItem<S>>,
        rng_seed: i64,
        recorded_ios: Vec<RecordedIo>,
        label: Option<String>,
    ) -> Self {
        sort_frontier(&mut frontier);
        let idempotency_key = idempotency_key(&run_id, step_id, &frontier, &state);
        Self {
            run_id,
            step_id,
            state,
            frontier,
            rng_seed,
            recorded_ios,
            idempotency_key,
            created_at: Utc::now(),
            label,
        }
    }

    /// Step-0 checkpoint for a run that has not executed anything yet: the
    /// initial state and a single seed work item. Useful for durable starts
    /// and replay-from-scratch.
    pub fn initial(run_id: RunId, start_node: NodeId, state: S, rng_seed: i64) -> Self
    where
        S: Clone,
    {
        let seed = WorkItem::seed(start_node, state.clone());
        Self::assemble(run_id, 0, state, vec![seed], rng_seed, Vec::new(), None)
    }
}

/// Content-derived key uniquely identifying a committed step:
/// `SHA-256(run || step || canonical frontier || canonical state)`.
///
/// Deterministic execution makes a re-attempted commit of the same step
/// reproduce this key exactly, which is how the store deduplicates it.
pub fn idempotency_key<S: Serialize>(
    run_id: &RunId,
    step_id: StepId,
    frontier: &[WorkItem<S>],
    state: &S,
) -> String {
    let mut sorted: Vec<&WorkItem<S>> = frontier.iter().collect();
    sorted.sort_by(|a, b| a.canonical_cmp(b));

    let mut hasher = Sha256::new();
    hasher.update(KEY_DOMAIN);
    hasher.update(run_id.as_str().as_bytes());
    hasher.update(step_id.to_be_bytes());
    for item in sorted {
        hasher.update(item.order_key.as_u64().to_be_bytes());
        hasher.update(item.step_id.to_be_bytes());
        hasher.update(item.node.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(item.attempt.to_be_bytes());
        hasher.update(item.parent.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(item.edge_index.to_be_bytes());
        hasher.update(serde_json::to_vec(&item.snapshot).unwrap_or_default());
    }
    hasher.update([0xffu8]);
    hasher.update(serde_json::to_vec(state).unwrap_or_default());
    hex::encode(hasher.finalize())
}
