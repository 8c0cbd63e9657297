//! The scheduler: coordinator loop, worker pool, and run entry points.
//!
//! [`Runner`] owns a compiled [`Workflow`], a [`CheckpointStore`], and
//! [`RunOptions`], and drives runs step by step:
//!
//! 1. **Dispatch** — the frontier's watermark releases the current step's
//!    batch; workers dequeue and execute concurrently.
//! 2. **Collect** — the coordinator waits for the whole batch (the join
//!    barrier is the batch size, fixed at enqueue time).
//! 3. **Merge** — results sort by order key; deltas fold left through the
//!    reducer. Worker completion order is irrelevant by construction.
//! 4. **Route** — explicit routes win; otherwise edge predicates run against
//!    the merged state. Successors get fresh order keys from
//!    `(parent, edge index)` and the next step id.
//! 5. **Commit** — successors are fed to the frontier (still gated), then the
//!    checkpoint — merged state, full successor frontier, cumulative recorded
//!    I/O, content-derived idempotency key — and the step's buffered events
//!    commit atomically. An idempotency violation means the step already
//!    committed (crash recovery, replay) and is recovered locally. Only then
//!    does the watermark release the next step.
//!
//! Backpressure, budget exhaustion, and cancellation all halt between
//! commits, so the last checkpoint is always a consistent resume point; no
//! partial step is ever observable.

mod options;
mod worker;

pub use options::{ReplayMode, RunOptions};

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::checkpoint::{Checkpoint, WorkItem};
use crate::errors::RunError;
use crate::events::{EventKind, EventRecord};
use crate::frontier::{Frontier, FrontierError};
use crate::node::{NodeError, ReplayHandle};
use crate::recorder::{RecordedIo, ReplayLog};
use crate::state::WorkflowState;
use crate::store::{CheckpointStore, StoreError};
use crate::topology::Workflow;
use crate::types::{NodeId, Route, RunId, StepId};
use worker::{RunEnv, WorkerFailure, WorkerReport, worker_loop};

use serde_json::json;

const COMMIT_RETRIES: u32 = 3;

enum FeedOutcome {
    Complete,
    Backpressure,
    Canceled,
}

/// Execution engine for one workflow against one store.
pub struct Runner<S> {
    workflow: Arc<Workflow<S>>,
    store: Arc<dyn CheckpointStore<S>>,
    options: RunOptions,
}

impl<S: WorkflowState> Runner<S> {
    pub fn new(workflow: Workflow<S>, store: Arc<dyn CheckpointStore<S>>) -> Self {
        Self {
            workflow: Arc::new(workflow),
            store,
            options: RunOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn CheckpointStore<S>> {
        &self.store
    }

    #[must_use]
    pub fn workflow(&self) -> &Arc<Workflow<S>> {
        &self.workflow
    }

    /// Execute a fresh run from the workflow's start node to termination.
    #[instrument(skip(self, initial_state), fields(run = %run_id))]
    pub async fn run(&self, run_id: RunId, initial_state: S) -> Result<S, RunError> {
        let rng_seed = self.options.resolve_rng_seed(&run_id);
        // Durable step-0 checkpoint: the anchor for replay-from-scratch and
        // divergence bisection. Re-running the same run id dedups on the key.
        let initial = Checkpoint::initial(
            run_id.clone(),
            self.workflow.start().clone(),
            initial_state.clone(),
            rng_seed,
        );
        self.commit(&initial, &[]).await?;
        let seed = WorkItem::seed(self.workflow.start().clone(), initial_state.clone());
        self.drive(
            run_id,
            initial_state,
            vec![seed],
            0,
            Vec::new(),
            rng_seed,
            ReplayMode::Off,
        )
        .await
    }

    /// Resume live execution from a persisted checkpoint.
    #[instrument(skip(self, checkpoint), fields(run = %checkpoint.run_id, step = checkpoint.step_id))]
    pub async fn run_with_checkpoint(&self, checkpoint: Checkpoint<S>) -> Result<S, RunError> {
        let Checkpoint {
            run_id,
            step_id,
            state,
            frontier,
            rng_seed,
            recorded_ios,
            ..
        } = checkpoint;
        self.drive(
            run_id,
            state,
            frontier,
            step_id,
            recorded_ios,
            rng_seed,
            ReplayMode::Off,
        )
        .await
    }

    /// Re-execute from a checkpoint substituting its recorded I/O. Strict
    /// unless the options ask for lenient replay.
    #[instrument(skip(self, checkpoint), fields(run = %checkpoint.run_id, step = checkpoint.step_id))]
    pub async fn replay_run(&self, checkpoint: Checkpoint<S>) -> Result<S, RunError> {
        let mode = match self.options.replay {
            ReplayMode::Lenient => ReplayMode::Lenient,
            _ => ReplayMode::Strict,
        };
        let Checkpoint {
            run_id,
            step_id,
            state,
            frontier,
            rng_seed,
            recorded_ios,
            ..
        } = checkpoint;
        self.drive(
            run_id,
            state,
            frontier,
            step_id,
            recorded_ios,
            rng_seed,
            mode,
        )
        .await
    }

    /// Resume a run from its most recent checkpoint in the store.
    pub async fn resume_latest(&self, run_id: &RunId) -> Result<S, RunError> {
        let checkpoint = self
            .store
            .latest_checkpoint(run_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                run_id: run_id.clone(),
                step_id: None,
            })?;
        self.run_with_checkpoint(checkpoint).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        run_id: RunId,
        state: S,
        batch: Vec<WorkItem<S>>,
        last_committed: StepId,
        recorded: Vec<RecordedIo>,
        rng_seed: i64,
        replay_mode: ReplayMode,
    ) -> Result<S, RunError> {
        if batch.is_empty() {
            // Resuming a completed run is a no-op.
            return Ok(state);
        }

        let opts = &self.options;
        let cancel = opts.cancel.child_token();
        let deadline = opts
            .run_wall_clock_budget
            .map(|budget| tokio::time::Instant::now() + budget);
        let frontier: Arc<Frontier<S>> = Arc::new(Frontier::new(opts.queue_depth));
        let (tx, rx) = flume::unbounded::<WorkerReport<S>>();

        let replay = match replay_mode {
            ReplayMode::Off => None,
            ReplayMode::Strict => Some(ReplayHandle {
                log: Arc::new(ReplayLog::from_entries(&recorded)),
                strict: true,
            }),
            ReplayMode::Lenient => Some(ReplayHandle {
                log: Arc::new(ReplayLog::from_entries(&recorded)),
                strict: false,
            }),
        };
        let env = Arc::new(RunEnv {
            run_id: run_id.clone(),
            rng_seed,
            default_node_timeout: opts.default_node_timeout,
            replay,
            cancel: cancel.clone(),
        });

        let workers: Vec<_> = (0..opts.max_concurrent_nodes)
            .map(|_| {
                tokio::spawn(worker_loop(
                    self.workflow.clone(),
                    frontier.clone(),
                    tx.clone(),
                    env.clone(),
                ))
            })
            .collect();
        drop(tx);

        let result = self
            .step_loop(
                &run_id,
                state,
                batch,
                last_committed,
                recorded,
                rng_seed,
                &frontier,
                &rx,
                &cancel,
                deadline,
            )
            .await;

        frontier.close();
        cancel.cancel();
        futures_util::future::join_all(workers).await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn step_loop(
        &self,
        run_id: &RunId,
        mut state: S,
        batch: Vec<WorkItem<S>>,
        last_committed: StepId,
        mut recorded: Vec<RecordedIo>,
        rng_seed: i64,
        frontier: &Arc<Frontier<S>>,
        rx: &flume::Receiver<WorkerReport<S>>,
        cancel: &CancellationToken,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<S, RunError> {
        let opts = &self.options;
        let mut current_step = last_committed + 1;
        let mut expected = batch.len();

        // The first batch comes from a committed checkpoint (or the seed), so
        // it is dispatchable immediately; releasing before feeding lets a
        // batch wider than queue_depth drain through the bounded frontier.
        frontier.release(current_step);
        match self
            .feed(frontier, batch, opts.backpressure_timeout, cancel)
            .await
        {
            FeedOutcome::Complete => {}
            FeedOutcome::Backpressure => {
                return Err(RunError::BackpressureTimeout {
                    run_id: run_id.clone(),
                    step_id: current_step,
                });
            }
            FeedOutcome::Canceled => {
                return Err(RunError::Canceled {
                    run_id: run_id.clone(),
                    last_committed_step: last_committed,
                });
            }
        }

        loop {
            // Join barrier: every sibling of the batch reports before merge.
            let mut reports: Vec<WorkerReport<S>> = Vec::with_capacity(expected);
            while reports.len() < expected {
                tokio::select! {
                    received = rx.recv_async() => match received {
                        Ok(report) => reports.push(report),
                        Err(_) => {
                            return Err(RunError::Internal {
                                message: "worker pool terminated before the batch completed".into(),
                            });
                        }
                    },
                    _ = cancel.cancelled() => {
                        return Err(RunError::Canceled {
                            run_id: run_id.clone(),
                            last_committed_step: current_step - 1,
                        });
                    }
                    _ = wall_clock(deadline) => {
                        return Err(RunError::WallClockBudgetExceeded {
                            run_id: run_id.clone(),
                            step_id: current_step - 1,
                        });
                    }
                }
            }

            // Canonical order restores determinism regardless of completion
            // order.
            reports.sort_by(|a, b| a.item.canonical_cmp(&b.item));

            if let Some(pos) = reports.iter().position(|r| r.outcome.is_err()) {
                let report = reports.swap_remove(pos);
                let node = report.item.node;
                let failure = report.outcome.err().expect("position found an error");
                return Err(match failure {
                    WorkerFailure::MaxAttempts { attempts, source } => {
                        RunError::MaxAttemptsExceeded {
                            run_id: run_id.clone(),
                            step_id: current_step,
                            node,
                            attempts,
                            source,
                        }
                    }
                    WorkerFailure::Fatal(NodeError::ReplayMismatch(divergence)) => {
                        RunError::ReplayMismatch(divergence)
                    }
                    WorkerFailure::Fatal(source) => RunError::NodeFailed {
                        run_id: run_id.clone(),
                        step_id: current_step,
                        node,
                        source,
                    },
                    WorkerFailure::Canceled => RunError::Canceled {
                        run_id: run_id.clone(),
                        last_committed_step: current_step - 1,
                    },
                });
            }

            // Merge: fold deltas in canonical order, gather events and
            // recorded I/O in the same order.
            let mut events: Vec<EventRecord> = Vec::new();
            let mut merged_nodes: Vec<NodeId> = Vec::new();
            let mut ran_nodes: Vec<NodeId> = Vec::new();
            for report in &mut reports {
                events.append(&mut report.events);
                recorded.append(&mut report.recorded);
                ran_nodes.push(report.item.node.clone());
                if let Ok(result) = &mut report.outcome {
                    if let Some(delta) = result.delta.take() {
                        state = self.workflow.reducer().apply(state, delta);
                        merged_nodes.push(report.item.node.clone());
                    }
                }
            }

            // Route against the merged state and build the next batch.
            let next_step = current_step + 1;
            let mut successors: Vec<WorkItem<S>> = Vec::new();
            let mut dead_ends: Vec<NodeId> = Vec::new();
            for report in &reports {
                let result = match &report.outcome {
                    Ok(result) => result,
                    Err(_) => unreachable!("failures already handled"),
                };
                let targets: Vec<(NodeId, u32)> = match &result.route {
                    Some(Route::Stop) => Vec::new(),
                    Some(Route::Goto(target)) => vec![(target.clone(), 0)],
                    Some(Route::Many(targets)) => targets
                        .iter()
                        .cloned()
                        .enumerate()
                        .map(|(index, target)| (target, index as u32))
                        .collect(),
                    None => {
                        if self.workflow.has_out_edges(&report.item.node) {
                            let matched = self.workflow.next_for(&report.item.node, &state);
                            if matched.is_empty() {
                                dead_ends.push(report.item.node.clone());
                            }
                            matched
                        } else {
                            // Edge-less nodes passed validation by declaring
                            // stop capability.
                            Vec::new()
                        }
                    }
                };
                for (target, edge_index) in targets {
                    if self.workflow.node(&target).is_none() {
                        return Err(RunError::NodeFailed {
                            run_id: run_id.clone(),
                            step_id: current_step,
                            node: report.item.node.clone(),
                            source: NodeError::ValidationFailed(format!(
                                "route target not registered: {target}"
                            )),
                        });
                    }
                    successors.push(WorkItem::successor(
                        next_step,
                        report.item.node.clone(),
                        edge_index,
                        target,
                        state.clone(),
                    ));
                }
            }

            let completed = successors.is_empty();
            let no_progress = completed && !dead_ends.is_empty();

            events.push(EventRecord::new(
                run_id.clone(),
                current_step,
                None,
                EventKind::StepCommitted,
                json!({
                    "ran": ran_nodes.iter().map(NodeId::as_str).collect::<Vec<_>>(),
                    "merged": merged_nodes.iter().map(NodeId::as_str).collect::<Vec<_>>(),
                    "successors": successors.iter().map(|i| i.node.as_str()).collect::<Vec<_>>(),
                }),
            ));
            if completed && !no_progress {
                events.push(EventRecord::new(
                    run_id.clone(),
                    current_step,
                    None,
                    EventKind::RunCompleted,
                    json!({ "steps": current_step }),
                ));
            }

            // Spec order: successors enter the (still gated) frontier before
            // the commit; the checkpoint carries the full batch either way,
            // which is what makes a backpressure halt resumable.
            let feed_outcome = if completed {
                FeedOutcome::Complete
            } else {
                self.feed(
                    frontier,
                    successors.clone(),
                    opts.backpressure_timeout,
                    cancel,
                )
                .await
            };
            if matches!(feed_outcome, FeedOutcome::Backpressure) {
                events.push(EventRecord::new(
                    run_id.clone(),
                    current_step,
                    None,
                    EventKind::RunStalled,
                    json!({
                        "reason": "backpressure-timeout",
                        "queue_depth": opts.queue_depth,
                        "pending": successors.len(),
                    }),
                ));
            }

            // Only recordings up to this step belong in its checkpoint; under
            // replay the cumulative log carries future steps' entries, and
            // trimming keeps the re-committed checkpoint byte-compatible with
            // the original (same idempotency key, recovered locally).
            let recorded_upto: Vec<RecordedIo> = recorded
                .iter()
                .filter(|entry| entry.step_id <= current_step)
                .cloned()
                .collect();
            let checkpoint = Checkpoint::assemble(
                run_id.clone(),
                current_step,
                state.clone(),
                successors.clone(),
                rng_seed,
                recorded_upto,
                None,
            );
            self.commit(&checkpoint, &events).await?;

            if let Some(representative) = ran_nodes.first() {
                if let Err(e) = self
                    .store
                    .save_step(run_id, current_step, representative, &state)
                    .await
                {
                    warn!(error = %e, step = current_step, "save_step failed; checkpoint remains authoritative");
                }
            }

            match feed_outcome {
                FeedOutcome::Complete => {}
                FeedOutcome::Backpressure => {
                    return Err(RunError::BackpressureTimeout {
                        run_id: run_id.clone(),
                        step_id: current_step,
                    });
                }
                FeedOutcome::Canceled => {
                    return Err(RunError::Canceled {
                        run_id: run_id.clone(),
                        last_committed_step: current_step,
                    });
                }
            }

            if completed {
                if no_progress {
                    return Err(RunError::NoProgress {
                        run_id: run_id.clone(),
                        step_id: current_step,
                        nodes: dead_ends,
                    });
                }
                debug!(steps = current_step, "run completed");
                return Ok(state);
            }

            if next_step > opts.max_steps {
                return Err(RunError::MaxStepsExceeded {
                    run_id: run_id.clone(),
                    max_steps: opts.max_steps,
                });
            }

            // Parent step durable: release the next batch for dispatch.
            frontier.release(next_step);
            current_step = next_step;
            expected = successors.len();
        }
    }

    async fn feed(
        &self,
        frontier: &Arc<Frontier<S>>,
        items: Vec<WorkItem<S>>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> FeedOutcome {
        for item in items {
            match frontier.enqueue(item, timeout, cancel).await {
                Ok(()) => {}
                Err(FrontierError::BackpressureTimeout) => return FeedOutcome::Backpressure,
                Err(FrontierError::Canceled) | Err(FrontierError::Closed) => {
                    return FeedOutcome::Canceled;
                }
            }
        }
        FeedOutcome::Complete
    }

    /// Commit with local recovery: an idempotency violation means this step
    /// already landed (crash retry, replay against the original store) and is
    /// treated as success; transient backend failures are retried.
    async fn commit(
        &self,
        checkpoint: &Checkpoint<S>,
        events: &[EventRecord],
    ) -> Result<(), RunError> {
        let mut tries = 0u32;
        loop {
            match self.store.save_checkpoint(checkpoint, events).await {
                Ok(()) => return Ok(()),
                Err(StoreError::IdempotencyViolation { key }) => {
                    debug!(
                        step = checkpoint.step_id,
                        key, "step already committed; recovered locally"
                    );
                    return Ok(());
                }
                Err(e) if e.is_retryable() && tries < COMMIT_RETRIES => {
                    tries += 1;
                    warn!(error = %e, attempt = tries, "checkpoint commit failed; retrying");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(tries))).await;
                }
                Err(e) => return Err(RunError::Store(e)),
            }
        }
    }
}

async fn wall_clock(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(instant) => tokio::time::sleep_until(instant).await,
        None => std::future::pending::<()>().await,
    }
}
