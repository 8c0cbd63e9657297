//! Worker side of the scheduler: dequeue, execute under policy, retry, report.
//!
//! Workers never hold scheduler-owned locks across node execution, and they
//! never touch the accumulated state — each work item carries its own
//! snapshot. Retries happen in place: the attempt counter advances inside the
//! worker, the item is never re-enqueued, and the backoff jitter comes from
//! the item's deterministic RNG stream.

use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::checkpoint::WorkItem;
use crate::events::{EventKind, EventRecord};
use crate::frontier::Frontier;
use crate::node::{NodeContext, NodeError, NodeResult, ReplayHandle};
use crate::recorder::{IoKind, IoRecorder, RecordedIo, digest_value, outcome_hash};
use crate::replay::Divergence;
use crate::rng::DetRng;
use crate::state::WorkflowState;
use crate::topology::Workflow;
use crate::types::RunId;

/// Immutable per-run environment shared by all workers.
pub(crate) struct RunEnv {
    pub run_id: RunId,
    pub rng_seed: i64,
    pub default_node_timeout: Option<Duration>,
    pub replay: Option<ReplayHandle>,
    pub cancel: CancellationToken,
}

/// Why a work item ultimately failed.
#[derive(Debug)]
pub(crate) enum WorkerFailure {
    /// Retry budget exhausted on a retryable error.
    MaxAttempts { attempts: u32, source: NodeError },
    /// Non-retryable node error (includes strict replay mismatches).
    Fatal(NodeError),
    /// The run was canceled mid-attempt.
    Canceled,
}

/// Everything the coordinator needs from one completed work item.
pub(crate) struct WorkerReport<S> {
    pub item: WorkItem<S>,
    pub outcome: Result<NodeResult<S>, WorkerFailure>,
    pub recorded: Vec<RecordedIo>,
    pub events: Vec<EventRecord>,
}

/// Worker task body: drain the frontier until it closes or the run cancels.
pub(crate) async fn worker_loop<S: WorkflowState>(
    workflow: Arc<Workflow<S>>,
    frontier: Arc<Frontier<S>>,
    results: flume::Sender<WorkerReport<S>>,
    env: Arc<RunEnv>,
) {
    loop {
        match frontier.dequeue(&env.cancel).await {
            Ok(Some(item)) => {
                let report = execute_item(&workflow, &env, item).await;
                if results.send(report).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
}

/// Run one work item to a terminal outcome, driving the retry loop.
pub(crate) async fn execute_item<S: WorkflowState>(
    workflow: &Workflow<S>,
    env: &RunEnv,
    item: WorkItem<S>,
) -> WorkerReport<S> {
    let Some(node) = workflow.node(&item.node).cloned() else {
        // Dynamic routes can address nodes validation never saw.
        return WorkerReport {
            outcome: Err(WorkerFailure::Fatal(NodeError::ValidationFailed(format!(
                "work item addresses unregistered node: {}",
                item.node
            )))),
            item,
            recorded: Vec::new(),
            events: Vec::new(),
        };
    };
    let policy = node.policy();
    let timeout = policy.timeout.or(env.default_node_timeout);
    let rng = Arc::new(Mutex::new(DetRng::for_work_item(
        env.rng_seed,
        &env.run_id,
        item.order_key,
    )));

    let mut attempt = item.attempt;
    let mut recorded: Vec<RecordedIo> = Vec::new();
    let mut events: Vec<EventRecord> = Vec::new();

    loop {
        let recorder = (policy.recordable && env.replay.is_none())
            .then(|| Arc::new(IoRecorder::new(item.step_id, item.node.clone(), attempt)));
        let ctx = NodeContext::new(
            env.run_id.clone(),
            item.step_id,
            item.node.clone(),
            attempt,
            rng.clone(),
            recorder.clone(),
            env.replay.clone(),
            env.cancel.child_token(),
        );
        events.push(EventRecord::new(
            env.run_id.clone(),
            item.step_id,
            Some(item.node.clone()),
            EventKind::NodeStarted,
            json!({ "attempt": attempt }),
        ));

        let started = Instant::now();
        let run = node.run(ctx.clone(), item.snapshot.clone());
        let bounded = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(result) => result,
                    Err(_) => Err(NodeError::Timeout { elapsed: limit }),
                },
                None => run.await,
            }
        };
        // Abandon in-flight work when the run cancels; the item stays durable
        // in its parent step's checkpoint.
        let outcome = tokio::select! {
            outcome = bounded => outcome,
            _ = env.cancel.cancelled() => Err(NodeError::Canceled),
        };
        events.extend(ctx.drain_events());
        if let Some(rec) = &recorder {
            recorded.extend(rec.drain());
        }

        match outcome {
            Ok(result) => {
                if let Some(replay) = &env.replay {
                    if let Err(divergence) = verify_outcome(&item, attempt, &result, replay) {
                        warn!(
                            node = %item.node,
                            step = item.step_id,
                            %divergence,
                            "replay outcome diverged"
                        );
                        if replay.strict {
                            return WorkerReport {
                                outcome: Err(WorkerFailure::Fatal(NodeError::ReplayMismatch(
                                    Box::new(divergence),
                                ))),
                                item,
                                recorded,
                                events,
                            };
                        }
                    }
                } else {
                    recorded.push(RecordedIo {
                        step_id: item.step_id,
                        node: item.node.clone(),
                        attempt,
                        seq: u32::MAX,
                        kind: IoKind::Outcome,
                        request_digest: digest_value(&item.snapshot),
                        response: json!({
                            "route": result.route.as_ref().map(|r| r.encode())
                        }),
                        output_hash: outcome_hash(&result.delta, &result.route),
                        route: result.route.clone(),
                        recorded_at: chrono::Utc::now(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                events.push(EventRecord::new(
                    env.run_id.clone(),
                    item.step_id,
                    Some(item.node.clone()),
                    EventKind::NodeCompleted,
                    json!({
                        "attempt": attempt,
                        "duration_ms": started.elapsed().as_millis() as u64
                    }),
                ));
                return WorkerReport {
                    outcome: Ok(result),
                    item,
                    recorded,
                    events,
                };
            }
            Err(error) => {
                if env.cancel.is_cancelled() {
                    return WorkerReport {
                        outcome: Err(WorkerFailure::Canceled),
                        item,
                        recorded,
                        events,
                    };
                }
                if policy.retry.should_retry(attempt, &error) {
                    let delay = {
                        let mut rng = rng.lock().expect("rng lock");
                        policy.retry.backoff_delay(attempt, &mut rng)
                    };
                    debug!(
                        node = %item.node,
                        step = item.step_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying node after backoff"
                    );
                    events.push(EventRecord::new(
                        env.run_id.clone(),
                        item.step_id,
                        Some(item.node.clone()),
                        EventKind::NodeRetried,
                        json!({
                            "attempt": attempt,
                            "delay_ms": delay.as_millis() as u64,
                            "error": error.to_string()
                        }),
                    ));
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = env.cancel.cancelled() => {
                            return WorkerReport {
                                outcome: Err(WorkerFailure::Canceled),
                                item,
                                recorded,
                                events,
                            };
                        }
                    }
                    attempt += 1;
                    continue;
                }

                // Terminal failure: routable per node policy, except replay
                // mismatches, which must stay fatal.
                if let Some(route) = &policy.error_route {
                    if !matches!(error, NodeError::ReplayMismatch(_)) {
                        warn!(
                            node = %item.node,
                            step = item.step_id,
                            error = %error,
                            target = %route,
                            "node failed terminally; following its error route"
                        );
                        events.push(EventRecord::new(
                            env.run_id.clone(),
                            item.step_id,
                            Some(item.node.clone()),
                            EventKind::NodeCompleted,
                            json!({
                                "attempt": attempt,
                                "error_routed": route.encode(),
                                "error": error.to_string()
                            }),
                        ));
                        let result = NodeResult::empty().with_route(route.clone());
                        if env.replay.is_none() {
                            recorded.push(RecordedIo {
                                step_id: item.step_id,
                                node: item.node.clone(),
                                attempt,
                                seq: u32::MAX,
                                kind: IoKind::Outcome,
                                request_digest: digest_value(&item.snapshot),
                                response: json!({ "route": route.encode() }),
                                output_hash: outcome_hash(&result.delta, &result.route),
                                route: result.route.clone(),
                                recorded_at: chrono::Utc::now(),
                                duration_ms: started.elapsed().as_millis() as u64,
                            });
                        }
                        return WorkerReport {
                            outcome: Ok(result),
                            item,
                            recorded,
                            events,
                        };
                    }
                }

                let attempts = attempt + 1;
                let budget_exhausted =
                    policy.retry.max_attempts > 1 && attempts >= policy.retry.max_attempts;
                let failure = if budget_exhausted && (policy.retry.retry_on)(&error) {
                    WorkerFailure::MaxAttempts {
                        attempts,
                        source: error,
                    }
                } else {
                    WorkerFailure::Fatal(error)
                };
                return WorkerReport {
                    outcome: Err(failure),
                    item,
                    recorded,
                    events,
                };
            }
        }
    }
}

/// Compare a live result against the recorded outcome for this step/node.
fn verify_outcome<S: WorkflowState>(
    item: &WorkItem<S>,
    attempt: u32,
    result: &NodeResult<S>,
    replay: &ReplayHandle,
) -> Result<(), Divergence> {
    let actual_hash = outcome_hash(&result.delta, &result.route);
    let actual_route = result.route.as_ref().map(|r| r.encode());
    match replay.log.outcome(item.step_id, &item.node) {
        Some(entry) if entry.output_hash == actual_hash => Ok(()),
        Some(entry) => Err(Divergence {
            step_id: item.step_id,
            node: item.node.clone(),
            attempt,
            expected_output_hash: Some(entry.output_hash.clone()),
            actual_output_hash: Some(actual_hash),
            expected_route: entry.route.as_ref().map(|r| r.encode()),
            actual_route,
        }),
        None => Err(Divergence {
            step_id: item.step_id,
            node: item.node.clone(),
            attempt,
            expected_output_hash: None,
            actual_output_hash: Some(actual_hash),
            expected_route: None,
            actual_route,
        }),
    }
}
