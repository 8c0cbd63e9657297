//! Node execution contract: the [`Node`] trait, execution context, results,
//! and per-node policy.
//!
//! A node is an addressable unit of computation. It receives a deep copy of
//! the accumulated state and a [`NodeContext`] carrying its execution
//! environment — identity, attempt counter, deterministic RNG, event emission,
//! and (for recordable nodes) the record-or-replay I/O channel — and returns a
//! [`NodeResult`]: an optional delta plus an optional explicit route.
//!
//! # Design principles
//!
//! - **Deterministic**: all randomness through the context RNG, no ambient
//!   clocks or global state. Violations are only detectable at replay.
//! - **Focused**: one unit of work per node; compose via the topology.
//! - **Observable**: use [`NodeContext::emit`] for telemetry; events ride the
//!   step's atomic commit.
//!
//! # Errors
//!
//! Returning `Err(NodeError)` puts the failure through the node's retry
//! policy; non-retryable errors (or an exhausted budget) terminate the run
//! with the last committed checkpoint intact.

use async_trait::async_trait;
use miette::Diagnostic;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::events::EventRecord;
use crate::recorder::{IoRecorder, ReplayLog, digest_value};
use crate::replay::Divergence;
use crate::retry::RetryPolicy;
use crate::rng::DetRng;
use crate::types::{NodeId, Route, RunId, StepId};

/// Core trait for executable workflow nodes, generic over the state type.
#[async_trait]
pub trait Node<S>: Send + Sync {
    /// Execute this node against a snapshot of the accumulated state.
    async fn run(&self, ctx: NodeContext, state: S) -> Result<NodeResult<S>, NodeError>;

    /// Execution policy for this node. The default has no timeout, no retry,
    /// no recording, and does not declare stop capability.
    fn policy(&self) -> NodePolicy<S> {
        NodePolicy::default()
    }
}

/// Advisory idempotency-key function for side-effect protection inside nodes.
///
/// The step-level idempotency key remains authoritative for commit
/// deduplication; this hook only lets a node derive a stable key for its own
/// external effects.
pub type IdempotencyKeyFn<S> = Arc<dyn Fn(&S) -> String + Send + Sync>;

/// Per-node execution policy.
pub struct NodePolicy<S> {
    /// Wall-clock limit for one attempt. `None` falls back to the run's
    /// `default_node_timeout`.
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
    /// Whether external interactions of this node are captured for replay.
    pub recordable: bool,
    /// Whether this node's route contract permits ending a branch (an
    /// explicit `Stop`, or explicit routing that never falls through to
    /// edges). Topology validation requires it for nodes without outgoing
    /// edges.
    pub declares_stop: bool,
    /// Where to route when this node fails terminally (non-retryable error or
    /// exhausted retry budget). `None` makes such failures fatal for the run.
    pub error_route: Option<Route>,
    pub idempotency_key: Option<IdempotencyKeyFn<S>>,
}

impl<S> Default for NodePolicy<S> {
    fn default() -> Self {
        Self {
            timeout: None,
            retry: RetryPolicy::default(),
            recordable: false,
            declares_stop: false,
            error_route: None,
            idempotency_key: None,
        }
    }
}

impl<S> Clone for NodePolicy<S> {
    fn clone(&self) -> Self {
        Self {
            timeout: self.timeout,
            retry: self.retry.clone(),
            recordable: self.recordable,
            declares_stop: self.declares_stop,
            error_route: self.error_route.clone(),
            idempotency_key: self.idempotency_key.clone(),
        }
    }
}

impl<S> std::fmt::Debug for NodePolicy<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePolicy")
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("recordable", &self.recordable)
            .field("declares_stop", &self.declares_stop)
            .finish_non_exhaustive()
    }
}

impl<S> NodePolicy<S> {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn recordable(mut self) -> Self {
        self.recordable = true;
        self
    }

    /// Declare that this node may legally return [`Route::Stop`].
    #[must_use]
    pub fn stops(mut self) -> Self {
        self.declares_stop = true;
        self
    }

    /// Map terminal failures of this node to a route instead of failing the
    /// run.
    #[must_use]
    pub fn route_errors_to(mut self, route: Route) -> Self {
        self.error_route = Some(route);
        self
    }

    #[must_use]
    pub fn with_idempotency_key(
        mut self,
        key: impl Fn(&S) -> String + Send + Sync + 'static,
    ) -> Self {
        self.idempotency_key = Some(Arc::new(key));
        self
    }
}

/// Result of one node execution: an optional partial state update and an
/// optional explicit route.
///
/// `route == None` defers routing to the topology's outgoing edges.
#[derive(Clone, Debug, Default)]
pub struct NodeResult<S> {
    pub delta: Option<S>,
    pub route: Option<Route>,
}

impl<S> NodeResult<S> {
    /// No delta, routing deferred to edges.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            delta: None,
            route: None,
        }
    }

    #[must_use]
    pub fn with_delta(mut self, delta: S) -> Self {
        self.delta = Some(delta);
        self
    }

    #[must_use]
    pub fn with_route(mut self, route: Route) -> Self {
        self.route = Some(route);
        self
    }

    /// Terminate this branch.
    #[must_use]
    pub fn stop() -> Self {
        Self::empty().with_route(Route::Stop)
    }

    #[must_use]
    pub fn goto(target: impl Into<NodeId>) -> Self {
        Self::empty().with_route(Route::Goto(target.into()))
    }

    #[must_use]
    pub fn fan_out<I, T>(targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<NodeId>,
    {
        Self::empty().with_route(Route::Many(targets.into_iter().map(Into::into).collect()))
    }
}

/// Replay substitution handle shared by every attempt of a work item.
#[derive(Clone)]
pub(crate) struct ReplayHandle {
    pub log: Arc<ReplayLog>,
    pub strict: bool,
}

/// Execution context handed to a node for one attempt.
///
/// Cloneable; clones share the same RNG stream, event buffer, and recorder.
#[derive(Clone)]
pub struct NodeContext {
    run_id: RunId,
    step_id: StepId,
    node: NodeId,
    attempt: u32,
    rng: Arc<Mutex<DetRng>>,
    events: Arc<Mutex<Vec<EventRecord>>>,
    recorder: Option<Arc<IoRecorder>>,
    replay: Option<ReplayHandle>,
    replay_seq: Arc<AtomicU32>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("run_id", &self.run_id)
            .field("step_id", &self.step_id)
            .field("node", &self.node)
            .field("attempt", &self.attempt)
            .field("replaying", &self.replay.is_some())
            .finish_non_exhaustive()
    }
}

impl NodeContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: RunId,
        step_id: StepId,
        node: NodeId,
        attempt: u32,
        rng: Arc<Mutex<DetRng>>,
        recorder: Option<Arc<IoRecorder>>,
        replay: Option<ReplayHandle>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            step_id,
            node,
            attempt,
            rng,
            events: Arc::new(Mutex::new(Vec::new())),
            recorder,
            replay,
            replay_seq: Arc::new(AtomicU32::new(0)),
            cancel,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    #[must_use]
    pub fn step_id(&self) -> StepId {
        self.step_id
    }

    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    /// Zero-based attempt number of this execution.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the engine is substituting recorded I/O.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.replay.is_some()
    }

    /// Token observing run-level cancellation; long-running nodes should
    /// select against it.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Draw a raw 64-bit word from the work item's deterministic stream.
    pub fn rng_u64(&self) -> u64 {
        self.rng.lock().expect("rng lock").next_u64()
    }

    /// Draw an unbiased integer in `[0, n)` from the deterministic stream.
    pub fn rng_range(&self, n: u64) -> u64 {
        self.rng.lock().expect("rng lock").next_range(n)
    }

    /// Emit a node-scoped event. Buffered and persisted atomically with the
    /// step commit.
    pub fn emit(&self, scope: impl Into<String>, message: impl Into<String>) {
        let event = EventRecord::node_message(
            self.run_id.clone(),
            self.step_id,
            self.node.clone(),
            scope,
            message,
        );
        self.events.lock().expect("event buffer lock").push(event);
    }

    /// Perform an external interaction through the record/replay channel.
    ///
    /// Live execution: runs `live`, captures `(request digest, response)` if
    /// this node is recordable, and returns the response. Replay: looks up the
    /// recorded entry for `(step, node, attempt, seq)` and returns its
    /// response without running `live`; a digest mismatch or missing entry is
    /// a [`NodeError::ReplayMismatch`] in strict mode and a logged live
    /// fallback in lenient mode.
    pub async fn recorded_io<Req, F, Fut>(
        &self,
        request: &Req,
        live: F,
    ) -> Result<Value, NodeError>
    where
        Req: Serialize + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Value, NodeError>> + Send,
    {
        let request_digest = digest_value(request);

        if let Some(replay) = self.replay.clone() {
            let seq = self.replay_seq.fetch_add(1, Ordering::SeqCst);
            match replay.log.external(self.step_id, &self.node, self.attempt, seq) {
                Some(entry) if entry.request_digest == request_digest => {
                    return Ok(entry.response.clone());
                }
                Some(entry) => {
                    if replay.strict {
                        return Err(NodeError::ReplayMismatch(Box::new(Divergence {
                            step_id: self.step_id,
                            node: self.node.clone(),
                            attempt: self.attempt,
                            expected_output_hash: Some(entry.request_digest.clone()),
                            actual_output_hash: Some(request_digest),
                            expected_route: None,
                            actual_route: None,
                        })));
                    }
                    tracing::warn!(
                        node = %self.node,
                        step = self.step_id,
                        seq,
                        "lenient replay: request digest changed, executing live"
                    );
                }
                None => {
                    if replay.strict {
                        return Err(NodeError::ReplayMismatch(Box::new(Divergence {
                            step_id: self.step_id,
                            node: self.node.clone(),
                            attempt: self.attempt,
                            expected_output_hash: None,
                            actual_output_hash: Some(request_digest),
                            expected_route: None,
                            actual_route: None,
                        })));
                    }
                    tracing::warn!(
                        node = %self.node,
                        step = self.step_id,
                        seq,
                        "lenient replay: no recorded entry, executing live"
                    );
                }
            }
        }

        let started = Instant::now();
        let response = live().await?;
        if let Some(recorder) = &self.recorder {
            let seq = recorder.next_seq();
            recorder.capture(
                seq,
                request_digest,
                response.clone(),
                started.elapsed().as_millis() as u64,
            );
        }
        Ok(response)
    }

    /// Drain events emitted through this context (engine-internal).
    pub(crate) fn drain_events(&self) -> Vec<EventRecord> {
        std::mem::take(&mut *self.events.lock().expect("event buffer lock"))
    }
}

/// Errors raised by node execution.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// Expected input data is missing from the state snapshot.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(treadle::node::missing_input),
        help("Check that an upstream node produced `{what}` before this node runs.")
    )]
    MissingInput { what: &'static str },

    /// External provider or service failure. Retryable by default.
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(treadle::node::provider))]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// One attempt exceeded its timeout. Retryable by default.
    #[error("node attempt timed out after {elapsed:?}")]
    #[diagnostic(
        code(treadle::node::timeout),
        help("Raise the node's timeout or the run's default_node_timeout.")
    )]
    Timeout { elapsed: Duration },

    /// Input validation failed. Not retryable.
    #[error("validation failed: {0}")]
    #[diagnostic(code(treadle::node::validation))]
    ValidationFailed(String),

    /// JSON serialization error.
    #[error(transparent)]
    #[diagnostic(code(treadle::node::serde_json))]
    Serde(#[from] serde_json::Error),

    /// The run's cancellation token fired during this attempt.
    #[error("node execution canceled")]
    #[diagnostic(code(treadle::node::canceled))]
    Canceled,

    /// Strict replay observed a divergence from the recorded execution.
    #[error("replay mismatch at step {} node {}", .0.step_id, .0.node)]
    #[diagnostic(
        code(treadle::node::replay_mismatch),
        help("The node implementation or its inputs changed since recording.")
    )]
    ReplayMismatch(Box<Divergence>),

    /// Any other node failure.
    #[error("node error: {0}")]
    #[diagnostic(code(treadle::node::other))]
    Other(String),
}

impl NodeError {
    /// Default retryability classification: transient externals retry,
    /// logic and replay failures do not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Provider { .. } | NodeError::Timeout { .. })
    }
}
