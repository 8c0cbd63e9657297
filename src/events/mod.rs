//! Observability events and the transactional outbox contract.
//!
//! Every notable moment of a run — node lifecycle, retries, step commits,
//! terminal outcomes, plus anything user nodes emit through their context —
//! becomes an [`EventRecord`]. Records are buffered during a step and written
//! to the store's outbox *in the same atomic commit* as the checkpoint, so an
//! observer never sees an event for a step that did not commit. A separate
//! [`OutboxPump`](crate::events::OutboxPump) drains pending events to
//! [`EventSink`](crate::events::EventSink)s and marks them emitted.
//!
//! Event ids are random (UUIDv4); they identify rows for outbox bookkeeping
//! and never feed any digest, so they do not disturb determinism.

mod outbox;
mod sink;

pub use outbox::OutboxPump;
pub use sink::{ChannelSink, EventSink, MemorySink, SinkError, StdOutSink};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::{NodeId, RunId, StepId};

/// Category of an observability event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A worker began executing a node attempt.
    NodeStarted,
    /// A node attempt finished successfully.
    NodeCompleted,
    /// A node attempt failed retryably; payload carries the backoff delay.
    NodeRetried,
    /// Free-form message emitted by a node through its context.
    NodeMessage,
    /// A step merged and committed; payload carries the canonical merge order.
    StepCommitted,
    /// The run reached normal termination.
    RunCompleted,
    /// The run halted resumably (backpressure or budget exhaustion).
    RunStalled,
    /// Engine diagnostic not tied to a single node.
    Diagnostic,
}

/// Append-only observability record written to the store outbox.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub run_id: RunId,
    pub step_id: StepId,
    pub node: Option<NodeId>,
    pub kind: EventKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(
        run_id: RunId,
        step_id: StepId,
        node: Option<NodeId>,
        kind: EventKind,
        payload: Value,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            run_id,
            step_id,
            node,
            kind,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Scoped message emitted by a node through [`NodeContext::emit`].
    ///
    /// [`NodeContext::emit`]: crate::node::NodeContext::emit
    pub fn node_message(
        run_id: RunId,
        step_id: StepId,
        node: NodeId,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            run_id,
            step_id,
            Some(node),
            EventKind::NodeMessage,
            json!({ "scope": scope.into(), "message": message.into() }),
        )
    }

    pub fn diagnostic(
        run_id: RunId,
        step_id: StepId,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            run_id,
            step_id,
            None,
            EventKind::Diagnostic,
            json!({ "scope": scope.into(), "message": message.into() }),
        )
    }

    /// Compact single-line rendering used by the stdout sink.
    #[must_use]
    pub fn render_line(&self) -> String {
        let node = self
            .node
            .as_ref()
            .map(|n| format!(" node={n}"))
            .unwrap_or_default();
        format!(
            "[{}] run={} step={}{} {:?} {}",
            self.created_at.to_rfc3339(),
            self.run_id,
            self.step_id,
            node,
            self.kind,
            self.payload
        )
    }
}
