//! Recorded I/O: capture of external interactions and node outcomes.
//!
//! Nodes declared recordable perform their external calls through
//! [`NodeContext::recorded_io`](crate::node::NodeContext::recorded_io). Outside
//! replay, the engine captures each call's request digest, response payload,
//! and response hash. The scheduler additionally records one *outcome* entry
//! per successful node execution — the digest of its `(delta, route)` pair —
//! which is what replay verifies step by step.
//!
//! Entries are keyed `(step, node, attempt, seq)`. The step id is part of the
//! key because a node may execute at many steps of the same run (loops); `seq`
//! distinguishes multiple calls within one attempt.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::types::{NodeId, Route, StepId};

/// What a recorded entry describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoKind {
    /// An external interaction performed through the recorder.
    External,
    /// The outcome of one node execution: delta/route digest for replay
    /// verification.
    Outcome,
}

/// One captured interaction or outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordedIo {
    pub step_id: StepId,
    pub node: NodeId,
    pub attempt: u32,
    pub seq: u32,
    pub kind: IoKind,
    /// Hex SHA-256 of the canonical request bytes (`External`) or of the input
    /// state snapshot (`Outcome`).
    pub request_digest: String,
    /// Response payload (`External`) or encoded route (`Outcome`).
    pub response: Value,
    /// Hex SHA-256 of the response (`External`) or of `(delta, route)`
    /// (`Outcome`).
    pub output_hash: String,
    /// Route returned by the node; present on `Outcome` entries.
    pub route: Option<Route>,
    pub recorded_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Hex SHA-256 of a serde-serializable value's JSON bytes.
///
/// Serialization through `serde_json` is canonical for sorted-map state types;
/// callers with unordered maps must ensure their own serialization is stable.
pub fn digest_value<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    digest_bytes(&bytes)
}

/// Hex SHA-256 of raw bytes.
#[must_use]
pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digest of a node execution's observable output: delta JSON, a separator,
/// then the encoded route.
pub fn outcome_hash<S: Serialize>(delta: &Option<S>, route: &Option<Route>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(delta).unwrap_or_default());
    hasher.update([0u8]);
    match route {
        Some(r) => hasher.update(r.encode().as_bytes()),
        None => hasher.update(b"<edges>"),
    }
    hex::encode(hasher.finalize())
}

/// Per-attempt capture buffer handed to a recordable node's context.
#[derive(Debug)]
pub struct IoRecorder {
    step_id: StepId,
    node: NodeId,
    attempt: u32,
    seq: AtomicU32,
    captured: Mutex<Vec<RecordedIo>>,
}

impl IoRecorder {
    #[must_use]
    pub fn new(step_id: StepId, node: NodeId, attempt: u32) -> Self {
        Self {
            step_id,
            node,
            attempt,
            seq: AtomicU32::new(0),
            captured: Mutex::new(Vec::new()),
        }
    }

    /// Reserve the next sequence number within this attempt.
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Capture one external interaction.
    pub fn capture(
        &self,
        seq: u32,
        request_digest: String,
        response: Value,
        duration_ms: u64,
    ) {
        let output_hash = digest_value(&response);
        let entry = RecordedIo {
            step_id: self.step_id,
            node: self.node.clone(),
            attempt: self.attempt,
            seq,
            kind: IoKind::External,
            request_digest,
            response,
            output_hash,
            route: None,
            recorded_at: Utc::now(),
            duration_ms,
        };
        self.captured.lock().expect("recorder lock").push(entry);
    }

    /// Drain everything captured by this attempt.
    #[must_use]
    pub fn drain(&self) -> Vec<RecordedIo> {
        std::mem::take(&mut *self.captured.lock().expect("recorder lock"))
    }
}

type ExternalKey = (StepId, NodeId, u32, u32);
type OutcomeKey = (StepId, NodeId);

/// Indexed view over a checkpoint's cumulative recorded I/O, used in replay.
#[derive(Debug, Default)]
pub struct ReplayLog {
    externals: FxHashMap<ExternalKey, RecordedIo>,
    outcomes: FxHashMap<OutcomeKey, RecordedIo>,
}

impl ReplayLog {
    #[must_use]
    pub fn from_entries(entries: &[RecordedIo]) -> Self {
        let mut log = Self::default();
        for entry in entries {
            match entry.kind {
                IoKind::External => {
                    log.externals.insert(
                        (entry.step_id, entry.node.clone(), entry.attempt, entry.seq),
                        entry.clone(),
                    );
                }
                IoKind::Outcome => {
                    // Last write wins; the final attempt's outcome is the one
                    // the step committed.
                    log.outcomes
                        .insert((entry.step_id, entry.node.clone()), entry.clone());
                }
            }
        }
        log
    }

    #[must_use]
    pub fn external(
        &self,
        step_id: StepId,
        node: &NodeId,
        attempt: u32,
        seq: u32,
    ) -> Option<&RecordedIo> {
        self.externals
            .get(&(step_id, node.clone(), attempt, seq))
    }

    #[must_use]
    pub fn outcome(&self, step_id: StepId, node: &NodeId) -> Option<&RecordedIo> {
        self.outcomes.get(&(step_id, node.clone()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.externals.is_empty() && self.outcomes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn digests_are_stable() {
        assert_eq!(digest_value(&json!({"a": 1})), digest_value(&json!({"a": 1})));
        assert_ne!(digest_value(&json!({"a": 1})), digest_value(&json!({"a": 2})));
    }

    #[test]
    fn outcome_hash_depends_on_route() {
        let delta = Some(json!({"count": 1}));
        let goto = outcome_hash(&delta, &Some(Route::Goto("x".into())));
        let stop = outcome_hash(&delta, &Some(Route::Stop));
        assert_ne!(goto, stop);
    }

    #[test]
    fn recorder_drains_in_capture_order() {
        let rec = IoRecorder::new(2, "n".into(), 0);
        let s0 = rec.next_seq();
        let s1 = rec.next_seq();
        rec.capture(s0, "d0".into(), json!(0), 1);
        rec.capture(s1, "d1".into(), json!(1), 1);
        let drained = rec.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].seq, 0);
        assert_eq!(drained[1].seq, 1);
        assert!(rec.drain().is_empty());
    }

    #[test]
    fn replay_log_indexes_by_step_and_seq() {
        let rec = IoRecorder::new(1, "n".into(), 0);
        rec.capture(rec.next_seq(), "d".into(), json!("resp"), 3);
        let entries = rec.drain();
        let log = ReplayLog::from_entries(&entries);
        assert!(log.external(1, &"n".into(), 0, 0).is_some());
        assert!(log.external(2, &"n".into(), 0, 0).is_none());
    }
}
