//! The checkpoint store contract and its implementations.
//!
//! Persistence is an external collaborator; the engine only speaks to the
//! [`CheckpointStore`] trait. The load-bearing operation is
//! [`save_checkpoint`](CheckpointStore::save_checkpoint): an **atomic**,
//! **idempotent** commit of the checkpoint, its idempotency key, and the
//! step's buffered outbox events. If it returns success, everything is
//! durable; if it returns any failure, nothing is visible. A crash between
//! call and return is indistinguishable from failure — the caller retries
//! with the same content-derived key, and the second call either observes
//! [`StoreError::IdempotencyViolation`] (the first commit landed) or commits
//! for the first time. Either way, exactly one commit.
//!
//! Implementations here: [`InMemoryStore`] (volatile, for tests and ephemeral
//! runs) and, behind the default-on `sqlite` feature, [`SqliteStore`]
//! (durable, sqlx-backed). Any other backend must pass the shared contract
//! suite in `tests/store_contract.rs`.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::checkpoint::Checkpoint;
use crate::events::EventRecord;
use crate::types::{NodeId, RunId, StepId};

/// Failures surfaced by store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    /// The requested run or step does not exist.
    #[error("not found: run {run_id}, step {step_id:?}")]
    #[diagnostic(code(treadle::store::not_found))]
    NotFound {
        run_id: RunId,
        step_id: Option<StepId>,
    },

    /// A commit reused an idempotency key: the step is already durable.
    /// Callers treat this as success for the same logical step.
    #[error("idempotency violation: key {key} already committed")]
    #[diagnostic(
        code(treadle::store::idempotency_violation),
        help("The step already committed; resume from its checkpoint instead of re-committing.")
    )]
    IdempotencyViolation { key: String },

    /// Backend failure (database, filesystem, lock poisoning). Possibly
    /// transient.
    #[error("store backend error: {message}")]
    #[diagnostic(code(treadle::store::backend))]
    Backend { message: String },

    /// Serialization or deserialization of persisted payloads failed.
    #[error("store codec error: {message}")]
    #[diagnostic(code(treadle::store::codec))]
    Codec { message: String },
}

impl StoreError {
    /// Whether the scheduler's commit loop should retry this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec {
            message: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable, atomic, idempotent persistence of checkpoints and the event
/// outbox.
///
/// All implementations must be `Send + Sync` and internally thread-safe; the
/// scheduler issues at most one `save_checkpoint` call per step but tests may
/// hammer the same step from many tasks.
#[async_trait]
pub trait CheckpointStore<S>: Send + Sync {
    /// Persist a cheap per-step state record. Redundant with
    /// `save_checkpoint` but sufficient for simple recovery via
    /// [`load_latest`](Self::load_latest).
    async fn save_step(
        &self,
        run_id: &RunId,
        step_id: StepId,
        node: &NodeId,
        state: &S,
    ) -> Result<()>;

    /// State of the highest committed step record, regardless of the order
    /// `save_step` calls arrived in. [`StoreError::NotFound`] when the run has
    /// none.
    async fn load_latest(&self, run_id: &RunId) -> Result<(S, StepId)>;

    /// Atomic commit of one step: checkpoint + idempotency key + buffered
    /// outbox events, all or nothing. Rejects a reused idempotency key with
    /// [`StoreError::IdempotencyViolation`] and leaves no trace on any
    /// failure.
    async fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint<S>,
        events: &[EventRecord],
    ) -> Result<()>;

    /// Precise step lookup. [`StoreError::NotFound`] when absent.
    async fn load_checkpoint(&self, run_id: &RunId, step_id: StepId) -> Result<Checkpoint<S>>;

    /// Most recent checkpoint of a run, or `None` for an unknown run. The
    /// probing API used by resume.
    async fn latest_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint<S>>>;

    /// Cheap existence check for an idempotency key.
    async fn check_idempotency(&self, key: &str) -> Result<bool>;

    /// Outbox events written but not yet marked emitted, oldest first.
    async fn pending_events(&self, limit: usize) -> Result<Vec<EventRecord>>;

    /// Mark a batch of events as delivered.
    async fn mark_events_emitted(&self, event_ids: &[String]) -> Result<()>;

    /// All run ids known to this store.
    async fn list_runs(&self) -> Result<Vec<RunId>>;
}
