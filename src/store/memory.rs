//! Volatile in-process store for tests and ephemeral runs.
//!
//! A single `RwLock` over all tables makes `save_checkpoint` trivially
//! atomic: the idempotency check and every insert happen under one write
//! guard, so concurrent committers of the same step serialize and exactly one
//! wins.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{CheckpointStore, Result, StoreError};
use crate::checkpoint::Checkpoint;
use crate::events::EventRecord;
use crate::types::{NodeId, RunId, StepId};

struct OutboxRow {
    event: EventRecord,
    emitted: bool,
}

struct Inner<S> {
    // BTreeMap keyed by step id gives "latest" lookups for free and keeps
    // out-of-order save_step arrivals harmless.
    steps: FxHashMap<RunId, BTreeMap<StepId, (NodeId, S)>>,
    checkpoints: FxHashMap<RunId, BTreeMap<StepId, Checkpoint<S>>>,
    idempotency: FxHashMap<String, (RunId, StepId)>,
    outbox: Vec<OutboxRow>,
}

impl<S> Default for Inner<S> {
    fn default() -> Self {
        Self {
            steps: FxHashMap::default(),
            checkpoints: FxHashMap::default(),
            idempotency: FxHashMap::default(),
            outbox: Vec::new(),
        }
    }
}

/// In-memory [`CheckpointStore`] implementation.
pub struct InMemoryStore<S> {
    inner: RwLock<Inner<S>>,
}

impl<S> Default for InMemoryStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> InMemoryStore<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner<S>>> {
        self.inner.read().map_err(|e| StoreError::Backend {
            message: format!("lock poisoned: {e}"),
        })
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner<S>>> {
        self.inner.write().map_err(|e| StoreError::Backend {
            message: format!("lock poisoned: {e}"),
        })
    }
}

#[async_trait]
impl<S> CheckpointStore<S> for InMemoryStore<S>
where
    S: Clone + Send + Sync + 'static,
{
    async fn save_step(
        &self,
        run_id: &RunId,
        step_id: StepId,
        node: &NodeId,
        state: &S,
    ) -> Result<()> {
        let mut inner = self.write()?;
        inner
            .steps
            .entry(run_id.clone())
            .or_default()
            .insert(step_id, (node.clone(), state.clone()));
        Ok(())
    }

    async fn load_latest(&self, run_id: &RunId) -> Result<(S, StepId)> {
        let inner = self.read()?;
        inner
            .steps
            .get(run_id)
            .and_then(|steps| steps.last_key_value())
            .map(|(step_id, (_, state))| (state.clone(), *step_id))
            .ok_or_else(|| StoreError::NotFound {
                run_id: run_id.clone(),
                step_id: None,
            })
    }

    async fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint<S>,
        events: &[EventRecord],
    ) -> Result<()> {
        let mut inner = self.write()?;
        if inner.idempotency.contains_key(&checkpoint.idempotency_key) {
            return Err(StoreError::IdempotencyViolation {
                key: checkpoint.idempotency_key.clone(),
            });
        }
        inner.idempotency.insert(
            checkpoint.idempotency_key.clone(),
            (checkpoint.run_id.clone(), checkpoint.step_id),
        );
        inner
            .checkpoints
            .entry(checkpoint.run_id.clone())
            .or_default()
            .insert(checkpoint.step_id, checkpoint.clone());
        for event in events {
            inner.outbox.push(OutboxRow {
                event: event.clone(),
                emitted: false,
            });
        }
        Ok(())
    }

    async fn load_checkpoint(&self, run_id: &RunId, step_id: StepId) -> Result<Checkpoint<S>> {
        let inner = self.read()?;
        inner
            .checkpoints
            .get(run_id)
            .and_then(|steps| steps.get(&step_id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                run_id: run_id.clone(),
                step_id: Some(step_id),
            })
    }

    async fn latest_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint<S>>> {
        let inner = self.read()?;
        Ok(inner
            .checkpoints
            .get(run_id)
            .and_then(|steps| steps.last_key_value())
            .map(|(_, cp)| cp.clone()))
    }

    async fn check_idempotency(&self, key: &str) -> Result<bool> {
        Ok(self.read()?.idempotency.contains_key(key))
    }

    async fn pending_events(&self, limit: usize) -> Result<Vec<EventRecord>> {
        let inner = self.read()?;
        Ok(inner
            .outbox
            .iter()
            .filter(|row| !row.emitted)
            .take(limit)
            .map(|row| row.event.clone())
            .collect())
    }

    async fn mark_events_emitted(&self, event_ids: &[String]) -> Result<()> {
        let mut inner = self.write()?;
        for row in &mut inner.outbox {
            if event_ids.contains(&row.event.event_id) {
                row.emitted = true;
            }
        }
        Ok(())
    }

    async fn list_runs(&self) -> Result<Vec<RunId>> {
        let inner = self.read()?;
        let mut runs: Vec<RunId> = inner
            .checkpoints
            .keys()
            .chain(inner.steps.keys())
            .cloned()
            .collect();
        runs.sort();
        runs.dedup();
        Ok(runs)
    }
}
