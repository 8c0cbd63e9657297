//! Asynchronous draining of the store outbox into event sinks.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::sink::EventSink;
use crate::store::{CheckpointStore, StoreError};

const DEFAULT_BATCH: usize = 64;

/// Drains `pending_events` batches to a set of sinks and marks them emitted.
///
/// Delivery is at-least-once: events are marked only after every sink
/// accepted the batch, so a sink failure leaves them pending for the next
/// drain.
pub struct OutboxPump<S> {
    store: Arc<dyn CheckpointStore<S>>,
    sinks: Vec<Box<dyn EventSink>>,
    batch_size: usize,
}

impl<S> OutboxPump<S> {
    pub fn new(store: Arc<dyn CheckpointStore<S>>, sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self {
            store,
            sinks,
            batch_size: DEFAULT_BATCH,
        }
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Drain one batch. Returns how many events were delivered and marked.
    pub async fn drain_once(&self) -> Result<usize, StoreError> {
        let pending = self.store.pending_events(self.batch_size).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        for sink in &self.sinks {
            if let Err(e) = sink.emit_batch(&pending) {
                warn!(error = %e, "event sink rejected batch; leaving events pending");
                return Ok(0);
            }
        }

        let ids: Vec<String> = pending.iter().map(|e| e.event_id.clone()).collect();
        self.store.mark_events_emitted(&ids).await?;
        debug!(count = ids.len(), "outbox batch emitted");
        Ok(ids.len())
    }

    /// Poll-drain until the token fires, then make a final pass and flush.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        loop {
            match self.drain_once().await {
                Ok(0) => {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                Ok(_) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "outbox drain failed; backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }
        // Final sweep so shutdown does not strand delivered-but-unmarked rows.
        let _ = self.drain_once().await;
        for sink in &self.sinks {
            let _ = sink.flush();
        }
    }
}
