//! The frontier: a bounded, order-keyed queue of pending work items.
//!
//! A min-heap ordered by `(order key, step, provenance)` gives the scheduler a
//! canonical dequeue order regardless of which worker asks first. Capacity is
//! bounded: a full frontier blocks producers (backpressure) rather than
//! dropping items, and a blocked producer gives up only after the configured
//! backpressure timeout — a distinguished, resumable failure.
//!
//! Dispatch is gated by a **watermark**: `dequeue` only surfaces items whose
//! step is at or below the released step. Successors are enqueued before their
//! parent step commits, but workers cannot touch them until the coordinator
//! releases the next step, which is what keeps execution from running ahead of
//! durable progress.

use miette::Diagnostic;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::WorkItem;
use crate::types::StepId;

/// Failures surfaced by frontier operations.
#[derive(Debug, Error, Diagnostic)]
pub enum FrontierError {
    /// The frontier stayed full past the backpressure timeout.
    #[error("frontier full: enqueue blocked past the backpressure timeout")]
    #[diagnostic(
        code(treadle::frontier::backpressure),
        help("Raise queue_depth or backpressure_timeout, or reduce fan-out width.")
    )]
    BackpressureTimeout,

    /// The run's cancellation token fired while blocked.
    #[error("frontier operation canceled")]
    #[diagnostic(code(treadle::frontier::canceled))]
    Canceled,

    /// The frontier was closed by the coordinator.
    #[error("frontier closed")]
    #[diagnostic(code(treadle::frontier::closed))]
    Closed,
}

struct Entry<S>(WorkItem<S>);

impl<S> PartialEq for Entry<S> {
    fn eq(&self, other: &Self) -> bool {
        self.0.canonical_cmp(&other.0) == std::cmp::Ordering::Equal
    }
}

impl<S> Eq for Entry<S> {}

impl<S> PartialOrd for Entry<S> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for Entry<S> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.canonical_cmp(&other.0)
    }
}

struct Inner<S> {
    heap: BinaryHeap<Reverse<Entry<S>>>,
    released: StepId,
    closed: bool,
}

/// Bounded priority queue of pending work items.
pub struct Frontier<S> {
    inner: Mutex<Inner<S>>,
    space: Semaphore,
    available: Notify,
    capacity: usize,
}

impl<S> Frontier<S> {
    /// Create a frontier holding at most `capacity` items. The watermark
    /// starts at 0, so nothing is dispatchable until [`release`](Self::release).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                released: 0,
                closed: false,
            }),
            space: Semaphore::new(capacity),
            available: Notify::new(),
            capacity,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued item count (dispatchable or not).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("frontier lock").heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert an item, blocking while the frontier is full.
    ///
    /// Returns [`FrontierError::BackpressureTimeout`] if no space opened up
    /// within `timeout`, and [`FrontierError::Canceled`] if the token fired
    /// first. A full frontier never drops items.
    pub async fn enqueue(
        &self,
        item: WorkItem<S>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), FrontierError> {
        let permit = tokio::select! {
            permit = self.space.acquire() => permit.map_err(|_| FrontierError::Closed)?,
            _ = tokio::time::sleep(timeout) => return Err(FrontierError::BackpressureTimeout),
            _ = cancel.cancelled() => return Err(FrontierError::Canceled),
        };
        permit.forget();
        {
            let mut inner = self.inner.lock().expect("frontier lock");
            if inner.closed {
                return Err(FrontierError::Closed);
            }
            inner.heap.push(Reverse(Entry(item)));
        }
        self.available.notify_one();
        Ok(())
    }

    /// Remove and return the minimum dispatchable item, waiting until one
    /// becomes available. Returns `Ok(None)` once the frontier is closed.
    pub async fn dequeue(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<WorkItem<S>>, FrontierError> {
        loop {
            let notified = self.available.notified();
            {
                let mut inner = self.inner.lock().expect("frontier lock");
                if inner.closed {
                    return Ok(None);
                }
                let dispatchable = inner
                    .heap
                    .peek()
                    .is_some_and(|Reverse(entry)| entry.0.step_id <= inner.released);
                if dispatchable {
                    let Reverse(entry) = inner.heap.pop().expect("peeked entry");
                    let more = inner
                        .heap
                        .peek()
                        .is_some_and(|Reverse(next)| next.0.step_id <= inner.released);
                    drop(inner);
                    self.space.add_permits(1);
                    if more {
                        // Chain the wakeup so sibling workers see the rest of
                        // the batch.
                        self.available.notify_one();
                    }
                    return Ok(Some(entry.0));
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(FrontierError::Canceled),
            }
        }
    }

    /// Raise the dispatch watermark: items with `step_id <= step` become
    /// dispatchable.
    pub fn release(&self, step: StepId) {
        {
            let mut inner = self.inner.lock().expect("frontier lock");
            inner.released = inner.released.max(step);
        }
        self.available.notify_waiters();
        // Cover the no-waiter case: store one permit for the next dequeue.
        self.available.notify_one();
    }

    /// Close the frontier; blocked and future dequeues observe `None`.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().expect("frontier lock");
            inner.closed = true;
        }
        self.space.close();
        self.available.notify_waiters();
        self.available.notify_one();
    }
}

impl<S: Clone> Frontier<S> {
    /// Point-in-time copy of every queued item, canonically sorted. Taken
    /// under the internal lock, so it never interleaves with a concurrent
    /// enqueue or dequeue.
    #[must_use]
    pub fn snapshot(&self) -> Vec<WorkItem<S>> {
        let inner = self.inner.lock().expect("frontier lock");
        let mut items: Vec<WorkItem<S>> = inner
            .heap
            .iter()
            .map(|Reverse(entry)| entry.0.clone())
            .collect();
        crate::checkpoint::sort_frontier(&mut items);
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    fn item(step: StepId, parent: &str, edge: u32) -> WorkItem<u8> {
        WorkItem::successor(step, NodeId::from(parent), edge, NodeId::from("n"), 0)
    }

    #[tokio::test]
    async fn dequeues_in_order_key_order() {
        let frontier = Frontier::new(8);
        let cancel = CancellationToken::new();
        let timeout = Duration::from_millis(100);
        for edge in [2u32, 0, 1] {
            frontier
                .enqueue(item(1, "p", edge), timeout, &cancel)
                .await
                .unwrap();
        }
        frontier.release(1);
        let mut keys = Vec::new();
        for _ in 0..3 {
            keys.push(frontier.dequeue(&cancel).await.unwrap().unwrap().order_key);
        }
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[tokio::test]
    async fn watermark_gates_dispatch() {
        let frontier = Frontier::new(4);
        let cancel = CancellationToken::new();
        frontier
            .enqueue(item(2, "p", 0), Duration::from_millis(50), &cancel)
            .await
            .unwrap();
        frontier.release(1);
        let waited =
            tokio::time::timeout(Duration::from_millis(50), frontier.dequeue(&cancel)).await;
        assert!(waited.is_err(), "step-2 item must stay gated");
        frontier.release(2);
        let got = frontier.dequeue(&cancel).await.unwrap().unwrap();
        assert_eq!(got.step_id, 2);
    }

    #[tokio::test]
    async fn full_frontier_times_out_without_dropping() {
        let frontier = Frontier::new(2);
        let cancel = CancellationToken::new();
        let timeout = Duration::from_millis(30);
        frontier
            .enqueue(item(1, "p", 0), timeout, &cancel)
            .await
            .unwrap();
        frontier
            .enqueue(item(1, "p", 1), timeout, &cancel)
            .await
            .unwrap();
        let res = frontier.enqueue(item(1, "p", 2), timeout, &cancel).await;
        assert!(matches!(res, Err(FrontierError::BackpressureTimeout)));
        assert_eq!(frontier.len(), 2);
    }

    #[tokio::test]
    async fn snapshot_is_sorted_and_complete() {
        let frontier = Frontier::new(8);
        let cancel = CancellationToken::new();
        for edge in [3u32, 1, 2, 0] {
            frontier
                .enqueue(item(1, "p", edge), Duration::from_millis(50), &cancel)
                .await
                .unwrap();
        }
        let snap = frontier.snapshot();
        assert_eq!(snap.len(), 4);
        for pair in snap.windows(2) {
            assert!(pair[0].canonical_cmp(&pair[1]).is_le());
        }
    }

    #[tokio::test]
    async fn close_wakes_blocked_dequeuers() {
        let frontier = std::sync::Arc::new(Frontier::<u8>::new(2));
        let cancel = CancellationToken::new();
        let waiter = {
            let frontier = frontier.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { frontier.dequeue(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        frontier.close();
        let res = waiter.await.unwrap().unwrap();
        assert!(res.is_none());
    }
}
