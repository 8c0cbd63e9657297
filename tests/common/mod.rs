//! Shared fixtures: counter states, reducers, and test nodes.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use treadle::prelude::*;

/// Reducer for counter workflows: `count` adds, every other key overwrites.
pub fn sum_counts(mut acc: JsonState, delta: JsonState) -> JsonState {
    let mut merged_count = acc.get_i64("count");
    for (key, value) in delta.iter() {
        if key == "count" {
            merged_count += value.as_i64().unwrap_or(0);
        } else {
            acc.insert(key.clone(), value.clone());
        }
    }
    acc.insert("count", json!(merged_count));
    acc
}

/// Counter state with `count = n`.
pub fn counter(n: i64) -> JsonState {
    JsonState::new().with("count", json!(n))
}

/// Adds 1 to `count`, routing back to itself while `count < limit`, then
/// stopping.
pub struct LoopingInc {
    pub id: &'static str,
    pub limit: i64,
}

#[async_trait]
impl Node<JsonState> for LoopingInc {
    async fn run(
        &self,
        _ctx: NodeContext,
        state: JsonState,
    ) -> Result<NodeResult<JsonState>, NodeError> {
        let count = state.get_i64("count") + 1;
        let delta = counter(1);
        let result = if count < self.limit {
            NodeResult::goto(self.id).with_delta(delta)
        } else {
            NodeResult::stop().with_delta(delta)
        };
        Ok(result)
    }

    fn policy(&self) -> NodePolicy<JsonState> {
        NodePolicy::default().stops()
    }
}

/// Adds a fixed amount to `count` and stops.
pub struct AddAndStop {
    pub amount: i64,
}

#[async_trait]
impl Node<JsonState> for AddAndStop {
    async fn run(
        &self,
        _ctx: NodeContext,
        _state: JsonState,
    ) -> Result<NodeResult<JsonState>, NodeError> {
        Ok(NodeResult::stop().with_delta(counter(self.amount)))
    }

    fn policy(&self) -> NodePolicy<JsonState> {
        NodePolicy::default().stops()
    }
}

/// Adds a fixed amount after sleeping a deterministic-RNG-chosen duration, to
/// randomize completion order across siblings.
pub struct JitteredAdd {
    pub amount: i64,
}

#[async_trait]
impl Node<JsonState> for JitteredAdd {
    async fn run(
        &self,
        ctx: NodeContext,
        _state: JsonState,
    ) -> Result<NodeResult<JsonState>, NodeError> {
        let pause_ms = ctx.rng_range(15);
        tokio::time::sleep(std::time::Duration::from_millis(pause_ms)).await;
        Ok(NodeResult::stop().with_delta(counter(self.amount)))
    }

    fn policy(&self) -> NodePolicy<JsonState> {
        NodePolicy::default().stops()
    }
}

/// Fans out to the given targets.
pub struct FanOut {
    pub targets: Vec<NodeId>,
}

#[async_trait]
impl Node<JsonState> for FanOut {
    async fn run(
        &self,
        _ctx: NodeContext,
        _state: JsonState,
    ) -> Result<NodeResult<JsonState>, NodeError> {
        Ok(NodeResult::fan_out(self.targets.clone()))
    }

    fn policy(&self) -> NodePolicy<JsonState> {
        NodePolicy::default().stops()
    }
}

/// Fails with a retryable provider error until the configured attempt, then
/// adds 1 and stops.
pub struct FlakyAdd {
    pub succeed_at_attempt: u32,
}

#[async_trait]
impl Node<JsonState> for FlakyAdd {
    async fn run(
        &self,
        ctx: NodeContext,
        _state: JsonState,
    ) -> Result<NodeResult<JsonState>, NodeError> {
        if ctx.attempt() < self.succeed_at_attempt {
            return Err(NodeError::Provider {
                provider: "flaky",
                message: format!("transient failure on attempt {}", ctx.attempt()),
            });
        }
        Ok(NodeResult::stop().with_delta(counter(1)))
    }

    fn policy(&self) -> NodePolicy<JsonState> {
        NodePolicy::default()
            .stops()
            .with_retry(
                RetryPolicy::attempts(3).with_delays(
                    std::time::Duration::from_millis(10),
                    std::time::Duration::from_millis(100),
                ),
            )
    }
}

/// Recordable node: fetches a value through the record/replay channel and
/// writes it into the state under `fetched.<step>`.
pub struct FetchingNode {
    /// The "external world" answered by live executions.
    pub live_value: Arc<dyn Fn() -> Value + Send + Sync>,
    pub route_to: Option<NodeId>,
}

impl FetchingNode {
    pub fn constant(value: Value, route_to: Option<NodeId>) -> Self {
        Self {
            live_value: Arc::new(move || value.clone()),
            route_to,
        }
    }
}

#[async_trait]
impl Node<JsonState> for FetchingNode {
    async fn run(
        &self,
        ctx: NodeContext,
        state: JsonState,
    ) -> Result<NodeResult<JsonState>, NodeError> {
        let request = json!({ "query": "value", "count": state.get_i64("count") });
        let live = self.live_value.clone();
        let response = ctx
            .recorded_io(&request, move || async move { Ok(live()) })
            .await?;
        let delta = JsonState::new()
            .with(format!("fetched.{}", ctx.step_id()), response)
            .with("count", json!(1));
        let result = match &self.route_to {
            Some(target) => NodeResult::goto(target.clone()).with_delta(delta),
            None => NodeResult::stop().with_delta(delta),
        };
        Ok(result)
    }

    fn policy(&self) -> NodePolicy<JsonState> {
        NodePolicy::default().stops().recordable()
    }
}

/// Node that sleeps far longer than any sane timeout.
pub struct SlowNode;

#[async_trait]
impl Node<JsonState> for SlowNode {
    async fn run(
        &self,
        _ctx: NodeContext,
        _state: JsonState,
    ) -> Result<NodeResult<JsonState>, NodeError> {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        Ok(NodeResult::stop())
    }

    fn policy(&self) -> NodePolicy<JsonState> {
        NodePolicy::default().stops()
    }
}

/// Node with no explicit route; relies entirely on topology edges.
pub struct EdgeRouted {
    pub amount: i64,
}

#[async_trait]
impl Node<JsonState> for EdgeRouted {
    async fn run(
        &self,
        _ctx: NodeContext,
        _state: JsonState,
    ) -> Result<NodeResult<JsonState>, NodeError> {
        Ok(NodeResult::empty().with_delta(counter(self.amount)))
    }
}

/// Sequence of `merged` node lists from StepCommitted events, in step order.
pub fn merge_trace(events: &[treadle::events::EventRecord]) -> Vec<(u64, Vec<String>)> {
    let mut trace: Vec<(u64, Vec<String>)> = events
        .iter()
        .filter(|e| matches!(e.kind, treadle::events::EventKind::StepCommitted))
        .map(|e| {
            let merged = e.payload["merged"]
                .as_array()
                .map(|nodes| {
                    nodes
                        .iter()
                        .filter_map(|n| n.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            (e.step_id, merged)
        })
        .collect();
    trace.sort_by_key(|(step, _)| *step);
    trace
}

/// Drain every pending event out of a store.
pub async fn drain_events(
    store: &Arc<InMemoryStore<JsonState>>,
) -> Vec<treadle::events::EventRecord> {
    let store: Arc<dyn CheckpointStore<JsonState>> = store.clone();
    store.pending_events(10_000).await.expect("pending events")
}
