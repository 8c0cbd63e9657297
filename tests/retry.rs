//! Retry behavior: deterministic jitter and attempt accounting.

mod common;

use common::{FlakyAdd, counter, drain_events, sum_counts};
use std::sync::Arc;
use treadle::events::EventKind;
use treadle::prelude::*;

fn flaky_workflow() -> Workflow<JsonState> {
    WorkflowBuilder::new()
        .add_node(
            "flaky",
            FlakyAdd {
                succeed_at_attempt: 2,
            },
        )
        .start_at("flaky")
        .reducer(sum_counts)
        .build()
        .expect("valid topology")
}

async fn retry_delays(run_id: &str) -> Vec<u64> {
    let store = Arc::new(InMemoryStore::new());
    let runner = Runner::new(flaky_workflow(), store.clone())
        .with_options(RunOptions::default().with_rng_seed(11));
    let final_state = runner
        .run(RunId::from(run_id), counter(0))
        .await
        .expect("run succeeds after retries");
    assert_eq!(final_state.get_i64("count"), 1);

    drain_events(&store)
        .await
        .iter()
        .filter(|e| matches!(e.kind, EventKind::NodeRetried))
        .map(|e| e.payload["delay_ms"].as_u64().expect("delay recorded"))
        .collect()
}

#[tokio::test]
async fn fails_twice_then_succeeds_with_deterministic_jitter() {
    // Scenario: two retryable failures, success on the third attempt. The
    // sleep sequence must be identical across runs sharing a run id and seed.
    let first = retry_delays("scenario-c").await;
    let second = retry_delays("scenario-c").await;

    assert_eq!(first.len(), 2, "two backoffs for two failed attempts");
    assert_eq!(first, second);

    // Envelope check: min(10 * 2^attempt, 100) + uniform(0, 10).
    for (attempt, delay) in first.iter().enumerate() {
        let exp = (10u64 << attempt).min(100);
        assert!(*delay >= exp && *delay < exp + 10, "delay {delay} out of envelope");
    }
}

#[tokio::test]
async fn attempts_are_visible_in_retry_events() {
    let store = Arc::new(InMemoryStore::new());
    let runner = Runner::new(flaky_workflow(), store.clone());
    runner
        .run(RunId::from("attempts"), counter(0))
        .await
        .unwrap();
    let attempts: Vec<u64> = drain_events(&store)
        .await
        .iter()
        .filter(|e| matches!(e.kind, EventKind::NodeRetried))
        .map(|e| e.payload["attempt"].as_u64().unwrap())
        .collect();
    assert_eq!(attempts, vec![0, 1]);
}
