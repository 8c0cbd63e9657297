//! Shared contract suite: every `CheckpointStore` implementation must pass
//! these, unchanged.

mod common;

use common::counter;
use serde_json::json;
use std::sync::Arc;
use treadle::checkpoint::{Checkpoint, WorkItem};
use treadle::events::EventRecord;
use treadle::prelude::*;

fn checkpoint(run: &str, step: StepId, count: i64) -> Checkpoint<JsonState> {
    let frontier = if step == 0 {
        vec![WorkItem::seed(NodeId::from("start"), counter(count))]
    } else {
        vec![WorkItem::successor(
            step + 1,
            NodeId::from("start"),
            0,
            NodeId::from("next"),
            counter(count),
        )]
    };
    Checkpoint::assemble(
        RunId::from(run),
        step,
        counter(count),
        frontier,
        7,
        Vec::new(),
        None,
    )
}

async fn checkpoint_round_trip(store: Arc<dyn CheckpointStore<JsonState>>) {
    let cp = checkpoint("rt", 2, 5);
    store.save_checkpoint(&cp, &[]).await.unwrap();

    let loaded = store.load_checkpoint(&RunId::from("rt"), 2).await.unwrap();
    assert_eq!(loaded.step_id, 2);
    assert_eq!(loaded.state.get_i64("count"), 5);
    assert_eq!(loaded.frontier.len(), 1);
    assert_eq!(loaded.frontier[0].node, NodeId::from("next"));
    assert_eq!(loaded.rng_seed, 7);
    assert_eq!(loaded.idempotency_key, cp.idempotency_key);

    let latest = store
        .latest_checkpoint(&RunId::from("rt"))
        .await
        .unwrap()
        .expect("latest exists");
    assert_eq!(latest.step_id, 2);

    assert!(matches!(
        store.load_checkpoint(&RunId::from("rt"), 9).await,
        Err(StoreError::NotFound { .. })
    ));
    assert!(
        store
            .latest_checkpoint(&RunId::from("ghost"))
            .await
            .unwrap()
            .is_none()
    );
}

async fn duplicate_key_is_rejected(store: Arc<dyn CheckpointStore<JsonState>>) {
    let cp = checkpoint("dup", 1, 1);
    store.save_checkpoint(&cp, &[]).await.unwrap();
    assert!(store.check_idempotency(&cp.idempotency_key).await.unwrap());
    assert!(matches!(
        store.save_checkpoint(&cp, &[]).await,
        Err(StoreError::IdempotencyViolation { .. })
    ));
}

async fn concurrent_commits_land_exactly_once(store: Arc<dyn CheckpointStore<JsonState>>) {
    let cp = Arc::new(checkpoint("race", 3, 3));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let cp = cp.clone();
        handles.push(tokio::spawn(async move {
            store.save_checkpoint(&cp, &[]).await
        }));
    }
    let mut ok = 0;
    let mut violations = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => ok += 1,
            Err(StoreError::IdempotencyViolation { .. }) => violations += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 1, "exactly one concurrent commit must win");
    assert_eq!(violations, 7);
}

async fn load_latest_ignores_arrival_order(store: Arc<dyn CheckpointStore<JsonState>>) {
    let run = RunId::from("ooo");
    let node = NodeId::from("n");
    for step in [4u64, 1, 3] {
        store
            .save_step(&run, step, &node, &counter(step as i64))
            .await
            .unwrap();
    }
    let (state, step) = store.load_latest(&run).await.unwrap();
    assert_eq!(step, 4);
    assert_eq!(state.get_i64("count"), 4);

    assert!(matches!(
        store.load_latest(&RunId::from("ghost")).await,
        Err(StoreError::NotFound { .. })
    ));
}

async fn outbox_drains_once(store: Arc<dyn CheckpointStore<JsonState>>) {
    let cp = checkpoint("outbox", 1, 0);
    let events: Vec<EventRecord> = (0..3)
        .map(|i| {
            EventRecord::diagnostic(RunId::from("outbox"), 1, "suite", format!("event-{i}"))
        })
        .collect();
    store.save_checkpoint(&cp, &events).await.unwrap();

    let first_two = store.pending_events(2).await.unwrap();
    assert_eq!(first_two.len(), 2);
    let ids: Vec<String> = first_two.iter().map(|e| e.event_id.clone()).collect();
    store.mark_events_emitted(&ids).await.unwrap();

    let rest = store.pending_events(10).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].payload["message"], json!("event-2"));
}

async fn lists_known_runs(store: Arc<dyn CheckpointStore<JsonState>>) {
    store
        .save_checkpoint(&checkpoint("list-a", 1, 0), &[])
        .await
        .unwrap();
    store
        .save_checkpoint(&checkpoint("list-b", 1, 0), &[])
        .await
        .unwrap();
    let runs = store.list_runs().await.unwrap();
    assert!(runs.contains(&RunId::from("list-a")));
    assert!(runs.contains(&RunId::from("list-b")));
}

async fn run_suite(store: Arc<dyn CheckpointStore<JsonState>>) {
    checkpoint_round_trip(store.clone()).await;
    duplicate_key_is_rejected(store.clone()).await;
    concurrent_commits_land_exactly_once(store.clone()).await;
    load_latest_ignores_arrival_order(store.clone()).await;
    outbox_drains_once(store.clone()).await;
    lists_known_runs(store).await;
}

#[tokio::test]
async fn in_memory_store_passes_the_contract() {
    run_suite(Arc::new(InMemoryStore::new())).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_store_passes_the_contract() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("contract.db").display());
    let store = SqliteStore::connect(&url).await.expect("connect");
    run_suite(Arc::new(store)).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_checkpoint_survives_reconnect() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("durable.db").display());
    {
        let store: SqliteStore<JsonState> = SqliteStore::connect(&url).await.expect("connect");
        store
            .save_checkpoint(&checkpoint("durable", 2, 9), &[])
            .await
            .unwrap();
    }
    let store: SqliteStore<JsonState> = SqliteStore::connect(&url).await.expect("reconnect");
    let loaded = store
        .load_checkpoint(&RunId::from("durable"), 2)
        .await
        .unwrap();
    assert_eq!(loaded.state.get_i64("count"), 9);
}
