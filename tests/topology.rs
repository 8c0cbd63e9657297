//! Topology construction and validation.

mod common;

use common::{AddAndStop, EdgeRouted, LoopingInc};
use treadle::prelude::*;
use treadle::topology::TopologyError;

fn linear() -> WorkflowBuilder<JsonState> {
    WorkflowBuilder::new()
        .add_node("inc", LoopingInc { id: "inc", limit: 3 })
        .start_at("inc")
        .reducer(merge_json)
}

#[test]
fn valid_linear_topology_builds() {
    let workflow = linear().build().expect("valid topology");
    assert_eq!(workflow.start().as_str(), "inc");
    assert_eq!(workflow.node_count(), 1);
}

#[test]
fn duplicate_node_is_rejected() {
    let err = WorkflowBuilder::new()
        .add_node("a", AddAndStop { amount: 1 })
        .add_node("a", AddAndStop { amount: 2 })
        .start_at("a")
        .reducer(merge_json)
        .build()
        .unwrap_err();
    assert!(matches!(err, TopologyError::DuplicateNode { node } if node.as_str() == "a"));
}

#[test]
fn missing_start_is_rejected() {
    let err = WorkflowBuilder::new()
        .add_node("a", AddAndStop { amount: 1 })
        .reducer(merge_json)
        .build()
        .unwrap_err();
    assert!(matches!(err, TopologyError::NoStartNode));
}

#[test]
fn unregistered_start_is_rejected() {
    let err = WorkflowBuilder::new()
        .add_node("a", AddAndStop { amount: 1 })
        .start_at("missing")
        .reducer(merge_json)
        .build()
        .unwrap_err();
    assert!(matches!(err, TopologyError::UnknownStartNode { .. }));
}

#[test]
fn dangling_edge_target_is_rejected() {
    let err = WorkflowBuilder::new()
        .add_node("a", AddAndStop { amount: 1 })
        .connect("a", "ghost")
        .start_at("a")
        .reducer(merge_json)
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        TopologyError::UnknownEdgeTarget { node, .. } if node.as_str() == "ghost"
    ));
}

#[test]
fn dangling_edge_source_is_rejected() {
    let err = WorkflowBuilder::new()
        .add_node("a", AddAndStop { amount: 1 })
        .connect("ghost", "a")
        .start_at("a")
        .reducer(merge_json)
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        TopologyError::UnknownEdgeSource { node } if node.as_str() == "ghost"
    ));
}

#[test]
fn edge_less_node_without_stop_contract_is_rejected() {
    // EdgeRouted never returns a route, so without out-edges it can only dead
    // end.
    let err = WorkflowBuilder::new()
        .add_node("sink", EdgeRouted { amount: 1 })
        .start_at("sink")
        .reducer(merge_json)
        .build()
        .unwrap_err();
    assert!(matches!(err, TopologyError::DeadEndNode { node } if node.as_str() == "sink"));
}

#[test]
fn missing_reducer_is_rejected() {
    let err = WorkflowBuilder::<JsonState>::new()
        .add_node("a", AddAndStop { amount: 1 })
        .start_at("a")
        .build()
        .unwrap_err();
    assert!(matches!(err, TopologyError::NoReducer));
}

#[test]
fn next_for_evaluates_predicates_in_edge_order() {
    let workflow = WorkflowBuilder::new()
        .add_node("router", EdgeRouted { amount: 0 })
        .add_node("low", AddAndStop { amount: 1 })
        .add_node("high", AddAndStop { amount: 2 })
        .connect_when("router", "low", |s: &JsonState| s.get_i64("count") < 10)
        .connect_when("router", "high", |s: &JsonState| s.get_i64("count") >= 10)
        .start_at("router")
        .reducer(merge_json)
        .build()
        .expect("valid topology");

    let low = workflow.next_for(&"router".into(), &common::counter(3));
    assert_eq!(low, vec![(NodeId::from("low"), 0)]);

    let high = workflow.next_for(&"router".into(), &common::counter(12));
    assert_eq!(high, vec![(NodeId::from("high"), 1)]);
}

#[test]
fn next_for_includes_every_matching_edge() {
    let workflow = WorkflowBuilder::new()
        .add_node("fan", EdgeRouted { amount: 0 })
        .add_node("a", AddAndStop { amount: 1 })
        .add_node("b", AddAndStop { amount: 2 })
        .connect("fan", "a")
        .connect("fan", "b")
        .start_at("fan")
        .reducer(merge_json)
        .build()
        .expect("valid topology");

    let targets = workflow.next_for(&"fan".into(), &JsonState::new());
    assert_eq!(
        targets,
        vec![(NodeId::from("a"), 0), (NodeId::from("b"), 1)]
    );
}
