//! Fork/join merge strategies and branch cancellation.

use serde_json::json;
use std::sync::Arc;

use aios::config::Config;
use aios::exit_codes;
use aios::orchestration::{EngineEvent, EventSink};
use aios::workflow::{TaskState, WorkflowStatus};

use crate::fixtures::{engine, engine_with, fork_join_nodes, task_json, workflow, MockAdapter};

fn with_tail(mut nodes: Vec<serde_json::Value>) -> Vec<serde_json::Value> {
    nodes.push(json!({ "id": "report", "kind": "task", "task": "report", "after": ["join"] }));
    nodes
}

fn branch_tasks(names: &[&str]) -> Vec<serde_json::Value> {
    names
        .iter()
        .map(|n| task_json(n))
        .chain(std::iter::once(task_json("report")))
        .collect()
}

#[tokio::test]
async fn test_majority_complete_tolerates_one_failed_branch() {
    let names = ["b1", "b2", "b3"];
    let wf = workflow(
        "majority",
        branch_tasks(&names),
        with_tail(fork_join_nodes(&names, "majorityComplete", json!({}))),
    );
    let adapter = Arc::new(
        MockAdapter::new()
            .fail("b1", 1)
            .delay("b1", 5)
            .delay("b2", 20)
            .delay("b3", 40),
    );
    let report = engine(adapter).run_workflow(wf, Default::default()).await.unwrap();

    assert_eq!(report.state("b1"), Some(TaskState::Failed));
    assert_eq!(report.state("b2"), Some(TaskState::Succeeded));
    assert_eq!(report.state("b3"), Some(TaskState::Succeeded));
    assert_eq!(report.state("join"), Some(TaskState::Succeeded));
    assert_eq!(report.state("report"), Some(TaskState::Succeeded));
    assert_eq!(report.status, WorkflowStatus::Succeeded);
    assert_eq!(report.exit_code, exit_codes::OK);

    let merged = report.outputs("join").unwrap();
    let keys: Vec<&str> = merged.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["b2", "b3"]);
    assert_eq!(merged["b2"]["out"], json!("b2()"));
}

#[tokio::test]
async fn test_majority_complete_fails_when_two_branches_fail() {
    let names = ["b1", "b2", "b3"];
    let wf = workflow(
        "majority",
        branch_tasks(&names),
        with_tail(fork_join_nodes(&names, "majorityComplete", json!({}))),
    );
    let adapter = Arc::new(MockAdapter::new().fail("b1", 1).fail("b2", 1).delay("b3", 200));
    let report = engine(adapter).run_workflow(wf, Default::default()).await.unwrap();

    assert_eq!(report.state("join"), Some(TaskState::Failed));
    assert_eq!(report.state("b3"), Some(TaskState::Cancelled));
    assert_eq!(report.state("report"), Some(TaskState::Skipped));
    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(report.exit_code, exit_codes::EXECUTION);
}

#[tokio::test]
async fn test_first_complete_cancels_remaining_branches() {
    let names = ["fast", "slow"];
    let wf = workflow(
        "race",
        branch_tasks(&names),
        with_tail(fork_join_nodes(&names, "firstComplete", json!({}))),
    );
    let (sink, mut rx) = EventSink::channel();
    let adapter = Arc::new(MockAdapter::new().delay("fast", 5).delay("slow", 2_000));
    let started = std::time::Instant::now();
    let report = engine_with(adapter, Config::default(), sink)
        .run_workflow(wf, Default::default())
        .await
        .unwrap();

    assert!(started.elapsed() < std::time::Duration::from_millis(1_500));
    assert_eq!(report.state("fast"), Some(TaskState::Succeeded));
    assert_eq!(report.state("slow"), Some(TaskState::Cancelled));
    assert_eq!(report.state("join"), Some(TaskState::Succeeded));
    assert_eq!(report.status, WorkflowStatus::Succeeded);
    let merged = report.outputs("join").unwrap();
    assert!(merged.contains_key("fast"));
    assert!(!merged.contains_key("slow"));
    assert!(report
        .attempts_for("slow")
        .iter()
        .all(|record| !record.result.is_success()));

    let mut cancelled = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::BranchCancelled { branch, .. } = event {
            cancelled.push(branch.to_string());
        }
    }
    assert_eq!(cancelled, vec!["slow".to_string()]);
}

#[tokio::test]
async fn test_all_complete_waits_for_every_branch() {
    let names = ["a", "b", "c"];
    let wf = workflow(
        "all",
        branch_tasks(&names),
        with_tail(fork_join_nodes(&names, "allComplete", json!({}))),
    );
    let adapter = Arc::new(MockAdapter::new().delay("a", 30).delay("b", 10).delay("c", 20));
    let report = engine(adapter.clone())
        .run_workflow(wf, Default::default())
        .await
        .unwrap();

    assert_eq!(report.state("join"), Some(TaskState::Succeeded));
    assert_eq!(report.outputs("join").unwrap().len(), 3);
    assert_eq!(adapter.calls(), 4);

    let position = |id: &str| report.nodes.iter().position(|n| n.node.as_str() == id).unwrap();
    for branch in names {
        assert!(position(branch) < position("join"));
    }
    assert!(position("join") < position("report"));
}

#[tokio::test]
async fn test_all_complete_uses_join_fallback() {
    let names = ["left", "right"];
    let wf = workflow(
        "fallback",
        branch_tasks(&names),
        with_tail(fork_join_nodes(
            &names,
            "allComplete",
            json!({ "errorPolicy": { "strategy": "fallback", "fallback": { "summary": "partial" } } }),
        )),
    );
    let adapter = Arc::new(MockAdapter::new().fail("right", 1));
    let report = engine(adapter).run_workflow(wf, Default::default()).await.unwrap();

    assert_eq!(report.state("right"), Some(TaskState::Failed));
    assert_eq!(report.state("join"), Some(TaskState::Succeeded));
    assert_eq!(report.outputs("join").unwrap()["summary"], json!("partial"));
    assert_eq!(report.state("report"), Some(TaskState::Succeeded));
    assert_eq!(report.status, WorkflowStatus::Succeeded);
}

#[tokio::test]
async fn test_all_complete_with_min_success_accepts_partial_results() {
    let names = ["p", "q", "r"];
    let wf = workflow(
        "quorum",
        branch_tasks(&names),
        with_tail(fork_join_nodes(&names, "allComplete", json!({ "minSuccess": 1 }))),
    );
    let adapter = Arc::new(MockAdapter::new().fail("p", 1).fail("q", 1).delay("r", 10));
    let report = engine(adapter).run_workflow(wf, Default::default()).await.unwrap();

    assert_eq!(report.state("join"), Some(TaskState::Succeeded));
    let keys: Vec<&str> = report.outputs("join").unwrap().keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["r"]);
}

#[tokio::test]
async fn test_min_success_raises_majority_threshold() {
    let names = ["x", "y", "z"];
    let wf = workflow(
        "strict",
        branch_tasks(&names),
        with_tail(fork_join_nodes(&names, "majorityComplete", json!({ "minSuccess": 3 }))),
    );
    let adapter = Arc::new(MockAdapter::new().fail("z", 1));
    let report = engine(adapter).run_workflow(wf, Default::default()).await.unwrap();

    assert_eq!(report.state("join"), Some(TaskState::Failed));
    assert_eq!(report.status, WorkflowStatus::Failed);
}
