//! Organizer nodes distributing work items over a worker pool.

use serde_json::json;
use std::sync::Arc;

use aios::config::Config;
use aios::orchestration::{EngineEvent, EventSink};
use aios::workflow::{TaskState, WorkflowStatus};

use crate::fixtures::{engine, engine_with, patch, task_json, workflow, MockAdapter};

fn items(n: usize) -> Vec<serde_json::Value> {
    (1..=n)
        .map(|i| json!({ "id": format!("i{}", i), "payload": format!("p{}", i) }))
        .collect()
}

fn organizer_node(distribution: &str, workers: serde_json::Value, items: Vec<serde_json::Value>) -> serde_json::Value {
    json!({
        "id": "fanout",
        "kind": "organizer",
        "task": "label",
        "distribution": distribution,
        "workers": workers,
        "items": items,
    })
}

#[tokio::test]
async fn test_round_robin_reassigns_failed_item() {
    let wf = workflow(
        "labels",
        vec![task_json("label")],
        vec![organizer_node(
            "roundRobin",
            json!([{ "id": "w1" }, { "id": "w2" }]),
            items(5),
        )],
    );
    let (sink, mut rx) = EventSink::channel();
    let adapter = Arc::new(MockAdapter::new().faulty_worker("w1", "i3"));
    let report = engine_with(adapter.clone(), Config::default(), sink)
        .run_workflow(wf, Default::default())
        .await
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Succeeded);
    let node = report.node("fanout").unwrap();
    assert_eq!(node.state, TaskState::Succeeded);
    assert_eq!(node.items.len(), 5);

    let placement: Vec<(&str, Vec<&str>)> = node
        .items
        .iter()
        .map(|o| (o.item.as_str(), o.workers.iter().map(String::as_str).collect()))
        .collect();
    assert_eq!(
        placement,
        vec![
            ("i1", vec!["w1"]),
            ("i2", vec!["w2"]),
            ("i3", vec!["w1", "w2"]),
            ("i4", vec!["w2"]),
            ("i5", vec!["w1"]),
        ]
    );
    assert!(node.items.iter().all(|o| o.succeeded));
    assert_eq!(node.items[2].attempts, 2);

    let results = &node.outputs["results"];
    assert_eq!(results["i3"]["out"], json!("label(p3)@w2"));
    assert_eq!(results["i4"]["out"], json!("label(p4)@w2"));
    assert_eq!(adapter.calls(), 6);

    // one attempt record per (item, attempt)
    let i3: Vec<u32> = report
        .attempts_for("label")
        .iter()
        .filter(|r| r.key.item.as_deref() == Some("i3"))
        .map(|r| r.key.attempt)
        .collect();
    assert_eq!(i3, vec![1, 2]);

    let mut reassigned = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::ItemAssigned {
            item,
            worker,
            reassignment,
            ..
        } = event
        {
            if reassignment > 0 {
                reassigned.push((item, worker, reassignment));
            }
        }
    }
    assert_eq!(reassigned, vec![("i3".to_string(), "w2".to_string(), 1)]);
}

#[tokio::test]
async fn test_item_failing_everywhere_fails_the_organizer() {
    let wf = workflow(
        "labels",
        vec![task_json("label")],
        vec![organizer_node(
            "roundRobin",
            json!([{ "id": "w1" }, { "id": "w2" }]),
            items(3),
        )],
    );
    let adapter = Arc::new(
        MockAdapter::new()
            .faulty_worker("w1", "i2")
            .faulty_worker("w2", "i2"),
    );
    let report = engine(adapter).run_workflow(wf, Default::default()).await.unwrap();

    let node = report.node("fanout").unwrap();
    assert_eq!(node.state, TaskState::Failed);
    assert_eq!(report.status, WorkflowStatus::Failed);
    let failed: Vec<&str> = node
        .items
        .iter()
        .filter(|o| !o.succeeded)
        .map(|o| o.item.as_str())
        .collect();
    assert_eq!(failed, vec!["i2"]);
    assert_eq!(node.items[1].workers, vec!["w2".to_string(), "w1".to_string()]);
}

#[tokio::test]
async fn test_skill_based_keeps_items_on_skilled_workers() {
    let label = patch(task_json("label"), json!({ "routing": { "skill": "text" } }));
    let items = vec![
        json!({ "id": "doc", "payload": "readme" }),
        json!({ "id": "pic", "payload": "logo", "skill": "image" }),
        json!({ "id": "note", "payload": "todo" }),
    ];
    let wf = workflow(
        "skills",
        vec![label],
        vec![organizer_node(
            "skillBased",
            json!([
                { "id": "writer", "skills": ["text"] },
                { "id": "artist", "skills": ["image"] }
            ]),
            items,
        )],
    );
    let report = engine(Arc::new(MockAdapter::new()))
        .run_workflow(wf, Default::default())
        .await
        .unwrap();

    let node = report.node("fanout").unwrap();
    assert_eq!(node.state, TaskState::Succeeded);
    for outcome in &node.items {
        let expected = if outcome.item == "pic" { "artist" } else { "writer" };
        assert_eq!(outcome.workers, vec![expected.to_string()], "item {}", outcome.item);
    }
}

#[tokio::test]
async fn test_organizer_runs_before_downstream_task() {
    let mut nodes = vec![organizer_node(
        "loadBalanced",
        json!([{ "id": "w1" }, { "id": "w2" }, { "id": "w3" }]),
        items(4),
    )];
    nodes.push(json!({ "id": "collect", "kind": "task", "task": "collect", "after": ["fanout"] }));
    let wf = workflow("gather", vec![task_json("label"), task_json("collect")], nodes);

    let adapter = Arc::new(MockAdapter::new());
    let report = engine(adapter.clone())
        .run_workflow(wf, Default::default())
        .await
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Succeeded);
    assert_eq!(report.state("collect"), Some(TaskState::Succeeded));
    let results = report.outputs("fanout").unwrap()["results"].as_object().unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(adapter.log().last().map(String::as_str), Some("collect"));
}
