//! Sequential data flow, input binding and the result cache.

use serde_json::json;
use std::sync::Arc;

use aios::config::Config;
use aios::core::{ExecutorKind, TaskDeclaration, TaskId};
use aios::exit_codes;
use aios::orchestration::EventSink;
use aios::workflow::{build, NodeId, TaskState, WorkflowDeclaration, WorkflowStatus};
use aios::Error;

use crate::fixtures::{
    engine, engine_with, inputs, patch, task_json, valid_task, with_input, workflow, MockAdapter,
};

fn upper_then_agent() -> Vec<serde_json::Value> {
    let upper = patch(
        with_input(task_json("shout"), "text", "string", "user"),
        json!({ "routing": { "deterministic": true, "capability": "uppercase" } }),
    );
    let annotate = with_input(task_json("annotate"), "loud", "string", "task:shout.out");
    vec![upper, annotate]
}

#[tokio::test]
async fn test_outputs_flow_to_downstream_inputs() {
    let wf = workflow("pipeline", upper_then_agent(), vec![]);
    let shout = NodeId::from("shout");
    let annotate = wf.node_for_task(&TaskId::from("annotate")).unwrap().id.clone();
    assert!(wf.graph.has_edge(&shout, &annotate));

    let adapter = Arc::new(MockAdapter::new());
    let engine = engine(adapter.clone());
    let report = engine
        .run_workflow(wf, inputs(&[("text", json!("hello"))]))
        .await
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Succeeded);
    assert_eq!(report.exit_code, exit_codes::OK);
    assert_eq!(report.outputs("shout").unwrap()["out"], json!("HELLO"));
    assert_eq!(report.outputs("annotate").unwrap()["out"], json!("annotate(HELLO)"));

    let order: Vec<&str> = report.nodes.iter().map(|n| n.node.as_str()).collect();
    assert_eq!(order, vec!["shout", "annotate"]);
    assert_eq!(report.node("shout").unwrap().executor, Some(ExecutorKind::Worker));
    assert_eq!(report.node("annotate").unwrap().executor, Some(ExecutorKind::Agent));
    assert_eq!(adapter.calls(), 1);
    assert_eq!(report.attempts.len(), 2);
    assert_eq!(engine.attempt_log().len().await, 2);

    let metrics = engine.tracker().snapshot().await;
    assert_eq!(metrics.len(), 2);
    assert_eq!(metrics[&TaskId::from("annotate")].count, 1);
}

#[tokio::test]
async fn test_missing_user_input_is_a_validation_error() {
    let wf = workflow("pipeline", upper_then_agent(), vec![]);
    let adapter = Arc::new(MockAdapter::new());
    let err = engine(adapter.clone())
        .run_workflow(wf, Default::default())
        .await
        .unwrap_err();

    match &err {
        Error::Validation(report) => assert!(report.mentions("tasks.shout.inputs.text")),
        other => panic!("Expected validation error, got {:?}", other),
    }
    assert_eq!(err.exit_code(), exit_codes::VALIDATION);
    assert_eq!(adapter.calls(), 0);
}

#[tokio::test]
async fn test_input_default_fills_missing_user_value() {
    let mut task = with_input(task_json("greet"), "name", "string", "user");
    task["inputs"][0]["required"] = json!(false);
    task["inputs"][0]["default"] = json!("world");
    let report = engine(Arc::new(MockAdapter::new()))
        .run_task(Arc::new(valid_task(task)), Default::default())
        .await
        .unwrap();

    assert_eq!(report.outputs("greet").unwrap()["out"], json!("greet(world)"));
}

#[tokio::test]
async fn test_config_source_binds_config_value() {
    let mut config = Config::default();
    config.values.insert("region".to_string(), json!("eu-west"));
    let task = with_input(task_json("deploy"), "region", "string", "config:region");
    let decl: WorkflowDeclaration = serde_json::from_value(json!({
        "workflow": { "id": "deploy" },
        "tasks": [task],
    }))
    .unwrap();
    let wf = build(&decl, &config).unwrap();

    let adapter = Arc::new(MockAdapter::new());
    let report = engine_with(adapter, config, EventSink::disabled())
        .run_workflow(Arc::new(wf), Default::default())
        .await
        .unwrap();
    assert_eq!(report.outputs("deploy").unwrap()["out"], json!("deploy(eu-west)"));
}

#[tokio::test]
async fn test_abort_policy_skips_downstream() {
    let first = with_input(task_json("first"), "text", "string", "user");
    let second = with_input(task_json("second"), "prev", "string", "task:first.out");
    let third = with_input(task_json("third"), "prev", "string", "task:second.out");
    let wf = workflow("chain", vec![first, second, third], vec![]);

    let adapter = Arc::new(MockAdapter::new().fail("first", 1));
    let report = engine(adapter.clone())
        .run_workflow(wf, inputs(&[("text", json!("x"))]))
        .await
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(report.exit_code, exit_codes::EXECUTION);
    assert_eq!(report.state("first"), Some(TaskState::Failed));
    assert_eq!(report.state("second"), Some(TaskState::Skipped));
    assert_eq!(report.state("third"), Some(TaskState::Skipped));
    assert_eq!(adapter.calls(), 1);
    assert_eq!(report.errors.len(), 1);
}

#[tokio::test]
async fn test_cacheable_task_runs_once_per_key() {
    let task = patch(
        with_input(task_json("summarize"), "doc", "string", "user"),
        json!({
            "performance": {
                "expectedDurationMs": 10,
                "cost": 1.0,
                "cacheable": true,
                "cacheKey": "summary:{{doc}}"
            }
        }),
    );
    let task = Arc::new(valid_task(task));
    let adapter = Arc::new(MockAdapter::new());
    let engine = engine(adapter.clone());

    let first = engine
        .run_task(Arc::clone(&task), inputs(&[("doc", json!("a.md"))]))
        .await
        .unwrap();
    let second = engine
        .run_task(Arc::clone(&task), inputs(&[("doc", json!("a.md"))]))
        .await
        .unwrap();

    assert_eq!(adapter.calls(), 1);
    assert!(!first.node("summarize").unwrap().cached);
    let cached = second.node("summarize").unwrap();
    assert!(cached.cached);
    assert_eq!(cached.path, vec![TaskState::Pending, TaskState::Succeeded]);
    assert_eq!(cached.outputs, first.node("summarize").unwrap().outputs);

    engine
        .run_task(task, inputs(&[("doc", json!("b.md"))]))
        .await
        .unwrap();
    assert_eq!(adapter.calls(), 2);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_execution() {
    let task = patch(
        with_input(task_json("slowsum"), "doc", "string", "user"),
        json!({
            "performance": {
                "expectedDurationMs": 10,
                "cost": 1.0,
                "cacheable": true,
                "cacheKey": "{{task}}:{{doc}}"
            }
        }),
    );
    let task = Arc::new(valid_task(task));
    let adapter = Arc::new(MockAdapter::new().delay("slowsum", 50));
    let engine = engine(adapter.clone());

    let (a, b) = tokio::join!(
        engine.run_task(Arc::clone(&task), inputs(&[("doc", json!("same"))])),
        engine.run_task(Arc::clone(&task), inputs(&[("doc", json!("same"))])),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(adapter.calls(), 1);
    assert_eq!(a.outputs("slowsum"), b.outputs("slowsum"));
}

#[tokio::test]
async fn test_workflow_loaded_from_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flow.toml");
    std::fs::write(
        &path,
        r#"
[workflow]
id = "from-file"
description = "loaded from disk"

[[tasks]]
task = "echo"
responsible = "ops"
executorKind = "worker"
checklist = {}
errorPolicy = { strategy = "abort" }
metadata = { version = "2.1.0" }
performance = { expectedDurationMs = 5, cost = 0.0, cacheable = false }
routing = { deterministic = true, capability = "identity" }
inputs = [{ name = "msg", type = "string", source = "user", required = true }]
outputs = [{ name = "out", type = "string", destination = "return", persisted = true }]
"#,
    )
    .unwrap();

    let decl = WorkflowDeclaration::from_path(&path).unwrap();
    let wf = build(&decl, &Config::default()).unwrap();
    assert_eq!(wf.id, "from-file");

    let report = aios::Engine::builder(Config::default())
        .build()
        .run_workflow(Arc::new(wf), inputs(&[("msg", json!("ping"))]))
        .await
        .unwrap();
    assert_eq!(report.outputs("echo").unwrap()["out"], json!("ping"));
    assert_eq!(report.node("echo").unwrap().rule.as_deref(), Some("override"));
}

#[test]
fn test_invalid_workflow_reports_every_problem() {
    let mut broken = task_json("broken");
    broken.as_object_mut().unwrap().remove("responsible");
    let orphan = with_input(task_json("orphan"), "x", "string", "task:ghost.out");
    let decl: WorkflowDeclaration = serde_json::from_value(json!({
        "workflow": { "id": "bad" },
        "tasks": [broken, orphan],
    }))
    .unwrap();

    let report = build(&decl, &Config::default()).unwrap_err();
    assert!(report.mentions("tasks[0].responsible"));
    assert!(report.len() >= 2);
}

#[test]
fn test_validation_is_idempotent_and_round_trips() {
    let decl: TaskDeclaration = serde_json::from_value(patch(
        with_input(task_json("check"), "doc", "string", "user:document"),
        json!({
            "errorPolicy": {
                "strategy": "retry",
                "retry": { "maxAttempts": 3, "backoff": "exponential", "baseDelayMs": 10 }
            }
        }),
    ))
    .unwrap();

    let once = tokio_test::assert_ok!(aios::core::validate(&decl));
    let twice = tokio_test::assert_ok!(aios::core::validate(&decl));
    assert_eq!(once, twice);
    assert_eq!(aios::core::validate(&once.to_declaration()).unwrap(), once);
}
