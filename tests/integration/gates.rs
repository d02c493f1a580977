//! Quality gates and resuming a human review from a later process.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use aios::config::Config;
use aios::core::{ExecutorKind, TaskId, Values};
use aios::exit_codes;
use aios::orchestration::gate::Finding;
use aios::orchestration::Reviewer;
use aios::state::{Artifact, ArtifactId, Verdict};
use aios::workflow::{TaskState, WorkflowStatus};
use aios::{Engine, RunReport};

use crate::fixtures::{engine, inputs, patch, task_json, valid_task, with_input, workflow, MockAdapter};

fn echo_task(id: &str, quality: serde_json::Value) -> Arc<aios::core::Task> {
    Arc::new(valid_task(patch(
        with_input(task_json(id), "text", "string", "user"),
        json!({
            "routing": { "deterministic": true, "capability": "identity" },
            "quality": quality,
        }),
    )))
}

#[tokio::test]
async fn test_type_mismatch_blocks_and_skips_downstream() {
    let produce = patch(
        task_json("produce"),
        json!({
            "outputs": [
                { "name": "out", "type": "number", "destination": "return", "persisted": false }
            ]
        }),
    );
    let consume = with_input(task_json("consume"), "n", "number", "task:produce.out");
    let wf = workflow("typed", vec![produce, consume], vec![]);

    let adapter = Arc::new(MockAdapter::new());
    let report = engine(adapter.clone())
        .run_workflow(wf, Default::default())
        .await
        .unwrap();

    assert_eq!(report.state("produce"), Some(TaskState::Failed));
    assert_eq!(report.state("consume"), Some(TaskState::Skipped));
    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(report.exit_code, exit_codes::GATE_BLOCKED);
    assert_eq!(adapter.calls(), 1);

    let gate = &report.gates[0];
    assert!(!gate.passed);
    assert_eq!(gate.layers.len(), 1);
    assert_eq!(gate.layers[0].layer, 1);
    assert!(gate.layers[0].blocks());
}

#[tokio::test]
async fn test_acceptance_rule_blocks_long_output() {
    let task = Arc::new(valid_task(patch(
        task_json("brief"),
        json!({
            "checklist": {
                "acceptance": [{
                    "description": "fits in a tweet",
                    "blocking": true,
                    "rule": { "target": "out", "check": "maxLength", "value": 5 }
                }]
            }
        }),
    )));
    let report = engine(Arc::new(MockAdapter::new()))
        .run_task(task, Default::default())
        .await
        .unwrap();

    assert_eq!(report.exit_code, exit_codes::GATE_BLOCKED);
    let issue = &report.gates[0].layers[0].issues[0];
    assert_eq!(issue.check, "maxLength");
    assert!(issue.message.contains("fits in a tweet"));
}

#[tokio::test]
async fn test_layer_two_findings_are_advisory_unless_blocking() {
    let text = inputs(&[("text", json!("TODO: write the summary"))]);
    let engine = Engine::builder(Config::default()).build();

    let advisory = engine
        .run_task(echo_task("draft", json!({})), text.clone())
        .await
        .unwrap();
    assert_eq!(advisory.state("draft"), Some(TaskState::Succeeded));
    assert_eq!(advisory.exit_code, exit_codes::OK);
    let layers = &advisory.gates[0].layers;
    assert_eq!(layers[1].layer, 2);
    assert_eq!(layers[1].issues_found, 1);
    assert!(!layers[1].blocking);

    let strict = engine
        .run_task(echo_task("final", json!({ "blocking": true })), text)
        .await
        .unwrap();
    assert_eq!(strict.state("final"), Some(TaskState::Failed));
    assert_eq!(strict.exit_code, exit_codes::GATE_BLOCKED);
}

struct ForbiddenWord(&'static str);

#[async_trait]
impl Reviewer for ForbiddenWord {
    fn name(&self) -> &str {
        "forbidden"
    }

    async fn review(&self, artifact: &Artifact) -> Vec<Finding> {
        artifact
            .outputs
            .values()
            .filter(|v| v.as_str().is_some_and(|s| s.contains(self.0)))
            .map(|_| Finding::new(self.name(), format!("mentions '{}'", self.0)))
            .collect()
    }
}

#[tokio::test]
async fn test_strict_mode_makes_custom_reviewer_blocking() {
    let config = Config {
        quality_gate_strict_mode: true,
        ..Config::default()
    };
    let engine = Engine::builder(config)
        .reviewer(Arc::new(ForbiddenWord("secret")))
        .build();

    let clean = engine
        .run_task(echo_task("post", json!({})), inputs(&[("text", json!("hello"))]))
        .await
        .unwrap();
    assert_eq!(clean.status, WorkflowStatus::Succeeded);

    let leaked = engine
        .run_task(echo_task("post", json!({})), inputs(&[("text", json!("the secret plan"))]))
        .await
        .unwrap();
    assert_eq!(leaked.exit_code, exit_codes::GATE_BLOCKED);
    let layer = &leaked.gates[0].layers[1];
    assert!(layer.issues.iter().any(|i| i.check == "forbidden"));
}

#[tokio::test]
async fn test_human_review_resumes_in_a_new_engine() {
    let dir = tempfile::tempdir().unwrap();
    let task = Arc::new(valid_task(patch(
        task_json("publish"),
        json!({ "quality": { "humanReview": true } }),
    )));

    let first = Engine::builder(Config::default())
        .adapter(ExecutorKind::Agent, Arc::new(MockAdapter::new()))
        .state_dir(dir.path())
        .build();
    let report = first.run_task(task, Default::default()).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::AwaitingReview);
    assert_eq!(report.exit_code, exit_codes::OK);
    assert_eq!(report.state("publish"), Some(TaskState::AwaitingReview));
    assert!(report.gates[0].pending);
    drop(first);

    // a later `aios gate run` builds a fresh engine over the same state
    let second = Engine::builder(Config::default()).state_dir(dir.path()).build();
    let artifact = ArtifactId::new(report.run_id, TaskId::from("publish"));
    let result = second
        .run_gate(&artifact, 3, Some(Verdict::approve(Values::new())))
        .await
        .unwrap();
    assert!(result.passed);
    assert!(!result.blocks());

    let stored: RunReport = second.store().unwrap().load_report(report.run_id).unwrap();
    assert_eq!(stored.run_id, report.run_id);
    assert_eq!(stored.status, WorkflowStatus::Succeeded);
    assert_eq!(stored.state("publish"), Some(TaskState::Succeeded));
    assert!(!stored.gates[0].pending);
}

#[tokio::test]
async fn test_human_rejection_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let task = Arc::new(valid_task(patch(
        task_json("ship"),
        json!({ "quality": { "humanReview": true } }),
    )));
    let engine = Engine::builder(Config::default())
        .adapter(ExecutorKind::Agent, Arc::new(MockAdapter::new()))
        .state_dir(dir.path())
        .build();
    let report = engine.run_task(task, Default::default()).await.unwrap();

    let artifact = ArtifactId::new(report.run_id, TaskId::from("ship"));
    let result = engine
        .run_gate(&artifact, 3, Some(Verdict::reject("needs a changelog")))
        .await
        .unwrap();
    assert!(result.blocks());
    assert_eq!(result.issues[0].message, "needs a changelog");

    let stored: RunReport = engine.store().unwrap().load_report(report.run_id).unwrap();
    assert_eq!(stored.state("ship"), Some(TaskState::Failed));
    assert_eq!(stored.exit_code, exit_codes::GATE_BLOCKED);
}

#[tokio::test]
async fn test_gate_run_without_state_dir_is_not_found() {
    let engine = engine(Arc::new(MockAdapter::new()));
    let artifact: ArtifactId = format!("{}:missing", aios::workflow::WorkflowRunId::new())
        .parse()
        .unwrap();
    let err = engine.run_gate(&artifact, 1, None).await.unwrap_err();
    assert_eq!(err.exit_code(), exit_codes::VALIDATION);
}
