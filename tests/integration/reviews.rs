//! Runs paused on human reviews and continued by a later engine.

use serde_json::json;
use std::sync::Arc;

use aios::config::Config;
use aios::core::{ExecutorKind, TaskId, Values};
use aios::exit_codes;
use aios::state::{ArtifactId, Verdict};
use aios::workflow::{TaskState, WorkflowStatus};
use aios::{Engine, RunReport};

use crate::fixtures::{inputs, patch, task_json, with_input, workflow, MockAdapter};

fn engine_at(dir: &std::path::Path, adapter: Arc<MockAdapter>) -> Arc<Engine> {
    Engine::builder(Config::default())
        .adapter(ExecutorKind::Agent, adapter)
        .state_dir(dir)
        .build()
}

/// `decide` is routed to a human; `announce` consumes its decision.
fn refund_workflow() -> Arc<aios::workflow::Workflow> {
    workflow(
        "refund",
        vec![
            patch(task_json("decide"), json!({ "routing": { "criticalDecision": true } })),
            with_input(task_json("announce"), "choice", "string", "task:decide.out"),
        ],
        vec![],
    )
}

#[tokio::test]
async fn test_reviewed_task_holds_downstream_until_approved() {
    let dir = tempfile::tempdir().unwrap();
    let wf = workflow(
        "release",
        vec![
            patch(task_json("draft"), json!({ "quality": { "humanReview": true } })),
            with_input(task_json("publish"), "text", "string", "task:draft.out"),
        ],
        vec![],
    );

    let first = engine_at(dir.path(), Arc::new(MockAdapter::new()));
    let report = first.run_workflow(wf, Default::default()).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::AwaitingReview);
    assert_eq!(report.exit_code, exit_codes::OK);
    assert_eq!(report.state("draft"), Some(TaskState::AwaitingReview));
    assert_eq!(report.state("publish"), Some(TaskState::Pending));
    drop(first);

    // `aios gate run <artifact> --layer 3 --verdict approve` in a later process
    let adapter = Arc::new(MockAdapter::new());
    let second = engine_at(dir.path(), adapter.clone());
    let artifact = ArtifactId::new(report.run_id, TaskId::from("draft"));
    let result = second
        .run_gate(&artifact, 3, Some(Verdict::approve(Values::new())))
        .await
        .unwrap();
    assert!(result.passed);

    let stored: RunReport = second.store().unwrap().load_report(report.run_id).unwrap();
    assert_eq!(stored.run_id, report.run_id);
    assert_eq!(stored.status, WorkflowStatus::Succeeded);
    assert_eq!(stored.exit_code, exit_codes::OK);
    assert_eq!(stored.state("draft"), Some(TaskState::Succeeded));
    assert_eq!(stored.state("publish"), Some(TaskState::Succeeded));
    assert_eq!(stored.outputs("publish").unwrap()["out"], json!("publish(draft())"));
    assert_eq!(adapter.log(), vec!["publish".to_string()]);
    assert!(stored.gates.iter().all(|g| !g.pending));
}

#[tokio::test]
async fn test_unanswered_review_keeps_run_paused() {
    let dir = tempfile::tempdir().unwrap();
    let first = engine_at(dir.path(), Arc::new(MockAdapter::new()));
    let report = first.run_workflow(refund_workflow(), Default::default()).await.unwrap();
    drop(first);

    let second = engine_at(dir.path(), Arc::new(MockAdapter::new()));
    let again = second.resume(report.run_id).await.unwrap();
    assert_eq!(again.run_id, report.run_id);
    assert_eq!(again.status, WorkflowStatus::AwaitingReview);
    assert_eq!(again.state("decide"), Some(TaskState::AwaitingReview));
    assert_eq!(again.state("announce"), Some(TaskState::Pending));
    assert!(second.store().unwrap().has_checkpoint(report.run_id));
}

#[tokio::test]
async fn test_execution_review_answered_from_a_second_engine() {
    let dir = tempfile::tempdir().unwrap();
    let first = engine_at(dir.path(), Arc::new(MockAdapter::new()));
    let report = first.run_workflow(refund_workflow(), Default::default()).await.unwrap();

    assert_eq!(report.status, WorkflowStatus::AwaitingReview);
    assert_eq!(report.exit_code, exit_codes::OK);
    assert_eq!(report.state("decide"), Some(TaskState::AwaitingReview));
    assert_eq!(report.state("announce"), Some(TaskState::Pending));
    let decide = report.node("decide").unwrap();
    assert_eq!(decide.executor, Some(ExecutorKind::Human));
    let review = decide.review.clone().unwrap();
    assert_eq!(review, format!("exec:{}:decide:1", report.run_id));

    let pending = first.pending_reviews().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request.id, review);
    assert_eq!(pending[0].request.run_id, Some(report.run_id));
    drop(first);

    // `aios review respond <id> --verdict approve --output out=refund`
    let adapter = Arc::new(MockAdapter::new());
    let second = engine_at(dir.path(), adapter.clone());
    let resumed = second
        .respond_review(&review, Verdict::approve(inputs(&[("out", json!("refund"))])))
        .await
        .unwrap()
        .expect("paused run continues");

    assert_eq!(resumed.run_id, report.run_id);
    assert_eq!(resumed.status, WorkflowStatus::Succeeded);
    assert_eq!(resumed.exit_code, exit_codes::OK);
    assert_eq!(resumed.outputs("decide").unwrap()["out"], json!("refund"));
    assert_eq!(resumed.outputs("announce").unwrap()["out"], json!("announce(refund)"));
    assert_eq!(adapter.log(), vec!["announce".to_string()]);

    let decided = resumed.attempts_for("decide");
    assert_eq!(decided.len(), 1);
    assert!(decided[0].result.is_success());
    assert!(second.pending_reviews().unwrap().is_empty());
    assert!(!second.store().unwrap().has_checkpoint(report.run_id));
}

#[tokio::test]
async fn test_rejected_execution_review_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let first = engine_at(dir.path(), Arc::new(MockAdapter::new()));
    let report = first.run_workflow(refund_workflow(), Default::default()).await.unwrap();
    let review = report.node("decide").unwrap().review.clone().unwrap();
    drop(first);

    let adapter = Arc::new(MockAdapter::new());
    let second = engine_at(dir.path(), adapter.clone());
    let resumed = second
        .respond_review(&review, Verdict::reject("over the refund limit"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(resumed.status, WorkflowStatus::Failed);
    assert_eq!(resumed.exit_code, exit_codes::EXECUTION);
    assert_eq!(resumed.state("decide"), Some(TaskState::Failed));
    assert_eq!(resumed.state("announce"), Some(TaskState::Skipped));
    assert!(resumed.errors.iter().any(|e| e.contains("over the refund limit")));
    assert_eq!(adapter.calls(), 0);
}

#[tokio::test]
async fn test_unknown_review_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path(), Arc::new(MockAdapter::new()));
    let err = engine
        .respond_review("exec:missing:task:1", Verdict::approve(Values::new()))
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), exit_codes::VALIDATION);
}
