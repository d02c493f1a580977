//! Error policies: retry with backoff, fallback values and timeouts.

use serde_json::json;
use std::sync::Arc;

use aios::config::Config;
use aios::core::ExecutionStatus;
use aios::exit_codes;
use aios::orchestration::{EngineEvent, EventSink};
use aios::workflow::{TaskState, WorkflowStatus};

use crate::fixtures::{engine, engine_with, patch, task_json, valid_task, MockAdapter};

fn retrying(id: &str, max_attempts: u32) -> Arc<aios::core::Task> {
    Arc::new(valid_task(patch(
        task_json(id),
        json!({
            "errorPolicy": {
                "strategy": "retry",
                "retry": { "maxAttempts": max_attempts, "backoff": "linear", "baseDelayMs": 1 }
            }
        }),
    )))
}

#[tokio::test]
async fn test_retry_succeeds_on_third_attempt() {
    let (sink, mut rx) = EventSink::channel();
    let adapter = Arc::new(MockAdapter::new().fail("flaky", 2));
    let report = engine_with(adapter.clone(), Config::default(), sink)
        .run_task(retrying("flaky", 3), Default::default())
        .await
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Succeeded);
    assert_eq!(adapter.calls(), 3);

    let attempts = report.attempts_for("flaky");
    assert_eq!(attempts.len(), 3);
    let numbers: Vec<u32> = attempts.iter().map(|r| r.key.attempt).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    let statuses: Vec<ExecutionStatus> = attempts.iter().map(|r| r.result.status).collect();
    assert_eq!(
        statuses,
        vec![ExecutionStatus::Failure, ExecutionStatus::Failure, ExecutionStatus::Success]
    );

    let node = report.node("flaky").unwrap();
    assert_eq!(node.attempts, 3);
    assert_eq!(
        node.path,
        vec![
            TaskState::Pending,
            TaskState::Routed,
            TaskState::Running,
            TaskState::Failed,
            TaskState::Routed,
            TaskState::Running,
            TaskState::Failed,
            TaskState::Routed,
            TaskState::Running,
            TaskState::Succeeded,
        ]
    );

    let mut scheduled = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::RetryScheduled { attempt, .. } = event {
            scheduled.push(attempt);
        }
    }
    assert_eq!(scheduled, vec![2, 3]);
}

#[tokio::test]
async fn test_retry_exhaustion_fails_the_task() {
    let adapter = Arc::new(MockAdapter::new().fail("doomed", 10));
    let report = engine(adapter.clone())
        .run_task(retrying("doomed", 2), Default::default())
        .await
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(report.exit_code, exit_codes::EXECUTION);
    assert_eq!(adapter.calls(), 2);
    assert_eq!(report.attempts_for("doomed").len(), 2);
    assert_eq!(report.state("doomed"), Some(TaskState::Failed));
    assert!(report.node("doomed").unwrap().error.is_some());
}

#[tokio::test]
async fn test_fallback_substitutes_declared_value() {
    let task = Arc::new(valid_task(patch(
        task_json("guess"),
        json!({ "errorPolicy": { "strategy": "fallback", "fallback": "unknown" } }),
    )));
    let adapter = Arc::new(MockAdapter::new().fail("guess", 1));
    let report = engine(adapter.clone())
        .run_task(task, Default::default())
        .await
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Succeeded);
    assert_eq!(report.outputs("guess").unwrap()["out"], json!("unknown"));
    assert_eq!(adapter.calls(), 1);
    assert_eq!(report.attempts_for("guess").len(), 1);
    // fallback values skip the quality gates
    assert!(report.gates.is_empty());
}

#[tokio::test]
async fn test_timeout_counts_as_failed_attempt() {
    let task = Arc::new(valid_task(patch(
        task_json("sluggish"),
        json!({
            "performance": { "expectedDurationMs": 10, "cost": 0.0, "cacheable": false, "timeoutMs": 20 }
        }),
    )));
    let adapter = Arc::new(MockAdapter::new().delay("sluggish", 1_000));
    let started = std::time::Instant::now();
    let report = engine(adapter)
        .run_task(task, Default::default())
        .await
        .unwrap();

    assert!(started.elapsed() < std::time::Duration::from_millis(800));
    assert_eq!(report.state("sluggish"), Some(TaskState::Failed));
    assert_eq!(report.exit_code, exit_codes::EXECUTION);
    let attempts = report.attempts_for("sluggish");
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].result.status, ExecutionStatus::Failure);
}
