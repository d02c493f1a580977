//! Executor routing from task metadata.

use serde_json::json;
use std::sync::Arc;

use aios::config::Config;
use aios::core::ExecutorKind;
use aios::orchestration::{Router, StaticCatalog};

use crate::fixtures::{engine, patch, task_json, valid_task, with_input, MockAdapter};

fn router() -> Router {
    Router::new(Arc::new(StaticCatalog::with_builtins()), &Config::default())
}

#[test]
fn test_rules_pick_executor_kinds() {
    let router = router();
    let cases = [
        (
            json!({ "routing": { "deterministic": true, "capability": "identity" } }),
            ExecutorKind::Worker,
            "deterministic",
        ),
        (
            json!({
                "executorKind": "agent",
                "routing": { "deterministic": true, "capability": "identity" }
            }),
            ExecutorKind::Agent,
            "override",
        ),
        (
            json!({ "routing": { "criticalDecision": true } }),
            ExecutorKind::Human,
            "critical",
        ),
        (
            json!({ "routing": { "methodology": "tdd" } }),
            ExecutorKind::Clone,
            "methodology",
        ),
        (json!({}), ExecutorKind::Agent, "default"),
    ];

    for (i, (routing, kind, rule)) in cases.into_iter().enumerate() {
        let task = valid_task(patch(task_json(&format!("t{}", i)), routing));
        let decision = router.explain(&task);
        assert_eq!(decision.kind, kind, "case {}", i);
        assert_eq!(decision.rule, rule, "case {}", i);
    }
}

#[test]
fn test_unknown_capability_falls_through() {
    let task = valid_task(patch(
        task_json("lookup"),
        json!({ "routing": { "deterministic": true, "capability": "teleport" } }),
    ));
    let decision = router().explain(&task);
    assert_eq!(decision.kind, ExecutorKind::Agent);
    assert_eq!(decision.rule, "default");
}

#[test]
fn test_configured_default_kind() {
    let config = Config {
        default_executor_kind: ExecutorKind::Human,
        ..Config::default()
    };
    let router = Router::new(Arc::new(StaticCatalog::with_builtins()), &config);
    assert_eq!(router.route(&valid_task(task_json("plain"))), ExecutorKind::Human);
}

#[tokio::test]
async fn test_routing_is_pure_across_runs() {
    let task = Arc::new(valid_task(patch(
        with_input(task_json("upper"), "text", "string", "user"),
        json!({ "routing": { "deterministic": true, "capability": "uppercase" } }),
    )));
    let router = router();
    let before = router.explain(&task);

    let engine = engine(Arc::new(MockAdapter::new()));
    for word in ["a", "b", "c"] {
        let report = engine
            .run_task(
                Arc::clone(&task),
                [("text".to_string(), json!(word))].into_iter().collect(),
            )
            .await
            .unwrap();
        let node = report.node("upper").unwrap();
        assert_eq!(node.executor, Some(before.kind));
        assert_eq!(node.rule.as_deref(), Some(before.rule));
    }

    for _ in 0..10 {
        assert_eq!(router.explain(&task), before);
    }
    assert_eq!(engine.router().explain(&task), before);
}
