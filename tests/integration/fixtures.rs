//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Task and workflow declarations written as JSON documents
//! - A scripted execution adapter standing in for every executor kind
//! - Engines wired to that adapter

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aios::config::Config;
use aios::core::{ExecutionResult, ExecutorKind, Task, TaskDeclaration, Values};
use aios::orchestration::{EventSink, ExecutionAdapter, ExecutionContext};
use aios::util::value_text;
use aios::workflow::{build, Workflow, WorkflowDeclaration};
use aios::Engine;

/// Declaration of a task with one string output `out`, routed by default.
pub fn task_json(id: &str) -> Value {
    json!({
        "task": id,
        "description": format!("{} step", id),
        "responsible": "qa",
        "inputs": [],
        "outputs": [
            { "name": "out", "type": "string", "destination": "return", "persisted": false }
        ],
        "checklist": {},
        "performance": { "expectedDurationMs": 10, "cost": 0.5, "cacheable": false },
        "errorPolicy": { "strategy": "abort" },
        "metadata": { "version": "1.0.0" }
    })
}

/// Add an input to a task declaration.
pub fn with_input(mut task: Value, name: &str, value_type: &str, source: &str) -> Value {
    task["inputs"]
        .as_array_mut()
        .expect("inputs array")
        .push(json!({ "name": name, "type": value_type, "source": source, "required": true }));
    task
}

/// Merge `patch` into the top level of a task declaration.
pub fn patch(mut task: Value, patch: Value) -> Value {
    if let (Some(target), Value::Object(fields)) = (task.as_object_mut(), patch) {
        for (k, v) in fields {
            target.insert(k, v);
        }
    }
    task
}

pub fn declaration(task: Value) -> TaskDeclaration {
    serde_json::from_value(task).expect("task declaration")
}

/// Validate a single task declaration.
pub fn valid_task(task: Value) -> Task {
    aios::core::validate(&declaration(task)).expect("valid task")
}

/// Build a workflow from inline tasks and, optionally, explicit nodes.
pub fn workflow(id: &str, tasks: Vec<Value>, nodes: Vec<Value>) -> Arc<Workflow> {
    let decl: WorkflowDeclaration = serde_json::from_value(json!({
        "workflow": { "id": id, "description": format!("{} workflow", id) },
        "tasks": tasks,
        "nodes": nodes,
    }))
    .expect("workflow declaration");
    match build(&decl, &Config::default()) {
        Ok(workflow) => Arc::new(workflow),
        Err(report) => panic!("workflow {} is invalid: {}", id, report),
    }
}

/// A fork with one single-task branch per name, joined by `merge`.
pub fn fork_join_nodes(branches: &[&str], merge: &str, extra: Value) -> Vec<Value> {
    let mut nodes = vec![json!({ "id": "fork", "kind": "fork" })];
    for branch in branches {
        nodes.push(json!({ "id": branch, "kind": "task", "task": branch, "after": ["fork"] }));
    }
    let mut join = json!({
        "id": "join",
        "kind": "join",
        "fork": "fork",
        "merge": merge,
        "after": branches,
    });
    if let (Some(target), Value::Object(fields)) = (join.as_object_mut(), extra) {
        for (k, v) in fields {
            target.insert(k, v);
        }
    }
    nodes.push(join);
    nodes
}

/// Scripted adapter.
///
/// Answers `out = "<task>(<inputs>)"`, suffixed with `@<worker>` for
/// organizer items. Failures, delays and per-worker faults are scripted
/// by task id.
#[derive(Default)]
pub struct MockAdapter {
    delays: HashMap<String, u64>,
    failures: Mutex<HashMap<String, u32>>,
    faulty: Vec<(String, String)>,
    calls: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, task: &str, ms: u64) -> Self {
        self.delays.insert(task.to_string(), ms);
        self
    }

    /// Fail the next `times` attempts of `task`.
    pub fn fail(self, task: &str, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(task.to_string(), times);
        self
    }

    /// Always fail `item` when `worker` runs it.
    pub fn faulty_worker(mut self, worker: &str, item: &str) -> Self {
        self.faulty.push((worker.to_string(), item.to_string()));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Tasks in call order, as `task` or `task#item@worker`.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionAdapter for MockAdapter {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Agent
    }

    async fn execute(&self, task: &Task, inputs: &Values, ctx: &ExecutionContext) -> ExecutionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = task.id.as_str();
        let entry = match (&ctx.item, &ctx.worker) {
            (Some(item), Some(worker)) => format!("{}#{}@{}", id, item, worker),
            _ => id.to_string(),
        };
        self.log.lock().unwrap().push(entry);

        if let Some(ms) = self.delays.get(id) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        if let (Some(item), Some(worker)) = (&ctx.item, &ctx.worker) {
            if self.faulty.iter().any(|(w, i)| w == worker && i == item) {
                return ExecutionResult::failure(task.id.clone(), ExecutorKind::Agent, "worker fault");
            }
        }
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(id) {
                if *left > 0 {
                    *left -= 1;
                    return ExecutionResult::failure(task.id.clone(), ExecutorKind::Agent, "scripted failure");
                }
            }
        }

        let args: Vec<String> = inputs.values().map(value_text).collect();
        let mut text = format!("{}({})", id, args.join(","));
        if let Some(worker) = &ctx.worker {
            text = format!("{}@{}", text, worker);
        }
        let mut outputs = Values::new();
        outputs.insert("out".to_string(), json!(text));
        ExecutionResult::success(task.id.clone(), ExecutorKind::Agent, outputs)
            .with_duration(Duration::from_millis(5))
            .with_cost(0.5)
    }
}

/// Engine whose agent executor is `adapter`.
pub fn engine(adapter: Arc<MockAdapter>) -> Arc<Engine> {
    engine_with(adapter, Config::default(), EventSink::disabled())
}

pub fn engine_with(adapter: Arc<MockAdapter>, config: Config, events: EventSink) -> Arc<Engine> {
    Engine::builder(config)
        .adapter(ExecutorKind::Agent, adapter)
        .events(events)
        .build()
}

pub fn inputs(pairs: &[(&str, Value)]) -> Values {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
