//! Execution adapters, one per executor kind.
//!
//! Every adapter turns a task plus bound inputs into the same
//! [`ExecutionResult`] shape, so nothing downstream cares which kind of
//! executor ran.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::result::ExecutionResult;
use crate::core::task::{ExecutorKind, Task, TaskId, Values};
use crate::orchestration::backend::{ReasoningBackend, ReasoningRequest};
use crate::orchestration::catalog::ServiceCatalog;
use crate::orchestration::human::ReviewQueue;
use crate::state::store::{ReviewKind, ReviewRequest, Verdict};
use crate::util::value_text;
use crate::workflow::types::WorkflowRunId;
use crate::{alog, alog_debug, alog_warn};

/// Per-attempt information handed to an adapter.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: WorkflowRunId,
    pub attempt: u32,
    /// Cancelled when the owning branch is abandoned.
    pub cancel: CancellationToken,
    pub worker: Option<String>,
    pub item: Option<String>,
    /// Hard timeout of this attempt.
    pub timeout: Duration,
}

impl ExecutionContext {
    pub fn new(run_id: WorkflowRunId, timeout: Duration) -> Self {
        Self {
            run_id,
            attempt: 1,
            cancel: CancellationToken::new(),
            worker: None,
            item: None,
            timeout,
        }
    }
}

#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    async fn execute(&self, task: &Task, inputs: &Values, ctx: &ExecutionContext)
        -> ExecutionResult;

    /// Called after an attempt was dropped on timeout or cancellation.
    async fn abandon(&self, _task: &Task, _ctx: &ExecutionContext) {}
}

/// Map a produced value onto the task's declared outputs.
///
/// A single-output task takes the value itself, or the matching field when
/// the value is an object holding just that key. Multi-output tasks need an
/// object keyed by output name.
pub fn bind_outputs(task: &Task, value: Value) -> std::result::Result<Values, String> {
    if let [only] = task.outputs.as_slice() {
        let value = match value {
            Value::Object(mut map) if map.len() == 1 && map.contains_key(&only.name) => {
                map.remove(&only.name).unwrap_or(Value::Null)
            }
            other => other,
        };
        let mut outputs = Values::new();
        outputs.insert(only.name.clone(), value);
        return Ok(outputs);
    }
    match value {
        Value::Object(map) => Ok(task
            .outputs
            .iter()
            .filter_map(|o| map.get(&o.name).map(|v| (o.name.clone(), v.clone())))
            .collect()),
        other => Err(format!(
            "expected an object with outputs {}, got {}",
            output_names(task),
            other
        )),
    }
}

fn output_names(task: &Task) -> String {
    task.outputs
        .iter()
        .map(|o| o.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Runs a registered deterministic implementation in-process.
pub struct WorkerAdapter {
    catalog: Arc<dyn ServiceCatalog>,
}

impl WorkerAdapter {
    pub fn new(catalog: Arc<dyn ServiceCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl ExecutionAdapter for WorkerAdapter {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Worker
    }

    async fn execute(&self, task: &Task, inputs: &Values, _ctx: &ExecutionContext) -> ExecutionResult {
        let started = Instant::now();
        let Some(capability) = task.routing.capability.as_deref() else {
            return ExecutionResult::failure(task.id.clone(), self.kind(), "no capability declared");
        };
        let Some(implementation) = self.catalog.lookup(capability) else {
            return ExecutionResult::failure(
                task.id.clone(),
                self.kind(),
                format!("capability '{}' not in catalog", capability),
            );
        };
        let result = match implementation
            .invoke(inputs)
            .and_then(|value| bind_outputs(task, value))
        {
            Ok(outputs) => ExecutionResult::success(task.id.clone(), self.kind(), outputs),
            Err(message) => ExecutionResult::failure(task.id.clone(), self.kind(), message),
        };
        result.with_duration(started.elapsed())
    }
}

/// Agent or Clone: asks a reasoning backend for the outputs.
pub struct ReasoningAdapter {
    kind: ExecutorKind,
    backend: Arc<dyn ReasoningBackend>,
}

impl ReasoningAdapter {
    pub fn agent(backend: Arc<dyn ReasoningBackend>) -> Self {
        Self {
            kind: ExecutorKind::Agent,
            backend,
        }
    }

    pub fn clone_executor(backend: Arc<dyn ReasoningBackend>) -> Self {
        Self {
            kind: ExecutorKind::Clone,
            backend,
        }
    }

    pub fn prompt(task: &Task, inputs: &Values) -> String {
        let mut prompt = format!("Task: {}\n", task.id);
        if !task.description.is_empty() {
            prompt.push_str(&task.description);
            prompt.push('\n');
        }
        if !inputs.is_empty() {
            prompt.push_str("\nInputs:\n");
            for (name, value) in inputs {
                prompt.push_str(&format!("- {}: {}\n", name, value_text(value)));
            }
        }
        let fields: Vec<String> = task
            .outputs
            .iter()
            .map(|o| format!("\"{}\" ({})", o.name, o.value_type.as_str()))
            .collect();
        prompt.push_str(&format!(
            "\nRespond with only a JSON object with the keys {}.",
            fields.join(", ")
        ));
        prompt
    }
}

/// Pull a JSON value out of free text, tolerating a fenced code block.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

#[async_trait]
impl ExecutionAdapter for ReasoningAdapter {
    fn kind(&self) -> ExecutorKind {
        self.kind
    }

    async fn execute(&self, task: &Task, inputs: &Values, ctx: &ExecutionContext) -> ExecutionResult {
        let methodology = match self.kind {
            ExecutorKind::Clone => task.routing.methodology.clone(),
            _ => None,
        };
        let request = ReasoningRequest {
            task_id: task.id.clone(),
            prompt: Self::prompt(task, inputs),
            methodology,
            timeout: ctx.timeout,
        };
        let started = Instant::now();
        let response = match self.backend.complete(&request).await {
            Ok(response) => response,
            Err(e) => {
                return ExecutionResult::failure(task.id.clone(), self.kind, e.to_string())
                    .with_duration(started.elapsed())
            }
        };
        let value = extract_json(&response.text).unwrap_or_else(|| Value::String(response.text.clone()));
        let result = match bind_outputs(task, value) {
            Ok(outputs) => ExecutionResult::success(task.id.clone(), self.kind, outputs),
            Err(message) => {
                alog_warn!("{} response for {} unusable: {}", self.kind, task.id, message);
                ExecutionResult::failure(task.id.clone(), self.kind, message)
            }
        };
        let mut result = result.with_cost(response.cost_usd);
        result.duration_ms = response.duration_ms.max(started.elapsed().as_millis() as u64);
        result
    }
}

/// Id of the review a Human attempt waits on.
pub fn execution_review_id(run_id: WorkflowRunId, task: &TaskId, item: Option<&str>, attempt: u32) -> String {
    match item {
        Some(item) => format!("exec:{}:{}:{}:{}", run_id, task, item, attempt),
        None => format!("exec:{}:{}:{}", run_id, task, attempt),
    }
}

/// Failure message for a rejecting verdict.
pub fn rejection_message(verdict: &Verdict) -> String {
    match &verdict.comment {
        Some(comment) => format!("rejected by reviewer: {}", comment),
        None => "rejected by reviewer".to_string(),
    }
}

/// Asks a human for a task's outputs.
///
/// Waits up to `wait` for the verdict; without one the attempt comes back
/// pending and the request stays on file for a later answer.
pub struct HumanAdapter {
    queue: ReviewQueue,
    wait: Duration,
}

impl HumanAdapter {
    pub fn new(queue: ReviewQueue, wait: Duration) -> Self {
        Self { queue, wait }
    }

    pub fn request_id(task: &Task, ctx: &ExecutionContext) -> String {
        execution_review_id(ctx.run_id, &task.id, ctx.item.as_deref(), ctx.attempt)
    }
}

#[async_trait]
impl ExecutionAdapter for HumanAdapter {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Human
    }

    async fn execute(&self, task: &Task, inputs: &Values, ctx: &ExecutionContext) -> ExecutionResult {
        let started = Instant::now();
        let id = Self::request_id(task, ctx);
        let request = ReviewRequest {
            id: id.clone(),
            kind: ReviewKind::Execution,
            run_id: Some(ctx.run_id),
            task_id: task.id.clone(),
            artifact_id: None,
            summary: if task.description.is_empty() {
                format!("decide {}", task.id)
            } else {
                task.description.clone()
            },
            payload: inputs.clone(),
            created_at: Utc::now(),
        };
        let rx = match self.queue.submit(request).await {
            Ok(rx) => rx,
            Err(e) => return ExecutionResult::failure(task.id.clone(), self.kind(), e.to_string()),
        };

        let verdict = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                if let Err(e) = self.queue.discard(&id).await {
                    alog_warn!("HumanAdapter: discard {} failed: {}", id, e);
                }
                let mut result = ExecutionResult::failure(task.id.clone(), self.kind(), "review discarded");
                result.cancelled = true;
                return result;
            }
            verdict = tokio::time::timeout(self.wait, rx) => match verdict {
                Ok(verdict) => verdict,
                Err(_) => {
                    alog!("HumanAdapter: no verdict yet for {}", id);
                    return ExecutionResult::pending(task.id.clone(), self.kind(), &id)
                        .with_duration(started.elapsed());
                }
            },
        };

        let result = match verdict {
            Ok(v) if v.approved => {
                alog_debug!("HumanAdapter: {} approved", id);
                ExecutionResult::success(task.id.clone(), self.kind(), v.outputs)
            }
            Ok(v) => ExecutionResult::failure(task.id.clone(), self.kind(), rejection_message(&v)),
            Err(_) => ExecutionResult::failure(task.id.clone(), self.kind(), "review channel closed"),
        };
        result.with_duration(started.elapsed())
    }

    async fn abandon(&self, task: &Task, ctx: &ExecutionContext) {
        let id = Self::request_id(task, ctx);
        if let Err(e) = self.queue.discard(&id).await {
            alog_warn!("HumanAdapter: discard {} failed: {}", id, e);
        }
    }
}

/// The four adapters, selected exhaustively by kind.
#[derive(Clone)]
pub struct Adapters {
    agent: Arc<dyn ExecutionAdapter>,
    worker: Arc<dyn ExecutionAdapter>,
    human: Arc<dyn ExecutionAdapter>,
    clone: Arc<dyn ExecutionAdapter>,
}

impl Adapters {
    pub fn new(
        catalog: Arc<dyn ServiceCatalog>,
        backend: Arc<dyn ReasoningBackend>,
        reviews: ReviewQueue,
        review_wait: Duration,
    ) -> Self {
        Self {
            agent: Arc::new(ReasoningAdapter::agent(backend.clone())),
            worker: Arc::new(WorkerAdapter::new(catalog)),
            human: Arc::new(HumanAdapter::new(reviews, review_wait)),
            clone: Arc::new(ReasoningAdapter::clone_executor(backend)),
        }
    }

    /// Replace the adapter for `kind`.
    pub fn with_adapter(mut self, kind: ExecutorKind, adapter: Arc<dyn ExecutionAdapter>) -> Self {
        match kind {
            ExecutorKind::Agent => self.agent = adapter,
            ExecutorKind::Worker => self.worker = adapter,
            ExecutorKind::Human => self.human = adapter,
            ExecutorKind::Clone => self.clone = adapter,
        }
        self
    }

    pub fn for_kind(&self, kind: ExecutorKind) -> &Arc<dyn ExecutionAdapter> {
        match kind {
            ExecutorKind::Agent => &self.agent,
            ExecutorKind::Worker => &self.worker,
            ExecutorKind::Human => &self.human,
            ExecutorKind::Clone => &self.clone,
        }
    }
}
