//! Execution results and the append-only attempt log.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::core::task::{ExecutorKind, TaskId, Values};
use crate::workflow::types::WorkflowRunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Skipped,
    /// Waiting on a review verdict that has not arrived yet.
    Pending,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::Failure => write!(f, "failure"),
            ExecutionStatus::Skipped => write!(f, "skipped"),
            ExecutionStatus::Pending => write!(f, "pending"),
        }
    }
}

/// Normalized outcome of one attempt, identical for every executor kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub executor_kind: ExecutorKind,
    pub status: ExecutionStatus,
    pub outputs: Values,
    pub duration_ms: u64,
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 1-based; 0 for results that did not come from an attempt.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    /// Served from the result cache.
    #[serde(default)]
    pub cached: bool,
    /// Outputs are the declared fallback value.
    #[serde(default)]
    pub fallback: bool,
    /// Produced after the owning branch was cancelled; never counts as success.
    #[serde(default)]
    pub cancelled: bool,
}

impl ExecutionResult {
    pub fn success(task_id: TaskId, executor_kind: ExecutorKind, outputs: Values) -> Self {
        Self {
            task_id,
            executor_kind,
            status: ExecutionStatus::Success,
            outputs,
            duration_ms: 0,
            cost: 0.0,
            error: None,
            attempt: 0,
            worker: None,
            item: None,
            cached: false,
            fallback: false,
            cancelled: false,
        }
    }

    pub fn failure(task_id: TaskId, executor_kind: ExecutorKind, error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failure,
            error: Some(error.into()),
            ..Self::success(task_id, executor_kind, Values::new())
        }
    }

    pub fn skipped(task_id: TaskId, executor_kind: ExecutorKind, reason: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Skipped,
            error: Some(reason.into()),
            ..Self::success(task_id, executor_kind, Values::new())
        }
    }

    /// Parked on review `review_id` with no verdict yet.
    pub fn pending(task_id: TaskId, executor_kind: ExecutorKind, review_id: &str) -> Self {
        Self {
            status: ExecutionStatus::Pending,
            error: Some(format!("awaiting review '{}'", review_id)),
            ..Self::success(task_id, executor_kind, Values::new())
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success && !self.cancelled
    }

    pub fn is_pending(&self) -> bool {
        self.status == ExecutionStatus::Pending && !self.cancelled
    }
}

/// Key of one attempt record: `(run, task, item, attempt)`.
///
/// `item` is set for organizer work items, which run the same task many
/// times in one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptKey {
    pub run_id: WorkflowRunId,
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub key: AttemptKey,
    pub result: ExecutionResult,
}

/// Shared append-only log of every attempt in a process.
#[derive(Debug, Clone, Default)]
pub struct AttemptLog {
    records: Arc<Mutex<BTreeMap<AttemptKey, ExecutionResult>>>,
}

impl AttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Returns false, leaving the log untouched, when the
    /// key was already recorded.
    pub async fn record(&self, key: AttemptKey, result: ExecutionResult) -> bool {
        let mut records = self.records.lock().await;
        if records.contains_key(&key) {
            return false;
        }
        records.insert(key, result);
        true
    }

    /// Attempts of one task in one run, in attempt order.
    pub async fn attempts(&self, run_id: WorkflowRunId, task_id: &TaskId) -> Vec<AttemptRecord> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|(k, _)| k.run_id == run_id && &k.task_id == task_id)
            .map(|(key, result)| AttemptRecord {
                key: key.clone(),
                result: result.clone(),
            })
            .collect()
    }

    pub async fn run(&self, run_id: WorkflowRunId) -> Vec<AttemptRecord> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|(k, _)| k.run_id == run_id)
            .map(|(key, result)| AttemptRecord {
                key: key.clone(),
                result: result.clone(),
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}
