//! Observed duration and cost per task.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::core::result::ExecutionResult;
use crate::core::task::{Task, TaskId};
use crate::alog_warn;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetrics {
    pub count: u64,
    pub total_duration_ms: u64,
    pub total_cost: f64,
    pub overruns: u64,
}

impl TaskMetrics {
    pub fn mean_duration(&self) -> Option<Duration> {
        (self.count > 0).then(|| Duration::from_millis(self.total_duration_ms / self.count))
    }

    pub fn mean_cost(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total_cost / self.count as f64)
    }
}

/// Shared tracker; clones see the same records.
#[derive(Debug, Clone, Default)]
pub struct PerformanceTracker {
    records: Arc<RwLock<HashMap<TaskId, TaskMetrics>>>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one attempt. Cached results are not observations.
    pub async fn record(&self, task: &Task, result: &ExecutionResult) {
        if result.cached {
            return;
        }
        let budget = task.performance.expected_duration_ms;
        let overrun = budget > 0 && result.duration_ms > budget;
        if overrun {
            alog_warn!(
                "{} took {}ms, expected {}ms",
                task.id,
                result.duration_ms,
                budget
            );
        }
        let mut records = self.records.write().await;
        let entry = records.entry(task.id.clone()).or_default();
        entry.count += 1;
        entry.total_duration_ms += result.duration_ms;
        entry.total_cost += result.cost;
        if overrun {
            entry.overruns += 1;
        }
    }

    pub async fn get(&self, task_id: &TaskId) -> Option<TaskMetrics> {
        self.records.read().await.get(task_id).cloned()
    }

    /// Observed mean duration, or the declared expectation before any run.
    pub async fn expected(&self, task: &Task) -> Duration {
        self.records
            .read()
            .await
            .get(&task.id)
            .and_then(TaskMetrics::mean_duration)
            .unwrap_or_else(|| task.expected_duration())
    }

    pub async fn snapshot(&self) -> HashMap<TaskId, TaskMetrics> {
        self.records.read().await.clone()
    }
}
