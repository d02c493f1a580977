//! Engine events for external observers.
//!
//! Events are fire-and-forget: a dropped receiver never stalls a run.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::core::result::ExecutionStatus;
use crate::core::task::{ExecutorKind, TaskId};
use crate::workflow::state::TaskState;
use crate::workflow::types::{NodeId, WorkflowRunId, WorkflowStatus};
use crate::{alog_trace, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum EngineEvent {
    RunStarted {
        run_id: WorkflowRunId,
        workflow: String,
    },
    NodeStarted {
        run_id: WorkflowRunId,
        node: NodeId,
    },
    Routed {
        run_id: WorkflowRunId,
        task_id: TaskId,
        executor: ExecutorKind,
        rule: String,
    },
    AttemptFinished {
        run_id: WorkflowRunId,
        task_id: TaskId,
        attempt: u32,
        status: ExecutionStatus,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        worker: Option<String>,
    },
    RetryScheduled {
        run_id: WorkflowRunId,
        task_id: TaskId,
        attempt: u32,
        delay_ms: u64,
    },
    CacheHit {
        run_id: WorkflowRunId,
        task_id: TaskId,
        key: String,
    },
    BranchCancelled {
        run_id: WorkflowRunId,
        join: NodeId,
        branch: NodeId,
    },
    ItemAssigned {
        run_id: WorkflowRunId,
        organizer: NodeId,
        item: String,
        worker: String,
        reassignment: u32,
    },
    GateEvaluated {
        run_id: WorkflowRunId,
        artifact_id: String,
        layer: u8,
        passed: bool,
        pending: bool,
        issues_found: usize,
    },
    NodeFinished {
        run_id: WorkflowRunId,
        node: NodeId,
        state: TaskState,
    },
    RunFinished {
        run_id: WorkflowRunId,
        status: WorkflowStatus,
    },
}

/// Cloneable handle components use to publish events.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl EventSink {
    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            alog_trace!("event {:?}", event);
            if tx.send(event).is_err() {
                alog_trace!("event receiver gone");
            }
        }
    }
}

/// Drain `rx` into a JSON-lines file until every sender is gone.
pub async fn write_jsonl(mut rx: mpsc::UnboundedReceiver<EngineEvent>, path: &Path) -> Result<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0;
    while let Some(event) = rx.recv().await {
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        written += 1;
    }
    file.flush().await?;
    Ok(written)
}
