//! File-based persistence for runs and human review requests.
//!
//! Layout under the state directory:
//!
//! ```text
//! runs/<runId>/results.json          attempt records, append-only
//! runs/<runId>/artifacts/<task>.json task, inputs and outputs
//! runs/<runId>/report.json           final run report
//! runs/<runId>/checkpoint.json       graph and node states of a run paused on a review
//! reviews/<requestId>.json           review request and verdict
//! ```
//!
//! Writes go through a temp file and a rename so readers never observe a
//! partial document.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::result::AttemptRecord;
use crate::core::task::{ExecutorKind, Task, TaskId, Values};
use crate::error::{Error, Result};
use crate::workflow::state::NodeRun;
use crate::workflow::types::{WorkflowRunId, WorkflowSnapshot};
use crate::alog_debug;

/// `<runId>:<taskId>`, the address of one produced artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactId {
    pub run_id: WorkflowRunId,
    pub task_id: TaskId,
}

impl ArtifactId {
    pub fn new(run_id: WorkflowRunId, task_id: TaskId) -> Self {
        Self { run_id, task_id }
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.run_id, self.task_id)
    }
}

impl std::str::FromStr for ArtifactId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (run, task) = s
            .split_once(':')
            .filter(|(_, task)| !task.is_empty())
            .ok_or_else(|| Error::NotFound(format!("artifact id '{}' (expected <runId>:<taskId>)", s)))?;
        let run_id = run
            .parse::<WorkflowRunId>()
            .map_err(|_| Error::NotFound(format!("run id '{}'", run)))?;
        Ok(Self {
            run_id,
            task_id: TaskId::from(task),
        })
    }
}

/// A task output as handed to the quality gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: ArtifactId,
    pub task: Task,
    pub executor_kind: ExecutorKind,
    pub inputs: Values,
    pub outputs: Values,
    pub produced_at: DateTime<Utc>,
}

/// A run paused on a review: enough to continue it in a later process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCheckpoint {
    pub workflow: WorkflowSnapshot,
    /// User inputs the run started with.
    pub inputs: Values,
    pub nodes: Vec<NodeRun>,
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, serde_json::to_string_pretty(value)?)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(Error::NotFound(path.display().to_string()));
    }
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

fn file_name(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

/// Run records under `<state_dir>/runs`.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.join("runs"),
        }
    }

    pub fn run_dir(&self, run_id: WorkflowRunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    fn artifact_path(&self, id: &ArtifactId) -> PathBuf {
        self.run_dir(id.run_id)
            .join("artifacts")
            .join(format!("{}.json", file_name(id.task_id.as_str())))
    }

    pub fn save_results(&self, run_id: WorkflowRunId, records: &[AttemptRecord]) -> Result<()> {
        alog_debug!("RunStore: {} attempt record(s) for {}", records.len(), run_id);
        write_json(&self.run_dir(run_id).join("results.json"), records)
    }

    pub fn load_results(&self, run_id: WorkflowRunId) -> Result<Vec<AttemptRecord>> {
        read_json(&self.run_dir(run_id).join("results.json"))
    }

    pub fn save_artifact(&self, artifact: &Artifact) -> Result<()> {
        write_json(&self.artifact_path(&artifact.id), artifact)
    }

    pub fn load_artifact(&self, id: &ArtifactId) -> Result<Artifact> {
        read_json(&self.artifact_path(id))
    }

    pub fn save_report<T: Serialize>(&self, run_id: WorkflowRunId, report: &T) -> Result<()> {
        write_json(&self.run_dir(run_id).join("report.json"), report)
    }

    pub fn load_report<T: DeserializeOwned>(&self, run_id: WorkflowRunId) -> Result<T> {
        read_json(&self.run_dir(run_id).join("report.json"))
    }

    fn checkpoint_path(&self, run_id: WorkflowRunId) -> PathBuf {
        self.run_dir(run_id).join("checkpoint.json")
    }

    pub fn save_checkpoint(&self, run_id: WorkflowRunId, checkpoint: &RunCheckpoint) -> Result<()> {
        alog_debug!("RunStore: checkpoint for {}", run_id);
        write_json(&self.checkpoint_path(run_id), checkpoint)
    }

    pub fn load_checkpoint(&self, run_id: WorkflowRunId) -> Result<RunCheckpoint> {
        read_json(&self.checkpoint_path(run_id))
    }

    pub fn has_checkpoint(&self, run_id: WorkflowRunId) -> bool {
        self.checkpoint_path(run_id).exists()
    }

    /// Drop the checkpoint of a run that no longer waits on anything.
    pub fn clear_checkpoint(&self, run_id: WorkflowRunId) -> Result<()> {
        let path = self.checkpoint_path(run_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Why a human is being asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKind {
    /// A Human-executor task needs its outputs supplied.
    Execution,
    /// Layer 3 quality gate on a produced artifact.
    Gate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    pub id: String,
    pub kind: ReviewKind,
    /// Run that waits on the verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<WorkflowRunId>,
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    pub summary: String,
    /// Inputs for execution requests, outputs for gate requests.
    pub payload: Values,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub approved: bool,
    #[serde(default)]
    pub outputs: Values,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl Verdict {
    pub fn approve(outputs: Values) -> Self {
        Self {
            approved: true,
            outputs,
            comment: None,
            decided_at: Utc::now(),
        }
    }

    pub fn reject(comment: impl Into<String>) -> Self {
        Self {
            approved: false,
            outputs: Values::new(),
            comment: Some(comment.into()),
            decided_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRecord {
    pub request: ReviewRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    /// The waiting branch was cancelled; a late verdict is ignored.
    #[serde(default)]
    pub discarded: bool,
}

/// Review requests under `<state_dir>/reviews`, surviving restarts.
#[derive(Debug, Clone)]
pub struct ReviewStore {
    root: PathBuf,
}

impl ReviewStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.join("reviews"),
        }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.json", file_name(id)))
    }

    pub fn save(&self, record: &ReviewRecord) -> Result<()> {
        write_json(&self.path(&record.request.id), record)
    }

    pub fn load(&self, id: &str) -> Result<Option<ReviewRecord>> {
        let path = self.path(id);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Attach a verdict to a stored request.
    pub fn record_verdict(&self, id: &str, verdict: Verdict) -> Result<ReviewRecord> {
        let mut record = self
            .load(id)?
            .ok_or_else(|| Error::NotFound(format!("review request '{}'", id)))?;
        record.verdict = Some(verdict);
        self.save(&record)?;
        Ok(record)
    }

    /// Requests with no verdict that were not discarded.
    pub fn pending(&self) -> Result<Vec<ReviewRecord>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record: ReviewRecord = read_json(&path)?;
            if record.verdict.is_none() && !record.discarded {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.request.created_at.cmp(&b.request.created_at));
        Ok(records)
    }
}
