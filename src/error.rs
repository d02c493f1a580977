use std::time::Duration;

use thiserror::Error;

use crate::core::task::{ExecutorKind, TaskId};
use crate::core::validator::ValidationReport;
use crate::exit_codes;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation failed: {0}")]
    Validation(ValidationReport),

    #[error("Task {task_id} ({executor}) timed out after {timeout:?} on attempt {attempt}")]
    ExecutionTimeout {
        task_id: TaskId,
        executor: ExecutorKind,
        attempt: u32,
        timeout: Duration,
    },

    #[error("Task {task_id} ({executor}) failed on attempt {attempt}: {message}")]
    ExecutorFailure {
        task_id: TaskId,
        executor: ExecutorKind,
        attempt: u32,
        message: String,
    },

    #[error("Quality gate layer {layer} blocked artifact {artifact_id}: {check}")]
    GateBlockingFailure {
        artifact_id: String,
        layer: u8,
        check: String,
    },

    #[error("Join {join} unsatisfiable: {succeeded} branch(es) succeeded, {required} required")]
    JoinUnsatisfiable {
        join: String,
        succeeded: usize,
        required: usize,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow graph: {0}")]
    InvalidGraph(String),

    #[error("Work queue {queue} is already owned by organizer {owner}")]
    QueueOwned { queue: String, owner: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Exit code the CLI reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Validation(_)
            | Error::TomlParse(_)
            | Error::NotFound(_)
            | Error::InvalidGraph(_) => {
                exit_codes::VALIDATION
            }
            Error::GateBlockingFailure { .. } => exit_codes::GATE_BLOCKED,
            _ => exit_codes::EXECUTION,
        }
    }

    /// Whether the error policy of a task may handle this error.
    ///
    /// Validation and gate errors are never retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ExecutionTimeout { .. } | Error::ExecutorFailure { .. } | Error::Backend(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
