//! Per-node run state with transition validation.
//!
//! `NodeRun` tracks one node through a run and enforces the lifecycle:
//!
//! Pending -> Routed -> Running -> {Succeeded | Failed | Skipped}
//!
//! `Failed` may return to `Routed` when the error policy grants another
//! attempt, or settle as `Succeeded` when a fallback value stands in.
//! `Cancelled` is reachable from any non-terminal state and from a `Failed`
//! node waiting out its backoff. `AwaitingReview` holds a node whose output
//! waits on a human verdict. Quality gates run after a node succeeded, so a
//! `Succeeded` node may still be moved to `Failed` or `AwaitingReview`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Routed,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
    AwaitingReview,
}

impl TaskState {
    /// No further transitions, except a retry out of `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded
                | TaskState::Failed
                | TaskState::Skipped
                | TaskState::Cancelled
                | TaskState::AwaitingReview
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Routed => "routed",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
            TaskState::Cancelled => "cancelled",
            TaskState::AwaitingReview => "awaiting_review",
        }
    }

    pub fn can_transition(&self, target: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, target),
            (Pending, Routed)
                | (Pending, Running)
                | (Pending, Succeeded)
                | (Pending, Failed)
                | (Pending, Skipped)
                | (Pending, Cancelled)
                | (Routed, Running)
                | (Routed, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Skipped)
                | (Running, Cancelled)
                | (Running, AwaitingReview)
                | (Succeeded, Failed)
                | (Succeeded, AwaitingReview)
                | (Failed, Routed)
                | (Failed, Succeeded)
                | (Failed, Cancelled)
                | (AwaitingReview, Succeeded)
                | (AwaitingReview, Failed)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub state: TaskState,
    pub at: DateTime<Utc>,
}

/// Lifecycle of one node within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRun {
    pub node: NodeId,
    state: TaskState,
    history: Vec<StateChange>,
    /// Attempts started so far.
    attempts: u32,
}

impl NodeRun {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            state: TaskState::Pending,
            history: vec![StateChange {
                state: TaskState::Pending,
                at: Utc::now(),
            }],
            attempts: 0,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn can_transition(&self, target: TaskState) -> bool {
        self.state.can_transition(target)
    }

    /// Move to `target`. Entering `Running` starts a new attempt.
    pub fn transition(&mut self, target: TaskState) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidTransition {
                from: format!("{} ({})", self.state, self.node),
                to: target.to_string(),
            });
        }
        if target == TaskState::Running {
            self.attempts += 1;
        }
        self.state = target;
        self.history.push(StateChange {
            state: target,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Settle on a terminal state, skipping the check when already there.
    pub fn finish(&mut self, target: TaskState) -> Result<()> {
        if self.state == target {
            return Ok(());
        }
        self.transition(target)
    }

    /// States visited, in order.
    pub fn path(&self) -> Vec<TaskState> {
        self.history.iter().map(|c| c.state).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeRun {
        NodeRun::new(NodeId::from("t"))
    }

    #[test]
    fn test_new_node_is_pending() {
        let run = node();
        assert_eq!(run.state(), TaskState::Pending);
        assert_eq!(run.history().len(), 1);
        assert_eq!(run.attempts(), 0);
    }

    #[test]
    fn test_happy_path() {
        let mut run = node();
        run.transition(TaskState::Routed).unwrap();
        run.transition(TaskState::Running).unwrap();
        run.transition(TaskState::Succeeded).unwrap();
        assert_eq!(
            run.path(),
            vec![
                TaskState::Pending,
                TaskState::Routed,
                TaskState::Running,
                TaskState::Succeeded
            ]
        );
        assert_eq!(run.attempts(), 1);
    }

    #[test]
    fn test_retry_cycle_counts_attempts() {
        let mut run = node();
        run.transition(TaskState::Routed).unwrap();
        for _ in 0..2 {
            run.transition(TaskState::Running).unwrap();
            run.transition(TaskState::Failed).unwrap();
            run.transition(TaskState::Routed).unwrap();
        }
        run.transition(TaskState::Running).unwrap();
        run.transition(TaskState::Succeeded).unwrap();
        assert_eq!(run.attempts(), 3);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut run = node();
        assert!(matches!(
            run.transition(TaskState::Succeeded).and_then(|_| run.transition(TaskState::Running)),
            Err(Error::InvalidTransition { .. })
        ));

        let mut skipped = node();
        skipped.transition(TaskState::Skipped).unwrap();
        assert!(skipped.transition(TaskState::Routed).is_err());
        assert_eq!(skipped.state(), TaskState::Skipped);
    }

    #[test]
    fn test_cancelled_is_terminal() {
        let mut run = node();
        run.transition(TaskState::Routed).unwrap();
        run.transition(TaskState::Running).unwrap();
        run.transition(TaskState::Cancelled).unwrap();
        assert!(run.state().is_terminal());
        assert!(run.transition(TaskState::Succeeded).is_err());
    }

    #[test]
    fn test_gate_can_hold_or_reject_success() {
        let mut held = node();
        held.transition(TaskState::Succeeded).unwrap();
        held.transition(TaskState::AwaitingReview).unwrap();
        held.transition(TaskState::Succeeded).unwrap();

        let mut rejected = node();
        rejected.transition(TaskState::Succeeded).unwrap();
        rejected.transition(TaskState::Failed).unwrap();
        assert!(rejected.transition(TaskState::Running).is_err());
    }

    #[test]
    fn test_awaiting_review_resolves() {
        let mut run = node();
        run.transition(TaskState::Routed).unwrap();
        run.transition(TaskState::Running).unwrap();
        run.transition(TaskState::AwaitingReview).unwrap();
        run.transition(TaskState::Succeeded).unwrap();
        assert_eq!(run.state(), TaskState::Succeeded);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let mut run = node();
        run.finish(TaskState::Skipped).unwrap();
        run.finish(TaskState::Skipped).unwrap();
        assert_eq!(run.history().len(), 2);
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&TaskState::AwaitingReview).unwrap(),
            r#""awaiting_review""#
        );
    }
}
