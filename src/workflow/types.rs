//! Core workflow type definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::dag::{EdgeKind, WorkflowGraph};
use crate::core::task::{Task, TaskId, Values};
use crate::error::Result;

/// Unique identifier for one execution of a workflow or task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowRunId(pub Uuid);

impl WorkflowRunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters of the UUID.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkflowRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkflowRunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifier of a node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&TaskId> for NodeId {
    fn from(id: &TaskId) -> Self {
        Self(id.0.clone())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a join decides that its fork has produced enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeStrategy {
    /// Wait for every branch.
    AllComplete,
    /// Proceed on the first successful branch, cancel the rest.
    FirstComplete,
    /// Proceed once more than half the branches succeed.
    MajorityComplete,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::AllComplete => "allComplete",
            MergeStrategy::FirstComplete => "firstComplete",
            MergeStrategy::MajorityComplete => "majorityComplete",
        }
    }
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "allComplete" | "all_complete" => Ok(MergeStrategy::AllComplete),
            "firstComplete" | "first_complete" => Ok(MergeStrategy::FirstComplete),
            "majorityComplete" | "majority_complete" => Ok(MergeStrategy::MajorityComplete),
            other => Err(format!("unknown merge strategy '{}'", other)),
        }
    }
}

/// What a join does when too few branches succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum JoinPolicy {
    /// Fail the join; the failure reaches the workflow.
    Abort,
    /// Succeed with a substitute value.
    Fallback { value: Values },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub fork: NodeId,
    pub merge: MergeStrategy,
    pub min_success: Option<usize>,
    pub policy: JoinPolicy,
}

impl JoinSpec {
    /// Successful branches needed out of `branches`.
    pub fn required(&self, branches: usize) -> usize {
        let floor = self.min_success.unwrap_or(0);
        let base = match self.merge {
            MergeStrategy::AllComplete => self.min_success.unwrap_or(branches),
            MergeStrategy::FirstComplete => 1,
            MergeStrategy::MajorityComplete => branches / 2 + 1,
        };
        match self.merge {
            MergeStrategy::AllComplete => base,
            _ => base.max(floor),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DistributionStrategy {
    /// Cycle through workers in declaration order.
    RoundRobin,
    /// Pick the worker with the fewest in-flight items.
    LoadBalanced,
    /// Keep workers carrying the item's skill tag, then balance load.
    SkillBased,
}

impl DistributionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionStrategy::RoundRobin => "roundRobin",
            DistributionStrategy::LoadBalanced => "loadBalanced",
            DistributionStrategy::SkillBased => "skillBased",
        }
    }
}

impl std::fmt::Display for DistributionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DistributionStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "roundRobin" | "round_robin" => Ok(DistributionStrategy::RoundRobin),
            "loadBalanced" | "load_balanced" => Ok(DistributionStrategy::LoadBalanced),
            "skillBased" | "skill_based" => Ok(DistributionStrategy::SkillBased),
            other => Err(format!("unknown distribution strategy '{}'", other)),
        }
    }
}

/// A worker slot in an organizer pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: String,
    #[serde(default)]
    pub skills: Vec<String>,
}

impl WorkerSpec {
    pub fn has_skill(&self, skill: &str) -> bool {
        self.skills.iter().any(|s| s == skill)
    }
}

/// One unit of work handed to an organizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizerSpec {
    /// Task run once per item.
    pub task: TaskId,
    pub distribution: DistributionStrategy,
    pub workers: Vec<WorkerSpec>,
    pub items: Vec<WorkItem>,
    /// Reassignments allowed per item after its first failure.
    pub max_reassignments: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum NodeKind {
    Task { task: TaskId },
    Fork,
    Join(JoinSpec),
    Organizer(OrganizerSpec),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Task { .. } => "task",
            NodeKind::Fork => "fork",
            NodeKind::Join(_) => "join",
            NodeKind::Organizer(_) => "organizer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: NodeId,
    pub kind: NodeKind,
}

impl WorkflowNode {
    pub fn task(id: &TaskId) -> Self {
        Self {
            id: NodeId::from(id),
            kind: NodeKind::Task { task: id.clone() },
        }
    }

    /// Task executed by this node, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match &self.kind {
            NodeKind::Task { task } => Some(task),
            NodeKind::Organizer(spec) => Some(&spec.task),
            _ => None,
        }
    }
}

/// Aggregate status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Finished apart from a Layer 3 review still waiting for a verdict.
    AwaitingReview,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Succeeded => write!(f, "succeeded"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::AwaitingReview => write!(f, "awaiting_review"),
        }
    }
}

/// A validated workflow: its tasks plus the graph over them.
///
/// Built by [`crate::workflow::declaration::build`] or restored from a
/// [`WorkflowSnapshot`]; immutable afterwards.
#[derive(Debug)]
pub struct Workflow {
    pub id: String,
    pub description: String,
    pub tasks: BTreeMap<TaskId, Arc<Task>>,
    pub graph: WorkflowGraph,
}

impl Workflow {
    pub fn task(&self, id: &TaskId) -> Option<&Arc<Task>> {
        self.tasks.get(id)
    }

    /// Node running `task` as a plain task node.
    pub fn node_for_task(&self, task: &TaskId) -> Option<&WorkflowNode> {
        self.graph
            .nodes()
            .find(|n| matches!(&n.kind, NodeKind::Task { task: t } if t == task))
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            id: self.id.clone(),
            description: self.description.clone(),
            tasks: self.tasks.values().map(|t| (**t).clone()).collect(),
            nodes: self.graph.nodes().cloned().collect(),
            edges: self.graph.edges(),
        }
    }

    /// Rebuild a workflow saved with [`Workflow::snapshot`].
    pub fn restore(snapshot: WorkflowSnapshot) -> Result<Self> {
        let mut graph = WorkflowGraph::new();
        for node in snapshot.nodes {
            graph.add_node(node)?;
        }
        for (from, to, kind) in &snapshot.edges {
            graph.add_edge(from, to, kind.clone())?;
        }
        Ok(Self {
            id: snapshot.id,
            description: snapshot.description,
            tasks: snapshot
                .tasks
                .into_iter()
                .map(|t| (t.id.clone(), Arc::new(t)))
                .collect(),
            graph,
        })
    }
}

/// Serializable form of a [`Workflow`], kept with a paused run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSnapshot {
    pub id: String,
    pub description: String,
    pub tasks: Vec<Task>,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<(NodeId, NodeId, EdgeKind)>,
}
