//! Workflow definitions and per-run node state.

pub mod declaration;
pub mod state;
pub mod types;

pub use declaration::{build, validate_standalone, Document, WorkflowDeclaration};
pub use state::{NodeRun, TaskState};
pub use types::{
    DistributionStrategy, JoinPolicy, JoinSpec, MergeStrategy, NodeId, NodeKind, OrganizerSpec,
    WorkItem, WorkerSpec, Workflow, WorkflowNode, WorkflowRunId, WorkflowSnapshot, WorkflowStatus,
};
