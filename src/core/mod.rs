//! Core domain models for the orchestration engine.
//!
//! Task declarations and their validated form, the workflow graph, and the
//! results produced while running them.

pub mod dag;
pub mod declaration;
pub mod result;
pub mod task;
pub mod validator;

pub use dag::{EdgeKind, WorkflowGraph};
pub use declaration::{Format, TaskDeclaration};
pub use result::{AttemptKey, AttemptLog, AttemptRecord, ExecutionResult, ExecutionStatus};
pub use task::{ExecutorKind, Task, TaskId, Values};
pub use validator::{validate, ValidationReport, Violation};
