//! Workflow declaration documents and their validation.
//!
//! A workflow document carries inline task declarations plus the control
//! nodes that arrange them. Validation is batched like task validation:
//! every problem in every task and node is reported together.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::core::dag::{EdgeKind, WorkflowGraph};
use crate::core::declaration::{parse_document, Format, TaskDeclaration};
use crate::core::task::{InputSource, Task, TaskId, Values};
use crate::core::validator::{self, ValidationReport};
use crate::Result;

use super::types::{
    DistributionStrategy, JoinPolicy, JoinSpec, MergeStrategy, NodeId, NodeKind, OrganizerSpec,
    WorkItem, WorkerSpec, Workflow, WorkflowNode,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowHeader {
    pub id: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPolicyDeclaration {
    pub strategy: Option<String>,
    pub fallback: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDeclaration {
    pub id: Option<String>,
    /// `task`, `fork`, `join` or `organizer`.
    pub kind: Option<String>,
    #[serde(default)]
    pub after: Vec<String>,
    /// Task run by a task or organizer node.
    pub task: Option<String>,
    pub fork: Option<String>,
    pub merge: Option<String>,
    pub min_success: Option<usize>,
    pub error_policy: Option<JoinPolicyDeclaration>,
    pub distribution: Option<String>,
    pub workers: Option<Vec<WorkerSpec>>,
    pub items: Option<Vec<WorkItem>>,
    pub max_reassignments: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDeclaration {
    pub workflow: Option<WorkflowHeader>,
    #[serde(default)]
    pub tasks: Vec<TaskDeclaration>,
    /// When empty, every task becomes a task node ordered by its data.
    #[serde(default)]
    pub nodes: Vec<NodeDeclaration>,
}

impl WorkflowDeclaration {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        parse_document(&text, Format::from_path(path))
    }
}

/// A declaration file of either kind.
#[derive(Debug, Clone)]
pub enum Document {
    Task(TaskDeclaration),
    Workflow(WorkflowDeclaration),
}

impl Document {
    /// Load a declaration, treating documents with a `workflow` table as
    /// workflows and anything else as a single task.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let raw: serde_json::Value = parse_document(&text, Format::from_path(path))?;
        let is_workflow = raw
            .as_object()
            .is_some_and(|o| o.contains_key("workflow") || o.contains_key("nodes"));
        if is_workflow {
            Ok(Document::Workflow(serde_json::from_value(raw)?))
        } else {
            Ok(Document::Task(serde_json::from_value(raw)?))
        }
    }
}

/// Validate a task meant to run on its own.
///
/// Besides the declaration rules, its inputs may not come from other
/// tasks and config sources must exist.
pub fn validate_standalone(
    decl: &TaskDeclaration,
    config: &Config,
) -> std::result::Result<Task, ValidationReport> {
    let task = validator::validate(decl)?;
    let mut report = ValidationReport::default();
    for (i, input) in task.inputs.iter().enumerate() {
        let path = format!("inputs[{}].source", i);
        match &input.source {
            InputSource::Task { task: upstream, .. } => report.push(
                path,
                format!("task '{}' is not available outside a workflow", upstream),
            ),
            InputSource::Config { key } if config.value(key).is_none() => {
                report.push(path, format!("config value '{}' is not defined", key))
            }
            _ => {}
        }
    }
    if report.is_empty() {
        Ok(task)
    } else {
        Err(report)
    }
}

/// Validate a workflow declaration into a runnable `Workflow`.
pub fn build(
    decl: &WorkflowDeclaration,
    config: &Config,
) -> std::result::Result<Workflow, ValidationReport> {
    let mut report = ValidationReport::default();

    let header = decl.workflow.clone().unwrap_or_default();
    let id = header
        .id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    if id.is_none() {
        report.push("workflow.id", "required field is missing");
    }

    let mut tasks: BTreeMap<TaskId, Arc<Task>> = BTreeMap::new();
    for (i, task_decl) in decl.tasks.iter().enumerate() {
        match validator::validate(task_decl) {
            Ok(task) => {
                if tasks.contains_key(&task.id) {
                    report.push(
                        format!("tasks[{}].task", i),
                        format!("task '{}' declared twice", task.id),
                    );
                } else {
                    tasks.insert(task.id.clone(), Arc::new(task));
                }
            }
            Err(errors) => report.extend(errors.scoped(&format!("tasks[{}]", i))),
        }
    }
    if decl.tasks.is_empty() {
        report.push("tasks", "workflow declares no tasks");
    }

    let node_decls: Vec<NodeDeclaration> = if decl.nodes.is_empty() {
        decl.tasks
            .iter()
            .filter_map(|t| t.task.clone())
            .map(|task| NodeDeclaration {
                id: Some(task.clone()),
                kind: Some("task".into()),
                task: Some(task),
                ..Default::default()
            })
            .collect()
    } else {
        decl.nodes.clone()
    };

    let mut graph = WorkflowGraph::new();
    let mut task_nodes: HashMap<TaskId, NodeId> = HashMap::new();
    let mut placed: Vec<(usize, NodeId)> = Vec::new();
    for (i, node_decl) in node_decls.iter().enumerate() {
        let base = format!("nodes[{}]", i);
        let Some(node) = node_from_declaration(&mut report, &base, node_decl, &tasks) else {
            continue;
        };
        if let NodeKind::Task { task } = &node.kind {
            if let Some(existing) = task_nodes.get(task) {
                report.push(
                    format!("{}.task", base),
                    format!("task '{}' already runs in node '{}'", task, existing),
                );
                continue;
            }
            task_nodes.insert(task.clone(), node.id.clone());
        }
        let node_id = node.id.clone();
        match graph.add_node(node) {
            Ok(_) => placed.push((i, node_id)),
            Err(e) => report.push(format!("{}.id", base), e.to_string()),
        }
    }

    // ordering edges
    for (i, node_id) in &placed {
        for (j, after) in node_decls[*i].after.iter().enumerate() {
            let from = NodeId::from(after.as_str());
            if !graph.contains(&from) {
                report.push(
                    format!("nodes[{}].after[{}]", i, j),
                    format!("unknown node '{}'", after),
                );
                continue;
            }
            if let Err(e) = graph.add_edge(&from, node_id, EdgeKind::Order) {
                report.push(format!("nodes[{}].after[{}]", i, j), e.to_string());
            }
        }
    }

    // data edges and source resolution
    for (i, node_id) in &placed {
        let Some(task) = graph
            .node(node_id)
            .and_then(|n| n.task_id())
            .and_then(|t| tasks.get(t))
            .cloned()
        else {
            continue;
        };
        for (k, input) in task.inputs.iter().enumerate() {
            let path = format!("nodes[{}].inputs[{}].source", i, k);
            match &input.source {
                InputSource::Task {
                    task: upstream,
                    output,
                } => {
                    let Some(upstream_task) = tasks.get(upstream) else {
                        report.push(path, format!("unknown task '{}'", upstream));
                        continue;
                    };
                    if upstream_task.output(output).is_none() {
                        report.push(
                            path,
                            format!("task '{}' declares no output '{}'", upstream, output),
                        );
                        continue;
                    }
                    let Some(from) = task_nodes.get(upstream) else {
                        report.push(
                            path,
                            format!("task '{}' does not run in any task node", upstream),
                        );
                        continue;
                    };
                    let edge = EdgeKind::Data {
                        output: output.clone(),
                    };
                    if let Err(e) = graph.add_edge(from, node_id, edge) {
                        report.push(path, e.to_string());
                    }
                }
                InputSource::Config { key } if config.value(key).is_none() => {
                    report.push(path, format!("config value '{}' is not defined", key));
                }
                _ => {}
            }
        }
    }

    validate_joins(&mut report, &graph, &placed);

    if !report.is_empty() {
        return Err(report);
    }
    let description = header.description.unwrap_or_default();
    match id {
        Some(id) => Ok(Workflow {
            id,
            description,
            tasks,
            graph,
        }),
        None => Err(report),
    }
}

fn node_from_declaration(
    report: &mut ValidationReport,
    base: &str,
    decl: &NodeDeclaration,
    tasks: &BTreeMap<TaskId, Arc<Task>>,
) -> Option<WorkflowNode> {
    let kind_name = decl.kind.as_deref().unwrap_or("task");
    let id = decl
        .id
        .clone()
        .or_else(|| (kind_name == "task").then(|| decl.task.clone()).flatten())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if id.is_none() {
        report.push(format!("{}.id", base), "required field is missing");
    }

    let task_ref = |report: &mut ValidationReport| -> Option<TaskId> {
        match decl.task.as_deref() {
            None => {
                report.push(format!("{}.task", base), "required field is missing");
                None
            }
            Some(name) => {
                let task_id = TaskId::from(name);
                if tasks.contains_key(&task_id) {
                    Some(task_id)
                } else {
                    report.push(format!("{}.task", base), format!("unknown task '{}'", name));
                    None
                }
            }
        }
    };

    let kind = match kind_name {
        "task" => task_ref(report).map(|task| NodeKind::Task { task }),
        "fork" => Some(NodeKind::Fork),
        "join" => join_spec(report, base, decl).map(NodeKind::Join),
        "organizer" => {
            let task = task_ref(report);
            organizer_spec(report, base, decl, task).map(NodeKind::Organizer)
        }
        other => {
            report.push(
                format!("{}.kind", base),
                format!("unknown node kind '{}' (task, fork, join, organizer)", other),
            );
            None
        }
    }?;

    Some(WorkflowNode {
        id: NodeId::from(id?),
        kind,
    })
}

fn join_spec(report: &mut ValidationReport, base: &str, decl: &NodeDeclaration) -> Option<JoinSpec> {
    let fork = decl.fork.as_deref().map(NodeId::from);
    if fork.is_none() {
        report.push(format!("{}.fork", base), "join requires its fork node");
    }
    let merge = match decl.merge.as_deref() {
        None => {
            report.push(format!("{}.merge", base), "join requires a merge strategy");
            None
        }
        Some(raw) => match raw.parse::<MergeStrategy>() {
            Ok(m) => Some(m),
            Err(e) => {
                report.push(format!("{}.merge", base), e);
                None
            }
        },
    };
    if decl.min_success == Some(0) {
        report.push(format!("{}.minSuccess", base), "minSuccess must be at least 1");
    }
    let policy = match &decl.error_policy {
        None => Some(JoinPolicy::Abort),
        Some(p) => match p.strategy.as_deref() {
            None | Some("abort") => Some(JoinPolicy::Abort),
            Some("fallback") => match &p.fallback {
                Some(serde_json::Value::Object(map)) => Some(JoinPolicy::Fallback {
                    value: map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                }),
                Some(other) => {
                    let mut value = Values::new();
                    value.insert("value".into(), other.clone());
                    Some(JoinPolicy::Fallback { value })
                }
                None => {
                    report.push(
                        format!("{}.errorPolicy.fallback", base),
                        "fallback strategy requires a fallback value",
                    );
                    None
                }
            },
            Some(other) => {
                report.push(
                    format!("{}.errorPolicy.strategy", base),
                    format!("unknown join strategy '{}' (abort, fallback)", other),
                );
                None
            }
        },
    };
    Some(JoinSpec {
        fork: fork?,
        merge: merge?,
        min_success: decl.min_success,
        policy: policy?,
    })
}

fn organizer_spec(
    report: &mut ValidationReport,
    base: &str,
    decl: &NodeDeclaration,
    task: Option<TaskId>,
) -> Option<OrganizerSpec> {
    let distribution = match decl.distribution.as_deref() {
        None => {
            report.push(
                format!("{}.distribution", base),
                "organizer requires a distribution strategy",
            );
            None
        }
        Some(raw) => match raw.parse::<DistributionStrategy>() {
            Ok(d) => Some(d),
            Err(e) => {
                report.push(format!("{}.distribution", base), e);
                None
            }
        },
    };
    let workers = decl.workers.clone().unwrap_or_default();
    if workers.is_empty() {
        report.push(format!("{}.workers", base), "organizer requires a worker pool");
    }
    let mut seen = HashSet::new();
    for (i, worker) in workers.iter().enumerate() {
        if !seen.insert(worker.id.as_str()) {
            report.push(
                format!("{}.workers[{}].id", base, i),
                format!("duplicate worker '{}'", worker.id),
            );
        }
    }
    let items = decl.items.clone().unwrap_or_default();
    if items.is_empty() {
        report.push(format!("{}.items", base), "organizer requires work items");
    }
    let mut seen = HashSet::new();
    for (i, item) in items.iter().enumerate() {
        if !seen.insert(item.id.as_str()) {
            report.push(
                format!("{}.items[{}].id", base, i),
                format!("duplicate item '{}'", item.id),
            );
        }
    }
    if workers.is_empty() || items.is_empty() {
        return None;
    }
    Some(OrganizerSpec {
        task: task?,
        distribution: distribution?,
        workers,
        items,
        max_reassignments: decl.max_reassignments.unwrap_or(1),
    })
}

fn validate_joins(report: &mut ValidationReport, graph: &WorkflowGraph, placed: &[(usize, NodeId)]) {
    for (i, node_id) in placed {
        let Some(WorkflowNode {
            kind: NodeKind::Join(spec),
            ..
        }) = graph.node(node_id)
        else {
            continue;
        };
        let base = format!("nodes[{}]", i);
        match graph.node(&spec.fork) {
            Some(WorkflowNode {
                kind: NodeKind::Fork,
                ..
            }) => {}
            Some(_) => {
                report.push(
                    format!("{}.fork", base),
                    format!("node '{}' is not a fork", spec.fork),
                );
                continue;
            }
            None => {
                report.push(
                    format!("{}.fork", base),
                    format!("unknown fork '{}'", spec.fork),
                );
                continue;
            }
        }
        if !graph.reaches(&spec.fork, node_id) {
            report.push(
                format!("{}.fork", base),
                format!("join is not downstream of fork '{}'", spec.fork),
            );
            continue;
        }
        let branches = graph.branches(&spec.fork, node_id).len();
        if let Some(min) = spec.min_success {
            if min > branches {
                report.push(
                    format!("{}.minSuccess", base),
                    format!("minSuccess {} exceeds the {} branch(es) of the fork", min, branches),
                );
            }
        }
    }
}
