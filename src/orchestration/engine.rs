//! Workflow engine.
//!
//! Drives a [`Workflow`] to completion. Each pass settles what the graph
//! allows (skips, forks, joins), launches ready task and organizer nodes
//! onto a `JoinSet` bounded by `max_parallel_branches`, then folds the next
//! completion back into the run state.
//!
//! Every fork opens one cancellation scope per branch, nested under the
//! scope of the fork itself. An aborting task or a blocking gate cancels
//! its enclosing scope; a join that has what it needs cancels the branches
//! still running.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::dag::{EdgeKind, WorkflowGraph};
use crate::core::result::{AttemptKey, AttemptLog, AttemptRecord, ExecutionResult};
use crate::core::task::{Destination, ErrorPolicy, ExecutorKind, InputSource, Task, TaskId, Values};
use crate::core::validator::ValidationReport;
use crate::error::{Error, Result};
use crate::exit_codes;
use crate::orchestration::adapters::{execution_review_id, rejection_message, Adapters, ExecutionAdapter};
use crate::orchestration::backend::{CommandBackend, ReasoningBackend};
use crate::orchestration::cache::ResultCache;
use crate::orchestration::catalog::{ServiceCatalog, StaticCatalog};
use crate::orchestration::events::{EngineEvent, EventSink};
use crate::orchestration::gate::{
    failed_items, gate_review_id, AgentReviewer, GateReport, QualityGateManager, QualityGateResult, Reviewer,
    LAYER_HUMAN,
};
use crate::orchestration::human::ReviewQueue;
use crate::orchestration::metrics::PerformanceTracker;
use crate::orchestration::organizer::{ItemOutcome, Organizer, QueueRegistry};
use crate::orchestration::retry::{AttemptRequest, RetryCoordinator};
use crate::orchestration::router::{RouteDecision, Router};
use crate::state::store::{
    Artifact, ArtifactId, ReviewKind, ReviewRecord, ReviewStore, RunCheckpoint, RunStore, Verdict,
};
use crate::util::value_text;
use crate::workflow::state::{NodeRun, TaskState};
use crate::workflow::types::{
    JoinPolicy, JoinSpec, MergeStrategy, NodeId, NodeKind, OrganizerSpec, Workflow, WorkflowNode,
    WorkflowRunId, WorkflowStatus,
};
use crate::{alog, alog_debug, alog_error, alog_warn};

/// Final view of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReport {
    pub node: NodeId,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorKind>,
    /// Routing rule that picked the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub state: TaskState,
    pub path: Vec<TaskState>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: Values,
    #[serde(default)]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ItemOutcome>,
    /// Review request the node waits on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<String>,
}

/// Everything a run produced, as printed by `aios run` and persisted under
/// the run directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: WorkflowRunId,
    pub workflow: String,
    pub status: WorkflowStatus,
    pub exit_code: i32,
    /// Nodes in execution order.
    pub nodes: Vec<NodeReport>,
    pub attempts: Vec<AttemptRecord>,
    pub gates: Vec<GateReport>,
    /// Values exported through `context` destinations.
    pub context: Values,
    pub errors: Vec<String>,
}

impl RunReport {
    pub fn node(&self, id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.node.as_str() == id)
    }

    pub fn state(&self, id: &str) -> Option<TaskState> {
        self.node(id).map(|n| n.state)
    }

    pub fn outputs(&self, id: &str) -> Option<&Values> {
        self.node(id).map(|n| &n.outputs)
    }

    /// Attempts recorded for `task`, in attempt order.
    pub fn attempts_for(&self, task: &str) -> Vec<&AttemptRecord> {
        self.attempts
            .iter()
            .filter(|r| r.key.task_id.as_str() == task)
            .collect()
    }
}

/// Builds an [`Engine`]; every collaborator not set falls back to what the
/// configuration describes.
pub struct EngineBuilder {
    config: Arc<Config>,
    catalog: Option<Arc<dyn ServiceCatalog>>,
    backend: Option<Arc<dyn ReasoningBackend>>,
    adapters: Vec<(ExecutorKind, Arc<dyn ExecutionAdapter>)>,
    reviewers: Vec<Arc<dyn Reviewer>>,
    events: EventSink,
    state_dir: Option<PathBuf>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            catalog: None,
            backend: None,
            adapters: Vec::new(),
            reviewers: Vec::new(),
            events: EventSink::disabled(),
            state_dir: None,
        }
    }

    pub fn catalog(mut self, catalog: Arc<dyn ServiceCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn ReasoningBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Replace the adapter the engine uses for `kind`.
    pub fn adapter(mut self, kind: ExecutorKind, adapter: Arc<dyn ExecutionAdapter>) -> Self {
        self.adapters.push((kind, adapter));
        self
    }

    /// Add a Layer 2 reviewer.
    pub fn reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
        self.reviewers.push(reviewer);
        self
    }

    pub fn events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Persist artifacts, run reports and reviews under `dir`.
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Arc<Engine> {
        let config = self.config;
        let catalog: Arc<dyn ServiceCatalog> = match self.catalog {
            Some(catalog) => catalog,
            None => Arc::new(StaticCatalog::with_builtins()),
        };
        let backend: Arc<dyn ReasoningBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(CommandBackend::from_config(&config)),
        };
        let reviews = match &self.state_dir {
            Some(dir) => ReviewQueue::with_store(ReviewStore::new(dir)),
            None => ReviewQueue::new(),
        };

        let mut adapters = Adapters::new(
            Arc::clone(&catalog),
            Arc::clone(&backend),
            reviews.clone(),
            config.human_review_wait(),
        );
        for (kind, adapter) in self.adapters {
            adapters = adapters.with_adapter(kind, adapter);
        }

        let mut gates = QualityGateManager::new(Arc::clone(&config), reviews, self.events.clone());
        if config.feature("agent_review") {
            gates = gates.with_reviewer(Arc::new(AgentReviewer::new(Arc::clone(&backend), &config)));
        }
        for reviewer in self.reviewers {
            gates = gates.with_reviewer(reviewer);
        }

        let log = AttemptLog::new();
        Arc::new(Engine {
            router: Router::new(catalog, &config),
            adapters,
            coordinator: RetryCoordinator::new(Arc::clone(&config), log.clone(), self.events.clone()),
            cache: ResultCache::new(),
            gates: Arc::new(gates),
            tracker: PerformanceTracker::new(),
            queues: QueueRegistry::new(),
            events: self.events,
            log,
            store: self.state_dir.as_deref().map(RunStore::new),
            config,
        })
    }
}

pub struct Engine {
    config: Arc<Config>,
    router: Router,
    adapters: Adapters,
    coordinator: RetryCoordinator,
    cache: ResultCache,
    gates: Arc<QualityGateManager>,
    tracker: PerformanceTracker,
    queues: QueueRegistry,
    events: EventSink,
    log: AttemptLog,
    store: Option<RunStore>,
}

/// What a finished node hands back to the run loop.
struct Completion {
    run: NodeRun,
    decision: Option<RouteDecision>,
    result: Option<ExecutionResult>,
    gate: Option<GateReport>,
    error: Option<Error>,
    items: Vec<ItemOutcome>,
    /// Review the node now waits on.
    review: Option<String>,
    /// Cancel the scope enclosing the node.
    abort_scope: bool,
}

impl Completion {
    fn new(run: NodeRun, decision: RouteDecision) -> Self {
        Self {
            decision: Some(decision),
            ..Self::settled(run)
        }
    }

    /// A node settled outside an execution, keeping its earlier route.
    fn settled(run: NodeRun) -> Self {
        Self {
            run,
            decision: None,
            result: None,
            gate: None,
            error: None,
            items: Vec::new(),
            review: None,
            abort_scope: false,
        }
    }

    fn failed(mut self, error: Error, abort_scope: bool) -> Self {
        self.error = Some(error);
        self.abort_scope = abort_scope;
        self
    }
}

#[derive(Default)]
struct NodeDetail {
    executor: Option<ExecutorKind>,
    rule: Option<String>,
    outputs: Values,
    cached: bool,
    error: Option<String>,
    items: Vec<ItemOutcome>,
    review: Option<String>,
}

struct RunState {
    run_id: WorkflowRunId,
    user: Values,
    nodes: HashMap<NodeId, NodeRun>,
    details: HashMap<NodeId, NodeDetail>,
    /// Outputs of succeeded tasks, for binding downstream inputs.
    outputs: HashMap<TaskId, Values>,
    launched: HashSet<NodeId>,
    gates: Vec<GateReport>,
    context: Values,
    errors: Vec<Error>,
    /// Attempts and errors from before the run was resumed.
    prior_attempts: Vec<AttemptRecord>,
    prior_errors: Vec<String>,
}

impl RunState {
    fn new(run_id: WorkflowRunId, order: &[WorkflowNode], user: Values) -> Self {
        Self {
            run_id,
            user,
            nodes: order
                .iter()
                .map(|n| (n.id.clone(), NodeRun::new(n.id.clone())))
                .collect(),
            details: HashMap::new(),
            outputs: HashMap::new(),
            launched: HashSet::new(),
            gates: Vec::new(),
            context: Values::new(),
            errors: Vec::new(),
            prior_attempts: Vec::new(),
            prior_errors: Vec::new(),
        }
    }

    /// State of a paused run, from its checkpoint and last report.
    fn restore(order: &[WorkflowNode], checkpoint: RunCheckpoint, report: RunReport) -> Self {
        let mut state = Self::new(report.run_id, order, checkpoint.inputs);
        for run in checkpoint.nodes {
            state.nodes.insert(run.node.clone(), run);
        }
        for node in report.nodes {
            if state.state(&node.node) != TaskState::Pending {
                state.launched.insert(node.node.clone());
            }
            if let (TaskState::Succeeded, Some(task)) = (node.state, &node.task) {
                state.outputs.insert(task.clone(), node.outputs.clone());
            }
            state.details.insert(
                node.node,
                NodeDetail {
                    executor: node.executor,
                    rule: node.rule,
                    outputs: node.outputs,
                    cached: node.cached,
                    error: node.error,
                    items: node.items,
                    review: node.review,
                },
            );
        }
        state.gates = report.gates;
        state.context = report.context;
        state.prior_attempts = report.attempts;
        state.prior_errors = report.errors;
        state
    }

    fn state(&self, id: &NodeId) -> TaskState {
        self.nodes.get(id).map_or(TaskState::Pending, NodeRun::state)
    }

    fn detail(&mut self, id: &NodeId) -> &mut NodeDetail {
        self.details.entry(id.clone()).or_default()
    }

    /// Overwrite an attempt recorded before the resume, such as the pending
    /// attempt a verdict settled.
    fn resolve_attempt(&mut self, key: AttemptKey, result: ExecutionResult) {
        match self.prior_attempts.iter_mut().find(|r| r.key == key) {
            Some(record) => record.result = result,
            None => self.prior_attempts.push(AttemptRecord { key, result }),
        }
    }
}

struct Branch {
    head: NodeId,
    members: BTreeSet<NodeId>,
    token: CancellationToken,
}

/// Cancellation scopes of one run.
struct Scopes {
    run: CancellationToken,
    /// Innermost branch token of every node inside a fork/join pair.
    nodes: HashMap<NodeId, CancellationToken>,
    /// Branches keyed by their join.
    branches: HashMap<NodeId, Vec<Branch>>,
}

impl Scopes {
    fn build(graph: &WorkflowGraph, run: CancellationToken) -> Result<Self> {
        let mut nodes: HashMap<NodeId, CancellationToken> = HashMap::new();
        let mut branches: HashMap<NodeId, Vec<Branch>> = HashMap::new();
        for (fork, join) in graph.fork_join_pairs()? {
            let parent = nodes.get(&fork).cloned().unwrap_or_else(|| run.clone());
            for (head, members) in graph.branches(&fork, &join) {
                let token = parent.child_token();
                for member in &members {
                    nodes.insert(member.clone(), token.clone());
                }
                branches.entry(join.clone()).or_default().push(Branch {
                    head,
                    members,
                    token,
                });
            }
        }
        Ok(Self {
            run,
            nodes,
            branches,
        })
    }

    fn token(&self, id: &NodeId) -> CancellationToken {
        self.nodes.get(id).cloned().unwrap_or_else(|| self.run.clone())
    }
}

enum Readiness {
    Wait,
    Ready,
    Skip(String),
}

enum JoinDecision {
    Wait,
    Skip,
    Merge(Values),
    Unsatisfiable { succeeded: usize, required: usize },
}

enum BranchState {
    Open,
    Succeeded,
    Failed,
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn attempt_log(&self) -> &AttemptLog {
        &self.log
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }

    pub fn reviews(&self) -> &ReviewQueue {
        self.gates.reviews()
    }

    pub fn store(&self) -> Option<&RunStore> {
        self.store.as_ref()
    }

    /// Run a single task as a one-node workflow.
    pub async fn run_task(self: &Arc<Self>, task: Arc<Task>, inputs: Values) -> Result<RunReport> {
        let mut graph = WorkflowGraph::new();
        graph.add_node(WorkflowNode::task(&task.id))?;
        let workflow = Workflow {
            id: task.id.to_string(),
            description: task.description.clone(),
            tasks: BTreeMap::from([(task.id.clone(), task)]),
            graph,
        };
        self.run_workflow(Arc::new(workflow), inputs).await
    }

    /// Run `workflow` to completion.
    ///
    /// Missing user inputs fail before anything runs. Otherwise the run
    /// always produces a report; its status and exit code say how it ended.
    /// A run left waiting on reviews keeps a checkpoint under the state
    /// directory and continues through [`Engine::resume`].
    pub async fn run_workflow(self: &Arc<Self>, workflow: Arc<Workflow>, inputs: Values) -> Result<RunReport> {
        check_user_inputs(&workflow, &inputs)?;
        let order = execution_order(&workflow)?;
        let scopes = Scopes::build(&workflow.graph, CancellationToken::new())?;
        let run_id = WorkflowRunId::new();
        let mut state = RunState::new(run_id, &order, inputs);

        alog!("run {}: workflow '{}' with {} node(s)", run_id.short(), workflow.id, order.len());
        self.events.emit(EngineEvent::RunStarted {
            run_id,
            workflow: workflow.id.clone(),
        });
        self.drive(&workflow, &order, &scopes, &mut state).await?;
        self.finish_run(&workflow, &order, state).await
    }

    /// Continue a run paused on reviews, under its original run id.
    ///
    /// Reviews answered since the pause settle their nodes first; the nodes
    /// they held then run as usual. Reviews still unanswered leave the run
    /// awaiting review with a fresh checkpoint.
    pub async fn resume(self: &Arc<Self>, run_id: WorkflowRunId) -> Result<RunReport> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| Error::NotFound("state directory for runs".to_string()))?;
        let checkpoint = store.load_checkpoint(run_id)?;
        let report: RunReport = store.load_report(run_id)?;
        let workflow = Arc::new(Workflow::restore(checkpoint.workflow.clone())?);
        let order = execution_order(&workflow)?;
        let scopes = Scopes::build(&workflow.graph, CancellationToken::new())?;
        let mut state = RunState::restore(&order, checkpoint, report);

        alog!("run {}: resuming workflow '{}'", run_id.short(), workflow.id);
        self.events.emit(EngineEvent::RunStarted {
            run_id,
            workflow: workflow.id.clone(),
        });
        self.settle_reviews(&workflow, &order, &scopes, &mut state).await?;
        self.drive(&workflow, &order, &scopes, &mut state).await?;
        self.finish_run(&workflow, &order, state).await
    }

    /// Record `verdict` for review `id` and continue the paused run that
    /// waits on it. None when no paused run waits on the review.
    pub async fn respond_review(self: &Arc<Self>, id: &str, verdict: Verdict) -> Result<Option<RunReport>> {
        let reviews = self.gates.reviews();
        let record = reviews
            .store()
            .ok_or_else(|| Error::NotFound("state directory for reviews".to_string()))?
            .load(id)?
            .ok_or_else(|| Error::NotFound(format!("review request '{}'", id)))?;
        reviews.respond(id, verdict).await?;
        match (record.request.run_id, &self.store) {
            (Some(run_id), Some(store)) if store.has_checkpoint(run_id) => self.resume(run_id).await.map(Some),
            _ => Ok(None),
        }
    }

    /// Review requests on file that still wait for a verdict.
    pub fn pending_reviews(&self) -> Result<Vec<ReviewRecord>> {
        match self.gates.reviews().store() {
            Some(store) => store.pending(),
            None => Ok(Vec::new()),
        }
    }

    /// Re-run one gate layer on a stored artifact, delivering `verdict` to
    /// its Layer 3 review first when given. A Layer 3 verdict continues the
    /// run paused on it.
    pub async fn run_gate(
        self: &Arc<Self>,
        artifact_id: &ArtifactId,
        layer: u8,
        verdict: Option<Verdict>,
    ) -> Result<QualityGateResult> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| Error::NotFound("state directory for artifacts".to_string()))?;
        let artifact = store.load_artifact(artifact_id)?;
        let answered = verdict.is_some();
        if let Some(verdict) = verdict {
            self.gates
                .reviews()
                .respond(&gate_review_id(artifact_id), verdict)
                .await?;
        }
        let result = self.gates.run_layer(&artifact, layer).await;
        if answered && layer == LAYER_HUMAN && !result.pending && store.has_checkpoint(artifact_id.run_id) {
            self.resume(artifact_id.run_id).await?;
        }
        Ok(result)
    }

    /// Launch and complete nodes until nothing more can run.
    async fn drive(
        self: &Arc<Self>,
        workflow: &Arc<Workflow>,
        order: &[WorkflowNode],
        scopes: &Scopes,
        state: &mut RunState,
    ) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.config.max_parallel_branches.max(1)));
        let mut running: JoinSet<Completion> = JoinSet::new();
        loop {
            let ready = self.settle(workflow, order, scopes, state);

            // Longest expected work first.
            let mut ranked = Vec::with_capacity(ready.len());
            for id in ready {
                let expected = match workflow.graph.node(&id).and_then(|n| n.task_id()).and_then(|t| workflow.task(t)) {
                    Some(task) => self.tracker.expected(task).await,
                    None => std::time::Duration::ZERO,
                };
                ranked.push((expected, id));
            }
            ranked.sort_by(|a, b| b.0.cmp(&a.0));

            for (_, id) in ranked {
                let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                    break;
                };
                self.launch(workflow, &id, scopes, state, permit, &mut running);
            }

            match running.join_next().await {
                Some(Ok(completion)) => self.complete(completion, scopes, state),
                Some(Err(e)) => {
                    scopes.run.cancel();
                    return Err(Error::TaskJoin(e.to_string()));
                }
                None => return Ok(()),
            }
        }
    }

    /// Skip what never became ready, then report and persist the run.
    async fn finish_run(&self, workflow: &Workflow, order: &[WorkflowNode], mut state: RunState) -> Result<RunReport> {
        let run_id = state.run_id;
        for node in order {
            if state.state(&node.id).is_terminal() {
                continue;
            }
            if held_by_review(&workflow.graph, &node.id, &state) {
                alog_debug!("run {}: {} waits on a review", run_id.short(), node.id);
                continue;
            }
            alog_warn!("run {}: {} never became ready", run_id.short(), node.id);
            self.finish_node(&mut state, &node.id, TaskState::Skipped);
        }

        let reviewing = state.nodes.values().any(|r| r.state() == TaskState::AwaitingReview);
        let checkpoint = (reviewing && self.store.is_some()).then(|| RunCheckpoint {
            workflow: workflow.snapshot(),
            inputs: state.user.clone(),
            nodes: order.iter().filter_map(|n| state.nodes.get(&n.id).cloned()).collect(),
        });

        let report = self.report(workflow, order, state).await;
        if let Some(store) = &self.store {
            store.save_results(run_id, &report.attempts)?;
            store.save_report(run_id, &report)?;
            match checkpoint {
                Some(checkpoint) if report.status == WorkflowStatus::AwaitingReview => {
                    store.save_checkpoint(run_id, &checkpoint)?
                }
                _ => store.clear_checkpoint(run_id)?,
            }
        }
        alog!(
            "run {}: {} (exit {})",
            run_id.short(),
            report.status,
            report.exit_code
        );
        self.events.emit(EngineEvent::RunFinished {
            run_id,
            status: report.status,
        });
        Ok(report)
    }

    /// Settle nodes whose review has a verdict on file by now.
    async fn settle_reviews(
        &self,
        workflow: &Workflow,
        order: &[WorkflowNode],
        scopes: &Scopes,
        state: &mut RunState,
    ) -> Result<()> {
        let Some(store) = self.gates.reviews().store() else {
            return Ok(());
        };
        for node in order {
            if state.state(&node.id) != TaskState::AwaitingReview {
                continue;
            }
            let Some(review) = state.details.get(&node.id).and_then(|d| d.review.clone()) else {
                continue;
            };
            let Some(task) = node.task_id().and_then(|t| workflow.task(t)).cloned() else {
                continue;
            };
            let Some(record) = store.load(&review)? else {
                alog_warn!("{}: review '{}' is not on file", node.id, review);
                continue;
            };
            let Some(verdict) = record.verdict else {
                alog_debug!("{}: still waiting on '{}'", node.id, review);
                continue;
            };
            alog!(
                "{}: review '{}' {}",
                node.id,
                review,
                if verdict.approved { "approved" } else { "rejected" }
            );
            let completion = match record.request.kind {
                ReviewKind::Gate => self.gate_verdict(&task, &node.id, &verdict, state).await,
                ReviewKind::Execution => {
                    let cancel = scopes.token(&node.id);
                    self.execution_verdict(&task, &node.id, verdict, &cancel, state).await
                }
            };
            self.complete(completion, scopes, state);
        }
        Ok(())
    }

    /// Apply a Layer 3 verdict to the node whose artifact it reviewed.
    async fn gate_verdict(&self, task: &Task, id: &NodeId, verdict: &Verdict, state: &mut RunState) -> Completion {
        let mut run = state.nodes.get(id).cloned().unwrap_or_else(|| NodeRun::new(id.clone()));
        let artifact_id = ArtifactId::new(state.run_id, task.id.clone()).to_string();
        let earlier = match state.gates.iter().position(|g| g.artifact_id == artifact_id) {
            Some(i) => state.gates.remove(i),
            None => GateReport {
                artifact_id,
                layers: Vec::new(),
                passed: false,
                pending: true,
            },
        };
        let report = earlier.with_human(QualityGateResult::from_verdict(verdict));

        let mut completion = Completion::settled(run.clone());
        if let Some(error) = report.blocking_failure() {
            alog_error!("{}", error);
            transition(&mut run, TaskState::Failed);
            completion.error = Some(error);
            completion.abort_scope = true;
        } else {
            transition(&mut run, TaskState::Succeeded);
            let detail = state.details.get(id);
            let outputs = detail.map(|d| d.outputs.clone()).unwrap_or_default();
            let executor = detail
                .and_then(|d| d.executor)
                .unwrap_or_else(|| self.router.explain(task).kind);
            write_files(task, &outputs).await;
            let mut result = ExecutionResult::success(task.id.clone(), executor, outputs);
            result.cached = detail.is_some_and(|d| d.cached);
            completion.result = Some(result);
        }
        completion.gate = Some(report);
        completion.run = run;
        completion
    }

    /// Apply a verdict to a Human task whose attempt was parked on it.
    async fn execution_verdict(
        &self,
        task: &Task,
        id: &NodeId,
        verdict: Verdict,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Completion {
        let run_id = state.run_id;
        let mut run = state.nodes.get(id).cloned().unwrap_or_else(|| NodeRun::new(id.clone()));
        let decision = self.router.explain(task);
        let attempt = run.attempts();
        let key = AttemptKey {
            run_id,
            task_id: task.id.clone(),
            item: None,
            attempt,
        };
        let inputs = self.bind_inputs(task, state);

        let mut result = if verdict.approved {
            ExecutionResult::success(task.id.clone(), decision.kind, verdict.outputs.clone())
        } else {
            ExecutionResult::failure(task.id.clone(), decision.kind, rejection_message(&verdict))
        };
        result.attempt = attempt;
        state.resolve_attempt(key, result.clone());

        if result.is_success() {
            transition(&mut run, TaskState::Succeeded);
            return self
                .finish_success(run_id, task, decision, run, inputs, result, cancel)
                .await;
        }
        if let ErrorPolicy::Fallback { value } = &task.error_policy {
            alog!("{}: substituting fallback value", task.id);
            transition(&mut run, TaskState::Succeeded);
            let mut fallback = ExecutionResult::success(task.id.clone(), decision.kind, value.clone());
            fallback.fallback = true;
            fallback.attempt = attempt;
            return self
                .finish_success(run_id, task, decision, run, inputs, fallback, cancel)
                .await;
        }

        let error = Error::ExecutorFailure {
            task_id: task.id.clone(),
            executor: decision.kind,
            attempt,
            message: rejection_message(&verdict),
        };
        alog_error!("{}", error);
        transition(&mut run, TaskState::Failed);
        let mut completion = Completion::new(run, decision);
        completion.result = Some(result);
        completion.failed(error, matches!(task.error_policy, ErrorPolicy::Abort))
    }

    /// Settle every node the graph decides without executing anything and
    /// return the task and organizer nodes ready to launch.
    fn settle(
        &self,
        workflow: &Workflow,
        order: &[WorkflowNode],
        scopes: &Scopes,
        state: &mut RunState,
    ) -> Vec<NodeId> {
        loop {
            let mut changed = false;
            let mut ready = Vec::new();
            for node in order {
                if state.launched.contains(&node.id) || state.state(&node.id).is_terminal() {
                    continue;
                }
                if let NodeKind::Join(spec) = &node.kind {
                    changed |= self.settle_join(&node.id, spec, scopes, state);
                    continue;
                }
                match readiness(workflow, node, state) {
                    Readiness::Wait => {}
                    Readiness::Skip(reason) => {
                        alog_debug!("{} skipped: {}", node.id, reason);
                        state.detail(&node.id).error = Some(reason);
                        self.finish_node(state, &node.id, TaskState::Skipped);
                        changed = true;
                    }
                    Readiness::Ready if scopes.token(&node.id).is_cancelled() => {
                        self.finish_node(state, &node.id, TaskState::Cancelled);
                        changed = true;
                    }
                    Readiness::Ready if matches!(node.kind, NodeKind::Fork) => {
                        self.finish_node(state, &node.id, TaskState::Succeeded);
                        changed = true;
                    }
                    Readiness::Ready => ready.push(node.id.clone()),
                }
            }
            if !changed {
                return ready;
            }
        }
    }

    fn settle_join(&self, id: &NodeId, spec: &JoinSpec, scopes: &Scopes, state: &mut RunState) -> bool {
        match self.join_decision(id, spec, scopes, state) {
            JoinDecision::Wait => false,
            JoinDecision::Skip => {
                self.finish_node(state, id, TaskState::Skipped);
                true
            }
            JoinDecision::Merge(outputs) => {
                state.detail(id).outputs = outputs;
                self.finish_node(state, id, TaskState::Succeeded);
                true
            }
            JoinDecision::Unsatisfiable {
                succeeded,
                required,
            } => {
                let error = Error::JoinUnsatisfiable {
                    join: id.to_string(),
                    succeeded,
                    required,
                };
                match &spec.policy {
                    JoinPolicy::Fallback { value } => {
                        alog_warn!("{}; using fallback", error);
                        state.detail(id).outputs = value.clone();
                        self.finish_node(state, id, TaskState::Succeeded);
                    }
                    JoinPolicy::Abort => {
                        alog_error!("{}", error);
                        state.detail(id).error = Some(error.to_string());
                        state.errors.push(error);
                        scopes.token(id).cancel();
                        self.finish_node(state, id, TaskState::Failed);
                    }
                }
                true
            }
        }
    }

    fn join_decision(&self, id: &NodeId, spec: &JoinSpec, scopes: &Scopes, state: &RunState) -> JoinDecision {
        let fork = state.state(&spec.fork);
        if !fork.is_terminal() {
            return JoinDecision::Wait;
        }
        if fork != TaskState::Succeeded {
            return JoinDecision::Skip;
        }

        let branches = scopes.branches.get(id).map(Vec::as_slice).unwrap_or(&[]);
        let mut succeeded = Vec::new();
        let mut open = Vec::new();
        for branch in branches {
            match branch_state(branch, state) {
                BranchState::Succeeded => succeeded.push(branch),
                BranchState::Open => open.push(branch),
                BranchState::Failed => {}
            }
        }
        let required = spec.required(branches.len());
        let (satisfied, impossible) = match spec.merge {
            MergeStrategy::AllComplete => (
                open.is_empty() && succeeded.len() >= required,
                open.is_empty() && succeeded.len() < required,
            ),
            MergeStrategy::FirstComplete | MergeStrategy::MajorityComplete => (
                succeeded.len() >= required,
                succeeded.len() + open.len() < required,
            ),
        };
        if !satisfied && !impossible {
            return JoinDecision::Wait;
        }

        for branch in open {
            alog!("{}: cancelling branch {}", id, branch.head);
            branch.token.cancel();
            self.events.emit(EngineEvent::BranchCancelled {
                run_id: state.run_id,
                join: id.clone(),
                branch: branch.head.clone(),
            });
        }
        if impossible {
            return JoinDecision::Unsatisfiable {
                succeeded: succeeded.len(),
                required,
            };
        }

        let mut merged = Values::new();
        for branch in succeeded {
            for member in &branch.members {
                if let Some(detail) = state.details.get(member) {
                    if !detail.outputs.is_empty() {
                        merged.insert(
                            member.to_string(),
                            serde_json::to_value(&detail.outputs).unwrap_or_default(),
                        );
                    }
                }
            }
        }
        JoinDecision::Merge(merged)
    }

    fn launch(
        self: &Arc<Self>,
        workflow: &Arc<Workflow>,
        id: &NodeId,
        scopes: &Scopes,
        state: &mut RunState,
        permit: OwnedSemaphorePermit,
        running: &mut JoinSet<Completion>,
    ) {
        let Some(node) = workflow.graph.node(id) else {
            return;
        };
        let task = node.task_id().and_then(|t| workflow.task(t)).cloned();
        let Some(task) = task else {
            alog_error!("{} has no task", id);
            state.errors.push(Error::NotFound(format!("task for node '{}'", id)));
            self.finish_node(state, id, TaskState::Failed);
            return;
        };

        state.launched.insert(id.clone());
        self.events.emit(EngineEvent::NodeStarted {
            run_id: state.run_id,
            node: id.clone(),
        });
        let run = state
            .nodes
            .get(id)
            .cloned()
            .unwrap_or_else(|| NodeRun::new(id.clone()));
        let inputs = self.bind_inputs(&task, state);
        let cancel = scopes.token(id);
        let run_id = state.run_id;
        let engine = Arc::clone(self);

        match &node.kind {
            NodeKind::Organizer(spec) => {
                let spec = spec.clone();
                let queue = format!("{}/{}", workflow.id, id);
                running.spawn(async move {
                    let _permit = permit;
                    engine
                        .execute_organizer(run_id, queue, spec, task, run, inputs, cancel)
                        .await
                });
            }
            _ => {
                running.spawn(async move {
                    let _permit = permit;
                    engine.execute_task(run_id, task, run, inputs, cancel).await
                });
            }
        }
    }

    fn bind_inputs(&self, task: &Task, state: &RunState) -> Values {
        let mut bound = Values::new();
        for input in &task.inputs {
            let value = match &input.source {
                InputSource::Task { task, output } => {
                    state.outputs.get(task).and_then(|o| o.get(output)).cloned()
                }
                InputSource::Config { key } => self.config.value(key).cloned(),
                InputSource::User { key } => state.user.get(key).cloned(),
            }
            .or_else(|| input.default.clone());
            if let Some(value) = value {
                bound.insert(input.name.clone(), value);
            }
        }
        bound
    }

    async fn execute_task(
        self: Arc<Self>,
        run_id: WorkflowRunId,
        task: Arc<Task>,
        mut run: NodeRun,
        inputs: Values,
        cancel: CancellationToken,
    ) -> Completion {
        let decision = self.routed(run_id, &task);
        let aborts = matches!(task.error_policy, ErrorPolicy::Abort);

        let failed = failed_items(&task.checklist.preconditions, &inputs);
        for (item, reason) in failed.iter().filter(|(i, _)| !i.blocking) {
            alog_warn!("{}: precondition '{}' not met: {}", task.id, item.description, reason);
        }
        if let Some((item, reason)) = failed.iter().find(|(i, _)| i.blocking) {
            let error = Error::ExecutorFailure {
                task_id: task.id.clone(),
                executor: decision.kind,
                attempt: 0,
                message: format!("precondition '{}' failed: {}", item.description, reason),
            };
            alog_error!("{}", error);
            transition(&mut run, TaskState::Failed);
            return Completion::new(run, decision).failed(error, aborts);
        }

        let slot = match ResultCache::key_for(&task, &inputs) {
            Some(key) => tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    transition(&mut run, TaskState::Cancelled);
                    return Completion::new(run, decision).failed(Error::Cancelled, false);
                }
                slot = self.cache.slot(&key) => Some(slot),
            },
            None => None,
        };
        if let Some(outputs) = slot.as_ref().and_then(|s| s.get()).cloned() {
            let key = slot.as_ref().map(|s| s.key().to_string()).unwrap_or_default();
            drop(slot);
            alog!("{}: cache hit '{}'", task.id, key);
            self.events.emit(EngineEvent::CacheHit {
                run_id,
                task_id: task.id.clone(),
                key,
            });
            transition(&mut run, TaskState::Succeeded);
            let mut result = ExecutionResult::success(task.id.clone(), decision.kind, outputs);
            result.cached = true;
            return self
                .finish_success(run_id, &task, decision, run, inputs, result, &cancel)
                .await;
        }

        transition(&mut run, TaskState::Routed);
        let adapter = Arc::clone(self.adapters.for_kind(decision.kind));
        let request = AttemptRequest {
            run_id,
            task: &task,
            kind: decision.kind,
            inputs: &inputs,
            cancel: &cancel,
            worker: None,
            item: None,
            attempt_base: 0,
        };
        let outcome = match self.coordinator.execute(adapter.as_ref(), request, &mut run).await {
            Ok(outcome) => outcome,
            Err(e) => {
                alog_error!("{}: {}", task.id, e);
                return Completion::new(run, decision).failed(e, aborts);
            }
        };
        if outcome.is_pending() {
            drop(slot);
            let mut completion = Completion::new(run, decision);
            completion.review = Some(execution_review_id(run_id, &task.id, None, outcome.result.attempt));
            completion.result = Some(outcome.result);
            return completion;
        }
        self.tracker.record(&task, &outcome.result).await;

        if outcome.succeeded() {
            if let Some(slot) = slot {
                if !outcome.result.fallback {
                    slot.fill(outcome.result.outputs.clone());
                }
            }
            return self
                .finish_success(run_id, &task, decision, run, inputs, outcome.result, &cancel)
                .await;
        }
        drop(slot);

        let cancelled = outcome.was_cancelled();
        let mut completion = Completion::new(run, decision);
        completion.result = Some(outcome.result);
        completion.error = outcome.error;
        completion.abort_scope = aborts && !cancelled;
        completion
    }

    /// Persist the artifact of a succeeded task and put it through the
    /// quality gates.
    #[allow(clippy::too_many_arguments)]
    async fn finish_success(
        &self,
        run_id: WorkflowRunId,
        task: &Task,
        decision: RouteDecision,
        mut run: NodeRun,
        inputs: Values,
        result: ExecutionResult,
        cancel: &CancellationToken,
    ) -> Completion {
        let mut completion = Completion::new(run.clone(), decision);
        if cancel.is_cancelled() {
            transition(&mut run, TaskState::Cancelled);
            completion.run = run;
            return completion.failed(Error::Cancelled, false);
        }

        let artifact = Artifact {
            id: ArtifactId::new(run_id, task.id.clone()),
            task: task.clone(),
            executor_kind: decision.kind,
            inputs,
            outputs: result.outputs.clone(),
            produced_at: Utc::now(),
        };
        if let Some(store) = &self.store {
            if let Err(e) = store.save_artifact(&artifact) {
                alog_warn!("{}: could not save artifact: {}", artifact.id, e);
            }
        }

        // Fallback values stand in for outputs nobody produced.
        if !result.fallback {
            let report = self.gates.evaluate(&artifact).await;
            if let Some(error) = report.blocking_failure() {
                alog_error!("{}", error);
                transition(&mut run, TaskState::Failed);
                completion.error = Some(error);
                completion.abort_scope = true;
            } else if report.pending {
                transition(&mut run, TaskState::AwaitingReview);
                completion.review = Some(gate_review_id(&artifact.id));
            }
            completion.gate = Some(report);
        }

        if run.state() == TaskState::Succeeded {
            write_files(task, &result.outputs).await;
        }
        completion.run = run;
        completion.result = Some(result);
        completion
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_organizer(
        self: Arc<Self>,
        run_id: WorkflowRunId,
        queue: String,
        spec: OrganizerSpec,
        task: Arc<Task>,
        mut run: NodeRun,
        inputs: Values,
        cancel: CancellationToken,
    ) -> Completion {
        let decision = self.routed(run_id, &task);
        transition(&mut run, TaskState::Routed);
        transition(&mut run, TaskState::Running);

        let node = run.node.clone();
        let organizer = Organizer {
            node: node.clone(),
            spec,
            task: Arc::clone(&task),
            kind: decision.kind,
            adapter: Arc::clone(self.adapters.for_kind(decision.kind)),
            coordinator: self.coordinator.clone(),
            events: self.events.clone(),
            run_id,
            cancel: cancel.clone(),
            parallelism: self.config.max_parallel_branches,
        };
        let queue = self.queues.queue(&queue);
        let outcome = match organizer.run(&queue, inputs).await {
            Ok(outcome) => outcome,
            Err(e) => {
                alog_error!("organizer {}: {}", node, e);
                transition(&mut run, TaskState::Failed);
                return Completion::new(run, decision).failed(e, false);
            }
        };
        for result in &outcome.results {
            self.tracker.record(&task, result).await;
        }

        let mut completion = Completion::new(run.clone(), decision);
        completion.items = outcome.items.clone();
        let failures = outcome.hard_failures();
        if cancel.is_cancelled() && outcome.cancelled() {
            transition(&mut run, TaskState::Cancelled);
            completion.error = Some(Error::Cancelled);
        } else if !failures.is_empty() {
            let names: Vec<&str> = failures.iter().map(|i| i.item.as_str()).collect();
            let error = Error::ExecutorFailure {
                task_id: task.id.clone(),
                executor: decision.kind,
                attempt: failures.iter().map(|i| i.attempts).max().unwrap_or(0),
                message: format!(
                    "item(s) {} failed: {}",
                    names.join(", "),
                    failures
                        .first()
                        .and_then(|i| i.error.clone())
                        .unwrap_or_default()
                ),
            };
            alog_error!("{}", error);
            transition(&mut run, TaskState::Failed);
            completion.error = Some(error);
            completion.abort_scope = matches!(task.error_policy, ErrorPolicy::Abort);
        } else {
            transition(&mut run, TaskState::Succeeded);
            let duration_ms = outcome.results.iter().map(|r| r.duration_ms).sum();
            let cost = outcome.results.iter().map(|r| r.cost).sum();
            let mut result = ExecutionResult::success(task.id.clone(), decision.kind, outcome.outputs)
                .with_cost(cost);
            result.duration_ms = duration_ms;
            completion.result = Some(result);
        }
        completion.run = run;
        completion
    }

    fn routed(&self, run_id: WorkflowRunId, task: &Task) -> RouteDecision {
        let decision = self.router.explain(task);
        alog_debug!("{} routed to {} by rule '{}'", task.id, decision.kind, decision.rule);
        self.events.emit(EngineEvent::Routed {
            run_id,
            task_id: task.id.clone(),
            executor: decision.kind,
            rule: decision.rule.to_string(),
        });
        decision
    }

    fn complete(&self, completion: Completion, scopes: &Scopes, state: &mut RunState) {
        let Completion {
            run,
            decision,
            result,
            gate,
            error,
            items,
            review,
            abort_scope,
        } = completion;
        let id = run.node.clone();
        let final_state = run.state();

        let detail = state.detail(&id);
        if let Some(decision) = decision {
            detail.executor = Some(decision.kind);
            detail.rule = Some(decision.rule.to_string());
            detail.items = items;
        }
        detail.review = review;
        if let Some(result) = &result {
            detail.cached = result.cached;
            detail.outputs = result.outputs.clone();
        }
        if let Some(error) = &error {
            detail.error = Some(error.to_string());
        }

        if let (Some(result), TaskState::Succeeded) = (&result, final_state) {
            state.outputs.insert(result.task_id.clone(), result.outputs.clone());
        }
        if let Some(gate) = gate {
            state.gates.push(gate);
        }
        if let Some(error) = error {
            if !matches!(error, Error::Cancelled) {
                state.errors.push(error);
            }
        }
        if abort_scope {
            alog_warn!("{} aborted its scope", id);
            scopes.token(&id).cancel();
        }

        state.nodes.insert(id.clone(), run);
        self.events.emit(EngineEvent::NodeFinished {
            run_id: state.run_id,
            node: id,
            state: final_state,
        });
    }

    /// Move a node the engine settles itself (never launched) to `target`.
    fn finish_node(&self, state: &mut RunState, id: &NodeId, target: TaskState) {
        if let Some(run) = state.nodes.get_mut(id) {
            transition(run, target);
        }
        self.events.emit(EngineEvent::NodeFinished {
            run_id: state.run_id,
            node: id.clone(),
            state: target,
        });
    }

    async fn report(&self, workflow: &Workflow, order: &[WorkflowNode], mut state: RunState) -> RunReport {
        // Context exports from every task that ended up succeeded.
        for node in order {
            if state.state(&node.id) != TaskState::Succeeded {
                continue;
            }
            let Some(task) = node.task_id().and_then(|t| workflow.task(t)) else {
                continue;
            };
            let Some(outputs) = state.outputs.get(&task.id) else {
                continue;
            };
            for output in &task.outputs {
                if let (Destination::Context { key }, Some(value)) =
                    (&output.destination, outputs.get(&output.name))
                {
                    state.context.insert(key.clone(), value.clone());
                }
            }
        }

        let status = run_status(&workflow.graph, &state);
        let gate_blocked = state
            .errors
            .iter()
            .any(|e| matches!(e, Error::GateBlockingFailure { .. }))
            || state.gates.iter().any(|g| g.blocking_failure().is_some());
        let exit_code = match status {
            WorkflowStatus::Succeeded | WorkflowStatus::AwaitingReview => exit_codes::OK,
            _ if gate_blocked => exit_codes::GATE_BLOCKED,
            _ => exit_codes::EXECUTION,
        };

        let nodes = order
            .iter()
            .map(|node| {
                let run = state.nodes.get(&node.id);
                let detail = state.details.remove(&node.id).unwrap_or_default();
                NodeReport {
                    node: node.id.clone(),
                    kind: node.kind.name().to_string(),
                    task: node.task_id().cloned(),
                    executor: detail.executor,
                    rule: detail.rule,
                    state: run.map_or(TaskState::Pending, NodeRun::state),
                    path: run.map(NodeRun::path).unwrap_or_default(),
                    attempts: run.map_or(0, NodeRun::attempts),
                    outputs: detail.outputs,
                    cached: detail.cached,
                    error: detail.error,
                    items: detail.items,
                    review: detail.review,
                }
            })
            .collect();

        // Attempts settled on resume replace what the log holds for them.
        let mut attempts: BTreeMap<AttemptKey, ExecutionResult> = self
            .log
            .run(state.run_id)
            .await
            .into_iter()
            .map(|r| (r.key, r.result))
            .collect();
        for record in state.prior_attempts {
            attempts.insert(record.key, record.result);
        }
        let mut errors = state.prior_errors;
        errors.extend(state.errors.iter().map(ToString::to_string));

        RunReport {
            run_id: state.run_id,
            workflow: workflow.id.clone(),
            status,
            exit_code,
            nodes,
            attempts: attempts
                .into_iter()
                .map(|(key, result)| AttemptRecord { key, result })
                .collect(),
            gates: state.gates,
            context: state.context,
            errors,
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("router", &self.router)
            .field("store", &self.store)
            .finish()
    }
}

fn transition(run: &mut NodeRun, target: TaskState) {
    if let Err(e) = run.finish(target) {
        alog_error!("{}", e);
    }
}

fn execution_order(workflow: &Workflow) -> Result<Vec<WorkflowNode>> {
    Ok(workflow
        .graph
        .topological_order()?
        .into_iter()
        .cloned()
        .collect())
}

fn readiness(workflow: &Workflow, node: &WorkflowNode, state: &RunState) -> Readiness {
    let mut blocked = Vec::new();
    for pred in workflow.graph.predecessors(&node.id) {
        let s = state.state(&pred);
        if !s.is_terminal() || s == TaskState::AwaitingReview {
            return Readiness::Wait;
        }
        if s != TaskState::Succeeded {
            blocked.push(pred);
        }
    }
    for pred in blocked {
        match workflow.graph.edge(&pred, &node.id) {
            Some(EdgeKind::Data { .. }) => {
                let upstream = workflow.graph.node(&pred).and_then(|n| n.task_id());
                let task = node.task_id().and_then(|t| workflow.task(t));
                let needed = match (upstream, task) {
                    (Some(upstream), Some(task)) => task.inputs.iter().any(|i| {
                        i.required
                            && i.default.is_none()
                            && matches!(&i.source, InputSource::Task { task, .. } if task == upstream)
                    }),
                    _ => true,
                };
                if needed {
                    return Readiness::Skip(format!("input from '{}' unavailable", pred));
                }
            }
            _ => return Readiness::Skip(format!("'{}' did not succeed", pred)),
        }
    }
    Readiness::Ready
}

fn branch_state(branch: &Branch, state: &RunState) -> BranchState {
    let mut done = true;
    for member in &branch.members {
        match state.state(member) {
            TaskState::Succeeded => {}
            TaskState::AwaitingReview => done = false,
            s if s.is_terminal() => return BranchState::Failed,
            _ => done = false,
        }
    }
    if done {
        BranchState::Succeeded
    } else {
        BranchState::Open
    }
}

/// A node downstream of a node awaiting review waits for the verdict.
fn held_by_review(graph: &WorkflowGraph, id: &NodeId, state: &RunState) -> bool {
    state
        .nodes
        .values()
        .any(|run| run.state() == TaskState::AwaitingReview && graph.reaches(&run.node, id))
}

/// The run succeeds when every sink succeeded. Sinks awaiting review, or
/// still pending behind a node that does, leave it awaiting review.
fn run_status(graph: &WorkflowGraph, state: &RunState) -> WorkflowStatus {
    let sinks: Vec<TaskState> = graph.sinks().iter().map(|s| state.state(s)).collect();
    if sinks.iter().all(|s| *s == TaskState::Succeeded) {
        WorkflowStatus::Succeeded
    } else if sinks.iter().all(|s| {
        matches!(
            s,
            TaskState::Succeeded | TaskState::AwaitingReview | TaskState::Pending
        )
    }) {
        WorkflowStatus::AwaitingReview
    } else {
        WorkflowStatus::Failed
    }
}

fn check_user_inputs(workflow: &Workflow, inputs: &Values) -> Result<()> {
    let mut report = ValidationReport::default();
    for task in workflow.tasks.values() {
        for input in &task.inputs {
            if let InputSource::User { key } = &input.source {
                if input.required && input.default.is_none() && !inputs.contains_key(key) {
                    report.push(
                        format!("tasks.{}.inputs.{}", task.id, input.name),
                        format!("requires user input '{}'", key),
                    );
                }
            }
        }
    }
    if report.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(report))
    }
}

async fn write_files(task: &Task, outputs: &Values) {
    for output in &task.outputs {
        let (Destination::File { path }, Some(value)) = (&output.destination, outputs.get(&output.name)) else {
            continue;
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                alog_warn!("{}: cannot create {}: {}", task.id, parent.display(), e);
                continue;
            }
        }
        match tokio::fs::write(path, value_text(value)).await {
            Ok(()) => alog_debug!("{}: wrote {}", task.id, path.display()),
            Err(e) => alog_warn!("{}: cannot write {}: {}", task.id, path.display(), e),
        }
    }
}
