//! Organizer/worker distribution.
//!
//! An organizer node runs one task once per work item, spreading the items
//! over a declared pool of workers. Items wait in a [`WorkQueue`] that only
//! the organizer holding a [`QueueClaim`] may touch. A failed item moves to
//! a worker that has not tried it yet, up to `max_reassignments` times,
//! before it counts as a hard failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::result::ExecutionResult;
use crate::core::task::{ExecutorKind, Task, Values};
use crate::error::{Error, Result};
use crate::orchestration::adapters::ExecutionAdapter;
use crate::orchestration::events::{EngineEvent, EventSink};
use crate::orchestration::retry::{AttemptRequest, RetryCoordinator, TaskOutcome};
use crate::workflow::state::{NodeRun, TaskState};
use crate::workflow::types::{DistributionStrategy, NodeId, OrganizerSpec, WorkItem, WorkerSpec, WorkflowRunId};
use crate::{alog, alog_debug, alog_warn};

/// Shared queue of work items.
#[derive(Debug)]
pub struct WorkQueue {
    name: String,
    owner: StdMutex<Option<String>>,
    items: StdMutex<VecDeque<WorkItem>>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            owner: StdMutex::new(None),
            items: StdMutex::new(VecDeque::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Option<String> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Take exclusive ownership. Fails with `QueueOwned` while another
    /// organizer holds the queue.
    pub fn claim(self: &Arc<Self>, owner: &str) -> Result<QueueClaim> {
        let mut current = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(held) = current.as_ref() {
            return Err(Error::QueueOwned {
                queue: self.name.clone(),
                owner: held.clone(),
            });
        }
        *current = Some(owner.to_string());
        alog_debug!("queue '{}' claimed by {}", self.name, owner);
        Ok(QueueClaim {
            queue: Arc::clone(self),
            owner: owner.to_string(),
        })
    }
}

/// Exclusive handle on a [`WorkQueue`]; ownership ends when it drops.
#[derive(Debug)]
pub struct QueueClaim {
    queue: Arc<WorkQueue>,
    owner: String,
}

impl QueueClaim {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn push(&self, item: WorkItem) {
        self.items().push_back(item);
    }

    pub fn pop(&self) -> Option<WorkItem> {
        self.items().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn items(&self) -> std::sync::MutexGuard<'_, VecDeque<WorkItem>> {
        self.queue.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for QueueClaim {
    fn drop(&mut self) {
        let mut owner = self.queue.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if owner.as_deref() == Some(self.owner.as_str()) {
            *owner = None;
        }
    }
}

/// Queues by name, shared across runs of one engine.
#[derive(Debug, Clone, Default)]
pub struct QueueRegistry {
    queues: Arc<StdMutex<HashMap<String, Arc<WorkQueue>>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, name: &str) -> Arc<WorkQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            queues
                .entry(name.to_string())
                .or_insert_with(|| WorkQueue::new(name)),
        )
    }
}

/// Picks workers according to a distribution strategy.
#[derive(Debug)]
pub struct Assigner {
    strategy: DistributionStrategy,
    workers: Vec<WorkerSpec>,
    cursor: usize,
    in_flight: Vec<usize>,
}

impl Assigner {
    pub fn new(strategy: DistributionStrategy, workers: Vec<WorkerSpec>) -> Self {
        let in_flight = vec![0; workers.len()];
        Self {
            strategy,
            workers,
            cursor: 0,
            in_flight,
        }
    }

    /// Index of the next worker for an item needing `skill`, skipping
    /// workers in `tried`.
    pub fn pick(&mut self, skill: Option<&str>, tried: &HashSet<String>) -> Option<usize> {
        let n = self.workers.len();
        let eligible = |w: &WorkerSpec| {
            !tried.contains(&w.id)
                && (self.strategy != DistributionStrategy::SkillBased
                    || skill.map_or(true, |s| w.has_skill(s)))
        };
        let index = match self.strategy {
            DistributionStrategy::RoundRobin => {
                let found = (0..n)
                    .map(|step| (self.cursor + step) % n)
                    .find(|&i| eligible(&self.workers[i]))?;
                self.cursor = (found + 1) % n;
                found
            }
            DistributionStrategy::LoadBalanced | DistributionStrategy::SkillBased => (0..n)
                .filter(|&i| eligible(&self.workers[i]))
                .min_by_key(|&i| (self.in_flight[i], i))?,
        };
        self.in_flight[index] += 1;
        Some(index)
    }

    pub fn release(&mut self, index: usize) {
        if let Some(count) = self.in_flight.get_mut(index) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn worker(&self, index: usize) -> &WorkerSpec {
        &self.workers[index]
    }

    pub fn in_flight(&self, index: usize) -> usize {
        self.in_flight[index]
    }
}

/// How one item ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOutcome {
    pub item: String,
    /// Workers in the order they tried the item.
    pub workers: Vec<String>,
    pub succeeded: bool,
    pub cancelled: bool,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrganizerOutcome {
    /// `{"results": {itemId: outputs}}` over the items that succeeded.
    pub outputs: Values,
    pub items: Vec<ItemOutcome>,
    /// Every attempt made, for persistence and the run report.
    pub results: Vec<ExecutionResult>,
}

impl OrganizerOutcome {
    pub fn hard_failures(&self) -> Vec<&ItemOutcome> {
        self.items
            .iter()
            .filter(|i| !i.succeeded && !i.cancelled)
            .collect()
    }

    pub fn cancelled(&self) -> bool {
        self.items.iter().any(|i| i.cancelled)
    }
}

/// Everything a running item needs, shared between spawned items.
struct ItemContext {
    run_id: WorkflowRunId,
    task: Arc<Task>,
    kind: ExecutorKind,
    adapter: Arc<dyn ExecutionAdapter>,
    coordinator: RetryCoordinator,
    cancel: CancellationToken,
    inputs: Values,
    permits: Arc<Semaphore>,
}

struct ItemRun {
    item: WorkItem,
    worker: usize,
    outcome: Result<TaskOutcome>,
}

/// One organizer node's execution.
pub struct Organizer {
    pub node: NodeId,
    pub spec: OrganizerSpec,
    pub task: Arc<Task>,
    pub kind: ExecutorKind,
    pub adapter: Arc<dyn ExecutionAdapter>,
    pub coordinator: RetryCoordinator,
    pub events: EventSink,
    pub run_id: WorkflowRunId,
    pub cancel: CancellationToken,
    /// Items running at once across all workers.
    pub parallelism: usize,
}

impl Organizer {
    /// Distribute every item of the spec through `queue` and collect the
    /// results.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue this organizer must own for the whole run
    /// * `inputs` - Inputs bound for the organizer's task; each item's
    ///   payload is layered on top
    pub async fn run(self, queue: &Arc<WorkQueue>, inputs: Values) -> Result<OrganizerOutcome> {
        let claim = queue.claim(&format!("{}/{}", self.run_id.short(), self.node))?;
        for item in &self.spec.items {
            claim.push(item.clone());
        }
        alog!(
            "organizer {}: {} item(s) over {} worker(s) by {}",
            self.node,
            claim.len(),
            self.spec.workers.len(),
            self.spec.distribution
        );

        let ctx = Arc::new(ItemContext {
            run_id: self.run_id,
            task: Arc::clone(&self.task),
            kind: self.kind,
            adapter: Arc::clone(&self.adapter),
            coordinator: self.coordinator.clone(),
            cancel: self.cancel.clone(),
            inputs,
            permits: Arc::new(Semaphore::new(self.parallelism.max(1))),
        });
        let serial: Vec<Arc<Mutex<()>>> = self
            .spec
            .workers
            .iter()
            .map(|_| Arc::new(Mutex::new(())))
            .collect();
        let mut assigner = Assigner::new(self.spec.distribution, self.spec.workers.clone());
        let mut tried: HashMap<String, Vec<String>> = HashMap::new();
        let mut spent: HashMap<String, u32> = HashMap::new();
        let mut outcomes: Vec<ItemOutcome> = Vec::new();
        let mut results: Vec<ExecutionResult> = Vec::new();
        let mut collected = serde_json::Map::new();
        let mut running = JoinSet::new();

        while let Some(item) = claim.pop() {
            let skill = self.skill_for(&item);
            match assigner.pick(skill.as_deref(), &HashSet::new()) {
                Some(worker) => {
                    tried.entry(item.id.clone()).or_default().push(assigner.worker(worker).id.clone());
                    self.assigned(&item, assigner.worker(worker), 0);
                    let slot = (worker, assigner.worker(worker).id.clone());
                    running.spawn(run_item(Arc::clone(&ctx), item, slot, 0, Arc::clone(&serial[worker])));
                }
                None => {
                    alog_warn!("organizer {}: no worker can take item {}", self.node, item.id);
                    outcomes.push(ItemOutcome {
                        item: item.id.clone(),
                        workers: Vec::new(),
                        succeeded: false,
                        cancelled: false,
                        attempts: 0,
                        error: Some(format!("no eligible worker for skill {:?}", skill)),
                    });
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            let run = joined.map_err(|e| Error::TaskJoin(e.to_string()))?;
            assigner.release(run.worker);
            let item = run.item;
            let workers = tried.get(&item.id).cloned().unwrap_or_default();
            let outcome = match run.outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    outcomes.push(ItemOutcome {
                        item: item.id.clone(),
                        workers,
                        succeeded: false,
                        cancelled: false,
                        attempts: spent.get(&item.id).copied().unwrap_or(0),
                        error: Some(e.to_string()),
                    });
                    continue;
                }
            };
            let total = spent.entry(item.id.clone()).or_insert(0);
            *total += outcome.attempts;
            let total = *total;
            results.push(outcome.result.clone());

            if outcome.succeeded() {
                collected.insert(
                    item.id.clone(),
                    Value::Object(outcome.result.outputs.clone().into_iter().collect()),
                );
                outcomes.push(ItemOutcome {
                    item: item.id.clone(),
                    workers,
                    succeeded: true,
                    cancelled: false,
                    attempts: total,
                    error: None,
                });
                continue;
            }
            if outcome.was_cancelled() {
                outcomes.push(ItemOutcome {
                    item: item.id.clone(),
                    workers,
                    succeeded: false,
                    cancelled: true,
                    attempts: total,
                    error: Some("cancelled".to_string()),
                });
                continue;
            }
            if outcome.is_pending() {
                // work items do not park; an unanswered review fails the item
                alog_warn!("organizer {}: item {} has no verdict", self.node, item.id);
                outcomes.push(ItemOutcome {
                    item: item.id.clone(),
                    workers,
                    succeeded: false,
                    cancelled: false,
                    attempts: total,
                    error: outcome.result.error.clone(),
                });
                continue;
            }

            let reassignment = workers.len() as u32;
            let failed_on = assigner.worker(run.worker).id.clone();
            let skill = self.skill_for(&item);
            let exclude: HashSet<String> = workers.iter().cloned().collect();
            let next = if reassignment <= self.spec.max_reassignments && !self.cancel.is_cancelled() {
                assigner.pick(skill.as_deref(), &exclude)
            } else {
                None
            };
            match next {
                Some(worker) => {
                    alog!(
                        "organizer {}: item {} failed on {}, reassigning to {}",
                        self.node,
                        item.id,
                        failed_on,
                        assigner.worker(worker).id
                    );
                    tried.entry(item.id.clone()).or_default().push(assigner.worker(worker).id.clone());
                    self.assigned(&item, assigner.worker(worker), reassignment);
                    let slot = (worker, assigner.worker(worker).id.clone());
                    running.spawn(run_item(
                        Arc::clone(&ctx),
                        item,
                        slot,
                        total,
                        Arc::clone(&serial[worker]),
                    ));
                }
                None => {
                    let error = outcome
                        .error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "failed".to_string());
                    alog_warn!(
                        "organizer {}: item {} failed after {} worker(s): {}",
                        self.node,
                        item.id,
                        workers.len(),
                        error
                    );
                    outcomes.push(ItemOutcome {
                        item: item.id.clone(),
                        workers,
                        succeeded: false,
                        cancelled: false,
                        attempts: total,
                        error: Some(error),
                    });
                }
            }
        }
        drop(claim);

        let order: HashMap<&str, usize> = self
            .spec
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.id.as_str(), i))
            .collect();
        outcomes.sort_by_key(|o| order.get(o.item.as_str()).copied().unwrap_or(usize::MAX));

        let mut outputs = Values::new();
        outputs.insert("results".to_string(), Value::Object(collected));
        Ok(OrganizerOutcome {
            outputs,
            items: outcomes,
            results,
        })
    }

    fn skill_for(&self, item: &WorkItem) -> Option<String> {
        item.skill.clone().or_else(|| self.task.routing.skill.clone())
    }

    fn assigned(&self, item: &WorkItem, worker: &WorkerSpec, reassignment: u32) {
        alog_debug!(
            "organizer {}: item {} -> {} (reassignment {})",
            self.node,
            item.id,
            worker.id,
            reassignment
        );
        self.events.emit(EngineEvent::ItemAssigned {
            run_id: self.run_id,
            organizer: self.node.clone(),
            item: item.id.clone(),
            worker: worker.id.clone(),
            reassignment,
        });
    }
}

/// Inputs for one item: the organizer's inputs overlaid with the payload.
///
/// Object payloads map key by key; any other payload binds to the task's
/// first declared input, or `item` when it declares none.
pub fn item_inputs(task: &Task, base: &Values, payload: &Value) -> Values {
    let mut inputs = base.clone();
    match payload {
        Value::Object(map) => {
            for (k, v) in map {
                inputs.insert(k.clone(), v.clone());
            }
        }
        Value::Null => {}
        other => {
            let name = task
                .inputs
                .first()
                .map(|i| i.name.clone())
                .unwrap_or_else(|| "item".to_string());
            inputs.insert(name, other.clone());
        }
    }
    inputs
}

async fn run_item(
    ctx: Arc<ItemContext>,
    item: WorkItem,
    (worker, worker_id): (usize, String),
    attempt_base: u32,
    serial: Arc<Mutex<()>>,
) -> ItemRun {
    let _turn = serial.lock().await;
    let outcome = match ctx.permits.acquire().await {
        Ok(_permit) => {
            let inputs = item_inputs(&ctx.task, &ctx.inputs, &item.payload);
            let mut node = NodeRun::new(NodeId::from(format!("{}#{}", ctx.task.id, item.id)));
            match node.transition(TaskState::Routed) {
                Ok(()) => {
                    let request = AttemptRequest {
                        run_id: ctx.run_id,
                        task: &ctx.task,
                        kind: ctx.kind,
                        inputs: &inputs,
                        cancel: &ctx.cancel,
                        worker: Some(worker_id),
                        item: Some(item.id.clone()),
                        attempt_base,
                    };
                    ctx.coordinator.execute(ctx.adapter.as_ref(), request, &mut node).await
                }
                Err(e) => Err(e),
            }
        }
        Err(_) => Err(Error::Cancelled),
    };
    ItemRun {
        item,
        worker,
        outcome,
    }
}
