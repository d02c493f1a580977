//! Error/retry coordinator.
//!
//! Applies a task's error policy the same way for every executor kind.
//! Each attempt runs under the task's hard timeout and the branch's
//! cancellation token; every attempt is appended to the [`AttemptLog`].

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::result::{AttemptKey, AttemptLog, ExecutionResult};
use crate::core::task::{ErrorPolicy, ExecutorKind, Task, Values};
use crate::error::{Error, Result};
use crate::orchestration::adapters::{ExecutionAdapter, ExecutionContext};
use crate::orchestration::events::{EngineEvent, EventSink};
use crate::workflow::state::{NodeRun, TaskState};
use crate::workflow::types::WorkflowRunId;
use crate::{alog, alog_debug, alog_warn};

/// What one task execution is about.
#[derive(Debug, Clone)]
pub struct AttemptRequest<'a> {
    pub run_id: WorkflowRunId,
    pub task: &'a Task,
    pub kind: ExecutorKind,
    pub inputs: &'a Values,
    pub cancel: &'a CancellationToken,
    pub worker: Option<String>,
    pub item: Option<String>,
    /// Attempts already spent elsewhere; numbering continues after them.
    pub attempt_base: u32,
}

/// Final result of a task after its error policy has been applied.
#[derive(Debug)]
pub struct TaskOutcome {
    pub result: ExecutionResult,
    pub attempts: u32,
    /// Set when the task did not succeed.
    pub error: Option<Error>,
}

impl TaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.result.is_success()
    }

    pub fn was_cancelled(&self) -> bool {
        matches!(self.error, Some(Error::Cancelled))
    }

    /// The attempt is parked on a review with no verdict yet.
    pub fn is_pending(&self) -> bool {
        self.error.is_none() && self.result.is_pending()
    }
}

#[derive(Clone)]
pub struct RetryCoordinator {
    config: Arc<Config>,
    log: AttemptLog,
    events: EventSink,
}

impl RetryCoordinator {
    pub fn new(config: Arc<Config>, log: AttemptLog, events: EventSink) -> Self {
        Self {
            config,
            log,
            events,
        }
    }

    pub fn log(&self) -> &AttemptLog {
        &self.log
    }

    /// Run `request` through `adapter` until it succeeds or its policy
    /// gives up.
    ///
    /// `node` must be `Routed`; it ends `Succeeded`, `Failed`, `Cancelled`
    /// or, when the adapter parks the attempt on a review, `AwaitingReview`.
    pub async fn execute(
        &self,
        adapter: &dyn ExecutionAdapter,
        request: AttemptRequest<'_>,
        node: &mut NodeRun,
    ) -> Result<TaskOutcome> {
        let task = request.task;
        let timeout = task.hard_timeout(self.config.global_timeout());
        let mut attempt = request.attempt_base;
        let mut tries = 0;

        loop {
            if request.cancel.is_cancelled() {
                node.finish(TaskState::Cancelled)?;
                return Ok(cancelled(&request, attempt, tries));
            }
            attempt += 1;
            tries += 1;
            node.transition(TaskState::Running)?;

            let ctx = ExecutionContext {
                run_id: request.run_id,
                attempt,
                cancel: request.cancel.clone(),
                worker: request.worker.clone(),
                item: request.item.clone(),
                timeout,
            };
            let started = Instant::now();
            let (mut result, timed_out) = tokio::select! {
                biased;
                _ = request.cancel.cancelled() => {
                    adapter.abandon(task, &ctx).await;
                    let mut r = ExecutionResult::failure(task.id.clone(), request.kind, "cancelled");
                    r.cancelled = true;
                    (r, false)
                }
                r = tokio::time::timeout(timeout, adapter.execute(task, request.inputs, &ctx)) => match r {
                    Ok(result) => (result, false),
                    Err(_) => {
                        adapter.abandon(task, &ctx).await;
                        let message = format!("timed out after {:?}", timeout);
                        (ExecutionResult::failure(task.id.clone(), request.kind, message), true)
                    }
                },
            };
            if request.cancel.is_cancelled() {
                // a late result after cancellation is discarded
                result.cancelled = true;
            }
            result.attempt = attempt;
            result.executor_kind = request.kind;
            result.worker = request.worker.clone();
            result.item = request.item.clone();
            if result.duration_ms == 0 {
                result.duration_ms = started.elapsed().as_millis() as u64;
            }
            self.record(&request, result.clone()).await;

            if result.is_success() {
                node.transition(TaskState::Succeeded)?;
                return Ok(TaskOutcome {
                    result,
                    attempts: tries,
                    error: None,
                });
            }
            if result.is_pending() {
                alog!("{} attempt {} awaiting review", task.id, attempt);
                node.transition(TaskState::AwaitingReview)?;
                return Ok(TaskOutcome {
                    result,
                    attempts: tries,
                    error: None,
                });
            }
            if result.cancelled {
                alog_debug!("{} attempt {} cancelled", task.id, attempt);
                node.transition(TaskState::Cancelled)?;
                return Ok(TaskOutcome {
                    result,
                    attempts: tries,
                    error: Some(Error::Cancelled),
                });
            }

            let message = result.error.clone().unwrap_or_else(|| "unknown failure".into());
            let error = if timed_out {
                Error::ExecutionTimeout {
                    task_id: task.id.clone(),
                    executor: request.kind,
                    attempt,
                    timeout,
                }
            } else {
                Error::ExecutorFailure {
                    task_id: task.id.clone(),
                    executor: request.kind,
                    attempt,
                    message,
                }
            };
            alog_warn!("{}", error);
            node.transition(TaskState::Failed)?;

            match &task.error_policy {
                ErrorPolicy::Retry(policy) if tries < policy.max_attempts => {
                    let delay = policy.delay_after(tries);
                    alog!(
                        "{}: retrying ({}/{}) in {:?}",
                        task.id,
                        tries + 1,
                        policy.max_attempts,
                        delay
                    );
                    self.events.emit(EngineEvent::RetryScheduled {
                        run_id: request.run_id,
                        task_id: task.id.clone(),
                        attempt: attempt + 1,
                        delay_ms: delay.as_millis() as u64,
                    });
                    if !self.backoff(delay, request.cancel).await {
                        node.transition(TaskState::Cancelled)?;
                        return Ok(cancelled(&request, attempt, tries));
                    }
                    node.transition(TaskState::Routed)?;
                }
                ErrorPolicy::Fallback { value } => {
                    alog!("{}: substituting fallback value", task.id);
                    let mut fallback =
                        ExecutionResult::success(task.id.clone(), request.kind, value.clone());
                    fallback.fallback = true;
                    fallback.attempt = attempt;
                    fallback.worker = request.worker.clone();
                    fallback.item = request.item.clone();
                    node.transition(TaskState::Succeeded)?;
                    return Ok(TaskOutcome {
                        result: fallback,
                        attempts: tries,
                        error: None,
                    });
                }
                _ => {
                    return Ok(TaskOutcome {
                        result,
                        attempts: tries,
                        error: Some(error),
                    });
                }
            }
        }
    }

    /// Sleep out a backoff; false when cancelled first.
    async fn backoff(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn record(&self, request: &AttemptRequest<'_>, result: ExecutionResult) {
        self.events.emit(EngineEvent::AttemptFinished {
            run_id: request.run_id,
            task_id: request.task.id.clone(),
            attempt: result.attempt,
            status: result.status,
            duration_ms: result.duration_ms,
            worker: result.worker.clone(),
        });
        let key = AttemptKey {
            run_id: request.run_id,
            task_id: request.task.id.clone(),
            item: request.item.clone(),
            attempt: result.attempt,
        };
        if !self.log.record(key, result).await {
            alog_warn!(
                "attempt {} of {} already recorded",
                request.task.id,
                request.run_id
            );
        }
    }
}

fn cancelled(request: &AttemptRequest<'_>, attempt: u32, attempts: u32) -> TaskOutcome {
    let mut result = ExecutionResult::failure(request.task.id.clone(), request.kind, "cancelled");
    result.cancelled = true;
    result.attempt = attempt;
    TaskOutcome {
        result,
        attempts,
        error: Some(Error::Cancelled),
    }
}

impl std::fmt::Debug for RetryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryCoordinator").finish()
    }
}
