//! Workflow Orchestrator
//!
//! Drives each execution's declared activity sequence: asks the definition
//! for the next decision given the persisted history, dispatches the
//! activity through the task queue, suspends until the worker pool reports
//! an outcome, and records every attempt before acting on it. The persisted
//! execution record is the whole suspension state; `resume_all` picks up
//! RUNNING executions after a restart and replays `plan` against their
//! history, so completed activities are never re-invoked.

use dashmap::DashMap;
use rand::Rng;
use sb_common::SyncBridgeError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::ActivityOutcome;
use crate::definition::{ActivityStep, Decision, WorkflowRegistry};
use crate::execution::{ActivityInvocation, WorkflowExecution, WorkflowState};
use crate::queue::{ActivityTask, TaskQueue};
use crate::store::WorkflowStore;
use crate::worker::TaskCompletion;

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(200);

enum StepRun {
    /// Activity succeeded; plan the next decision.
    Completed,
    /// Workflow reached a terminal state; already persisted.
    Finished,
    /// Shutdown or persistence loss; leave RUNNING for a later resume.
    Abandoned,
}

struct OrchestratorInner {
    store: Arc<dyn WorkflowStore>,
    definitions: Arc<WorkflowRegistry>,
    queue: Arc<TaskQueue>,
    pending: DashMap<String, oneshot::Sender<TaskCompletion>>,
    drives: DashMap<String, JoinHandle<()>>,
}

#[derive(Clone)]
pub struct WorkflowOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl WorkflowOrchestrator {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        definitions: Arc<WorkflowRegistry>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                store,
                definitions,
                queue,
                pending: DashMap::new(),
                drives: DashMap::new(),
            }),
        }
    }

    /// Route worker-pool completions to the awaiting dispatch. Late
    /// completions (a reclaimed task finished twice) have no pending entry
    /// and are dropped.
    pub fn start_completion_router(
        &self,
        mut completions: mpsc::Receiver<TaskCompletion>,
    ) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            while let Some(completion) = completions.recv().await {
                match orchestrator.inner.pending.remove(&completion.task.task_id) {
                    Some((_, reply)) => {
                        let _ = reply.send(completion);
                    }
                    None => {
                        debug!(
                            task_id = %completion.task.task_id,
                            "Dropping completion with no waiting dispatch"
                        );
                    }
                }
            }
            debug!("Completion router stopped");
        })
    }

    /// Persist a new execution and start driving it. Returns the workflow id
    /// for status polling.
    pub async fn submit(
        &self,
        workflow_type: &str,
        tenant_id: &str,
        input: serde_json::Value,
    ) -> sb_common::Result<String> {
        if self.inner.definitions.get(workflow_type).is_none() {
            return Err(SyncBridgeError::Workflow(format!(
                "unknown workflow type: {}",
                workflow_type
            )));
        }

        let execution = WorkflowExecution::new(workflow_type, tenant_id, input);
        self.inner
            .store
            .insert(&execution)
            .await
            .map_err(|e| SyncBridgeError::Workflow(format!("failed to persist workflow: {}", e)))?;

        metrics::counter!("sb_workflows_submitted_total").increment(1);
        info!(
            workflow_id = %execution.workflow_id,
            workflow_type = %execution.workflow_type,
            tenant_id = %execution.tenant_id,
            "Workflow submitted"
        );

        let workflow_id = execution.workflow_id.clone();
        self.spawn_drive(execution);
        Ok(workflow_id)
    }

    /// Resume every RUNNING execution from its persisted history. Called on
    /// process start; activities already recorded as successful are not
    /// re-invoked.
    pub async fn resume_all(&self) -> anyhow::Result<usize> {
        let running = self.inner.store.find_by_state(WorkflowState::Running).await?;
        let count = running.len();
        for execution in running {
            info!(
                workflow_id = %execution.workflow_id,
                completed_attempts = execution.history.len(),
                "Resuming workflow"
            );
            self.spawn_drive(execution);
        }
        if count > 0 {
            info!(resumed = count, "Resumed running workflows");
        }
        Ok(count)
    }

    pub async fn status(&self, workflow_id: &str) -> anyhow::Result<Option<WorkflowExecution>> {
        self.inner.store.get(workflow_id).await
    }

    /// Request cooperative cancellation. The currently-running activity is
    /// allowed to finish; no further activities are scheduled.
    pub async fn cancel(&self, workflow_id: &str) -> anyhow::Result<bool> {
        let requested = self.inner.store.request_cancel(workflow_id).await?;
        if requested {
            info!(workflow_id = %workflow_id, "Workflow cancellation requested");
        }
        Ok(requested)
    }

    /// Abort in-flight drives, leaving their executions RUNNING in the store
    /// for the next `resume_all`.
    pub async fn shutdown(&self) {
        let workflow_ids: Vec<String> =
            self.inner.drives.iter().map(|d| d.key().clone()).collect();
        for workflow_id in workflow_ids {
            if let Some((_, handle)) = self.inner.drives.remove(&workflow_id) {
                handle.abort();
            }
        }
        self.inner.pending.clear();
        info!("Workflow orchestrator shut down");
    }

    fn spawn_drive(&self, execution: WorkflowExecution) {
        let orchestrator = self.clone();
        let workflow_id = execution.workflow_id.clone();
        let handle = tokio::spawn(async move {
            let workflow_id = execution.workflow_id.clone();
            orchestrator.drive(execution).await;
            orchestrator.inner.drives.remove(&workflow_id);
        });
        self.inner.drives.insert(workflow_id, handle);
    }

    async fn drive(&self, mut execution: WorkflowExecution) {
        let Some(definition) = self.inner.definitions.get(&execution.workflow_type) else {
            execution.state = WorkflowState::Failed;
            execution.error = Some(format!(
                "no definition registered for workflow type {}",
                execution.workflow_type
            ));
            self.persist(&mut execution).await;
            return;
        };

        loop {
            if self.cancel_requested(&mut execution).await {
                self.finish(&mut execution, WorkflowState::Cancelled, None, None)
                    .await;
                return;
            }

            // plan() sees only persisted input and history, so the same
            // decision sequence replays identically after a restart.
            let decision = definition.plan(&execution.input, &execution.history);
            match decision {
                Decision::Complete(result) => {
                    self.finish(
                        &mut execution,
                        WorkflowState::Completed,
                        Some(result),
                        None,
                    )
                    .await;
                    return;
                }
                Decision::Fail(reason) => {
                    self.finish(&mut execution, WorkflowState::Failed, None, Some(reason))
                        .await;
                    return;
                }
                Decision::RunActivity(step) => {
                    match self.run_step(&mut execution, &step).await {
                        StepRun::Completed => continue,
                        StepRun::Finished => return,
                        StepRun::Abandoned => return,
                    }
                }
            }
        }
    }

    async fn run_step(&self, execution: &mut WorkflowExecution, step: &ActivityStep) -> StepRun {
        // A crash can land between recording an attempt and persisting the
        // terminal workflow state; re-derive the consequences from history.
        if execution.history.iter().any(|inv| {
            inv.activity_name == step.activity
                && matches!(inv.outcome, ActivityOutcome::FatalFailure { .. })
        }) {
            self.finish(
                execution,
                WorkflowState::Failed,
                None,
                Some(format!("activity {} failed fatally", step.activity)),
            )
            .await;
            return StepRun::Finished;
        }

        let prior_attempts = execution
            .history
            .iter()
            .filter(|inv| inv.activity_name == step.activity)
            .count() as u32;
        if prior_attempts >= step.retry.max_attempts {
            self.finish(
                execution,
                WorkflowState::Failed,
                None,
                Some(format!(
                    "activity {} exhausted its {}-attempt retry budget",
                    step.activity, step.retry.max_attempts
                )),
            )
            .await;
            return StepRun::Finished;
        }

        let mut attempt = prior_attempts + 1;
        loop {
            if self.cancel_requested(execution).await {
                self.finish(execution, WorkflowState::Cancelled, None, None)
                    .await;
                return StepRun::Finished;
            }

            let started_at = chrono::Utc::now();
            // The same idempotency key rides along on every retry.
            let task = ActivityTask::new(
                &execution.workflow_id,
                &execution.tenant_id,
                &step.activity,
                step.input.clone(),
                &step.idempotency_key,
                attempt,
            );

            let (reply_tx, reply_rx) = oneshot::channel();
            self.inner.pending.insert(task.task_id.clone(), reply_tx);

            debug!(
                workflow_id = %execution.workflow_id,
                activity = %step.activity,
                attempt,
                "Dispatching activity"
            );
            // Blocks when the queue is full; backpressure stalls dispatch
            // rather than dropping the task.
            self.inner.queue.enqueue(task).await;

            let completion = match reply_rx.await {
                Ok(completion) => completion,
                Err(_) => {
                    warn!(
                        workflow_id = %execution.workflow_id,
                        activity = %step.activity,
                        "Dispatch abandoned before completion"
                    );
                    return StepRun::Abandoned;
                }
            };

            execution.history.push(ActivityInvocation {
                activity_name: step.activity.clone(),
                attempt,
                started_at,
                completed_at: Some(completion.completed_at),
                outcome: completion.outcome.clone(),
            });
            if !self.persist(execution).await {
                return StepRun::Abandoned;
            }

            match completion.outcome {
                ActivityOutcome::Success { .. } => {
                    debug!(
                        workflow_id = %execution.workflow_id,
                        activity = %step.activity,
                        attempt,
                        "Activity succeeded"
                    );
                    return StepRun::Completed;
                }
                ActivityOutcome::FatalFailure { error } => {
                    self.finish(execution, WorkflowState::Failed, None, Some(error))
                        .await;
                    return StepRun::Finished;
                }
                ActivityOutcome::RetryableFailure { error } => {
                    if attempt >= step.retry.max_attempts {
                        self.finish(
                            execution,
                            WorkflowState::Failed,
                            None,
                            Some(format!(
                                "activity {} exhausted its {}-attempt retry budget: {}",
                                step.activity, step.retry.max_attempts, error
                            )),
                        )
                        .await;
                        return StepRun::Finished;
                    }

                    let backoff = Self::backoff_with_jitter(step, attempt);
                    debug!(
                        workflow_id = %execution.workflow_id,
                        activity = %step.activity,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Activity failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    fn backoff_with_jitter(step: &ActivityStep, attempt: u32) -> Duration {
        let base = step.retry.delay_after_attempt(attempt);
        let jitter_ceiling = (base.as_millis() as u64 / 4).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_ceiling);
        base + Duration::from_millis(jitter)
    }

    /// Re-read the cancellation flag from the store; it is the durable
    /// source of truth and survives restarts.
    async fn cancel_requested(&self, execution: &mut WorkflowExecution) -> bool {
        if let Ok(Some(current)) = self.inner.store.get(&execution.workflow_id).await {
            execution.cancel_requested = current.cancel_requested;
        }
        execution.cancel_requested
    }

    async fn finish(
        &self,
        execution: &mut WorkflowExecution,
        state: WorkflowState,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        execution.state = state;
        execution.result = result;
        execution.error = error;
        self.persist(execution).await;

        metrics::counter!("sb_workflows_finished_total").increment(1);
        match state {
            WorkflowState::Completed => info!(
                workflow_id = %execution.workflow_id,
                "Workflow completed"
            ),
            WorkflowState::Cancelled => info!(
                workflow_id = %execution.workflow_id,
                "Workflow cancelled"
            ),
            _ => warn!(
                workflow_id = %execution.workflow_id,
                error = ?execution.error,
                "Workflow failed"
            ),
        }
    }

    async fn persist(&self, execution: &mut WorkflowExecution) -> bool {
        execution.updated_at = chrono::Utc::now();
        for attempt in 1..=PERSIST_ATTEMPTS {
            match self.inner.store.update(execution).await {
                Ok(()) => return true,
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    warn!(
                        workflow_id = %execution.workflow_id,
                        error = %e,
                        "Workflow persist failed, retrying"
                    );
                    tokio::time::sleep(PERSIST_RETRY_DELAY).await;
                }
                Err(e) => {
                    warn!(
                        workflow_id = %execution.workflow_id,
                        error = %e,
                        "Workflow persist failed, abandoning drive"
                    );
                    return false;
                }
            }
        }
        false
    }
}
