//! Worker Pool - bounded-concurrency activity executor
//!
//! Dequeues leased tasks, runs the registered activity with a timeout, and
//! reports the outcome back to the orchestrator over a completion channel.
//! A timed-out attempt is reported as a retryable failure; a task whose
//! worker never completes at all is reclaimed by the queue's lease sweep.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use sb_common::WorkerPoolConfig;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::activity::{ActivityContext, ActivityOutcome, ActivityRegistry};
use crate::queue::{ActivityTask, TaskQueue};

/// Outcome report for one executed task.
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub task: ActivityTask,
    pub outcome: ActivityOutcome,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolStats {
    pub concurrency: u32,
    pub active_workers: u32,
    pub queue_pending: usize,
    pub queue_leased: usize,
}

pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    registry: Arc<ActivityRegistry>,
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    rate_limiter: Option<Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
    completions: mpsc::Sender<TaskCompletion>,
    active_workers: Arc<AtomicU32>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<TaskQueue>,
        registry: Arc<ActivityRegistry>,
        config: WorkerPoolConfig,
        completions: mpsc::Sender<TaskCompletion>,
    ) -> Self {
        let rate_limiter = config.rate_limit_per_minute.and_then(|rpm| {
            NonZeroU32::new(rpm).map(|nz| Arc::new(RateLimiter::direct(Quota::per_minute(nz))))
        });

        Self {
            semaphore: Arc::new(Semaphore::new(config.concurrency as usize)),
            queue,
            registry,
            config,
            rate_limiter,
            completions,
            active_workers: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let queue_stats = self.queue.stats();
        WorkerPoolStats {
            concurrency: self.config.concurrency,
            active_workers: self.active_workers.load(Ordering::SeqCst),
            queue_pending: queue_stats.pending,
            queue_leased: queue_stats.leased,
        }
    }

    /// Run the dispatch loop until shutdown. Already-dispatched workers are
    /// allowed to finish; their completions drain through the channel.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            concurrency = self.config.concurrency,
            task_timeout_secs = self.config.task_timeout.as_secs(),
            rate_limit = ?self.config.rate_limit_per_minute,
            "Starting worker pool"
        );

        let mut reclaim_ticker = tokio::time::interval(self.config.reclaim_interval);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Worker pool shutting down");
                    break;
                }
                _ = reclaim_ticker.tick() => {
                    let reclaimed = self.queue.reclaim_expired();
                    if reclaimed > 0 {
                        warn!(reclaimed, "Requeued tasks with expired leases");
                    }
                }
                task = self.queue.dequeue() => {
                    if let Some(ref limiter) = self.rate_limiter {
                        limiter.until_ready().await;
                    }

                    let permit = match self.semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    let registry = self.registry.clone();
                    let queue = self.queue.clone();
                    let completions = self.completions.clone();
                    let task_timeout = self.config.task_timeout;
                    let active_workers = self.active_workers.clone();

                    tokio::spawn(async move {
                        active_workers.fetch_add(1, Ordering::SeqCst);
                        let started_at = Utc::now();

                        let outcome =
                            Self::execute_task(registry.as_ref(), &task, task_timeout).await;

                        let completed_at = Utc::now();
                        let lease_held = queue.complete(&task.task_id);
                        if !lease_held {
                            debug!(
                                task_id = %task.task_id,
                                "Lease was reclaimed before completion"
                            );
                        }
                        metrics::counter!("sb_activity_attempts_total").increment(1);

                        if completions
                            .send(TaskCompletion {
                                task,
                                outcome,
                                started_at,
                                completed_at,
                            })
                            .await
                            .is_err()
                        {
                            debug!("Completion channel closed, dropping task outcome");
                        }

                        active_workers.fetch_sub(1, Ordering::SeqCst);
                        drop(permit);
                    });
                }
            }
        }
    }

    async fn execute_task(
        registry: &ActivityRegistry,
        task: &ActivityTask,
        task_timeout: Duration,
    ) -> ActivityOutcome {
        let Some(activity) = registry.get(&task.activity) else {
            return ActivityOutcome::fatal(format!(
                "activity {} is not registered",
                task.activity
            ));
        };

        let ctx = ActivityContext {
            workflow_id: task.workflow_id.clone(),
            tenant_id: task.tenant_id.clone(),
            idempotency_key: task.idempotency_key.clone(),
            attempt: task.attempt,
        };

        debug!(
            task_id = %task.task_id,
            activity = %task.activity,
            attempt = task.attempt,
            "Executing activity"
        );

        match tokio::time::timeout(task_timeout, activity.execute(&ctx, &task.input)).await {
            Ok(outcome) => outcome,
            Err(_) => ActivityOutcome::retryable(format!(
                "activity {} timed out after {:?}",
                task.activity, task_timeout
            )),
        }
    }
}
