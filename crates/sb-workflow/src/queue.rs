//! Bounded task queue with lease-based reclaim.
//!
//! Dequeue is atomic (each task goes to exactly one worker) and records a
//! lease; a task whose lease lapses without completion is requeued at the
//! front for another worker. Enqueue blocks while the queue is at capacity,
//! so a full queue backpressures the orchestrator's dispatch step instead of
//! dropping work.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// One pending activity invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityTask {
    pub task_id: String,
    pub workflow_id: String,
    pub tenant_id: String,
    pub activity: String,
    pub input: serde_json::Value,
    pub idempotency_key: String,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl ActivityTask {
    pub fn new(
        workflow_id: &str,
        tenant_id: &str,
        activity: &str,
        input: serde_json::Value,
        idempotency_key: &str,
        attempt: u32,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            tenant_id: tenant_id.to_string(),
            activity: activity.to_string(),
            input,
            idempotency_key: idempotency_key.to_string(),
            attempt,
            enqueued_at: Utc::now(),
        }
    }
}

struct TaskLease {
    task: ActivityTask,
    leased_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskQueueStats {
    pub pending: usize,
    pub leased: usize,
    pub capacity: usize,
}

pub struct TaskQueue {
    capacity: usize,
    lease_timeout: Duration,
    pending: Mutex<VecDeque<ActivityTask>>,
    leases: DashMap<String, TaskLease>,
    items_available: Notify,
    space_available: Notify,
}

/// Wakeup fallback so a missed notify can only delay, never deadlock.
const NOTIFY_RECHECK: Duration = Duration::from_millis(50);

impl TaskQueue {
    pub fn new(capacity: usize, lease_timeout: Duration) -> Self {
        Self {
            capacity,
            lease_timeout,
            pending: Mutex::new(VecDeque::new()),
            leases: DashMap::new(),
            items_available: Notify::new(),
            space_available: Notify::new(),
        }
    }

    /// Enqueue a task, waiting while the queue is at capacity.
    pub async fn enqueue(&self, task: ActivityTask) {
        loop {
            let notified = self.space_available.notified();
            {
                let mut pending = self.pending.lock();
                if pending.len() < self.capacity {
                    pending.push_back(task);
                    drop(pending);
                    self.items_available.notify_one();
                    return;
                }
            }
            let _ = tokio::time::timeout(NOTIFY_RECHECK, notified).await;
        }
    }

    /// Take the next task and lease it to the caller.
    pub async fn dequeue(&self) -> ActivityTask {
        loop {
            let notified = self.items_available.notified();
            {
                let mut pending = self.pending.lock();
                if let Some(task) = pending.pop_front() {
                    drop(pending);
                    self.space_available.notify_one();
                    self.leases.insert(
                        task.task_id.clone(),
                        TaskLease {
                            task: task.clone(),
                            leased_at: Instant::now(),
                        },
                    );
                    return task;
                }
            }
            let _ = tokio::time::timeout(NOTIFY_RECHECK, notified).await;
        }
    }

    /// Release the lease for a finished task. Returns false when the lease
    /// was already reclaimed (the completion is from a superseded worker).
    pub fn complete(&self, task_id: &str) -> bool {
        self.leases.remove(task_id).is_some()
    }

    /// Requeue tasks whose lease lapsed without completion. Reclaimed tasks
    /// go to the front and ignore capacity, so reclaim can never deadlock
    /// against a full queue.
    pub fn reclaim_expired(&self) -> usize {
        let expired: Vec<String> = self
            .leases
            .iter()
            .filter(|lease| lease.leased_at.elapsed() >= self.lease_timeout)
            .map(|lease| lease.key().clone())
            .collect();

        let mut reclaimed = 0;
        for task_id in expired {
            if let Some((_, lease)) = self.leases.remove(&task_id) {
                self.pending.lock().push_front(lease.task);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            self.items_available.notify_one();
        }
        reclaimed
    }

    pub fn stats(&self) -> TaskQueueStats {
        TaskQueueStats {
            pending: self.pending.lock().len(),
            leased: self.leases.len(),
            capacity: self.capacity,
        }
    }
}
