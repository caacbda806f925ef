//! Orchestrator integration tests: full engine wiring with stub activities.

use async_trait::async_trait;
use sb_common::{RetryPolicy, WorkerPoolConfig};
use sb_workflow::{
    has_succeeded, Activity, ActivityContext, ActivityOutcome, ActivityRegistry, ActivityStep,
    Decision, InMemoryWorkflowStore, TaskQueue, WorkerPool, WorkflowDefinition,
    WorkflowExecution, WorkflowOrchestrator, WorkflowRegistry, WorkflowState, WorkflowStore,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    Retryable,
    Fatal,
    BlockForever,
}

struct StubActivity {
    name: String,
    behavior: Behavior,
    executions: AtomicU32,
    applications: AtomicU32,
    seen_keys: parking_lot::Mutex<Vec<String>>,
}

impl StubActivity {
    fn new(name: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            behavior,
            executions: AtomicU32::new(0),
            applications: AtomicU32::new(0),
            seen_keys: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn executions(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }

    fn applications(&self) -> u32 {
        self.applications.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Activity for StubActivity {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &ActivityContext, _input: &serde_json::Value) -> ActivityOutcome {
        self.executions.fetch_add(1, Ordering::SeqCst);

        // Idempotency-key accounting: the external effect applies once per key.
        {
            let mut seen = self.seen_keys.lock();
            if !seen.contains(&ctx.idempotency_key) {
                seen.push(ctx.idempotency_key.clone());
                self.applications.fetch_add(1, Ordering::SeqCst);
            }
        }

        match self.behavior {
            Behavior::Succeed => ActivityOutcome::success(json!({ "done": self.name })),
            Behavior::Retryable => ActivityOutcome::retryable("transient downstream failure"),
            Behavior::Fatal => ActivityOutcome::fatal("invalid business input"),
            Behavior::BlockForever => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                ActivityOutcome::success(serde_json::Value::Null)
            }
        }
    }
}

/// Runs the declared activities in order, each at most `max_attempts` times.
struct SequenceWorkflow {
    workflow_type: String,
    activities: Vec<String>,
    retry: RetryPolicy,
}

impl SequenceWorkflow {
    fn new(
        workflow_type: &str,
        activities: &[&str],
        retry: RetryPolicy,
    ) -> Arc<dyn WorkflowDefinition> {
        Arc::new(Self {
            workflow_type: workflow_type.to_string(),
            activities: activities.iter().map(|a| a.to_string()).collect(),
            retry,
        })
    }
}

impl WorkflowDefinition for SequenceWorkflow {
    fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    fn plan(&self, _input: &serde_json::Value, history: &[sb_workflow::ActivityInvocation]) -> Decision {
        for activity in &self.activities {
            if !has_succeeded(history, activity) {
                return Decision::RunActivity(ActivityStep {
                    activity: activity.clone(),
                    input: json!({}),
                    idempotency_key: format!("{}:{}", self.workflow_type, activity),
                    retry: self.retry,
                });
            }
        }
        Decision::Complete(json!({ "stepsCompleted": self.activities.len() }))
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay_ms: 10,
        multiplier: 1.0,
        max_delay_ms: 20,
    }
}

struct Engine {
    orchestrator: WorkflowOrchestrator,
    shutdown_tx: broadcast::Sender<()>,
    pool_handle: JoinHandle<()>,
    router_handle: JoinHandle<()>,
}

impl Engine {
    fn start(
        store: Arc<InMemoryWorkflowStore>,
        activities: Vec<Arc<StubActivity>>,
        definitions: Vec<Arc<dyn WorkflowDefinition>>,
    ) -> Self {
        Self::start_with_timeout(store, activities, definitions, Duration::from_secs(5))
    }

    fn start_with_timeout(
        store: Arc<InMemoryWorkflowStore>,
        activities: Vec<Arc<StubActivity>>,
        definitions: Vec<Arc<dyn WorkflowDefinition>>,
        task_timeout: Duration,
    ) -> Self {
        let queue = Arc::new(TaskQueue::new(64, Duration::from_secs(60)));

        let mut activity_registry = ActivityRegistry::new();
        for activity in activities {
            activity_registry.register(activity);
        }
        let activity_registry = Arc::new(activity_registry);

        let mut workflow_registry = WorkflowRegistry::new();
        for definition in definitions {
            workflow_registry.register(definition);
        }
        let workflow_registry = Arc::new(workflow_registry);

        let (completion_tx, completion_rx) = mpsc::channel(64);
        let pool = WorkerPool::new(
            queue.clone(),
            activity_registry,
            WorkerPoolConfig {
                concurrency: 4,
                queue_capacity: 64,
                task_timeout,
                rate_limit_per_minute: None,
                reclaim_interval: Duration::from_secs(5),
                lease_timeout: Duration::from_secs(60),
            },
            completion_tx,
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let pool_handle = {
            let shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move { pool.run(shutdown_rx).await })
        };

        let orchestrator = WorkflowOrchestrator::new(store, workflow_registry, queue);
        let router_handle = orchestrator.start_completion_router(completion_rx);

        Self {
            orchestrator,
            shutdown_tx,
            pool_handle,
            router_handle,
        }
    }

    /// Simulate a process crash: abort drives and workers, drop routing.
    async fn kill(self) {
        self.orchestrator.shutdown().await;
        let _ = self.shutdown_tx.send(());
        self.pool_handle.abort();
        self.router_handle.abort();
    }
}

async fn wait_for_terminal(
    store: &InMemoryWorkflowStore,
    workflow_id: &str,
) -> WorkflowExecution {
    for _ in 0..1500 {
        if let Some(execution) = store.get(workflow_id).await.unwrap() {
            if execution.state.is_terminal() {
                return execution;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workflow {} did not reach a terminal state", workflow_id);
}

#[tokio::test]
async fn three_activity_workflow_completes_in_order() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let a = StubActivity::new("create_organization", Behavior::Succeed);
    let b = StubActivity::new("allocate_credits", Behavior::Succeed);
    let c = StubActivity::new("sync_users", Behavior::Succeed);
    let definition = SequenceWorkflow::new(
        "organization.provisioning",
        &["create_organization", "allocate_credits", "sync_users"],
        fast_retry(3),
    );

    let engine = Engine::start(
        store.clone(),
        vec![a.clone(), b.clone(), c.clone()],
        vec![definition],
    );

    let workflow_id = engine
        .orchestrator
        .submit("organization.provisioning", "T1", json!({ "plan": "pro" }))
        .await
        .unwrap();

    let execution = wait_for_terminal(&store, &workflow_id).await;
    assert_eq!(execution.state, WorkflowState::Completed);
    assert_eq!(execution.result, Some(json!({ "stepsCompleted": 3 })));

    let order: Vec<&str> = execution
        .history
        .iter()
        .map(|inv| inv.activity_name.as_str())
        .collect();
    assert_eq!(
        order,
        vec!["create_organization", "allocate_credits", "sync_users"]
    );
    assert!(execution.history.iter().all(|inv| inv.outcome.is_success()));
    assert_eq!(a.executions(), 1);
    assert_eq!(b.executions(), 1);
    assert_eq!(c.executions(), 1);

    engine.kill().await;
}

#[tokio::test]
async fn retry_budget_exhaustion_fails_the_workflow() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let a = StubActivity::new("step_a", Behavior::Succeed);
    let b = StubActivity::new("step_b", Behavior::Retryable);
    let definition = SequenceWorkflow::new("pair", &["step_a", "step_b"], fast_retry(3));

    let engine = Engine::start(store.clone(), vec![a.clone(), b.clone()], vec![definition]);

    let workflow_id = engine
        .orchestrator
        .submit("pair", "T1", json!({}))
        .await
        .unwrap();

    let execution = wait_for_terminal(&store, &workflow_id).await;
    assert_eq!(execution.state, WorkflowState::Failed);
    assert!(execution.error.as_deref().unwrap().contains("retry budget"));

    // History: one success of A, exactly three failed attempts of B.
    let a_attempts: Vec<_> = execution
        .history
        .iter()
        .filter(|inv| inv.activity_name == "step_a")
        .collect();
    assert_eq!(a_attempts.len(), 1);
    assert!(a_attempts[0].outcome.is_success());

    let b_attempts: Vec<_> = execution
        .history
        .iter()
        .filter(|inv| inv.activity_name == "step_b")
        .collect();
    assert_eq!(b_attempts.len(), 3);
    assert!(b_attempts
        .iter()
        .all(|inv| matches!(inv.outcome, ActivityOutcome::RetryableFailure { .. })));
    assert_eq!(
        b_attempts.iter().map(|inv| inv.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(b.executions(), 3);

    engine.kill().await;
}

#[tokio::test]
async fn fatal_failure_halts_without_retry() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let a = StubActivity::new("step_a", Behavior::Succeed);
    let b = StubActivity::new("step_b", Behavior::Fatal);
    let c = StubActivity::new("step_c", Behavior::Succeed);
    let definition =
        SequenceWorkflow::new("triple", &["step_a", "step_b", "step_c"], fast_retry(3));

    let engine = Engine::start(
        store.clone(),
        vec![a, b.clone(), c.clone()],
        vec![definition],
    );

    let workflow_id = engine
        .orchestrator
        .submit("triple", "T1", json!({}))
        .await
        .unwrap();

    let execution = wait_for_terminal(&store, &workflow_id).await;
    assert_eq!(execution.state, WorkflowState::Failed);
    assert_eq!(b.executions(), 1);
    // No automatic compensation and no further scheduling.
    assert_eq!(c.executions(), 0);

    engine.kill().await;
}

#[tokio::test]
async fn cancellation_suppresses_future_activities() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let a = StubActivity::new("step_a", Behavior::BlockForever);
    let b = StubActivity::new("step_b", Behavior::Succeed);
    let definition = SequenceWorkflow::new("pair", &["step_a", "step_b"], fast_retry(3));

    let engine = Engine::start_with_timeout(
        store.clone(),
        vec![a.clone(), b.clone()],
        vec![definition],
        Duration::from_millis(200),
    );

    let workflow_id = engine
        .orchestrator
        .submit("pair", "T1", json!({}))
        .await
        .unwrap();

    // Let the first activity start, then cancel while it is in flight.
    for _ in 0..100 {
        if a.executions() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(engine.orchestrator.cancel(&workflow_id).await.unwrap());

    // The blocked activity times out as retryable; the orchestrator then
    // observes the cancellation instead of retrying.
    let execution = wait_for_terminal(&store, &workflow_id).await;
    assert_eq!(execution.state, WorkflowState::Cancelled);
    assert_eq!(b.executions(), 0);

    engine.kill().await;
}

#[tokio::test]
async fn unknown_workflow_type_is_rejected() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let engine = Engine::start(store, vec![], vec![]);
    assert!(engine
        .orchestrator
        .submit("ghost", "T1", json!({}))
        .await
        .is_err());
    engine.kill().await;
}

#[tokio::test]
async fn killed_orchestrator_resumes_without_rerunning_completed_activities() {
    let store = Arc::new(InMemoryWorkflowStore::new());

    // Phase 1: activity 1 completes, activity 2 blocks forever.
    let a1 = StubActivity::new("step_a", Behavior::Succeed);
    let b1 = StubActivity::new("step_b", Behavior::BlockForever);
    let c1 = StubActivity::new("step_c", Behavior::Succeed);
    let definition = SequenceWorkflow::new(
        "triple",
        &["step_a", "step_b", "step_c"],
        fast_retry(3),
    );

    let engine = Engine::start(
        store.clone(),
        vec![a1.clone(), b1, c1.clone()],
        vec![definition.clone()],
    );
    let workflow_id = engine
        .orchestrator
        .submit("triple", "T1", json!({}))
        .await
        .unwrap();

    // Wait until activity 1's success is persisted to history.
    for _ in 0..200 {
        if let Some(execution) = store.get(&workflow_id).await.unwrap() {
            if has_succeeded(&execution.history, "step_a") {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let snapshot = store.get(&workflow_id).await.unwrap().unwrap();
    assert!(has_succeeded(&snapshot.history, "step_a"));
    assert_eq!(snapshot.state, WorkflowState::Running);
    assert_eq!(a1.applications(), 1);

    // Crash mid-workflow.
    engine.kill().await;

    // Phase 2: fresh engine over the same store; activity 2 now succeeds.
    let a2 = StubActivity::new("step_a", Behavior::Succeed);
    let b2 = StubActivity::new("step_b", Behavior::Succeed);
    let c2 = StubActivity::new("step_c", Behavior::Succeed);
    let engine = Engine::start(
        store.clone(),
        vec![a2.clone(), b2.clone(), c2.clone()],
        vec![definition],
    );
    let resumed = engine.orchestrator.resume_all().await.unwrap();
    assert_eq!(resumed, 1);

    let execution = wait_for_terminal(&store, &workflow_id).await;
    assert_eq!(execution.state, WorkflowState::Completed);

    // Activity 1 was not re-invoked after the restart: its side effect ran
    // exactly once across both processes.
    assert_eq!(a1.applications() + a2.applications(), 1);
    assert_eq!(a2.executions(), 0);
    assert_eq!(b2.executions(), 1);
    assert_eq!(c2.executions(), 1);

    engine.kill().await;
}
