//! Full-stack provisioning tests: workflow engine + event pipeline together.

use async_trait::async_trait;
use sb_common::{sync_stream_key, EventEnvelope, RetryPolicy, TrackingStatus, WorkerPoolConfig};
use sb_provision::{
    AllocateCreditsActivity, CreateOrganizationActivity, CreditLedger, DirectoryGateway,
    GatewayError, InMemoryCreditLedger, OrganizationProvisioningWorkflow, OrganizationRecord,
    OrganizationSpec, SyncUsersActivity, UserSpec,
};
use sb_stream::{InMemoryStreamTransport, StreamTransport};
use sb_sync::EventPublisher;
use sb_tracking::{InMemoryTrackingRepository, TrackingRepository};
use sb_workflow::{
    ActivityRegistry, InMemoryWorkflowStore, TaskQueue, WorkerPool, WorkflowDefinition,
    WorkflowExecution, WorkflowOrchestrator, WorkflowRegistry, WorkflowState, WorkflowStore,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Gateway that fails a configured number of create calls before succeeding.
struct FlakyGateway {
    create_failures_left: AtomicU32,
    create_calls: AtomicU32,
}

impl FlakyGateway {
    fn new(create_failures: u32) -> Arc<Self> {
        Arc::new(Self {
            create_failures_left: AtomicU32::new(create_failures),
            create_calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl DirectoryGateway for FlakyGateway {
    async fn create_organization(
        &self,
        _tenant_id: &str,
        spec: &OrganizationSpec,
    ) -> Result<OrganizationRecord, GatewayError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .create_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GatewayError::Retryable("downstream 503".to_string()));
        }
        Ok(OrganizationRecord {
            organization_id: format!("org-{}", spec.external_ref),
            created: true,
        })
    }

    async fn sync_users(
        &self,
        _tenant_id: &str,
        users: &[UserSpec],
    ) -> Result<u32, GatewayError> {
        Ok(users.len() as u32)
    }
}

struct Stack {
    transport: Arc<InMemoryStreamTransport>,
    tracking: Arc<InMemoryTrackingRepository>,
    store: Arc<InMemoryWorkflowStore>,
    ledger: Arc<InMemoryCreditLedger>,
    gateway: Arc<FlakyGateway>,
    orchestrator: WorkflowOrchestrator,
    shutdown_tx: broadcast::Sender<()>,
}

fn stack(create_failures: u32) -> Stack {
    let transport = Arc::new(InMemoryStreamTransport::new());
    let tracking = Arc::new(InMemoryTrackingRepository::new());
    let store = Arc::new(InMemoryWorkflowStore::new());
    let ledger = Arc::new(InMemoryCreditLedger::new());
    let gateway = FlakyGateway::new(create_failures);

    let publisher = Arc::new(EventPublisher::new(
        transport.clone(),
        tracking.clone(),
        vec!["crm".to_string()],
    ));

    let mut activities = ActivityRegistry::new();
    activities.register(Arc::new(CreateOrganizationActivity::new(
        gateway.clone(),
        publisher.clone(),
    )));
    activities.register(Arc::new(AllocateCreditsActivity::new(
        ledger.clone(),
        publisher.clone(),
    )));
    activities.register(Arc::new(SyncUsersActivity::new(
        gateway.clone(),
        publisher.clone(),
    )));

    let mut definitions = WorkflowRegistry::new();
    definitions.register(Arc::new(OrganizationProvisioningWorkflow::new(RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 10,
        multiplier: 1.0,
        max_delay_ms: 20,
    })) as Arc<dyn WorkflowDefinition>);

    let queue = Arc::new(TaskQueue::new(64, Duration::from_secs(60)));
    let (completion_tx, completion_rx) = mpsc::channel(64);
    let pool = WorkerPool::new(
        queue.clone(),
        Arc::new(activities),
        WorkerPoolConfig {
            concurrency: 4,
            queue_capacity: 64,
            task_timeout: Duration::from_secs(5),
            rate_limit_per_minute: None,
            reclaim_interval: Duration::from_secs(5),
            lease_timeout: Duration::from_secs(60),
        },
        completion_tx,
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    {
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { pool.run(shutdown_rx).await });
    }

    let orchestrator = WorkflowOrchestrator::new(store.clone(), Arc::new(definitions), queue);
    orchestrator.start_completion_router(completion_rx);

    Stack {
        transport,
        tracking,
        store,
        ledger,
        gateway,
        orchestrator,
        shutdown_tx,
    }
}

fn provisioning_input() -> serde_json::Value {
    json!({
        "organization": { "externalRef": "acme", "name": "Acme", "plan": "pro" },
        "initialCredits": 500,
        "users": [
            { "userId": "u1", "email": "u1@acme.test", "role": "admin" },
            { "userId": "u2", "email": "u2@acme.test" },
        ],
    })
}

async fn wait_for_terminal(store: &InMemoryWorkflowStore, workflow_id: &str) -> WorkflowExecution {
    for _ in 0..500 {
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
async fn provisioning_workflow_publishes_the_full_event_trail() {
    let stack = stack(0);

    let workflow_id = stack
        .orchestrator
        .submit("organization.provisioning", "T1", provisioning_input())
        .await
        .unwrap();

    let execution = wait_for_terminal(&stack.store, &workflow_id).await;
    assert_eq!(execution.state, WorkflowState::Completed);
    let result = execution.result.unwrap();
    assert_eq!(result["organizationId"], json!("org-acme"));
    assert_eq!(result["creditsAllocated"], json!(500));
    assert_eq!(result["usersSynced"], json!(2));

    // The ledger applied exactly once.
    assert_eq!(stack.ledger.applications(), 1);
    assert_eq!(stack.ledger.balance("T1", "org-acme").await.unwrap(), 500);

    // Each effect produced its sync event on the CRM streams.
    let org_events = stack
        .transport
        .read_after(&sync_stream_key("crm", "organization.created"), None, 10)
        .await
        .unwrap();
    assert_eq!(org_events.len(), 1);

    let credit_events = stack
        .transport
        .read_after(&sync_stream_key("crm", "credit.allocated"), None, 10)
        .await
        .unwrap();
    assert_eq!(credit_events.len(), 1);
    let envelope = EventEnvelope::from_json(&credit_events[0].payload).unwrap();
    assert_eq!(envelope.tenant_id, "T1");
    assert_eq!(envelope.data["amount"], json!(500));
    assert_eq!(envelope.data["balanceAfter"], json!(500));

    let user_events = stack
        .transport
        .read_after(&sync_stream_key("crm", "user.synced"), None, 10)
        .await
        .unwrap();
    assert_eq!(user_events.len(), 2);

    // Every published event has exactly one PUBLISHED tracking record.
    assert_eq!(stack.tracking.len(), 4);
    let record = stack
        .tracking
        .get(&envelope.event_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TrackingStatus::Published);

    let _ = stack.shutdown_tx.send(());
    stack.orchestrator.shutdown().await;
}

#[tokio::test]
async fn flaky_downstream_is_retried_with_one_ledger_application() {
    let stack = stack(2);

    let workflow_id = stack
        .orchestrator
        .submit("organization.provisioning", "T1", provisioning_input())
        .await
        .unwrap();

    let execution = wait_for_terminal(&stack.store, &workflow_id).await;
    assert_eq!(execution.state, WorkflowState::Completed);

    // Two retryable failures, then success.
    assert_eq!(stack.gateway.create_calls.load(Ordering::SeqCst), 3);
    let create_attempts = execution
        .history
        .iter()
        .filter(|inv| inv.activity_name == "create_organization")
        .count();
    assert_eq!(create_attempts, 3);

    // Retries never double-applied the allocation.
    assert_eq!(stack.ledger.applications(), 1);

    let _ = stack.shutdown_tx.send(());
    stack.orchestrator.shutdown().await;
}

#[tokio::test]
async fn exhausted_downstream_fails_the_workflow_before_credits() {
    let stack = stack(10);

    let workflow_id = stack
        .orchestrator
        .submit("organization.provisioning", "T1", provisioning_input())
        .await
        .unwrap();

    let execution = wait_for_terminal(&stack.store, &workflow_id).await;
    assert_eq!(execution.state, WorkflowState::Failed);
    assert!(execution.error.as_deref().unwrap().contains("retry budget"));

    // The workflow halted before the credit step; nothing was allocated and
    // no partial compensation was attempted.
    assert_eq!(stack.ledger.applications(), 0);

    let _ = stack.shutdown_tx.send(());
    stack.orchestrator.shutdown().await;
}
