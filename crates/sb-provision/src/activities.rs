//! Provisioning activities.
//!
//! Each activity performs its external effect first and then publishes the
//! matching sync event. Events are published at-least-once: a crash between
//! effect and publish means the retried attempt publishes a fresh envelope,
//! which idempotent downstream consumers de-duplicate on their side.

use async_trait::async_trait;
use sb_sync::payload::{
    CreditAllocatedPayload, OrganizationCreatedPayload, UserSyncedPayload,
};
use sb_sync::{EventPublisher, NewSyncEvent};
use sb_workflow::{Activity, ActivityContext, ActivityOutcome};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use crate::gateway::{DirectoryGateway, GatewayError, OrganizationSpec, UserSpec};
use crate::ledger::CreditLedger;

pub const CREATE_ORGANIZATION: &str = "create_organization";
pub const ALLOCATE_CREDITS: &str = "allocate_credits";
pub const SYNC_USERS: &str = "sync_users";

fn gateway_outcome(error: GatewayError) -> ActivityOutcome {
    match error {
        GatewayError::Retryable(message) => ActivityOutcome::retryable(message),
        GatewayError::Rejected(message) => ActivityOutcome::fatal(message),
    }
}

async fn publish_or_retry(
    publisher: &EventPublisher,
    event: NewSyncEvent,
) -> Result<String, ActivityOutcome> {
    publisher.publish(event).await.map_err(|e| {
        warn!(error = %e, "Sync event publish failed");
        ActivityOutcome::retryable(format!("event publish failed: {}", e))
    })
}

pub struct CreateOrganizationActivity {
    gateway: Arc<dyn DirectoryGateway>,
    publisher: Arc<EventPublisher>,
}

impl CreateOrganizationActivity {
    pub fn new(gateway: Arc<dyn DirectoryGateway>, publisher: Arc<EventPublisher>) -> Self {
        Self { gateway, publisher }
    }
}

#[async_trait]
impl Activity for CreateOrganizationActivity {
    fn name(&self) -> &str {
        CREATE_ORGANIZATION
    }

    async fn execute(&self, ctx: &ActivityContext, input: &serde_json::Value) -> ActivityOutcome {
        let spec: OrganizationSpec = match serde_json::from_value(input.clone()) {
            Ok(spec) => spec,
            Err(e) => return ActivityOutcome::fatal(format!("invalid organization spec: {}", e)),
        };

        let record = match self.gateway.create_organization(&ctx.tenant_id, &spec).await {
            Ok(record) => record,
            Err(e) => return gateway_outcome(e),
        };

        let event = NewSyncEvent {
            event_type: "organization.created".to_string(),
            tenant_id: ctx.tenant_id.clone(),
            entity_type: "organization".to_string(),
            entity_id: record.organization_id.clone(),
            data: serde_json::json!(OrganizationCreatedPayload {
                name: spec.name.clone(),
                plan: spec.plan.clone(),
            }),
            published_by: format!("workflow:{}", ctx.workflow_id),
        };
        if let Err(outcome) = publish_or_retry(&self.publisher, event).await {
            return outcome;
        }

        ActivityOutcome::success(serde_json::json!({
            "organizationId": record.organization_id,
            "created": record.created,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllocateCreditsInput {
    entity_id: String,
    amount: i64,
}

pub struct AllocateCreditsActivity {
    ledger: Arc<dyn CreditLedger>,
    publisher: Arc<EventPublisher>,
}

impl AllocateCreditsActivity {
    pub fn new(ledger: Arc<dyn CreditLedger>, publisher: Arc<EventPublisher>) -> Self {
        Self { ledger, publisher }
    }
}

#[async_trait]
impl Activity for AllocateCreditsActivity {
    fn name(&self) -> &str {
        ALLOCATE_CREDITS
    }

    async fn execute(&self, ctx: &ActivityContext, input: &serde_json::Value) -> ActivityOutcome {
        let input: AllocateCreditsInput = match serde_json::from_value(input.clone()) {
            Ok(input) => input,
            Err(e) => return ActivityOutcome::fatal(format!("invalid allocation input: {}", e)),
        };
        if input.amount <= 0 {
            return ActivityOutcome::fatal(format!(
                "allocation amount must be positive, got {}",
                input.amount
            ));
        }

        // The idempotency key makes a re-invocation after a crash a no-op on
        // the ledger side.
        let allocation = match self
            .ledger
            .allocate(
                &ctx.tenant_id,
                &input.entity_id,
                input.amount,
                &ctx.idempotency_key,
            )
            .await
        {
            Ok(allocation) => allocation,
            Err(e) => return ActivityOutcome::retryable(format!("ledger unavailable: {}", e)),
        };

        let event = NewSyncEvent {
            event_type: "credit.allocated".to_string(),
            tenant_id: ctx.tenant_id.clone(),
            entity_type: "credit".to_string(),
            entity_id: input.entity_id.clone(),
            data: serde_json::json!(CreditAllocatedPayload {
                amount: input.amount,
                balance_after: Some(allocation.balance_after),
                reason: None,
            }),
            published_by: format!("workflow:{}", ctx.workflow_id),
        };
        if let Err(outcome) = publish_or_retry(&self.publisher, event).await {
            return outcome;
        }

        ActivityOutcome::success(serde_json::json!({
            "applied": allocation.applied,
            "balanceAfter": allocation.balance_after,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncUsersInput {
    users: Vec<UserSpec>,
}

pub struct SyncUsersActivity {
    gateway: Arc<dyn DirectoryGateway>,
    publisher: Arc<EventPublisher>,
}

impl SyncUsersActivity {
    pub fn new(gateway: Arc<dyn DirectoryGateway>, publisher: Arc<EventPublisher>) -> Self {
        Self { gateway, publisher }
    }
}

#[async_trait]
impl Activity for SyncUsersActivity {
    fn name(&self) -> &str {
        SYNC_USERS
    }

    async fn execute(&self, ctx: &ActivityContext, input: &serde_json::Value) -> ActivityOutcome {
        let input: SyncUsersInput = match serde_json::from_value(input.clone()) {
            Ok(input) => input,
            Err(e) => return ActivityOutcome::fatal(format!("invalid user sync input: {}", e)),
        };

        let synced_count = match self.gateway.sync_users(&ctx.tenant_id, &input.users).await {
            Ok(count) => count,
            Err(e) => return gateway_outcome(e),
        };

        for user in &input.users {
            let event = NewSyncEvent {
                event_type: "user.synced".to_string(),
                tenant_id: ctx.tenant_id.clone(),
                entity_type: "user".to_string(),
                entity_id: user.user_id.clone(),
                data: serde_json::json!(UserSyncedPayload {
                    user_id: user.user_id.clone(),
                    email: user.email.clone(),
                    display_name: user.display_name.clone(),
                    role: user.role.clone(),
                }),
                published_by: format!("workflow:{}", ctx.workflow_id),
            };
            if let Err(outcome) = publish_or_retry(&self.publisher, event).await {
                return outcome;
            }
        }

        ActivityOutcome::success(serde_json::json!({ "syncedCount": synced_count }))
    }
}
