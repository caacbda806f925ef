//! Organization provisioning workflow.
//!
//! Declared sequence: create the organization downstream, allocate its
//! initial credits, sync its users. Credits and users are skipped when the
//! input does not ask for them. `plan` branches only on the input and the
//! recorded history, so resuming from persisted history replays the same
//! decisions.

use sb_common::RetryPolicy;
use sb_workflow::{
    has_succeeded, latest_success, ActivityInvocation, ActivityStep, Decision,
    WorkflowDefinition,
};

use crate::activities::{ALLOCATE_CREDITS, CREATE_ORGANIZATION, SYNC_USERS};

pub const WORKFLOW_TYPE: &str = "organization.provisioning";

pub struct OrganizationProvisioningWorkflow {
    retry: RetryPolicy,
}

impl OrganizationProvisioningWorkflow {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }
}

impl Default for OrganizationProvisioningWorkflow {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl WorkflowDefinition for OrganizationProvisioningWorkflow {
    fn workflow_type(&self) -> &str {
        WORKFLOW_TYPE
    }

    fn plan(&self, input: &serde_json::Value, history: &[ActivityInvocation]) -> Decision {
        let Some(organization) = input.get("organization") else {
            return Decision::Fail("input is missing the organization spec".to_string());
        };
        let Some(external_ref) = organization.get("externalRef").and_then(|r| r.as_str())
        else {
            return Decision::Fail("organization spec is missing externalRef".to_string());
        };

        if !has_succeeded(history, CREATE_ORGANIZATION) {
            return Decision::RunActivity(ActivityStep {
                activity: CREATE_ORGANIZATION.to_string(),
                input: organization.clone(),
                idempotency_key: format!("org:{}", external_ref),
                retry: self.retry,
            });
        }
        let organization_id = latest_success(history, CREATE_ORGANIZATION)
            .and_then(|output| output.get("organizationId"))
            .and_then(|id| id.as_str())
            .unwrap_or_default()
            .to_string();

        let initial_credits = input
            .get("initialCredits")
            .and_then(|c| c.as_i64())
            .unwrap_or(0);
        if initial_credits > 0 && !has_succeeded(history, ALLOCATE_CREDITS) {
            return Decision::RunActivity(ActivityStep {
                activity: ALLOCATE_CREDITS.to_string(),
                input: serde_json::json!({
                    "entityId": organization_id,
                    "amount": initial_credits,
                }),
                idempotency_key: format!("credits:{}", external_ref),
                retry: self.retry,
            });
        }

        let users = input
            .get("users")
            .and_then(|u| u.as_array())
            .cloned()
            .unwrap_or_default();
        if !users.is_empty() && !has_succeeded(history, SYNC_USERS) {
            return Decision::RunActivity(ActivityStep {
                activity: SYNC_USERS.to_string(),
                input: serde_json::json!({ "users": users }),
                idempotency_key: format!("users:{}", external_ref),
                retry: self.retry,
            });
        }

        let users_synced = latest_success(history, SYNC_USERS)
            .and_then(|output| output.get("syncedCount"))
            .and_then(|c| c.as_u64())
            .unwrap_or(0);
        Decision::Complete(serde_json::json!({
            "organizationId": organization_id,
            "creditsAllocated": initial_credits,
            "usersSynced": users_synced,
        }))
    }
}
