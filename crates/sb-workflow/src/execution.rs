//! Persisted workflow execution state.

use crate::activity::ActivityOutcome;
use chrono::{DateTime, Utc};
use sb_common::{Result, SyncBridgeError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    /// RUNNING is the only non-terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Running => "RUNNING",
            WorkflowState::Completed => "COMPLETED",
            WorkflowState::Failed => "FAILED",
            WorkflowState::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "RUNNING" => Ok(WorkflowState::Running),
            "COMPLETED" => Ok(WorkflowState::Completed),
            "FAILED" => Ok(WorkflowState::Failed),
            "CANCELLED" => Ok(WorkflowState::Cancelled),
            other => Err(SyncBridgeError::Workflow(format!(
                "unknown workflow state: {}",
                other
            ))),
        }
    }
}

/// One recorded activity attempt within a workflow's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityInvocation {
    pub activity_name: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: ActivityOutcome,
}

/// One durable run of a declared multi-activity business operation.
///
/// The execution record IS the orchestrator's suspension state: everything
/// needed to resume after a process restart lives here, nothing lives in
/// in-memory continuations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub workflow_type: String,
    pub tenant_id: String,
    pub state: WorkflowState,
    pub history: Vec<ActivityInvocation>,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(workflow_type: &str, tenant_id: &str, input: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: Uuid::new_v4().to_string(),
            workflow_type: workflow_type.to_string(),
            tenant_id: tenant_id.to_string(),
            state: WorkflowState::Running,
            history: Vec::new(),
            input,
            result: None,
            error: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Whether the history contains a successful attempt of `activity`.
pub fn has_succeeded(history: &[ActivityInvocation], activity: &str) -> bool {
    latest_success(history, activity).is_some()
}

/// Output of the most recent successful attempt of `activity`, if any.
pub fn latest_success<'a>(
    history: &'a [ActivityInvocation],
    activity: &str,
) -> Option<&'a serde_json::Value> {
    history.iter().rev().find_map(|inv| {
        if inv.activity_name != activity {
            return None;
        }
        match &inv.outcome {
            ActivityOutcome::Success { output } => Some(output),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invocation(activity: &str, outcome: ActivityOutcome) -> ActivityInvocation {
        ActivityInvocation {
            activity_name: activity.to_string(),
            attempt: 1,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            outcome,
        }
    }

    #[test]
    fn latest_success_skips_failed_attempts() {
        let history = vec![
            invocation("a", ActivityOutcome::retryable("x")),
            invocation("a", ActivityOutcome::success(json!({ "n": 1 }))),
            invocation("b", ActivityOutcome::retryable("y")),
        ];
        assert!(has_succeeded(&history, "a"));
        assert_eq!(latest_success(&history, "a"), Some(&json!({ "n": 1 })));
        assert!(!has_succeeded(&history, "b"));
        assert!(!has_succeeded(&history, "c"));
    }

    #[test]
    fn new_execution_starts_running() {
        let exec = WorkflowExecution::new("organization.provisioning", "T1", json!({}));
        assert_eq!(exec.state, WorkflowState::Running);
        assert!(!exec.state.is_terminal());
        assert!(exec.history.is_empty());
        assert!(!exec.cancel_requested);
    }
}
