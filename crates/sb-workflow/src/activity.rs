//! Activity trait and outcome types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Explicit result of one activity attempt.
///
/// Retriability is part of the outcome, not inferred from an error type:
/// a RETRYABLE_FAILURE is expected to succeed on re-invocation (rate limits,
/// transient downstream errors), a FATAL_FAILURE terminates the workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityOutcome {
    Success {
        #[serde(default)]
        output: serde_json::Value,
    },
    RetryableFailure {
        error: String,
    },
    FatalFailure {
        error: String,
    },
}

impl ActivityOutcome {
    pub fn success(output: serde_json::Value) -> Self {
        Self::Success { output }
    }

    pub fn retryable(error: impl Into<String>) -> Self {
        Self::RetryableFailure {
            error: error.into(),
        }
    }

    pub fn fatal(error: impl Into<String>) -> Self {
        Self::FatalFailure {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Execution context handed to every activity attempt.
///
/// The idempotency key is identical across retries of the same step, so the
/// activity's external effect can detect a duplicate invocation and no-op.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub workflow_id: String,
    pub tenant_id: String,
    pub idempotency_key: String,
    pub attempt: u32,
}

/// A single idempotent unit of work invoked by the orchestrator.
#[async_trait]
pub trait Activity: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &ActivityContext, input: &serde_json::Value) -> ActivityOutcome;
}

/// Registry of activities available to the worker pool, keyed by name.
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn Activity>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self {
            activities: HashMap::new(),
        }
    }

    pub fn register(&mut self, activity: Arc<dyn Activity>) {
        self.activities
            .insert(activity.name().to_string(), activity);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.activities.keys().cloned().collect()
    }
}

impl Default for ActivityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outcome_wire_tags_are_screaming_snake_case() {
        let success = serde_json::to_value(ActivityOutcome::success(json!({"id": 1}))).unwrap();
        assert_eq!(success["outcome"], json!("SUCCESS"));

        let retryable = serde_json::to_value(ActivityOutcome::retryable("rate limited")).unwrap();
        assert_eq!(retryable["outcome"], json!("RETRYABLE_FAILURE"));

        let fatal = serde_json::to_value(ActivityOutcome::fatal("bad input")).unwrap();
        assert_eq!(fatal["outcome"], json!("FATAL_FAILURE"));
    }

    #[tokio::test]
    async fn registry_lookup_by_name() {
        struct Noop;

        #[async_trait]
        impl Activity for Noop {
            fn name(&self) -> &str {
                "noop"
            }

            async fn execute(
                &self,
                _ctx: &ActivityContext,
                _input: &serde_json::Value,
            ) -> ActivityOutcome {
                ActivityOutcome::success(serde_json::Value::Null)
            }
        }

        let mut registry = ActivityRegistry::new();
        registry.register(Arc::new(Noop));
        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());
    }
}
