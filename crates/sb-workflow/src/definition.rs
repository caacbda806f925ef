//! Workflow definitions: the declared, deterministic activity sequence.

use crate::execution::ActivityInvocation;
use sb_common::RetryPolicy;
use std::collections::HashMap;
use std::sync::Arc;

/// One activity dispatch requested by a definition.
#[derive(Debug, Clone)]
pub struct ActivityStep {
    pub activity: String,
    pub input: serde_json::Value,
    /// Stable across retries; typically derived from a business entity id.
    pub idempotency_key: String,
    pub retry: RetryPolicy,
}

/// The next thing a workflow wants to do, given its recorded history.
#[derive(Debug, Clone)]
pub enum Decision {
    RunActivity(ActivityStep),
    Complete(serde_json::Value),
    Fail(String),
}

/// A declared multi-activity business operation.
///
/// `plan` must be deterministic given the same input and history: branching
/// on recorded activity results is fine, reading the clock or any other
/// unrecorded external state is not. Wall-clock and randomness belong in
/// activities. The orchestrator replays `plan` against persisted history to
/// resume after a restart.
pub trait WorkflowDefinition: Send + Sync {
    fn workflow_type(&self) -> &str;

    fn plan(&self, input: &serde_json::Value, history: &[ActivityInvocation]) -> Decision;
}

pub struct WorkflowRegistry {
    definitions: HashMap<String, Arc<dyn WorkflowDefinition>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            definitions: HashMap::new(),
        }
    }

    pub fn register(&mut self, definition: Arc<dyn WorkflowDefinition>) {
        self.definitions
            .insert(definition.workflow_type().to_string(), definition);
    }

    pub fn get(&self, workflow_type: &str) -> Option<Arc<dyn WorkflowDefinition>> {
        self.definitions.get(workflow_type).cloned()
    }

    pub fn workflow_types(&self) -> Vec<String> {
        self.definitions.keys().cloned().collect()
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}
