//! Workflow execution persistence.

use crate::execution::{WorkflowExecution, WorkflowState};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn insert(&self, execution: &WorkflowExecution) -> Result<()>;

    async fn update(&self, execution: &WorkflowExecution) -> Result<()>;

    async fn get(&self, workflow_id: &str) -> Result<Option<WorkflowExecution>>;

    async fn find_by_state(&self, state: WorkflowState) -> Result<Vec<WorkflowExecution>>;

    /// Flag a RUNNING execution for cooperative cancellation. Returns false
    /// when the execution is missing or already terminal.
    async fn request_cancel(&self, workflow_id: &str) -> Result<bool>;
}

pub struct InMemoryWorkflowStore {
    executions: DashMap<String, WorkflowExecution>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self {
            executions: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn insert(&self, execution: &WorkflowExecution) -> Result<()> {
        if self.executions.contains_key(&execution.workflow_id) {
            return Err(anyhow::anyhow!(
                "workflow {} already exists",
                execution.workflow_id
            ));
        }
        self.executions
            .insert(execution.workflow_id.clone(), execution.clone());
        Ok(())
    }

    async fn update(&self, execution: &WorkflowExecution) -> Result<()> {
        self.executions
            .insert(execution.workflow_id.clone(), execution.clone());
        Ok(())
    }

    async fn get(&self, workflow_id: &str) -> Result<Option<WorkflowExecution>> {
        Ok(self.executions.get(workflow_id).map(|e| e.clone()))
    }

    async fn find_by_state(&self, state: WorkflowState) -> Result<Vec<WorkflowExecution>> {
        let mut executions: Vec<WorkflowExecution> = self
            .executions
            .iter()
            .filter(|e| e.state == state)
            .map(|e| e.clone())
            .collect();
        executions.sort_by_key(|e| e.created_at);
        Ok(executions)
    }

    async fn request_cancel(&self, workflow_id: &str) -> Result<bool> {
        match self.executions.get_mut(workflow_id) {
            Some(mut execution) if execution.state == WorkflowState::Running => {
                execution.cancel_requested = true;
                execution.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
