use crate::execution::{ActivityInvocation, WorkflowExecution, WorkflowState};
use crate::store::WorkflowStore;
use anyhow::Result;
use async_trait::async_trait;
use chrono::DateTime;
use sqlx::{Row, SqlitePool};

pub struct SqliteWorkflowStore {
    pool: SqlitePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_executions (
                workflow_id TEXT PRIMARY KEY,
                workflow_type TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                state TEXT NOT NULL,
                history TEXT NOT NULL,
                input TEXT NOT NULL,
                result TEXT,
                error TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_workflow_state ON workflow_executions(state);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowExecution> {
        let history: Vec<ActivityInvocation> = serde_json::from_str(row.get("history"))?;
        let input: serde_json::Value = serde_json::from_str(row.get("input"))?;
        let result = row
            .get::<Option<String>, _>("result")
            .map(|r| serde_json::from_str(&r))
            .transpose()?;

        let created_at_ts: i64 = row.get("created_at");
        let updated_at_ts: i64 = row.get("updated_at");

        Ok(WorkflowExecution {
            workflow_id: row.get("workflow_id"),
            workflow_type: row.get("workflow_type"),
            tenant_id: row.get("tenant_id"),
            state: WorkflowState::parse(row.get("state"))
                .map_err(|e| anyhow::anyhow!("{}", e))?,
            history,
            input,
            result,
            error: row.get("error"),
            cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
            created_at: DateTime::from_timestamp_millis(created_at_ts)
                .ok_or_else(|| anyhow::anyhow!("Invalid created_at timestamp"))?,
            updated_at: DateTime::from_timestamp_millis(updated_at_ts)
                .ok_or_else(|| anyhow::anyhow!("Invalid updated_at timestamp"))?,
        })
    }
}

#[async_trait]
impl WorkflowStore for SqliteWorkflowStore {
    async fn insert(&self, execution: &WorkflowExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_executions
                (workflow_id, workflow_type, tenant_id, state, history, input,
                 result, error, cancel_requested, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.workflow_id)
        .bind(&execution.workflow_type)
        .bind(&execution.tenant_id)
        .bind(execution.state.as_str())
        .bind(serde_json::to_string(&execution.history)?)
        .bind(serde_json::to_string(&execution.input)?)
        .bind(
            execution
                .result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&execution.error)
        .bind(execution.cancel_requested as i64)
        .bind(execution.created_at.timestamp_millis())
        .bind(execution.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, execution: &WorkflowExecution) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET state = ?, history = ?, result = ?, error = ?,
                cancel_requested = ?, updated_at = ?
            WHERE workflow_id = ?
            "#,
        )
        .bind(execution.state.as_str())
        .bind(serde_json::to_string(&execution.history)?)
        .bind(
            execution
                .result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&execution.error)
        .bind(execution.cancel_requested as i64)
        .bind(execution.updated_at.timestamp_millis())
        .bind(&execution.workflow_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, workflow_id: &str) -> Result<Option<WorkflowExecution>> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE workflow_id = ?")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn find_by_state(&self, state: WorkflowState) -> Result<Vec<WorkflowExecution>> {
        let rows =
            sqlx::query("SELECT * FROM workflow_executions WHERE state = ? ORDER BY created_at")
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn request_cancel(&self, workflow_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workflow_executions SET cancel_requested = 1 \
             WHERE workflow_id = ? AND state = 'RUNNING'",
        )
        .bind(workflow_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityOutcome;
    use chrono::Utc;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteWorkflowStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteWorkflowStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn execution_roundtrips_with_history() {
        let store = store().await;
        let mut exec =
            WorkflowExecution::new("organization.provisioning", "T1", json!({ "plan": "pro" }));
        exec.history.push(ActivityInvocation {
            activity_name: "create_organization".to_string(),
            attempt: 1,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            outcome: ActivityOutcome::success(json!({ "organizationId": "org-1" })),
        });
        store.insert(&exec).await.unwrap();

        let stored = store.get(&exec.workflow_id).await.unwrap().unwrap();
        assert_eq!(stored.state, WorkflowState::Running);
        assert_eq!(stored.history.len(), 1);
        assert_eq!(stored.history[0].activity_name, "create_organization");
        assert_eq!(stored.input["plan"], json!("pro"));

        let running = store.find_by_state(WorkflowState::Running).await.unwrap();
        assert_eq!(running.len(), 1);
    }

    #[tokio::test]
    async fn cancel_flag_persists() {
        let store = store().await;
        let exec = WorkflowExecution::new("a", "T1", json!({}));
        store.insert(&exec).await.unwrap();

        assert!(store.request_cancel(&exec.workflow_id).await.unwrap());
        assert!(store
            .get(&exec.workflow_id)
            .await
            .unwrap()
            .unwrap()
            .cancel_requested);
        assert!(!store.request_cancel("missing").await.unwrap());
    }
}
