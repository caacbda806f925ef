use crate::repository::{AckTransition, TrackingRepository};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sb_common::{TrackingRecord, TrackingStatus};
use sqlx::{Row, SqlitePool};

pub struct SqliteTrackingRepository {
    pool: SqlitePool,
}

impl SqliteTrackingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracking_records (
                event_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                status TEXT NOT NULL,
                published_at BIGINT NOT NULL,
                acknowledged_at BIGINT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tracking_status ON tracking_records(status);
            CREATE INDEX IF NOT EXISTS idx_tracking_tenant_published
                ON tracking_records(tenant_id, published_at);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<TrackingRecord> {
        let published_at_ts: i64 = row.get("published_at");
        let published_at = DateTime::from_timestamp_millis(published_at_ts)
            .ok_or_else(|| anyhow::anyhow!("Invalid published_at timestamp"))?;
        let acknowledged_at = row
            .get::<Option<i64>, _>("acknowledged_at")
            .and_then(DateTime::from_timestamp_millis);

        Ok(TrackingRecord {
            event_id: row.get("event_id"),
            tenant_id: row.get("tenant_id"),
            event_type: row.get("event_type"),
            status: TrackingStatus::parse(row.get("status"))
                .map_err(|e| anyhow::anyhow!("{}", e))?,
            published_at,
            acknowledged_at,
            retry_count: row.get::<i64, _>("retry_count") as u32,
            last_error: row.get("last_error"),
        })
    }

    async fn classify_missed_update(&self, event_id: &str) -> Result<AckTransition> {
        match self.get(event_id).await? {
            None => Ok(AckTransition::NotFound),
            Some(record) if record.status.is_terminal() => Ok(AckTransition::AlreadyTerminal),
            // Raced with a concurrent update that left it PUBLISHED.
            Some(_) => Ok(AckTransition::StillPending),
        }
    }
}

#[async_trait]
impl TrackingRepository for SqliteTrackingRepository {
    async fn create(&self, record: TrackingRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tracking_records
                (event_id, tenant_id, event_type, status, published_at, acknowledged_at, retry_count, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.event_id)
        .bind(&record.tenant_id)
        .bind(&record.event_type)
        .bind(record.status.as_str())
        .bind(record.published_at.timestamp_millis())
        .bind(record.acknowledged_at.map(|t| t.timestamp_millis()))
        .bind(record.retry_count as i64)
        .bind(&record.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<TrackingRecord>> {
        let row = sqlx::query("SELECT * FROM tracking_records WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn mark_acknowledged(
        &self,
        event_id: &str,
        acknowledged_at: DateTime<Utc>,
    ) -> Result<AckTransition> {
        let result = sqlx::query(
            "UPDATE tracking_records SET status = 'ACKNOWLEDGED', acknowledged_at = ? \
             WHERE event_id = ? AND status = 'PUBLISHED'",
        )
        .bind(acknowledged_at.timestamp_millis())
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(AckTransition::Applied)
        } else {
            self.classify_missed_update(event_id).await
        }
    }

    async fn record_failure(
        &self,
        event_id: &str,
        error: &str,
        retry_budget: u32,
    ) -> Result<AckTransition> {
        let result = sqlx::query(
            r#"
            UPDATE tracking_records
            SET retry_count = retry_count + 1,
                last_error = ?,
                status = CASE WHEN retry_count + 1 >= ? THEN 'FAILED' ELSE 'PUBLISHED' END
            WHERE event_id = ? AND status = 'PUBLISHED'
            "#,
        )
        .bind(error)
        .bind(retry_budget as i64)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return self.classify_missed_update(event_id).await;
        }

        let status: String =
            sqlx::query_scalar("SELECT status FROM tracking_records WHERE event_id = ?")
                .bind(event_id)
                .fetch_one(&self.pool)
                .await?;
        if status == "FAILED" {
            Ok(AckTransition::Applied)
        } else {
            Ok(AckTransition::StillPending)
        }
    }

    async fn expire_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tracking_records SET status = 'EXPIRED' \
             WHERE status = 'PUBLISHED' AND published_at < ?",
        )
        .bind(cutoff.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_window(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<TrackingRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM tracking_records \
             WHERE tenant_id = ? AND published_at >= ? ORDER BY published_at",
        )
        .bind(tenant_id)
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }
}
