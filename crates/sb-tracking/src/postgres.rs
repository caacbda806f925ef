use crate::repository::{AckTransition, TrackingRepository};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sb_common::{TrackingRecord, TrackingStatus};
use sqlx::{PgPool, Row};

pub struct PostgresTrackingRepository {
    pool: PgPool,
}

impl PostgresTrackingRepository {
    pub fn new(pool: PgPool) -> Self {
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

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<TrackingRecord> {
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
            retry_count: row.get::<i32, _>("retry_count") as u32,
            last_error: row.get("last_error"),
        })
    }

    async fn classify_missed_update(&self, event_id: &str) -> Result<AckTransition> {
        match self.get(event_id).await? {
            None => Ok(AckTransition::NotFound),
            Some(record) if record.status.is_terminal() => Ok(AckTransition::AlreadyTerminal),
            Some(_) => Ok(AckTransition::StillPending),
        }
    }
}

#[async_trait]
impl TrackingRepository for PostgresTrackingRepository {
    async fn create(&self, record: TrackingRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tracking_records
                (event_id, tenant_id, event_type, status, published_at, acknowledged_at, retry_count, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&record.event_id)
        .bind(&record.tenant_id)
        .bind(&record.event_type)
        .bind(record.status.as_str())
        .bind(record.published_at.timestamp_millis())
        .bind(record.acknowledged_at.map(|t| t.timestamp_millis()))
        .bind(record.retry_count as i32)
        .bind(&record.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<TrackingRecord>> {
        let row = sqlx::query("SELECT * FROM tracking_records WHERE event_id = $1")
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
            "UPDATE tracking_records SET status = 'ACKNOWLEDGED', acknowledged_at = $1 \
             WHERE event_id = $2 AND status = 'PUBLISHED'",
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
                last_error = $1,
                status = CASE WHEN retry_count + 1 >= $2 THEN 'FAILED' ELSE 'PUBLISHED' END
            WHERE event_id = $3 AND status = 'PUBLISHED'
            "#,
        )
        .bind(error)
        .bind(retry_budget as i32)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return self.classify_missed_update(event_id).await;
        }

        let status: String =
            sqlx::query_scalar("SELECT status FROM tracking_records WHERE event_id = $1")
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
             WHERE status = 'PUBLISHED' AND published_at < $1",
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
             WHERE tenant_id = $1 AND published_at >= $2 ORDER BY published_at",
        )
        .bind(tenant_id)
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }
}
