//! Sync Health Aggregator
//!
//! Read-only rolling-window view over tracking records for one tenant.
//! Feeds operational alerting (e.g. an ack-rate floor); never mutates
//! records.

use chrono::Utc;
use sb_common::{SyncHealthMetrics, TrackingStatus};
use sb_tracking::TrackingRepository;
use std::sync::Arc;
use std::time::Duration;

pub struct SyncHealthService {
    tracking: Arc<dyn TrackingRepository>,
    window: Duration,
}

impl SyncHealthService {
    pub fn new(tracking: Arc<dyn TrackingRepository>, window: Duration) -> Self {
        Self { tracking, window }
    }

    pub async fn health_metrics(&self, tenant_id: &str) -> anyhow::Result<SyncHealthMetrics> {
        let since = Utc::now()
            - chrono::Duration::from_std(self.window)
                .unwrap_or_else(|_| chrono::Duration::days(365));
        let records = self.tracking.fetch_window(tenant_id, since).await?;

        let mut pending = 0u64;
        let mut acknowledged = 0u64;
        let mut failed = 0u64;
        let mut expired = 0u64;
        let mut latency_total_ms = 0i64;

        for record in &records {
            match record.status {
                TrackingStatus::Published => pending += 1,
                TrackingStatus::Acknowledged => {
                    acknowledged += 1;
                    if let Some(acked_at) = record.acknowledged_at {
                        latency_total_ms += (acked_at - record.published_at).num_milliseconds();
                    }
                }
                TrackingStatus::Failed => failed += 1,
                TrackingStatus::Expired => expired += 1,
            }
        }

        let settled = acknowledged + failed + expired;
        // Undefined, not zero, while nothing has settled yet.
        let ack_rate = if settled > 0 {
            Some(acknowledged as f64 / settled as f64)
        } else {
            None
        };
        let avg_ack_latency_ms = if acknowledged > 0 {
            Some(latency_total_ms as f64 / acknowledged as f64)
        } else {
            None
        };

        Ok(SyncHealthMetrics {
            tenant_id: tenant_id.to_string(),
            ack_rate,
            avg_ack_latency_ms,
            pending_count: pending,
            failed_count: failed,
            acknowledged_count: acknowledged,
            expired_count: expired,
            window_secs: self.window.as_secs(),
        })
    }
}
