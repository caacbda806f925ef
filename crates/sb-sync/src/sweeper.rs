//! Expiry Sweeper
//!
//! Background task that transitions PUBLISHED tracking records past the ack
//! window to EXPIRED. Redelivery of an expired event is an explicit external
//! re-publish (with a fresh event id); the sweeper only makes the gap
//! observable in health metrics.

use chrono::Utc;
use sb_common::SweeperConfig;
use sb_tracking::TrackingRepository;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub struct ExpirySweeper {
    tracking: Arc<dyn TrackingRepository>,
    config: SweeperConfig,
}

impl ExpirySweeper {
    pub fn new(tracking: Arc<dyn TrackingRepository>, config: SweeperConfig) -> Self {
        Self { tracking, config }
    }

    /// Run one sweep and return the number of records expired.
    pub async fn sweep_once(&self) -> anyhow::Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.ack_window)
                .unwrap_or_else(|_| chrono::Duration::days(365));
        let expired = self.tracking.expire_published_before(cutoff).await?;
        if expired > 0 {
            info!(expired, "Expired unacknowledged events");
            metrics::counter!("sb_events_expired_total").increment(expired);
        } else {
            debug!("Expiry sweep found nothing to expire");
        }
        Ok(expired)
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            window_secs = self.config.ack_window.as_secs(),
            "Starting expiry sweeper"
        );
        let mut ticker = tokio::time::interval(self.config.sweep_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "Expiry sweep failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Expiry sweeper shutting down");
                    break;
                }
            }
        }
    }
}
