use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sb_common::TrackingRecord;

/// Outcome of applying an acknowledgment to a tracking record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckTransition {
    /// The record moved to a new state.
    Applied,
    /// A negative ack was recorded but the retry budget is not exhausted;
    /// the record stays PUBLISHED and is eligible for external redelivery.
    StillPending,
    /// The record is already in a terminal state; the ack was a no-op.
    AlreadyTerminal,
    /// No record exists for the event id.
    NotFound,
}

#[async_trait]
pub trait TrackingRepository: Send + Sync {
    /// Create the PUBLISHED record for a freshly published event.
    /// Fails if a record already exists for the event id.
    async fn create(&self, record: TrackingRecord) -> Result<()>;

    async fn get(&self, event_id: &str) -> Result<Option<TrackingRecord>>;

    /// Apply a positive ack: PUBLISHED -> ACKNOWLEDGED with the given
    /// timestamp. Re-applying to an already-acknowledged record is a no-op.
    async fn mark_acknowledged(
        &self,
        event_id: &str,
        acknowledged_at: DateTime<Utc>,
    ) -> Result<AckTransition>;

    /// Apply a negative ack: increment `retry_count` and record the error;
    /// at `retry_budget` the record transitions to FAILED.
    async fn record_failure(
        &self,
        event_id: &str,
        error: &str,
        retry_budget: u32,
    ) -> Result<AckTransition>;

    /// Transition PUBLISHED records published before `cutoff` to EXPIRED.
    /// Returns the number of records expired.
    async fn expire_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// All records for a tenant published at or after `since`, oldest first.
    /// Read path for the health aggregator; never mutates.
    async fn fetch_window(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<TrackingRecord>>;
}
