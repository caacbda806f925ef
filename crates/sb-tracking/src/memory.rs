//! In-memory tracking repository.
//!
//! DashMap entry locking serializes updates per event id, which is the
//! same guarantee the SQL backends get from conditional UPDATEs.

use crate::repository::{AckTransition, TrackingRepository};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sb_common::{TrackingRecord, TrackingStatus};

pub struct InMemoryTrackingRepository {
    records: DashMap<String, TrackingRecord>,
}

impl InMemoryTrackingRepository {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for InMemoryTrackingRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrackingRepository for InMemoryTrackingRepository {
    async fn create(&self, record: TrackingRecord) -> Result<()> {
        match self.records.entry(record.event_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
            Entry::Occupied(_) => Err(anyhow::anyhow!(
                "tracking record already exists for event {}",
                record.event_id
            )),
        }
    }

    async fn get(&self, event_id: &str) -> Result<Option<TrackingRecord>> {
        Ok(self.records.get(event_id).map(|r| r.clone()))
    }

    async fn mark_acknowledged(
        &self,
        event_id: &str,
        acknowledged_at: DateTime<Utc>,
    ) -> Result<AckTransition> {
        match self.records.entry(event_id.to_string()) {
            Entry::Vacant(_) => Ok(AckTransition::NotFound),
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if record.status.is_terminal() {
                    return Ok(AckTransition::AlreadyTerminal);
                }
                record.status = TrackingStatus::Acknowledged;
                record.acknowledged_at = Some(acknowledged_at);
                Ok(AckTransition::Applied)
            }
        }
    }

    async fn record_failure(
        &self,
        event_id: &str,
        error: &str,
        retry_budget: u32,
    ) -> Result<AckTransition> {
        match self.records.entry(event_id.to_string()) {
            Entry::Vacant(_) => Ok(AckTransition::NotFound),
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if record.status.is_terminal() {
                    return Ok(AckTransition::AlreadyTerminal);
                }
                record.retry_count += 1;
                record.last_error = Some(error.to_string());
                if record.retry_count >= retry_budget {
                    record.status = TrackingStatus::Failed;
                    Ok(AckTransition::Applied)
                } else {
                    Ok(AckTransition::StillPending)
                }
            }
        }
    }

    async fn expire_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut expired = 0u64;
        for mut entry in self.records.iter_mut() {
            if entry.status == TrackingStatus::Published && entry.published_at < cutoff {
                entry.status = TrackingStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn fetch_window(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<TrackingRecord>> {
        let mut records: Vec<TrackingRecord> = self
            .records
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.published_at >= since)
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.published_at);
        Ok(records)
    }
}
