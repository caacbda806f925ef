//! Event Publisher
//!
//! Builds the canonical envelope for a domain change, appends it to the sync
//! stream of every configured consumer application, and creates the
//! PUBLISHED tracking record. The stream append is the source of truth; if
//! the tracking write fails afterwards the whole publish is surfaced as
//! retryable so the caller can re-drive it (the tracking record is
//! re-creatable from stream contents).

use chrono::Utc;
use sb_common::{
    sync_stream_key, EventEnvelope, SyncBridgeError, TrackingRecord,
};
use sb_stream::StreamTransport;
use sb_tracking::TrackingRepository;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A domain change to be published, before envelope construction.
#[derive(Debug, Clone)]
pub struct NewSyncEvent {
    pub event_type: String,
    pub tenant_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub published_by: String,
}

pub struct EventPublisher {
    transport: Arc<dyn StreamTransport>,
    tracking: Arc<dyn TrackingRepository>,
    consumer_applications: Vec<String>,
}

impl EventPublisher {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        tracking: Arc<dyn TrackingRepository>,
        consumer_applications: Vec<String>,
    ) -> Self {
        Self {
            transport,
            tracking,
            consumer_applications,
        }
    }

    pub fn consumer_applications(&self) -> &[String] {
        &self.consumer_applications
    }

    /// Publish a domain change and return the durable event id.
    ///
    /// Fire-and-continue with respect to consumers: the event becomes
    /// visible to all cursors at the stream tail, and this call never waits
    /// on consumer processing.
    pub async fn publish(&self, event: NewSyncEvent) -> sb_common::Result<String> {
        let envelope = EventEnvelope {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event.event_type,
            tenant_id: event.tenant_id,
            entity_type: event.entity_type,
            entity_id: event.entity_id,
            data: event.data,
            published_by: event.published_by,
        };
        let payload = serde_json::to_value(&envelope)?;

        for application in &self.consumer_applications {
            let key = sync_stream_key(application, &envelope.event_type);
            let entry_id = self
                .transport
                .append(&key, payload.clone())
                .await
                .map_err(|e| SyncBridgeError::Publish {
                    message: format!("stream append to {} failed: {}", key, e),
                    retryable: true,
                })?;
            debug!(
                event_id = %envelope.event_id,
                stream_key = %key,
                entry_id = %entry_id,
                "Appended sync event"
            );
        }

        if let Err(e) = self.tracking.create(TrackingRecord::published(&envelope)).await {
            warn!(
                event_id = %envelope.event_id,
                error = %e,
                "Tracking record creation failed after stream append"
            );
            return Err(SyncBridgeError::Publish {
                message: format!("tracking record creation failed: {}", e),
                retryable: true,
            });
        }

        metrics::counter!("sb_events_published_total").increment(1);
        debug!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            tenant_id = %envelope.tenant_id,
            "Published sync event"
        );
        Ok(envelope.event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_common::TrackingStatus;
    use sb_stream::InMemoryStreamTransport;
    use sb_tracking::InMemoryTrackingRepository;
    use serde_json::json;

    fn credit_event() -> NewSyncEvent {
        NewSyncEvent {
            event_type: "credit.allocated".to_string(),
            tenant_id: "T1".to_string(),
            entity_type: "credit".to_string(),
            entity_id: "E1".to_string(),
            data: json!({ "amount": 100 }),
            published_by: "admin".to_string(),
        }
    }

    #[tokio::test]
    async fn publish_appends_and_tracks() {
        let transport = Arc::new(InMemoryStreamTransport::new());
        let tracking = Arc::new(InMemoryTrackingRepository::new());
        let publisher = EventPublisher::new(
            transport.clone(),
            tracking.clone(),
            vec!["crm".to_string()],
        );

        let event_id = publisher.publish(credit_event()).await.unwrap();

        let entries = transport
            .read_after("crm:sync:credit_allocated", None, 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        let envelope = EventEnvelope::from_json(&entries[0].payload).unwrap();
        assert_eq!(envelope.event_id, event_id);
        assert_eq!(envelope.tenant_id, "T1");
        assert_eq!(envelope.data["amount"], json!(100));

        let record = tracking.get(&event_id).await.unwrap().unwrap();
        assert_eq!(record.status, TrackingStatus::Published);
        assert_eq!(record.event_type, "credit.allocated");
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn publish_fans_out_to_all_consumer_applications() {
        let transport = Arc::new(InMemoryStreamTransport::new());
        let tracking = Arc::new(InMemoryTrackingRepository::new());
        let publisher = EventPublisher::new(
            transport.clone(),
            tracking.clone(),
            vec!["crm".to_string(), "billing".to_string()],
        );

        let event_id = publisher.publish(credit_event()).await.unwrap();

        for application in ["crm", "billing"] {
            let key = sync_stream_key(application, "credit.allocated");
            let entries = transport.read_after(&key, None, 10).await.unwrap();
            assert_eq!(entries.len(), 1, "missing event in {}", key);
        }
        // Exactly one tracking record regardless of fan-out.
        assert_eq!(tracking.len(), 1);
        assert!(tracking.get(&event_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn each_publish_gets_a_fresh_event_id() {
        let transport = Arc::new(InMemoryStreamTransport::new());
        let tracking = Arc::new(InMemoryTrackingRepository::new());
        let publisher =
            EventPublisher::new(transport, tracking, vec!["crm".to_string()]);

        let first = publisher.publish(credit_event()).await.unwrap();
        let second = publisher.publish(credit_event()).await.unwrap();
        assert_ne!(first, second);
    }
}
