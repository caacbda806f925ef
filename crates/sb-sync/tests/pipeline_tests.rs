//! End-to-end pipeline tests: publish -> consume -> acknowledge -> aggregate.

use chrono::Utc;
use sb_common::{
    ack_stream_key, sync_stream_key, AckConsumerConfig, EventEnvelope, TrackingStatus,
};
use sb_stream::{CursorStore, InMemoryCursorStore, InMemoryStreamTransport, StreamTransport};
use sb_sync::{
    AckConsumer, EventPayload, EventPublisher, NewSyncEvent, PayloadRegistry, SyncHealthService,
};
use sb_tracking::{InMemoryTrackingRepository, TrackingRepository};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Pipeline {
    transport: Arc<InMemoryStreamTransport>,
    cursors: Arc<InMemoryCursorStore>,
    tracking: Arc<InMemoryTrackingRepository>,
    publisher: EventPublisher,
}

fn pipeline() -> Pipeline {
    let transport = Arc::new(InMemoryStreamTransport::new());
    let cursors = Arc::new(InMemoryCursorStore::new());
    let tracking = Arc::new(InMemoryTrackingRepository::new());
    let publisher = EventPublisher::new(
        transport.clone(),
        tracking.clone(),
        vec!["crm".to_string()],
    );
    Pipeline {
        transport,
        cursors,
        tracking,
        publisher,
    }
}

fn credit_event(entity_id: &str, amount: i64) -> NewSyncEvent {
    NewSyncEvent {
        event_type: "credit.allocated".to_string(),
        tenant_id: "T1".to_string(),
        entity_type: "credit".to_string(),
        entity_id: entity_id.to_string(),
        data: json!({ "amount": amount }),
        published_by: "admin".to_string(),
    }
}

async fn run_consumer_until_cursor(p: &Pipeline, expected_cursor: &str) {
    let consumer = AckConsumer::new(
        p.transport.clone(),
        p.cursors.clone(),
        p.tracking.clone(),
        AckConsumerConfig {
            consumer_application: "crm".to_string(),
            ..Default::default()
        },
    );
    let key = consumer.stream_key();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    for _ in 0..200 {
        if p.cursors.get_cursor(&key).await.unwrap().as_deref() == Some(expected_cursor) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn partition_preserves_publish_order_for_a_consumer() {
    let p = pipeline();
    let first = p.publisher.publish(credit_event("E1", 10)).await.unwrap();
    let second = p.publisher.publish(credit_event("E2", 20)).await.unwrap();

    let key = sync_stream_key("crm", "credit.allocated");
    let entries = p.transport.read_after(&key, None, 100).await.unwrap();
    assert_eq!(entries.len(), 2);

    let ids: Vec<String> = entries
        .iter()
        .map(|e| EventEnvelope::from_json(&e.payload).unwrap().event_id)
        .collect();
    assert_eq!(ids, vec![first, second]);
}

#[tokio::test]
async fn publish_then_ok_ack_round_trip() {
    let p = pipeline();

    let event_id = p.publisher.publish(credit_event("E1", 100)).await.unwrap();
    let record = p.tracking.get(&event_id).await.unwrap().unwrap();
    assert_eq!(record.status, TrackingStatus::Published);

    // Downstream consumes the envelope and validates the payload.
    let key = sync_stream_key("crm", "credit.allocated");
    let entries = p.transport.read_after(&key, None, 10).await.unwrap();
    let envelope = EventEnvelope::from_json(&entries[0].payload).unwrap();
    let registry = PayloadRegistry::with_standard_events();
    let payload = registry
        .decode(&envelope.event_type, &envelope.data)
        .unwrap();
    match payload {
        EventPayload::CreditAllocated(credit) => assert_eq!(credit.amount, 100),
        other => panic!("unexpected payload: {:?}", other),
    }

    // Downstream writes its acknowledgment back.
    let ack_entry = p
        .transport
        .append(
            &ack_stream_key("crm"),
            json!({
                "eventId": event_id,
                "tenantId": "T1",
                "consumerApplication": "crm",
                "result": "OK",
                "ackTimestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await
        .unwrap();

    run_consumer_until_cursor(&p, &ack_entry).await;

    let record = p.tracking.get(&event_id).await.unwrap().unwrap();
    assert_eq!(record.status, TrackingStatus::Acknowledged);
    assert!(record.acknowledged_at.unwrap() >= record.published_at);
}

#[tokio::test]
async fn health_metrics_reflect_the_pipeline() {
    let p = pipeline();

    let acked = p.publisher.publish(credit_event("E1", 10)).await.unwrap();
    let _pending = p.publisher.publish(credit_event("E2", 20)).await.unwrap();

    let ack_entry = p
        .transport
        .append(
            &ack_stream_key("crm"),
            json!({
                "eventId": acked,
                "tenantId": "T1",
                "consumerApplication": "crm",
                "result": "OK",
                "ackTimestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await
        .unwrap();
    run_consumer_until_cursor(&p, &ack_entry).await;

    let health = SyncHealthService::new(p.tracking.clone(), Duration::from_secs(3600));
    let metrics = health.health_metrics("T1").await.unwrap();
    assert_eq!(metrics.acknowledged_count, 1);
    assert_eq!(metrics.pending_count, 1);
    assert_eq!(metrics.failed_count, 0);
    assert_eq!(metrics.ack_rate, Some(1.0));
    assert!(metrics.avg_ack_latency_ms.is_some());
}
