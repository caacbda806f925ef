use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Event Envelope
// ============================================================================

/// The canonical cross-application message unit.
///
/// Consumers tolerate unknown additional fields (forward compatibility) and
/// reject envelopes missing any required field; both behaviors fall out of
/// the serde derive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    /// Dotted, hierarchical tag (e.g. `credit.allocated`, `role.updated`).
    pub event_type: String,
    pub tenant_id: String,
    pub entity_type: String,
    pub entity_id: String,
    /// Event-type-specific payload, opaque to transport and tracking.
    pub data: serde_json::Value,
    pub published_by: String,
}

impl EventEnvelope {
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| SyncBridgeError::MalformedMessage(format!("event envelope: {}", e)))
    }
}

// ============================================================================
// Acknowledgment Messages
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckResult {
    Ok,
    Error,
}

/// Downstream-originated confirmation correlated to one envelope by `event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckMessage {
    pub event_id: String,
    pub tenant_id: String,
    pub consumer_application: String,
    pub result: AckResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub ack_timestamp: DateTime<Utc>,
}

impl AckMessage {
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| SyncBridgeError::MalformedMessage(format!("ack message: {}", e)))
    }
}

// ============================================================================
// Tracking Records
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackingStatus {
    Published,
    Acknowledged,
    Failed,
    Expired,
}

impl TrackingStatus {
    /// ACKNOWLEDGED, FAILED and EXPIRED are terminal; no further transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TrackingStatus::Published)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingStatus::Published => "PUBLISHED",
            TrackingStatus::Acknowledged => "ACKNOWLEDGED",
            TrackingStatus::Failed => "FAILED",
            TrackingStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PUBLISHED" => Ok(TrackingStatus::Published),
            "ACKNOWLEDGED" => Ok(TrackingStatus::Acknowledged),
            "FAILED" => Ok(TrackingStatus::Failed),
            "EXPIRED" => Ok(TrackingStatus::Expired),
            other => Err(SyncBridgeError::Tracking(format!(
                "unknown tracking status: {}",
                other
            ))),
        }
    }
}

/// Delivery/acknowledgment lifecycle record, one per published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingRecord {
    pub event_id: String,
    pub tenant_id: String,
    pub event_type: String,
    pub status: TrackingStatus,
    pub published_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl TrackingRecord {
    pub fn published(envelope: &EventEnvelope) -> Self {
        Self {
            event_id: envelope.event_id.clone(),
            tenant_id: envelope.tenant_id.clone(),
            event_type: envelope.event_type.clone(),
            status: TrackingStatus::Published,
            published_at: envelope.timestamp,
            acknowledged_at: None,
            retry_count: 0,
            last_error: None,
        }
    }
}

// ============================================================================
// Sync Health Metrics
// ============================================================================

/// Rolling-window delivery health for one tenant.
///
/// `ack_rate` is `None` (not zero) when no record in the window has reached
/// a terminal state yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHealthMetrics {
    pub tenant_id: String,
    pub ack_rate: Option<f64>,
    pub avg_ack_latency_ms: Option<f64>,
    pub pending_count: u64,
    pub failed_count: u64,
    pub acknowledged_count: u64,
    pub expired_count: u64,
    pub window_secs: u64,
}

// ============================================================================
// Stream Key Naming
// ============================================================================

/// Sync stream key for a consumer application and event type.
///
/// `("crm", "role.updated")` -> `crm:sync:role_updated`
pub fn sync_stream_key(consumer_application: &str, event_type: &str) -> String {
    format!(
        "{}:sync:{}",
        consumer_application,
        event_type.replace('.', "_")
    )
}

/// Acknowledgment stream key for a consumer application.
///
/// `"crm"` -> `crm:sync:ack`
pub fn ack_stream_key(consumer_application: &str) -> String {
    format!("{}:sync:ack", consumer_application)
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Exponential backoff policy shared by activity retries and consumers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after a failed attempt (1-based), capped at `max_delay_ms`.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self.base_delay_ms as f64 * self.multiplier.powi(exp as i32);
        Duration::from_millis((delay as u64).min(self.max_delay_ms))
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

#[derive(Debug, Clone)]
pub struct AckConsumerConfig {
    pub consumer_application: String,
    /// Negative acks beyond this budget transition the record to FAILED.
    pub retry_budget: u32,
    pub batch_max_size: usize,
    pub batch_max_wait_ms: u64,
    /// Backoff applied when the tracking store is unavailable.
    pub store_backoff_initial_ms: u64,
    pub store_backoff_max_ms: u64,
}

impl Default for AckConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_application: "crm".to_string(),
            retry_budget: 3,
            batch_max_size: 100,
            batch_max_wait_ms: 1000,
            store_backoff_initial_ms: 500,
            store_backoff_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub sweep_interval: Duration,
    /// PUBLISHED records without an ack for this long become EXPIRED.
    pub ack_window: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            ack_window: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: u32,
    pub queue_capacity: usize,
    pub task_timeout: Duration,
    pub rate_limit_per_minute: Option<u32>,
    pub reclaim_interval: Duration,
    pub lease_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            queue_capacity: 256,
            task_timeout: Duration::from_secs(30),
            rate_limit_per_minute: None,
            reclaim_interval: Duration::from_secs(5),
            lease_timeout: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncBridgeError {
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Tracking store error: {0}")]
    Tracking(String),

    #[error("Publish failed: {message}")]
    Publish { message: String, retryable: bool },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown event reference: {0}")]
    UnknownEventReference(String),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, SyncBridgeError>;
