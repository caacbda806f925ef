//! SyncBridge Stream Transport
//!
//! Append-only, per-key ordered log abstraction with durable consumer
//! cursors. One log exists per `{consumerApplication}:sync:{eventType}` key,
//! plus one acknowledgment log per application. Within a key, entries are
//! delivered in append order; no ordering exists across keys.
//!
//! Cursors are explicit objects persisted through [`CursorStore`] and passed
//! into each consumer loop; there is no process-wide cursor state.

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use memory::{InMemoryCursorStore, InMemoryStreamTransport};

/// A single entry in a stream partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEntry {
    /// Opaque, lexically ordered identifier within its key.
    pub entry_id: String,
    pub payload: serde_json::Value,
    pub appended_at: DateTime<Utc>,
}

/// Append-only ordered log, keyed by stream name.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Append a payload and return the durable entry id.
    async fn append(&self, key: &str, payload: serde_json::Value) -> Result<String>;

    /// Read up to `max` entries strictly after `after` (from the start when
    /// `None`), in append order.
    async fn read_after(
        &self,
        key: &str,
        after: Option<&str>,
        max: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Like [`read_after`](StreamTransport::read_after) but waits up to
    /// `timeout` for new entries; returns an empty batch on timeout.
    async fn wait_for_entries(
        &self,
        key: &str,
        after: Option<&str>,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamEntry>>;
}

/// Durable storage for per-consumer stream cursors.
///
/// The cursor value is the id of the last fully-processed entry; consumers
/// save it only after their side effects commit, so a crash re-reads from
/// the last committed position (at-least-once, never skip-ahead).
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get_cursor(&self, consumer_key: &str) -> Result<Option<String>>;
    async fn save_cursor(&self, consumer_key: &str, entry_id: &str) -> Result<()>;
    async fn clear_cursor(&self, consumer_key: &str) -> Result<()>;
}
