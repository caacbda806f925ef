//! In-memory stream transport and cursor store.
//!
//! The default backend for tests and single-process deployments. Entry ids
//! are zero-padded per-key sequence numbers, so lexical order matches append
//! order and cursor comparison is a plain string compare.

use crate::{CursorStore, StreamEntry, StreamTransport};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub struct InMemoryStreamTransport {
    streams: DashMap<String, Vec<StreamEntry>>,
    appended: Notify,
}

impl InMemoryStreamTransport {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            appended: Notify::new(),
        }
    }

    /// Number of entries in a key, for diagnostics.
    pub fn len(&self, key: &str) -> usize {
        self.streams.get(key).map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    fn read_sync(&self, key: &str, after: Option<&str>, max: usize) -> Vec<StreamEntry> {
        let Some(entries) = self.streams.get(key) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter(|e| match after {
                Some(cursor) => e.entry_id.as_str() > cursor,
                None => true,
            })
            .take(max)
            .cloned()
            .collect()
    }
}

impl Default for InMemoryStreamTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamTransport for InMemoryStreamTransport {
    async fn append(&self, key: &str, payload: serde_json::Value) -> Result<String> {
        let entry_id = {
            let mut entries = self.streams.entry(key.to_string()).or_default();
            let entry_id = format!("{:016}", entries.len() as u64 + 1);
            entries.push(StreamEntry {
                entry_id: entry_id.clone(),
                payload,
                appended_at: Utc::now(),
            });
            entry_id
        };
        self.appended.notify_waiters();
        Ok(entry_id)
    }

    async fn read_after(
        &self,
        key: &str,
        after: Option<&str>,
        max: usize,
    ) -> Result<Vec<StreamEntry>> {
        Ok(self.read_sync(key, after, max))
    }

    async fn wait_for_entries(
        &self,
        key: &str,
        after: Option<&str>,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for wakeups before checking, so an append between the
            // check and the await is not missed.
            let notified = self.appended.notified();
            let batch = self.read_sync(key, after, max);
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }
}

pub struct InMemoryCursorStore {
    cursors: DashMap<String, String>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
        }
    }
}

impl Default for InMemoryCursorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn get_cursor(&self, consumer_key: &str) -> Result<Option<String>> {
        Ok(self.cursors.get(consumer_key).map(|c| c.clone()))
    }

    async fn save_cursor(&self, consumer_key: &str, entry_id: &str) -> Result<()> {
        self.cursors
            .insert(consumer_key.to_string(), entry_id.to_string());
        Ok(())
    }

    async fn clear_cursor(&self, consumer_key: &str) -> Result<()> {
        self.cursors.remove(consumer_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn append_preserves_order_within_key() {
        let transport = InMemoryStreamTransport::new();
        for i in 0..5 {
            transport
                .append("crm:sync:role_updated", json!({ "seq": i }))
                .await
                .unwrap();
        }

        let entries = transport
            .read_after("crm:sync:role_updated", None, 100)
            .await
            .unwrap();
        assert_eq!(entries.len(), 5);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.payload["seq"], json!(i));
        }
    }

    #[tokio::test]
    async fn read_after_is_exclusive_of_cursor() {
        let transport = InMemoryStreamTransport::new();
        let first = transport.append("k", json!({ "n": 1 })).await.unwrap();
        transport.append("k", json!({ "n": 2 })).await.unwrap();

        let entries = transport.read_after("k", Some(&first), 100).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload["n"], json!(2));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let transport = InMemoryStreamTransport::new();
        transport.append("a", json!({})).await.unwrap();
        assert!(transport.read_after("b", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wait_for_entries_times_out_empty() {
        let transport = InMemoryStreamTransport::new();
        let batch = transport
            .wait_for_entries("k", None, 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn wait_for_entries_wakes_on_append() {
        let transport = Arc::new(InMemoryStreamTransport::new());

        let reader = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .wait_for_entries("k", None, 10, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.append("k", json!({ "n": 1 })).await.unwrap();

        let batch = reader.await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn cursor_store_roundtrip() {
        let store = InMemoryCursorStore::new();
        assert!(store.get_cursor("c").await.unwrap().is_none());

        store.save_cursor("c", "0000000000000003").await.unwrap();
        assert_eq!(
            store.get_cursor("c").await.unwrap().as_deref(),
            Some("0000000000000003")
        );

        store.clear_cursor("c").await.unwrap();
        assert!(store.get_cursor("c").await.unwrap().is_none());
    }
}
