//! Redis Streams transport and cursor store.
//!
//! Entry ids are the native Redis stream ids (`ms-seq`), which sort in
//! append order per key. Cursors are plain keys under `cursor:`.

use crate::{CursorStore, StreamEntry, StreamTransport};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

const PAYLOAD_FIELD: &str = "payload";
const APPENDED_AT_FIELD: &str = "appendedAt";

pub struct RedisStreamTransport {
    manager: ConnectionManager,
}

impl RedisStreamTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        info!("Connected Redis stream transport");
        Ok(Self { manager })
    }

    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    fn decode_entry(entry_id: String, fields: HashMap<String, String>) -> Result<StreamEntry> {
        let payload = fields
            .get(PAYLOAD_FIELD)
            .ok_or_else(|| anyhow::anyhow!("stream entry {} missing payload field", entry_id))?;
        let payload: serde_json::Value = serde_json::from_str(payload)?;
        let appended_at = fields
            .get(APPENDED_AT_FIELD)
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Ok(StreamEntry {
            entry_id,
            payload,
            appended_at,
        })
    }
}

#[async_trait]
impl StreamTransport for RedisStreamTransport {
    async fn append(&self, key: &str, payload: serde_json::Value) -> Result<String> {
        let mut conn = self.manager.clone();
        let body = serde_json::to_string(&payload)?;
        let entry_id: String = redis::cmd("XADD")
            .arg(key)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(body)
            .arg(APPENDED_AT_FIELD)
            .arg(Utc::now().to_rfc3339())
            .query_async(&mut conn)
            .await?;
        Ok(entry_id)
    }

    async fn read_after(
        &self,
        key: &str,
        after: Option<&str>,
        max: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.manager.clone();
        // "(" prefix makes the range exclusive of the cursor id.
        let start = match after {
            Some(cursor) => format!("({}", cursor),
            None => "-".to_string(),
        };
        let raw: Vec<(String, HashMap<String, String>)> = redis::cmd("XRANGE")
            .arg(key)
            .arg(start)
            .arg("+")
            .arg("COUNT")
            .arg(max)
            .query_async(&mut conn)
            .await?;

        raw.into_iter()
            .map(|(id, fields)| Self::decode_entry(id, fields))
            .collect()
    }

    async fn wait_for_entries(
        &self,
        key: &str,
        after: Option<&str>,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.manager.clone();
        let last_seen = after.unwrap_or("0-0");
        let raw: Option<Vec<(String, Vec<(String, HashMap<String, String>)>)>> =
            redis::cmd("XREAD")
                .arg("COUNT")
                .arg(max)
                .arg("BLOCK")
                .arg(timeout.as_millis() as u64)
                .arg("STREAMS")
                .arg(key)
                .arg(last_seen)
                .query_async(&mut conn)
                .await?;

        let Some(streams) = raw else {
            return Ok(Vec::new());
        };
        streams
            .into_iter()
            .flat_map(|(_, entries)| entries)
            .map(|(id, fields)| Self::decode_entry(id, fields))
            .collect()
    }
}

pub struct RedisCursorStore {
    manager: ConnectionManager,
}

impl RedisCursorStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }

    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    fn storage_key(consumer_key: &str) -> String {
        format!("cursor:{}", consumer_key)
    }
}

#[async_trait]
impl CursorStore for RedisCursorStore {
    async fn get_cursor(&self, consumer_key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let cursor: Option<String> = redis::cmd("GET")
            .arg(Self::storage_key(consumer_key))
            .query_async(&mut conn)
            .await?;
        Ok(cursor)
    }

    async fn save_cursor(&self, consumer_key: &str, entry_id: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::storage_key(consumer_key))
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear_cursor(&self, consumer_key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("DEL")
            .arg(Self::storage_key(consumer_key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
