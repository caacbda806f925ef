//! Acknowledgment Consumer
//!
//! Reads the per-application acknowledgment stream through an explicit,
//! durably persisted cursor and reconciles each ack against the tracking
//! store. Malformed messages and acks for unknown event ids are logged and
//! skipped without halting the loop; a tracking-store outage blocks the
//! cursor (retry with backoff, never advance past an unprocessed entry).
//! The cursor is saved only after the tracking update commits, so a crash
//! re-reads and re-applies the same ack, which is idempotent by
//! construction.

use sb_common::{ack_stream_key, AckConsumerConfig, AckMessage, AckResult};
use sb_stream::{CursorStore, StreamEntry, StreamTransport};
use sb_tracking::{AckTransition, TrackingRepository};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// What became of a single acknowledgment entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDisposition {
    /// Tracking record transitioned (ACKNOWLEDGED or FAILED).
    Applied,
    /// Negative ack recorded; record still PUBLISHED within budget.
    StillPending,
    /// Duplicate or stale ack against a terminal record; ignored.
    Duplicate,
    /// Ack referenced an event id we never published; discarded.
    UnknownEvent,
    /// Entry did not parse as an ack message; discarded.
    Malformed,
}

pub struct AckConsumer {
    transport: Arc<dyn StreamTransport>,
    cursors: Arc<dyn CursorStore>,
    tracking: Arc<dyn TrackingRepository>,
    config: AckConsumerConfig,
}

impl AckConsumer {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        cursors: Arc<dyn CursorStore>,
        tracking: Arc<dyn TrackingRepository>,
        config: AckConsumerConfig,
    ) -> Self {
        Self {
            transport,
            cursors,
            tracking,
            config,
        }
    }

    /// The stream (and cursor) key this consumer drains.
    pub fn stream_key(&self) -> String {
        ack_stream_key(&self.config.consumer_application)
    }

    /// Run until the shutdown signal fires. The cursor is committed up to
    /// the last fully-processed entry when this returns.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let key = self.stream_key();
        info!(stream_key = %key, "Starting acknowledgment consumer");

        let mut cursor = match self.cursors.get_cursor(&key).await {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!(stream_key = %key, error = %e, "Failed to load cursor, starting from the beginning");
                None
            }
        };

        let mut backoff_ms = self.config.store_backoff_initial_ms;

        loop {
            let batch = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(stream_key = %key, "Acknowledgment consumer shutting down");
                    return;
                }
                batch = self.transport.wait_for_entries(
                    &key,
                    cursor.as_deref(),
                    self.config.batch_max_size,
                    Duration::from_millis(self.config.batch_max_wait_ms),
                ) => batch,
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(stream_key = %key, error = %e, "Stream read failed, retrying in {}ms", backoff_ms);
                    if self.backoff(&mut shutdown_rx, &mut backoff_ms).await {
                        return;
                    }
                    continue;
                }
            };

            for entry in batch {
                match self.process_entry(&entry).await {
                    Ok(_) => {
                        backoff_ms = self.config.store_backoff_initial_ms;
                        if let Err(e) = self.cursors.save_cursor(&key, &entry.entry_id).await {
                            // Processing already committed; re-applying after a
                            // crash is idempotent, so keep going.
                            warn!(stream_key = %key, entry_id = %entry.entry_id, error = %e, "Cursor save failed");
                        }
                        cursor = Some(entry.entry_id);
                    }
                    Err(e) => {
                        warn!(
                            stream_key = %key,
                            entry_id = %entry.entry_id,
                            error = %e,
                            "Tracking update failed, blocking on this entry"
                        );
                        if self.backoff(&mut shutdown_rx, &mut backoff_ms).await {
                            return;
                        }
                        // Do not advance; the entry is re-read next iteration.
                        break;
                    }
                }
            }
        }
    }

    /// Wait out the current backoff, doubling it up to the configured cap.
    /// Returns true if shutdown fired during the wait.
    async fn backoff(
        &self,
        shutdown_rx: &mut broadcast::Receiver<()>,
        backoff_ms: &mut u64,
    ) -> bool {
        let wait = Duration::from_millis(*backoff_ms);
        *backoff_ms = (*backoff_ms * 2).min(self.config.store_backoff_max_ms);
        tokio::select! {
            _ = shutdown_rx.recv() => true,
            _ = tokio::time::sleep(wait) => false,
        }
    }

    /// Process one acknowledgment entry against the tracking store.
    ///
    /// `Ok` means the cursor may advance (including the discard cases);
    /// `Err` means a transient store failure and the entry must be retried.
    pub async fn process_entry(&self, entry: &StreamEntry) -> anyhow::Result<AckDisposition> {
        let ack = match AckMessage::from_json(&entry.payload) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(entry_id = %entry.entry_id, error = %e, "Discarding malformed ack");
                metrics::counter!("sb_acks_malformed_total").increment(1);
                return Ok(AckDisposition::Malformed);
            }
        };

        let transition = match ack.result {
            AckResult::Ok => {
                self.tracking
                    .mark_acknowledged(&ack.event_id, ack.ack_timestamp)
                    .await?
            }
            AckResult::Error => {
                let detail = ack
                    .error_detail
                    .as_deref()
                    .unwrap_or("consumer reported an unspecified error");
                self.tracking
                    .record_failure(&ack.event_id, detail, self.config.retry_budget)
                    .await?
            }
        };

        let disposition = match transition {
            AckTransition::Applied => {
                debug!(
                    event_id = %ack.event_id,
                    consumer = %ack.consumer_application,
                    result = ?ack.result,
                    "Ack applied"
                );
                AckDisposition::Applied
            }
            AckTransition::StillPending => {
                debug!(
                    event_id = %ack.event_id,
                    "Negative ack within retry budget, event stays pending"
                );
                AckDisposition::StillPending
            }
            AckTransition::AlreadyTerminal => {
                debug!(event_id = %ack.event_id, "Duplicate or stale ack ignored");
                AckDisposition::Duplicate
            }
            AckTransition::NotFound => {
                // Never create a record from an ack; a forged or misrouted
                // ack must not inflate delivery metrics.
                warn!(
                    event_id = %ack.event_id,
                    consumer = %ack.consumer_application,
                    "Discarding ack for unknown event"
                );
                metrics::counter!("sb_acks_unknown_total").increment(1);
                AckDisposition::UnknownEvent
            }
        };

        metrics::counter!("sb_acks_processed_total").increment(1);
        Ok(disposition)
    }
}
