//! SyncBridge Tracking Store
//!
//! System-of-record for event delivery state: one record per published
//! event, with a strict lifecycle PUBLISHED -> {ACKNOWLEDGED | FAILED |
//! EXPIRED}. Terminal states never transition again, and every update to a
//! record is serialized per event id (entry locking in memory, conditional
//! UPDATE in SQL), so a late stale ack can never revert a FAILED record.

pub mod memory;
pub mod repository;

#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryTrackingRepository;
pub use repository::{AckTransition, TrackingRepository};
