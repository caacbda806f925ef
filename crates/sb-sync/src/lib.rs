//! SyncBridge Event Pipeline
//!
//! This crate provides the cross-application synchronization pipeline:
//! - EventPublisher: envelope construction, stream append, tracking creation
//! - AckConsumer: cursor-driven acknowledgment processing with per-message
//!   error isolation
//! - PayloadRegistry: event type -> payload decoder, applied at consumption
//! - SyncHealthService: rolling-window delivery health per tenant
//! - ExpirySweeper: background expiry of never-acknowledged events

pub mod consumer;
pub mod health;
pub mod payload;
pub mod publisher;
pub mod sweeper;

pub use consumer::AckConsumer;
pub use health::SyncHealthService;
pub use payload::{EventPayload, PayloadRegistry};
pub use publisher::{EventPublisher, NewSyncEvent};
pub use sweeper::ExpirySweeper;
