//! Event Payload Registry
//!
//! The envelope `data` field is opaque to transport and tracking, but
//! consumers validate it against the schema registered for the event type
//! before acting on it. Unknown event types decode to
//! [`EventPayload::Unrecognized`] and are tolerated for forward
//! compatibility; a known event type with a non-conforming payload is a
//! malformed message.

use sb_common::{Result, SyncBridgeError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreditAllocatedPayload {
    pub amount: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_after: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreditDeductedPayload {
    pub amount: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_after: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleUpdatedPayload {
    pub role_id: String,
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSyncedPayload {
    pub user_id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationCreatedPayload {
    pub name: String,
    pub plan: String,
}

/// Decoded payload, tagged by the event type it was registered under.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    CreditAllocated(CreditAllocatedPayload),
    CreditDeducted(CreditDeductedPayload),
    RoleUpdated(RoleUpdatedPayload),
    UserSynced(UserSyncedPayload),
    OrganizationCreated(OrganizationCreatedPayload),
    /// Event type with no registered decoder; carried through untouched.
    Unrecognized {
        event_type: String,
        data: serde_json::Value,
    },
}

type Decoder = fn(&serde_json::Value) -> std::result::Result<EventPayload, serde_json::Error>;

pub struct PayloadRegistry {
    decoders: HashMap<String, Decoder>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registry pre-populated with the platform's standard sync events.
    pub fn with_standard_events() -> Self {
        let mut registry = Self::new();
        registry.register("credit.allocated", |data| {
            Ok(EventPayload::CreditAllocated(serde_json::from_value(
                data.clone(),
            )?))
        });
        registry.register("credit.deducted", |data| {
            Ok(EventPayload::CreditDeducted(serde_json::from_value(
                data.clone(),
            )?))
        });
        registry.register("role.updated", |data| {
            Ok(EventPayload::RoleUpdated(serde_json::from_value(
                data.clone(),
            )?))
        });
        registry.register("user.synced", |data| {
            Ok(EventPayload::UserSynced(serde_json::from_value(
                data.clone(),
            )?))
        });
        registry.register("organization.created", |data| {
            Ok(EventPayload::OrganizationCreated(serde_json::from_value(
                data.clone(),
            )?))
        });
        registry
    }

    pub fn register(&mut self, event_type: &str, decoder: Decoder) {
        self.decoders.insert(event_type.to_string(), decoder);
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    pub fn decode(&self, event_type: &str, data: &serde_json::Value) -> Result<EventPayload> {
        match self.decoders.get(event_type) {
            Some(decoder) => decoder(data).map_err(|e| {
                SyncBridgeError::MalformedMessage(format!(
                    "payload for {} does not match schema: {}",
                    event_type, e
                ))
            }),
            None => Ok(EventPayload::Unrecognized {
                event_type: event_type.to_string(),
                data: data.clone(),
            }),
        }
    }
}

impl Default for PayloadRegistry {
    fn default() -> Self {
        Self::with_standard_events()
    }
}
