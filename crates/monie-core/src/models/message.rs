use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::RatesDocument;

/// Messages sent by a foreground client to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// The user's in-app notification preference. Must be resent after the
    /// worker restarts; the worker never persists it.
    SetNotificationPermissions(bool),
    RequestStatusInfo,
}

impl ClientMessage {
    /// Decode an inbound message. Unknown discriminants and malformed
    /// payloads yield `None` and are ignored by the worker.
    pub fn decode(value: &Value) -> Option<Self> {
        match serde_json::from_value(value.clone()) {
            Ok(message) => Some(message),
            Err(e) => {
                let kind = value.get("type").and_then(Value::as_str).unwrap_or("<none>");
                debug!(kind, error = %e, "Ignoring unrecognized client message");
                None
            }
        }
    }
}

/// Messages sent by the worker to foreground clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    StatusInfo { version: String },
    NewRates(RatesDocument),
}
