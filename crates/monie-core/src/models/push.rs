use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Push discriminant announcing that fresh rates are available.
pub const NEW_RATES: &str = "NEW_RATES";

/// Body of the dynamic rates resource.
///
/// The shape is owned by the rates provider, so the worker only carries it
/// around as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RatesDocument(pub Value);

impl RatesDocument {
    pub fn from_slice(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body).map(RatesDocument)
    }
}

#[derive(Debug, Deserialize)]
struct RawPush {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
}

/// A decoded push delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum PushPayload {
    /// New rates were published. The server may or may not inline them.
    NewRates { data: Option<RatesDocument> },
    /// Any other discriminant; `raw` keeps the original text for diagnostics.
    Other { kind: String, raw: String },
}

impl PushPayload {
    /// Decode a raw push body. Returns `None` for an absent, non-JSON or
    /// untyped payload.
    pub fn decode(raw: Option<&[u8]>) -> Option<Self> {
        let bytes = raw?;
        let parsed: RawPush = match serde_json::from_slice(bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "Ignoring undecodable push payload");
                return None;
            }
        };

        if parsed.kind == NEW_RATES {
            Some(PushPayload::NewRates {
                data: parsed.data.map(RatesDocument),
            })
        } else {
            Some(PushPayload::Other {
                kind: parsed.kind,
                raw: String::from_utf8_lossy(bytes).into_owned(),
            })
        }
    }
}

/// Subscription details posted to `/push-register`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    #[serde(default)]
    pub key: String,
    #[serde(default, rename = "authSecret")]
    pub auth_secret: String,
    #[serde(default)]
    pub endpoint: String,
}

impl PushSubscription {
    /// The registration server accepts a subscription (201) only when all
    /// three fields are present; anything else is rejected with 400.
    pub fn is_complete(&self) -> bool {
        !self.key.is_empty() && !self.auth_secret.is_empty() && !self.endpoint.is_empty()
    }

    pub fn expected_status(&self) -> u16 {
        if self.is_complete() {
            201
        } else {
            400
        }
    }
}
