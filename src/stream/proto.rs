use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field that marks an inbound liveness probe.
pub const PING_FIELD: &str = "ping";

/// Outbound control envelope.
///
/// Every variant serializes to a flat JSON object keyed by the operation,
/// e.g. `{"sub":"market_BTCUSDT_ticker"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ClientMessage {
    Request { req: String, id: String },
    Subscribe { sub: String },
    Unsubscribe { unsub: String },
    Ping { ping: u64 },
    Pong { pong: Value },
}

impl ClientMessage {
    pub fn subscribe(channel: impl Into<String>) -> Self {
        Self::Subscribe {
            sub: channel.into(),
        }
    }

    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Self::Unsubscribe {
            unsub: channel.into(),
        }
    }

    pub fn request(channel: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Request {
            req: channel.into(),
            id: id.into(),
        }
    }

    pub fn ping(timestamp_ms: u64) -> Self {
        Self::Ping { ping: timestamp_ms }
    }

    /// Acknowledges a remote probe by echoing its value unchanged.
    pub fn pong(echo: Value) -> Self {
        Self::Pong { pong: echo }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Remote liveness probe carrying the value to echo back.
    Ping(Value),
    /// Any other payload, kept as raw JSON.
    Data(Value),
}

impl InboundMessage {
    /// Classifies a parsed payload.
    ///
    /// Only objects can carry the `ping` marker; a present-but-null marker
    /// still counts as a probe.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut fields) if fields.contains_key(PING_FIELD) => {
                Self::Ping(fields.remove(PING_FIELD).unwrap_or(Value::Null))
            }
            other => Self::Data(other),
        }
    }
}
