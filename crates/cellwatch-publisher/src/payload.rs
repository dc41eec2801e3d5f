use std::borrow::Cow;

use serde::Serialize;
use serde_json::Value;

/// The body of an outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Sent as-is.
    Text(String),
    /// Serialized to compact JSON at delivery time.
    Json(Value),
}

impl Payload {
    /// Converts any serializable value into a JSON payload.
    pub fn serialize<S>(value: &S) -> Result<Self, serde_json::Error>
    where
        S: Serialize + ?Sized,
    {
        serde_json::to_value(value).map(Payload::Json)
    }

    /// Wire bytes for the transport.
    pub fn encode(&self) -> Result<Cow<'_, [u8]>, serde_json::Error> {
        match self {
            Payload::Text(text) => Ok(Cow::Borrowed(text.as_bytes())),
            Payload::Json(value) => serde_json::to_vec(value).map(Cow::Owned),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}
