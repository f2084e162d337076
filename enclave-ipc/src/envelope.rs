//! IPC wire envelope.
//!
//! ```json
//! {"channel": "...", "type": "ipc", "payload": ...,
//!  "metadata": {"id": "...", "timestamp": 0, "source": "...",
//!               "target": "...", "signature": "..."}}
//! ```
//!
//! Unknown fields, a missing field or a `type` other than `"ipc"` make the
//! message invalid.

use enclave_types::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only accepted value of the envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "ipc")]
    Ipc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metadata {
    pub id: String,
    pub timestamp: Timestamp,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Hex HMAC-SHA256 of the plaintext payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    pub channel: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub payload: Value,
    pub metadata: Metadata,
}

impl Envelope {
    /// Parses a posted value, returning `None` when the shape is not exact.
    pub fn from_value(value: Value) -> Option<Self> {
        let env: Self = serde_json::from_value(value).ok()?;
        if env.channel.is_empty() || env.metadata.id.is_empty() {
            return None;
        }
        Some(env)
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn source(&self) -> &str {
        &self.metadata.source
    }

    pub fn target(&self) -> Option<&str> {
        self.metadata.target.as_deref()
    }
}

/// Bytes covered by a payload signature.
pub(crate) fn signing_bytes(payload: &Value) -> Vec<u8> {
    serde_json::to_vec(payload).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> Value {
        json!({
            "channel": "rpc-request",
            "type": "ipc",
            "payload": {"x": 1},
            "metadata": {"id": "m1", "timestamp": 5, "source": "host://app"}
        })
    }

    #[test]
    fn accepts_exact_shape() {
        let env = Envelope::from_value(valid()).unwrap();
        assert_eq!(env.channel, "rpc-request");
        assert_eq!(env.id(), "m1");
        assert!(env.target().is_none());
    }

    #[test]
    fn rejects_extra_top_level_field() {
        let mut v = valid();
        v["extra"] = json!(true);
        assert!(Envelope::from_value(v).is_none());
    }

    #[test]
    fn rejects_extra_metadata_field() {
        let mut v = valid();
        v["metadata"]["nonce"] = json!("n");
        assert!(Envelope::from_value(v).is_none());
    }

    #[test]
    fn rejects_wrong_type_and_missing_fields() {
        let mut v = valid();
        v["type"] = json!("rpc");
        assert!(Envelope::from_value(v).is_none());

        let mut v = valid();
        v.as_object_mut().unwrap().remove("payload");
        assert!(Envelope::from_value(v).is_none());

        let mut v = valid();
        v["metadata"].as_object_mut().unwrap().remove("source");
        assert!(Envelope::from_value(v).is_none());

        assert!(Envelope::from_value(json!("hello")).is_none());
    }

    #[test]
    fn null_payload_is_allowed() {
        let mut v = valid();
        v["payload"] = Value::Null;
        assert!(Envelope::from_value(v).is_some());
    }
}
