//! Framed JSON envelopes exchanged on the socket.

use crate::engine::Variables;
use crate::error::ServerError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use std::collections::HashMap;

/// An inbound envelope: `{id, type, message}`.
///
/// `message` is kept raw and decoded per verb, so a malformed payload only
/// fails the operation it belongs to.
#[derive(Debug, Clone, Deserialize)]
pub struct InEnvelope {
    /// Client-chosen opaque id the reply is addressed to.
    #[serde(default)]
    pub id: String,

    /// Control verb: `subscribe`, `unsubscribe`, `mutate`, `echo`, `url`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Verb-specific payload, decoded lazily.
    #[serde(default)]
    pub message: Option<Box<RawValue>>,
}

impl InEnvelope {
    /// Decode the verb-specific payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ServerError> {
        let raw = self
            .message
            .as_ref()
            .ok_or_else(|| ServerError::client(format!("missing {} payload", self.kind)))?;
        serde_json::from_str(raw.get())
            .map_err(|error| ServerError::client(format!("invalid {} payload: {error}", self.kind)))
    }
}

/// An outbound envelope: `{id?, type, message?, metadata?}`.
#[derive(Debug, Clone, Serialize)]
pub struct OutEnvelope {
    /// Id of the operation this envelope belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Verb: `update`, `result`, `error`, `echo`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Verb-specific payload; omitted when empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,

    /// Middleware-supplied metadata; omitted when empty.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl OutEnvelope {
    /// A subscription delta.
    pub fn update(id: &str, message: Option<Value>, metadata: HashMap<String, Value>) -> Self {
        Self {
            id: id_field(id),
            kind: "update".to_string(),
            message,
            metadata,
        }
    }

    /// A mutation result.
    pub fn result(id: &str, message: Option<Value>, metadata: HashMap<String, Value>) -> Self {
        Self {
            id: id_field(id),
            kind: "result".to_string(),
            message,
            metadata,
        }
    }

    /// A sanitized failure.
    pub fn error(id: &str, message: impl Into<String>) -> Self {
        Self {
            id: id_field(id),
            kind: "error".to_string(),
            message: Some(Value::String(message.into())),
            metadata: HashMap::new(),
        }
    }

    /// A liveness reply.
    pub fn echo(id: &str) -> Self {
        Self {
            id: id_field(id),
            kind: "echo".to_string(),
            message: None,
            metadata: HashMap::new(),
        }
    }

    /// Attach middleware metadata.
    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

fn id_field(id: &str) -> Option<String> {
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Payload of the `subscribe` and `mutate` verbs.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryMessage {
    /// Raw query text.
    pub query: String,

    /// Query variables; defaults to an empty mapping.
    #[serde(default)]
    pub variables: Variables,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbound_envelope_decodes_with_raw_message() {
        let envelope: InEnvelope = serde_json::from_str(
            r#"{"id":"a","type":"subscribe","message":{"query":"{x}","variables":{"n":1}}}"#,
        )
        .unwrap();
        assert_eq!(envelope.id, "a");
        assert_eq!(envelope.kind, "subscribe");

        let message: QueryMessage = envelope.decode().unwrap();
        assert_eq!(message.query, "{x}");
        assert_eq!(message.variables.get("n"), Some(&json!(1)));
    }

    #[test]
    fn test_inbound_envelope_tolerates_missing_fields() {
        let envelope: InEnvelope = serde_json::from_str(r#"{"type":"echo"}"#).unwrap();
        assert_eq!(envelope.id, "");
        assert!(envelope.message.is_none());
    }

    #[test]
    fn test_decode_missing_payload_is_a_client_error() {
        let envelope: InEnvelope = serde_json::from_str(r#"{"id":"a","type":"subscribe"}"#).unwrap();
        let error = envelope.decode::<QueryMessage>().unwrap_err();
        assert_eq!(error.sanitized(), Some("missing subscribe payload"));
    }

    #[test]
    fn test_decode_malformed_payload_is_a_client_error() {
        let envelope: InEnvelope =
            serde_json::from_str(r#"{"id":"a","type":"subscribe","message":{"query":7}}"#).unwrap();
        let error = envelope.decode::<QueryMessage>().unwrap_err();
        assert!(error.sanitized().unwrap().starts_with("invalid subscribe payload"));
    }

    #[test]
    fn test_variables_default_to_empty() {
        let envelope: InEnvelope =
            serde_json::from_str(r#"{"id":"a","type":"mutate","message":{"query":"mutation {}"}}"#)
                .unwrap();
        let message: QueryMessage = envelope.decode().unwrap();
        assert!(message.variables.is_empty());
    }

    #[test]
    fn test_outbound_envelope_omits_empty_fields() {
        let encoded = serde_json::to_value(OutEnvelope::echo("p")).unwrap();
        assert_eq!(encoded, json!({"id": "p", "type": "echo"}));

        let encoded = serde_json::to_value(OutEnvelope::update("", None, HashMap::new())).unwrap();
        assert_eq!(encoded, json!({"type": "update"}));
    }

    #[test]
    fn test_outbound_envelope_carries_message_and_metadata() {
        let mut metadata = HashMap::new();
        metadata.insert("elapsed".to_string(), json!(12));

        let encoded = serde_json::to_value(
            OutEnvelope::update("a", Some(json!({"x": [2]})), HashMap::new())
                .with_metadata(metadata),
        )
        .unwrap();
        assert_eq!(
            encoded,
            json!({"id": "a", "type": "update", "message": {"x": [2]}, "metadata": {"elapsed": 12}})
        );
    }

    #[test]
    fn test_error_envelope_shape() {
        let encoded = serde_json::to_value(OutEnvelope::error("q", "unknown message type")).unwrap();
        assert_eq!(
            encoded,
            json!({"id": "q", "type": "error", "message": "unknown message type"})
        );
    }
}
