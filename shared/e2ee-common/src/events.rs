//! Raw Events
//!
//! Timeline and state events as they arrive in a sync payload, plus the
//! encrypted envelope carried by `m.room.encrypted` events.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{DeviceId, Error, Result, RoomId, UserId};

/// Event type of an encrypted room event.
pub const ROOM_ENCRYPTED: &str = "m.room.encrypted";

/// Event type of an in-band room key (session establishment or rotation).
pub const ROOM_KEY: &str = "m.room_key";

/// Event type of a membership event.
pub const ROOM_MEMBER: &str = "m.room.member";

/// The only group encryption algorithm this client understands.
pub const MEGOLM_V1_AES_SHA2: &str = "m.megolm.v1.aes-sha2";

/// An unparsed protocol event.
///
/// Unknown fields are preserved so plaintext events pass through the
/// pipeline untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawEvent(Value);

impl RawEvent {
    /// Wrap a JSON value.
    #[must_use]
    pub const fn new(value: Value) -> Self {
        Self(value)
    }

    /// Borrow the underlying JSON.
    #[must_use]
    pub const fn json(&self) -> &Value {
        &self.0
    }

    /// Consume the event and return the underlying JSON.
    #[must_use]
    pub fn into_json(self) -> Value {
        self.0
    }

    fn str_field(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// The `type` field.
    #[must_use]
    pub fn event_type(&self) -> Option<&str> {
        self.str_field("type")
    }

    /// The `event_id` field.
    #[must_use]
    pub fn event_id(&self) -> Option<&str> {
        self.str_field("event_id")
    }

    /// The `state_key` field.
    #[must_use]
    pub fn state_key(&self) -> Option<&str> {
        self.str_field("state_key")
    }

    /// The `content` object, if present.
    #[must_use]
    pub fn content(&self) -> Option<&Value> {
        self.0.get("content")
    }

    /// The parsed `sender` field.
    pub fn sender(&self) -> Result<UserId> {
        let sender = self
            .str_field("sender")
            .ok_or(Error::MissingField("sender"))?;
        UserId::parse(sender)
    }

    /// Whether this is an `m.room.encrypted` event.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.event_type() == Some(ROOM_ENCRYPTED)
    }

    /// Whether this is an `m.room.member` state event.
    #[must_use]
    pub fn is_membership(&self) -> bool {
        self.event_type() == Some(ROOM_MEMBER) && self.state_key().is_some()
    }

    /// Parse the encrypted envelope out of the event content.
    pub fn encrypted_envelope(&self) -> Result<EncryptedEnvelope> {
        let content = self.content().ok_or(Error::MissingField("content"))?;
        Ok(EncryptedEnvelope::deserialize(content)?)
    }

    /// Build the plaintext form of an encrypted event.
    ///
    /// Keeps the outer envelope (`event_id`, `sender`, timestamps, unsigned
    /// data) and swaps in the decrypted `type` and `content`.
    #[must_use]
    pub fn with_decrypted(&self, event_type: &str, content: Value) -> Self {
        let mut object = match &self.0 {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        object.insert("type".to_owned(), Value::String(event_type.to_owned()));
        object.insert("content".to_owned(), content);
        Self(Value::Object(object))
    }
}

impl From<Value> for RawEvent {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Content of an `m.room.encrypted` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Encryption algorithm identifier.
    pub algorithm: String,
    /// Sender's Curve25519 identity key (base64).
    pub sender_key: String,
    /// Sending device, when the sender advertised it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    /// Group session the ciphertext belongs to.
    pub session_id: String,
    /// Base64 encoded ciphertext.
    pub ciphertext: String,
}

/// The JSON object encrypted inside a group message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecryptedPayload {
    /// The real event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The real event content.
    pub content: Value,
    /// Room the sender encrypted the event for.
    pub room_id: RoomId,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_encrypted_envelope_parsing() {
        let event = RawEvent::new(json!({
            "type": "m.room.encrypted",
            "event_id": "$1",
            "sender": "@alice:example.org",
            "content": {
                "algorithm": MEGOLM_V1_AES_SHA2,
                "sender_key": "curve",
                "device_id": "ALICEDEVICE",
                "session_id": "sid",
                "ciphertext": "AwgA"
            }
        }));

        assert!(event.is_encrypted());
        let envelope = event.encrypted_envelope().unwrap();
        assert_eq!(envelope.session_id, "sid");
        assert_eq!(envelope.device_id.unwrap().as_str(), "ALICEDEVICE");
    }

    #[test]
    fn test_envelope_missing_fields_is_error() {
        let event = RawEvent::new(json!({
            "type": "m.room.encrypted",
            "sender": "@alice:example.org",
            "content": { "algorithm": MEGOLM_V1_AES_SHA2 }
        }));
        assert!(event.encrypted_envelope().is_err());
    }

    #[test]
    fn test_with_decrypted_keeps_envelope() {
        let event = RawEvent::new(json!({
            "type": "m.room.encrypted",
            "event_id": "$1",
            "sender": "@alice:example.org",
            "origin_server_ts": 10,
            "content": {}
        }));

        let decrypted = event.with_decrypted("m.room.message", json!({"body": "hi"}));
        assert_eq!(decrypted.event_type(), Some("m.room.message"));
        assert_eq!(decrypted.event_id(), Some("$1"));
        assert_eq!(decrypted.json()["origin_server_ts"], 10);
        assert_eq!(decrypted.content().unwrap()["body"], "hi");
    }
}
