//! Bridge record types and JSON encoding.
//!
//! One record travels in each frame:
//!
//! ```json
//! {"type":"send","address":"foo.bar","replyAddress":"anywhere","headers":null,"body":{"text":"hello"}}
//! ```
//!
//! Field presence rules:
//! - `replyAddress` is left out entirely when unset; the peer treats a
//!   missing key differently from an empty or null one.
//! - `headers` and `body` are always written, as `null` when unset.
//! - `address` is always written, except on `ping`/`pong` records that
//!   have none.
//! - `failureCode` / `failureType` / `message` appear on inbound `err`
//!   records and are left out when unset.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use super::BridgeError;

/// Record type, carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Point-to-point message (client → bridge).
    Send,
    /// Broadcast message (client → bridge).
    Publish,
    /// Start inbound delivery for an address (client → bridge).
    Register,
    /// Stop inbound delivery for an address (client → bridge).
    Unregister,
    /// Keepalive (client → bridge).
    Ping,
    /// Inbound delivery (bridge → client).
    Message,
    /// Keepalive answer (bridge → client).
    Pong,
    /// Protocol-level failure (bridge → client).
    #[serde(rename = "err")]
    Error,
}

impl MessageKind {
    /// Wire name of this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Publish => "publish",
            Self::Register => "register",
            Self::Unregister => "unregister",
            Self::Ping => "ping",
            Self::Message => "message",
            Self::Pong => "pong",
            Self::Error => "err",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol record.
///
/// Built once per send/publish/receive and never mutated afterwards. The
/// dispatcher hands the same record to every subscriber behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Message {
    /// Record type.
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Logical destination (outbound) or source (inbound).
    #[serde(default)]
    pub address: String,

    /// Where the receiver should send its reply. Only set on `send`.
    #[serde(rename = "replyAddress", default)]
    pub reply_address: Option<String>,

    /// Opaque headers object.
    #[serde(default)]
    pub headers: Option<Value>,

    /// Opaque body.
    #[serde(default)]
    pub body: Option<Value>,

    /// Numeric failure code on `err` records.
    #[serde(rename = "failureCode", default)]
    pub failure_code: Option<i64>,

    /// Failure category on `err` records (e.g. `"NO_HANDLERS"`).
    #[serde(rename = "failureType", default)]
    pub failure_type: Option<String>,

    /// Human-readable failure description on `err` records.
    #[serde(default)]
    pub message: Option<String>,
}

impl Serialize for Message {
    fn serialize<W>(&self, serializer: W) -> Result<W::Ok, W::Error>
    where
        W: Serializer,
    {
        let mut record = serializer.serialize_struct("Message", 8)?;
        record.serialize_field("type", &self.kind)?;

        let keepalive = matches!(self.kind, MessageKind::Ping | MessageKind::Pong);
        if keepalive && self.address.is_empty() {
            record.skip_field("address")?;
        } else {
            record.serialize_field("address", &self.address)?;
        }

        match &self.reply_address {
            Some(reply_address) => record.serialize_field("replyAddress", reply_address)?,
            None => record.skip_field("replyAddress")?,
        }
        record.serialize_field("headers", &self.headers)?;
        record.serialize_field("body", &self.body)?;

        match self.failure_code {
            Some(code) => record.serialize_field("failureCode", &code)?,
            None => record.skip_field("failureCode")?,
        }
        match &self.failure_type {
            Some(failure_type) => record.serialize_field("failureType", failure_type)?,
            None => record.skip_field("failureType")?,
        }
        match &self.message {
            Some(message) => record.serialize_field("message", message)?,
            None => record.skip_field("message")?,
        }
        record.end()
    }
}

/// Failure details carried by an `err` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Numeric failure code, if the bridge sent one.
    pub code: Option<i64>,
    /// Failure category, if the bridge sent one.
    pub failure_type: Option<String>,
    /// Description, if the bridge sent one.
    pub message: Option<String>,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = self.message.as_deref().unwrap_or("no message");
        match (&self.failure_type, self.code) {
            (Some(kind), Some(code)) => write!(f, "{kind} ({code}): {message}"),
            (Some(kind), None) => write!(f, "{kind}: {message}"),
            (None, Some(code)) => write!(f, "code {code}: {message}"),
            (None, None) => f.write_str(message),
        }
    }
}

impl Message {
    fn new(kind: MessageKind, address: String) -> Self {
        Self {
            kind,
            address,
            reply_address: None,
            headers: None,
            body: None,
            failure_code: None,
            failure_type: None,
            message: None,
        }
    }

    /// Build a `send` record. `reply_address` stays absent when `None`.
    #[must_use]
    pub fn send(
        address: impl Into<String>,
        reply_address: Option<String>,
        headers: Option<Value>,
        body: Option<Value>,
    ) -> Self {
        Self {
            reply_address,
            headers: normalize(headers),
            body: normalize(body),
            ..Self::new(MessageKind::Send, address.into())
        }
    }

    /// Build a `publish` record. Never carries a reply address.
    #[must_use]
    pub fn publish(address: impl Into<String>, headers: Option<Value>, body: Option<Value>) -> Self {
        Self {
            headers: normalize(headers),
            body: normalize(body),
            ..Self::new(MessageKind::Publish, address.into())
        }
    }

    /// Build a `register` record with null headers and body.
    #[must_use]
    pub fn register(address: impl Into<String>) -> Self {
        Self::new(MessageKind::Register, address.into())
    }

    /// Build an `unregister` record with null headers and body.
    #[must_use]
    pub fn unregister(address: impl Into<String>) -> Self {
        Self::new(MessageKind::Unregister, address.into())
    }

    /// Build a keepalive `ping` record.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(MessageKind::Ping, String::new())
    }

    /// Returns `true` if this is an `err` record.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error
    }

    /// Failure details, if this is an `err` record.
    #[must_use]
    pub fn failure(&self) -> Option<Failure> {
        self.is_error().then(|| Failure {
            code: self.failure_code,
            failure_type: self.failure_type.clone(),
            message: self.message.clone(),
        })
    }

    /// Build a `send` record answering this one.
    ///
    /// Returns `None` if this record has no reply address.
    #[must_use]
    pub fn reply(&self, headers: Option<Value>, body: Option<Value>) -> Option<Self> {
        self.reply_address
            .as_ref()
            .map(|reply_to| Self::send(reply_to.clone(), None, headers, body))
    }

    /// Serialize to the JSON payload of one frame.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, BridgeError> {
        serde_json::to_vec(self).map_err(BridgeError::Encode)
    }

    /// Parse the JSON payload of one frame.
    ///
    /// `err` records decode normally; check [`Message::is_error`].
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Decode`] if the payload is not a valid record.
    pub fn decode(payload: &[u8]) -> Result<Self, BridgeError> {
        serde_json::from_slice(payload).map_err(BridgeError::Decode)
    }
}

/// Convert any serializable value into a record body or headers value.
///
/// `null` maps to `None` so that it is written as an explicit null.
///
/// # Errors
///
/// Returns [`BridgeError::Encode`] if the value cannot be represented as JSON
/// (for example a map with non-string keys).
pub fn to_value<T>(value: &T) -> Result<Option<Value>, BridgeError>
where
    T: Serialize + ?Sized,
{
    serde_json::to_value(value)
        .map(|v| normalize(Some(v)))
        .map_err(BridgeError::Encode)
}

fn normalize(value: Option<Value>) -> Option<Value> {
    value.filter(|v| !v.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encoded_text(message: &Message) -> String {
        String::from_utf8(message.encode().unwrap()).unwrap()
    }

    #[test]
    fn test_send_with_reply_address_encoding() {
        let msg = Message::send(
            "foo.bar",
            Some("anywhere".to_string()),
            None,
            Some(json!({"text": "hello"})),
        );
        let text = encoded_text(&msg);

        assert!(text.contains(r#""address":"foo.bar""#), "{text}");
        assert!(text.contains(r#""replyAddress":"anywhere""#), "{text}");
        assert!(text.contains(r#""body":{"text":"hello"}"#), "{text}");
    }

    #[test]
    fn test_send_without_reply_address_omits_field() {
        let msg = Message::send("foo.bar", None, None, Some(json!({"text": "hello"})));
        let text = encoded_text(&msg);

        assert!(!text.contains("replyAddress"), "{text}");
        assert!(text.contains(r#""headers":null"#), "{text}");
    }

    #[test]
    fn test_register_shape() {
        let value: Value = serde_json::from_slice(&Message::register("foo.bar").encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "register", "address": "foo.bar", "headers": null, "body": null})
        );
    }

    #[test]
    fn test_unregister_shape() {
        let value: Value =
            serde_json::from_slice(&Message::unregister("foo.bar").encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "unregister", "address": "foo.bar", "headers": null, "body": null})
        );
    }

    #[test]
    fn test_publish_never_has_reply_address() {
        let msg = Message::publish("news", Some(json!({"k": "v"})), Some(json!([1, 2, 3])));
        let value: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "publish", "address": "news", "headers": {"k": "v"}, "body": [1, 2, 3]})
        );
    }

    #[test]
    fn test_ping_omits_address() {
        let value: Value = serde_json::from_slice(&Message::ping().encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "ping", "headers": null, "body": null}));
    }

    #[test]
    fn test_empty_address_still_written_for_outbound_kinds() {
        for msg in [
            Message::send("", None, None, None),
            Message::publish("", None, None),
            Message::register(""),
            Message::unregister(""),
        ] {
            let value: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
            assert_eq!(value["address"], json!(""), "{} record", msg.kind);
        }
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let original = Message::send(
            "svc.echo",
            Some("reply.1".to_string()),
            Some(json!({"trace": "abc"})),
            Some(json!({"n": 42, "nested": {"ok": true}})),
        );
        let decoded = Message::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_missing_reply_address_decodes_as_none() {
        let decoded =
            Message::decode(br#"{"type":"message","address":"a","headers":null,"body":"x"}"#).unwrap();
        assert_eq!(decoded.kind, MessageKind::Message);
        assert_eq!(decoded.reply_address, None);
        assert_eq!(decoded.body, Some(json!("x")));
    }

    #[test]
    fn test_empty_reply_address_is_kept_distinct() {
        let decoded = Message::decode(br#"{"type":"message","address":"a","replyAddress":""}"#).unwrap();
        assert_eq!(decoded.reply_address.as_deref(), Some(""));
        assert_eq!(decoded.headers, None);
    }

    #[test]
    fn test_error_record_is_detected_not_rejected() {
        let decoded = Message::decode(
            br#"{"type":"err","address":"a","failureCode":-1,"failureType":"NO_HANDLERS","message":"no handlers"}"#,
        )
        .unwrap();

        assert!(decoded.is_error());
        let failure = decoded.failure().unwrap();
        assert_eq!(failure.code, Some(-1));
        assert_eq!(failure.failure_type.as_deref(), Some("NO_HANDLERS"));
        assert_eq!(failure.message.as_deref(), Some("no handlers"));
        assert_eq!(failure.to_string(), "NO_HANDLERS (-1): no handlers");
    }

    #[test]
    fn test_error_record_without_address() {
        let decoded = Message::decode(br#"{"type":"err","message":"access_denied"}"#).unwrap();
        assert!(decoded.is_error());
        assert!(decoded.address.is_empty());
    }

    #[test]
    fn test_non_error_has_no_failure() {
        assert!(Message::register("a").failure().is_none());
        assert!(!Message::register("a").is_error());
    }

    #[test]
    fn test_unknown_type_is_decode_error() {
        let err = Message::decode(br#"{"type":"bogus","address":"a"}"#).unwrap_err();
        assert!(matches!(err, BridgeError::Decode(_)));
    }

    #[test]
    fn test_malformed_payload_is_decode_error() {
        let err = Message::decode(b"not json").unwrap_err();
        assert!(matches!(err, BridgeError::Decode(_)));
    }

    #[test]
    fn test_reply_targets_reply_address() {
        let inbound = Message {
            reply_address: Some("reply.7".to_string()),
            ..Message::new(MessageKind::Message, "svc".to_string())
        };
        let reply = inbound.reply(None, Some(json!("pong"))).unwrap();

        assert_eq!(reply.kind, MessageKind::Send);
        assert_eq!(reply.address, "reply.7");
        assert_eq!(reply.reply_address, None);
        assert_eq!(reply.body, Some(json!("pong")));
    }

    #[test]
    fn test_reply_without_reply_address() {
        let inbound = Message::new(MessageKind::Message, "svc".to_string());
        assert!(inbound.reply(None, None).is_none());
    }

    #[test]
    fn test_to_value_rejects_non_string_keys() {
        let mut map = std::collections::HashMap::new();
        map.insert((1, 2), "x");
        assert!(matches!(to_value(&map), Err(BridgeError::Encode(_))));
    }

    #[test]
    fn test_to_value_maps_null_to_none() {
        assert_eq!(to_value(&()).unwrap(), None);
        assert_eq!(to_value(&Option::<u8>::None).unwrap(), None);
        assert_eq!(to_value("hi").unwrap(), Some(json!("hi")));
    }
}
