//! Phoenix channel frames (V2 JSON serializer).
//!
//! Every frame on the wire is a JSON array
//! `[join_ref, ref, topic, event, payload]`. Server replies to a push arrive
//! as `phx_reply` frames whose payload is `{"status": .., "response": ..}`.

use serde_json::{Map, Value};

use crate::error::{AbsintheError, Result};

/// Topic used by the socket for heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Event names defined by the Phoenix channel protocol.
pub mod events {
    /// Join a channel topic.
    pub const JOIN: &str = "phx_join";
    /// Leave a channel topic.
    pub const LEAVE: &str = "phx_leave";
    /// Reply to a push.
    pub const REPLY: &str = "phx_reply";
    /// The channel process crashed.
    pub const ERROR: &str = "phx_error";
    /// The channel was closed by the server.
    pub const CLOSE: &str = "phx_close";
    /// Keep-alive sent on the `phoenix` topic.
    pub const HEARTBEAT: &str = "heartbeat";
}

/// A single Phoenix channel frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Reference of the join that owns this frame, if any.
    pub join_ref: Option<String>,
    /// Reference of the push this frame belongs to, if any.
    pub msg_ref: Option<String>,
    /// Channel topic.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    pub payload: Value,
}

impl Message {
    /// Create an outgoing frame.
    pub fn new(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
        msg_ref: Option<String>,
        join_ref: Option<String>,
    ) -> Self {
        Self {
            join_ref,
            msg_ref,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Create a heartbeat frame with the given reference.
    pub fn heartbeat(msg_ref: String) -> Self {
        Self::new(
            PHOENIX_TOPIC,
            events::HEARTBEAT,
            Value::Object(Map::new()),
            Some(msg_ref),
            None,
        )
    }

    /// Whether this frame is a reply to a push.
    pub fn is_reply(&self) -> bool {
        self.event == events::REPLY
    }

    /// The `status` of a reply payload, if present.
    pub fn status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }

    /// The `response` of a reply payload, if present.
    pub fn response(&self) -> Option<&Value> {
        self.payload.get("response")
    }

    /// Serialize the frame for the wire.
    pub fn encode(&self) -> Result<String> {
        let frame = Value::Array(vec![
            opt_string(&self.join_ref),
            opt_string(&self.msg_ref),
            Value::String(self.topic.clone()),
            Value::String(self.event.clone()),
            self.payload.clone(),
        ]);
        Ok(serde_json::to_string(&frame)?)
    }

    /// Parse a frame received from the wire.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let Some(parts) = value.as_array() else {
            return Err(AbsintheError::parse("frame is not a JSON array", &value));
        };
        let [join_ref, msg_ref, topic, event, payload] = parts.as_slice() else {
            return Err(AbsintheError::parse("frame must have five elements", &value));
        };

        let (Some(topic), Some(event)) = (topic.as_str(), event.as_str()) else {
            return Err(AbsintheError::parse("frame topic and event must be strings", &value));
        };

        Ok(Self {
            join_ref: ref_string(join_ref),
            msg_ref: ref_string(msg_ref),
            topic: topic.to_string(),
            event: event.to_string(),
            payload: payload.clone(),
        })
    }
}

fn opt_string(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::String(s.clone()),
        None => Value::Null,
    }
}

// Some servers send numeric refs.
fn ref_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_join() {
        let msg = Message::new(
            "__absinthe__:control",
            events::JOIN,
            json!({}),
            Some("1".into()),
            Some("1".into()),
        );
        assert_eq!(
            msg.encode().unwrap(),
            r#"["1","1","__absinthe__:control","phx_join",{}]"#
        );
    }

    #[test]
    fn test_encode_null_refs() {
        let msg = Message::new("topic", "event", json!({"a": 1}), None, None);
        assert_eq!(msg.encode().unwrap(), r#"[null,null,"topic","event",{"a":1}]"#);
    }

    #[test]
    fn test_decode_reply() {
        let msg = Message::decode(
            r#"["1","3","__absinthe__:control","phx_reply",{"status":"ok","response":{"subscriptionId":"abc"}}]"#,
        )
        .unwrap();

        assert!(msg.is_reply());
        assert_eq!(msg.msg_ref.as_deref(), Some("3"));
        assert_eq!(msg.status(), Some("ok"));
        assert_eq!(msg.response().unwrap()["subscriptionId"], "abc");
    }

    #[test]
    fn test_decode_push_without_refs() {
        let msg = Message::decode(
            r#"[null,null,"__absinthe__:doc:abc","subscription:data",{"result":{"data":{}}}]"#,
        )
        .unwrap();

        assert!(msg.join_ref.is_none());
        assert!(msg.msg_ref.is_none());
        assert_eq!(msg.topic, "__absinthe__:doc:abc");
        assert!(!msg.is_reply());
    }

    #[test]
    fn test_decode_numeric_ref() {
        let msg = Message::decode(r#"[null,7,"phoenix","phx_reply",{"status":"ok"}]"#).unwrap();
        assert_eq!(msg.msg_ref.as_deref(), Some("7"));
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        assert!(Message::decode("not json").is_err());
        assert!(Message::decode(r#"{"topic":"x"}"#).is_err());
        assert!(Message::decode(r#"[null,null,"topic"]"#).is_err());
        assert!(Message::decode(r#"[null,null,1,"event",{}]"#).is_err());
    }
}
