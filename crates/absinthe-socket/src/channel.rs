//! Bookkeeping for the Absinthe control channel.
//!
//! The control channel is the single topic every GraphQL document goes
//! through. This type builds its frames and matches `phx_reply` frames back
//! to the push that caused them. It never touches the socket itself.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::codec::CONTROL_TOPIC;
use crate::phoenix::{Message, events};

/// Outcome of a push, as seen by its reply handler.
#[derive(Debug, Clone, PartialEq)]
pub enum PushReply {
    /// The server replied; the value is the reply payload `{status, response}`.
    Received(Value),
    /// No reply arrived within the configured timeout.
    TimedOut,
}

impl PushReply {
    /// The reply status, `"timeout"` for a timed out push.
    pub fn status(&self) -> Option<&str> {
        match self {
            Self::Received(payload) => payload.get("status").and_then(Value::as_str),
            Self::TimedOut => Some("timeout"),
        }
    }
}

/// Single-use handler for the reply to one push.
pub type ReplyHandler = Box<dyn FnOnce(PushReply) + Send>;

/// Join and reply bookkeeping for the control topic.
#[derive(Default)]
pub struct ControlChannel {
    join_ref: Option<String>,
    pending: HashMap<String, ReplyHandler>,
}

impl ControlChannel {
    /// Create a channel that has never joined.
    pub fn new() -> Self {
        Self::default()
    }

    /// The reference of the most recent join, if any.
    pub fn join_ref(&self) -> Option<&str> {
        self.join_ref.as_deref()
    }

    /// Build a join frame and register its reply handler.
    ///
    /// A fresh join supersedes any earlier one; replies to older joins are
    /// dropped.
    pub fn join(&mut self, msg_ref: String, handler: ReplyHandler) -> Message {
        if let Some(previous) = self.join_ref.take() {
            self.pending.remove(&previous);
        }
        self.join_ref = Some(msg_ref.clone());
        self.pending.insert(msg_ref.clone(), handler);
        Message::new(
            CONTROL_TOPIC,
            events::JOIN,
            Value::Object(Map::new()),
            Some(msg_ref.clone()),
            Some(msg_ref),
        )
    }

    /// Build a push frame for `event` and register its reply handler.
    pub fn push(
        &mut self,
        msg_ref: String,
        event: &str,
        payload: Value,
        handler: ReplyHandler,
    ) -> Message {
        self.pending.insert(msg_ref.clone(), handler);
        Message::new(
            CONTROL_TOPIC,
            event,
            payload,
            Some(msg_ref),
            self.join_ref.clone(),
        )
    }

    /// If `message` is a reply to one of our pushes, remove and return its handler.
    pub fn take_reply(&mut self, message: &Message) -> Option<ReplyHandler> {
        if message.topic != CONTROL_TOPIC || !message.is_reply() {
            return None;
        }
        let msg_ref = message.msg_ref.as_ref()?;
        self.pending.remove(msg_ref)
    }

    /// Remove the handler for a push whose timeout elapsed.
    ///
    /// Returns `None` if the reply already arrived.
    pub fn take_expired(&mut self, msg_ref: &str) -> Option<ReplyHandler> {
        self.pending.remove(msg_ref)
    }

    /// Handle a reply to an earlier push whose handler is gone, typically
    /// because its timeout elapsed. No timeout applies.
    pub fn watch(&mut self, msg_ref: String, handler: ReplyHandler) {
        self.pending.insert(msg_ref, handler);
    }

    /// Whether a reply for `msg_ref` is still outstanding.
    pub fn is_pending(&self, msg_ref: &str) -> bool {
        self.pending.contains_key(msg_ref)
    }

    /// Number of outstanding replies.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Forget the join and abandon every pending reply without invoking it.
    pub fn reset(&mut self) {
        self.join_ref = None;
        self.pending.clear();
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("join_ref", &self.join_ref)
            .field("pending", &self.pending.len())
            .finish()
    }
}
