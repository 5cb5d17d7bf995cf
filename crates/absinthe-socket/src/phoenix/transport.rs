//! The seam between the Absinthe transport and the socket beneath it.

use super::message::Message;
use crate::error::Result;

/// Something that happened on the socket.
///
/// Events are delivered in order on a single channel; the consumer is the
/// transport's receive loop.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The connection was established.
    Open,
    /// The connection was closed or lost.
    Close,
    /// A frame arrived.
    Message(Message),
    /// A connection attempt or an established connection failed.
    Error(String),
}

/// A multiplexed, topic-based socket.
///
/// Reconnection and heartbeats are the implementor's business; the
/// transport only issues frames and reacts to [`SocketEvent`]s.
pub trait SocketTransport: Send + Sync + 'static {
    /// Start connecting. A no-op if already connected or connecting.
    fn connect(&self);

    /// Close the connection and stop reconnecting.
    ///
    /// A later [`connect`](Self::connect) must start a fresh connection.
    fn disconnect(&self);

    /// Generate a reference that is unique for the life of the socket.
    fn make_ref(&self) -> String;

    /// Queue a frame for sending.
    fn push(&self, message: Message) -> Result<()>;

    /// Whether the socket currently has an open connection.
    fn is_connected(&self) -> bool;
}
