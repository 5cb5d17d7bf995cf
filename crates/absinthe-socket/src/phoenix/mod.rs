//! Phoenix channels socket.
//!
//! This module provides the socket the Absinthe transport runs on:
//! - V2 JSON frames (`[join_ref, ref, topic, event, payload]`)
//! - Connection params appended to the endpoint, refreshed per attempt
//! - Heartbeats on the `phoenix` topic
//! - Auto-reconnect with exponential backoff
//!
//! The transport depends only on the [`SocketTransport`] trait, so any
//! other socket implementation can be plugged in.
//!
//! # Example
//!
//! ```ignore
//! use absinthe_socket::phoenix::{PhoenixSocket, SocketConfig, SocketEvent, SocketTransport};
//!
//! let socket = PhoenixSocket::new(SocketConfig::new("wss://example.com/socket/websocket"));
//! let mut events = socket.take_events().unwrap();
//! socket.connect();
//!
//! while let Some(event) = events.recv().await {
//!     if let SocketEvent::Message(message) = event {
//!         println!("{} on {}", message.event, message.topic);
//!     }
//! }
//! ```

mod message;
mod socket;
mod transport;

pub use message::{Message, PHOENIX_TOPIC, events};
pub use socket::{
    PROTOCOL_VERSION, ParamsProvider, PhoenixSocket, ReconnectConfig, SocketConfig, SocketState,
};
pub use transport::{SocketEvent, SocketTransport};
