//! GraphQL over Absinthe Phoenix channels.
//!
//! This crate runs GraphQL queries, mutations and subscriptions against an
//! [Absinthe](https://hexdocs.pm/absinthe) server through its Phoenix socket:
//!
//! - **Transport**: [`AbsintheTransport`] joins the `__absinthe__:control`
//!   channel, queues operations until the join is acknowledged and routes
//!   replies and subscription pushes back to callbacks
//! - **Codec**: the Absinthe payload shapes and their decoding into
//!   [`GraphQLResponse`]s
//! - **Phoenix socket**: a tokio-tungstenite WebSocket speaking the Phoenix
//!   V2 JSON protocol, with heartbeats and reconnects
//!
//! # Queries and mutations
//!
//! ```ignore
//! use absinthe_socket::{AbsintheTransport, GraphQLRequest};
//!
//! let transport = AbsintheTransport::new("wss://example.com/socket/websocket")?;
//!
//! let response = transport
//!     .execute(GraphQLRequest::query("query($id: ID!) { post(id: $id) { title } }")
//!         .variable("id", "42"))
//!     .await?;
//! println!("{:?}", response.data);
//! ```
//!
//! # Subscriptions
//!
//! ```ignore
//! let handle = transport.send(
//!     GraphQLRequest::subscription("subscription { commentAdded { id body } }"),
//!     |result| match result {
//!         Ok(response) => println!("comment: {:?}", response.data),
//!         Err(e) => eprintln!("subscription failed: {e}"),
//!     },
//! );
//!
//! // later
//! handle.cancel();
//! ```
//!
//! # Typed operations
//!
//! Implement [`GraphQLOperation`] to decode results into your own types:
//!
//! ```ignore
//! #[derive(serde::Deserialize)]
//! struct CommentAdded {
//!     #[serde(rename = "commentAdded")]
//!     comment_added: Comment,
//! }
//!
//! struct OnCommentAdded;
//!
//! impl GraphQLOperation for OnCommentAdded {
//!     type Data = CommentAdded;
//!
//!     fn operation_type(&self) -> OperationType {
//!         OperationType::Subscription
//!     }
//!
//!     fn query_document(&self) -> &str {
//!         "subscription { commentAdded { id body } }"
//!     }
//! }
//!
//! let mut comments = transport.subscribe(OnCommentAdded)?;
//! while let Some(result) = comments.next().await {
//!     let comment = result?.data;
//! }
//! ```
//!
//! # Logging
//!
//! Everything is logged through `tracing` under the targets in
//! [`logging::targets`]. [`AbsintheTransport::enable_debug`] additionally logs
//! every frame at debug level.

pub(crate) mod callback;
pub mod channel;
pub mod codec;
pub mod connection;
mod error;
pub mod graphql;
pub mod logging;
pub mod phoenix;
pub mod registry;
mod transport;

pub use error::{AbsintheError, ErrorKind, Result};

// Re-export commonly used types at the crate root
pub use connection::ConnectionState;
pub use graphql::{
    GraphQLError, GraphQLLocation, GraphQLOperation, GraphQLRequest, GraphQLResponse,
    OperationType, PathSegment,
};
pub use phoenix::{PhoenixSocket, ReconnectConfig, SocketConfig, SocketEvent, SocketTransport};
pub use transport::{
    AbsintheTransport, AbsintheTransportBuilder, Cancellable, SubscriptionStream, TransportConfig,
};
