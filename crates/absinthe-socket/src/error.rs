//! Error types for the Absinthe socket transport.

use serde_json::Value;
use thiserror::Error;

use crate::graphql::GraphQLError;

/// Broad classification of an [`AbsintheError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The socket or channel transport failed.
    Network,
    /// A message did not have the shape the protocol requires.
    Parse,
    /// The server reported that the operation failed.
    Query,
}

impl ErrorKind {
    /// Human readable description of the kind.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Network => "Absinthe socket error",
            Self::Parse => "Absinthe message parse error",
            Self::Query => "Absinthe query error",
        }
    }
}

/// Errors produced by the transport and its codec.
#[derive(Debug, Clone, Error)]
pub enum AbsintheError {
    /// Delegated transport failure, surfaced as-is.
    #[error("Absinthe socket error: {0}")]
    Network(String),

    /// A message did not match the protocol's expectations.
    #[error("Absinthe message parse error: {reason}")]
    Parse {
        /// What was wrong with the message.
        reason: String,
        /// The offending raw payload, when one was available.
        payload: Option<Value>,
    },

    /// The server explicitly reported that the operation failed.
    #[error("Absinthe query error: {}", join_messages(.errors))]
    Query {
        /// Structured GraphQL errors taken from the reply.
        errors: Vec<GraphQLError>,
        /// The raw `response` object of the reply.
        payload: Option<Value>,
    },

    /// The endpoint URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A handshake header name or value was rejected.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// The operation cannot be run through the requested entry point.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

fn join_messages(errors: &[GraphQLError]) -> String {
    if errors.is_empty() {
        return "operation failed".into();
    }
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

impl AbsintheError {
    /// Build a parse error carrying the offending payload.
    pub fn parse(reason: impl Into<String>, payload: &Value) -> Self {
        Self::Parse {
            reason: reason.into(),
            payload: Some(payload.clone()),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) | Self::InvalidUrl(_) | Self::InvalidHeader(_) => ErrorKind::Network,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Query { .. } | Self::InvalidOperation(_) => ErrorKind::Query,
        }
    }

    /// The raw payload attached to this error, if any.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Parse { payload, .. } | Self::Query { payload, .. } => payload.as_ref(),
            _ => None,
        }
    }

    /// GraphQL errors reported by the server. Empty unless this is a query error.
    pub fn graphql_errors(&self) -> &[GraphQLError] {
        match self {
            Self::Query { errors, .. } => errors,
            _ => &[],
        }
    }
}

impl From<url::ParseError> for AbsintheError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

impl From<serde_json::Error> for AbsintheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse {
            reason: err.to_string(),
            payload: None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AbsintheError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Network(err.to_string())
    }
}

/// A specialized Result type for transport operations.
pub type Result<T> = std::result::Result<T, AbsintheError>;
