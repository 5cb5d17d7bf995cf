//! GraphQL response types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A GraphQL error returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    /// The error message.
    pub message: String,

    /// Locations in the document where the error occurred.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<GraphQLLocation>,

    /// Path to the field that caused the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,

    /// Additional error metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLError {
    /// Create an error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
            path: None,
            extensions: None,
        }
    }
}

impl fmt::Display for GraphQLError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref path) = self.path {
            write!(f, " (at ")?;
            for (i, segment) in path.iter().enumerate() {
                if i > 0 {
                    write!(f, ".")?;
                }
                match segment {
                    PathSegment::Field(name) => write!(f, "{}", name)?,
                    PathSegment::Index(idx) => write!(f, "[{}]", idx)?,
                }
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for GraphQLError {}

/// A location in a GraphQL document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphQLLocation {
    /// Line number (1-indexed).
    pub line: u32,
    /// Column number (1-indexed).
    pub column: u32,
}

/// A segment in an error path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// A field name.
    Field(String),
    /// An array index.
    Index(usize),
}

/// A GraphQL response, with `data` decoded as `T`.
///
/// Servers may return partial data together with errors, so a response
/// decoded from a successful reply can still carry `errors`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
pub struct GraphQLResponse<T = Value> {
    /// The data returned by the operation.
    #[serde(default)]
    pub data: Option<T>,

    /// Errors that occurred during execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,

    /// Additional response metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl<T> GraphQLResponse<T> {
    /// Check if the response contains errors.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Check if the response was successful (has data and no errors).
    pub fn is_success(&self) -> bool {
        self.data.is_some() && self.errors.is_empty()
    }

    /// Get the first error, if any.
    pub fn first_error(&self) -> Option<&GraphQLError> {
        self.errors.first()
    }

    /// Get all errors as a combined message.
    pub fn error_message(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(
                self.errors
                    .iter()
                    .map(|e| e.message.as_str())
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        }
    }

    /// Take the data out of the response.
    ///
    /// Returns the errors instead if there are any, or if there is no data.
    pub fn into_result(self) -> Result<T, Vec<GraphQLError>> {
        match self.data {
            Some(data) if self.errors.is_empty() => Ok(data),
            Some(_) => Err(self.errors),
            None if self.errors.is_empty() => {
                Err(vec![GraphQLError::new("No data in GraphQL response")])
            }
            None => Err(self.errors),
        }
    }
}
