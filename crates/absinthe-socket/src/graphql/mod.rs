//! GraphQL operation and response types consumed by the transport.

mod request;
mod response;

pub use request::{GraphQLOperation, GraphQLRequest, INTROSPECTION_QUERY, OperationType};
pub use response::{GraphQLError, GraphQLLocation, GraphQLResponse, PathSegment};
