//! GraphQL operation types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A GraphQL operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// A query operation (read-only).
    #[default]
    Query,
    /// A mutation operation (modifies data).
    Mutation,
    /// A subscription operation (real-time updates).
    Subscription,
}

/// An operation the transport can execute.
///
/// Implement this for generated or hand-written operation types to get
/// typed results. [`GraphQLRequest`] covers the untyped case.
pub trait GraphQLOperation: Send + Sync + 'static {
    /// The shape of the `data` member of a successful response.
    type Data: DeserializeOwned + Send + 'static;

    /// Whether this is a query, mutation or subscription.
    fn operation_type(&self) -> OperationType;

    /// The GraphQL document to submit.
    fn query_document(&self) -> &str;

    /// Variables for the document, if the operation declares any.
    fn variables(&self) -> Option<&Value> {
        None
    }
}

/// An untyped GraphQL request.
///
/// Responses to it decode their `data` as a raw [`Value`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQLRequest {
    /// The GraphQL query string.
    pub query: String,

    /// Optional variables for the query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,

    /// The operation type (not serialized).
    #[serde(skip)]
    pub(crate) operation_type: OperationType,
}

impl GraphQLRequest {
    /// Create a new query request.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let request = GraphQLRequest::query("query GetUsers { users { id name } }");
    /// ```
    pub fn query(query: impl Into<String>) -> Self {
        Self::with_type(query, OperationType::Query)
    }

    /// Create a new mutation request.
    pub fn mutation(query: impl Into<String>) -> Self {
        Self::with_type(query, OperationType::Mutation)
    }

    /// Create a new subscription request.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let request = GraphQLRequest::subscription(r#"
    ///     subscription OnCommentAdded($postId: ID!) {
    ///         commentAdded(postId: $postId) { id body }
    ///     }
    /// "#)
    /// .variable("postId", "42");
    /// ```
    pub fn subscription(query: impl Into<String>) -> Self {
        Self::with_type(query, OperationType::Subscription)
    }

    /// Create a new request from a raw document.
    ///
    /// The operation type is inferred from the document, defaulting to Query.
    pub fn new(query: impl Into<String>) -> Self {
        let query = query.into();
        let operation_type = Self::infer_operation_type(&query);
        Self::with_type(query, operation_type)
    }

    fn with_type(query: impl Into<String>, operation_type: OperationType) -> Self {
        Self {
            query: query.into(),
            variables: None,
            operation_type,
        }
    }

    /// Set a variable value.
    pub fn variable(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        let variables = self
            .variables
            .get_or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(map) = variables
            && let Ok(value) = serde_json::to_value(value)
        {
            map.insert(name.into(), value);
        }
        self
    }

    /// Set all variables from a serializable value.
    pub fn variables(mut self, variables: impl Serialize) -> Self {
        self.variables = serde_json::to_value(variables).ok();
        self
    }

    /// Check if this is a subscription.
    pub fn is_subscription(&self) -> bool {
        self.operation_type == OperationType::Subscription
    }

    fn infer_operation_type(query: &str) -> OperationType {
        let trimmed = query.trim_start();
        if trimmed.starts_with("subscription") {
            OperationType::Subscription
        } else if trimmed.starts_with("mutation") {
            OperationType::Mutation
        } else {
            OperationType::Query
        }
    }
}

impl GraphQLOperation for GraphQLRequest {
    type Data = Value;

    fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    fn query_document(&self) -> &str {
        &self.query
    }

    fn variables(&self) -> Option<&Value> {
        self.variables.as_ref()
    }
}

/// Schema introspection document used by
/// [`AbsintheTransport::introspect`](crate::AbsintheTransport::introspect).
pub const INTROSPECTION_QUERY: &str = r#"
query IntrospectionQuery {
  __schema {
    queryType { name }
    mutationType { name }
    subscriptionType { name }
    types {
      kind
      name
      description
      fields(includeDeprecated: true) {
        name
        args { name type { ...TypeRef } defaultValue }
        type { ...TypeRef }
        isDeprecated
      }
      inputFields { name type { ...TypeRef } defaultValue }
      enumValues(includeDeprecated: true) { name isDeprecated }
      possibleTypes { kind name }
    }
  }
}

fragment TypeRef on __Type {
  kind
  name
  ofType { kind name ofType { kind name ofType { kind name } } }
}
"#;
