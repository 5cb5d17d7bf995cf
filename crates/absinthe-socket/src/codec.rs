//! Absinthe wire codec.
//!
//! Translates operations into control-channel payloads and turns the three
//! server-initiated shapes (ok reply, error reply, subscription push) into
//! typed results. Each shape has its own decoder so that failures stay
//! specific: a [`Parse`](AbsintheError::Parse) error means the message did
//! not look like the protocol, a [`Query`](AbsintheError::Query) error means
//! the server said no.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{AbsintheError, Result};
use crate::graphql::{GraphQLError, GraphQLOperation, GraphQLResponse};

/// Topic every GraphQL document is pushed on.
pub const CONTROL_TOPIC: &str = "__absinthe__:control";

/// Absinthe event names.
pub mod events {
    /// Submit a query, mutation or subscription document.
    pub const DOC: &str = "doc";
    /// Cancel an active subscription.
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    /// Subscription data, pushed on the topic named by the subscription id.
    pub const SUBSCRIPTION_DATA: &str = "subscription:data";
}

mod keys {
    pub const QUERY: &str = "query";
    pub const VARIABLES: &str = "variables";
    pub const STATUS: &str = "status";
    pub const RESPONSE: &str = "response";
    pub const RESULT: &str = "result";
    pub const ERRORS: &str = "errors";
    pub const SUBSCRIPTION_ID: &str = "subscriptionId";
}

const STATUS_OK: &str = "ok";

/// A payload pushed on the control topic.
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingPayload {
    /// `{query, variables?}`, sent with the `doc` event.
    Document {
        /// The GraphQL document.
        query: String,
        /// Variables, omitted from the wire when absent.
        variables: Option<Value>,
    },
    /// `{subscriptionId}`, sent with the `unsubscribe` event.
    Unsubscribe {
        /// Server subscription id to cancel.
        subscription_id: String,
    },
}

impl OutgoingPayload {
    /// The event this payload is pushed with.
    pub fn event(&self) -> &'static str {
        match self {
            Self::Document { .. } => events::DOC,
            Self::Unsubscribe { .. } => events::UNSUBSCRIBE,
        }
    }

    /// The JSON object sent on the wire.
    pub fn into_value(self) -> Value {
        let mut map = Map::new();
        match self {
            Self::Document { query, variables } => {
                map.insert(keys::QUERY.into(), Value::String(query));
                if let Some(variables) = variables {
                    map.insert(keys::VARIABLES.into(), variables);
                }
            }
            Self::Unsubscribe { subscription_id } => {
                map.insert(keys::SUBSCRIPTION_ID.into(), Value::String(subscription_id));
            }
        }
        Value::Object(map)
    }
}

/// Build the `doc` payload for an operation.
pub fn encode<O: GraphQLOperation + ?Sized>(operation: &O) -> OutgoingPayload {
    OutgoingPayload::Document {
        query: operation.query_document().to_string(),
        variables: operation.variables().cloned(),
    }
}

/// Build the `unsubscribe` payload for a server subscription id.
pub fn encode_unsubscribe(subscription_id: &str) -> OutgoingPayload {
    OutgoingPayload::Unsubscribe {
        subscription_id: subscription_id.to_string(),
    }
}

/// Decode the reply to a query or mutation (or a failed subscription).
///
/// `reply` is the full reply payload, `{status, response}`.
pub fn decode_result<O: GraphQLOperation + ?Sized>(
    _operation: &O,
    reply: &Value,
) -> Result<GraphQLResponse<O::Data>> {
    let status = reply_status(reply)?;
    let response = reply
        .get(keys::RESPONSE)
        .filter(|r| r.is_object())
        .ok_or_else(|| AbsintheError::parse("reply has no response object", reply))?;

    if status != STATUS_OK {
        return Err(query_error(Some(response)));
    }
    decode_response(response, reply)
}

/// Decode the reply to a subscription document into the server subscription id.
pub fn decode_subscription_start(reply: &Value) -> Result<String> {
    let status = reply_status(reply)?;
    let response = reply.get(keys::RESPONSE);

    if status != STATUS_OK {
        return Err(query_error(response));
    }

    response
        .and_then(|r| r.get(keys::SUBSCRIPTION_ID))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AbsintheError::parse("reply has no subscriptionId", reply))
}

/// Decode a `subscription:data` push payload.
pub fn decode_subscription_push<O: GraphQLOperation + ?Sized>(
    _operation: &O,
    payload: &Value,
) -> Result<GraphQLResponse<O::Data>> {
    let result = payload
        .get(keys::RESULT)
        .filter(|r| r.is_object())
        .ok_or_else(|| AbsintheError::parse("push has no result object", payload))?;
    decode_response(result, payload)
}

fn reply_status(reply: &Value) -> Result<&str> {
    reply
        .get(keys::STATUS)
        .and_then(Value::as_str)
        .ok_or_else(|| AbsintheError::parse("reply has no status", reply))
}

fn decode_response<T: DeserializeOwned>(
    response: &Value,
    raw: &Value,
) -> Result<GraphQLResponse<T>> {
    serde_json::from_value(response.clone())
        .map_err(|e| AbsintheError::parse(format!("malformed GraphQL response: {e}"), raw))
}

fn query_error(response: Option<&Value>) -> AbsintheError {
    let errors = response.map(graphql_errors).unwrap_or_default();
    AbsintheError::Query {
        errors,
        payload: response.cloned(),
    }
}

// Absinthe reports document errors as `{errors: [...]}`; Phoenix itself
// rejects pushes with `{reason: "..."}`.
fn graphql_errors(response: &Value) -> Vec<GraphQLError> {
    if let Some(errors) = response.get(keys::ERRORS)
        && let Ok(errors) = serde_json::from_value::<Vec<GraphQLError>>(errors.clone())
    {
        return errors;
    }
    ["message", "reason"]
        .iter()
        .find_map(|key| response.get(*key).and_then(Value::as_str))
        .map(|message| vec![GraphQLError::new(message)])
        .unwrap_or_default()
}
