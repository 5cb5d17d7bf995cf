//! Subscription registry.
//!
//! Maps client references (known when a subscription is requested) to server
//! subscription ids (known once the server confirms it), and server ids to
//! push handlers. Cancellation may race confirmation; both orders end with
//! exactly one unsubscribe and no installed handler.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::logging::targets;

/// Handler invoked for every push addressed to one subscription.
pub type PushHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Result of [`SubscriptionRegistry::activate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    /// The handler is installed.
    Active,
    /// The reference was cancelled first; nothing was installed and the
    /// caller must unsubscribe the server id.
    Cancelled,
}

#[derive(Default)]
struct RegistryState {
    /// References whose confirmation has not arrived yet.
    pending: HashSet<String>,
    /// Pending references cancelled before confirmation.
    cancelled: HashSet<String>,
    /// Client reference -> server subscription id.
    server_ids: HashMap<String, String>,
    /// Server subscription id -> push handler.
    handlers: HashMap<String, PushHandler>,
}

/// Thread-safe subscription bookkeeping.
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a subscription request for `client_ref` is in flight.
    pub fn reserve(&self, client_ref: &str) {
        self.state.lock().pending.insert(client_ref.to_string());
    }

    /// Install the mapping for a confirmed subscription.
    ///
    /// If `client_ref` was cancelled before this confirmation, nothing is
    /// installed, the cancellation is consumed and [`Activation::Cancelled`]
    /// is returned.
    pub fn activate(&self, client_ref: &str, server_id: &str, handler: PushHandler) -> Activation {
        let mut state = self.state.lock();
        state.pending.remove(client_ref);

        if state.cancelled.remove(client_ref) {
            tracing::debug!(
                target: targets::REGISTRY,
                "Subscription {} confirmed as {} after cancel",
                client_ref,
                server_id
            );
            return Activation::Cancelled;
        }

        // References are single-use; a stale mapping must not survive.
        if let Some(previous) = state
            .server_ids
            .insert(client_ref.to_string(), server_id.to_string())
        {
            state.handlers.remove(&previous);
        }
        state.handlers.insert(server_id.to_string(), handler);
        Activation::Active
    }

    /// Remove both directions of the mapping for `client_ref`.
    ///
    /// Returns the server id that was mapped, if any. Idempotent.
    pub fn deactivate(&self, client_ref: &str) -> Option<String> {
        let mut state = self.state.lock();
        let server_id = state.server_ids.remove(client_ref)?;
        state.handlers.remove(&server_id);
        Some(server_id)
    }

    /// Cancel `client_ref`.
    ///
    /// If the subscription is active it is deactivated and its server id
    /// returned so the caller can unsubscribe. If it is still awaiting
    /// confirmation, the cancellation is recorded for
    /// [`activate`](Self::activate) to consume. Unknown references leave no
    /// trace.
    pub fn mark_cancelled(&self, client_ref: &str) -> Option<String> {
        let mut state = self.state.lock();
        if let Some(server_id) = state.server_ids.remove(client_ref) {
            state.handlers.remove(&server_id);
            return Some(server_id);
        }
        if state.pending.contains(client_ref) {
            state.cancelled.insert(client_ref.to_string());
        }
        None
    }

    /// Drop every trace of a reference whose request failed.
    pub fn forget(&self, client_ref: &str) {
        let mut state = self.state.lock();
        state.pending.remove(client_ref);
        state.cancelled.remove(client_ref);
    }

    /// Deliver a push to the handler for `server_id`.
    ///
    /// Returns `false` if no handler is installed; late pushes after an
    /// unsubscribe are dropped. The handler runs without the registry lock.
    pub fn dispatch(&self, server_id: &str, payload: &Value) -> bool {
        let handler = self.state.lock().handlers.get(server_id).cloned();
        match handler {
            Some(handler) => {
                handler(payload);
                true
            }
            None => {
                tracing::debug!(
                    target: targets::REGISTRY,
                    "Dropping push for inactive subscription {}",
                    server_id
                );
                false
            }
        }
    }

    /// The server id mapped to `client_ref`, if confirmed and active.
    pub fn server_id(&self, client_ref: &str) -> Option<String> {
        self.state.lock().server_ids.get(client_ref).cloned()
    }

    /// Number of active subscriptions.
    pub fn active_len(&self) -> usize {
        self.state.lock().handlers.len()
    }

    /// Whether the registry holds nothing at all for `client_ref`.
    pub fn is_untracked(&self, client_ref: &str) -> bool {
        let state = self.state.lock();
        !state.pending.contains(client_ref)
            && !state.cancelled.contains(client_ref)
            && !state.server_ids.contains_key(client_ref)
    }

    /// Whether the registry is completely empty.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty()
            && state.cancelled.is_empty()
            && state.server_ids.is_empty()
            && state.handlers.is_empty()
    }

    /// Forget everything. Used when the connection is torn down.
    pub fn clear(&self) {
        *self.state.lock() = RegistryState::default();
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SubscriptionRegistry")
            .field("pending", &state.pending.len())
            .field("cancelled", &state.cancelled.len())
            .field("active", &state.handlers.len())
            .finish()
    }
}
