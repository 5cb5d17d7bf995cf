//! Control channel join lifecycle and the outgoing queue.
//!
//! Every outgoing operation passes through [`ConnectionStateMachine::enqueue_or_send`].
//! Until the control channel is joined, operations wait in a FIFO queue;
//! the join acknowledgement drains it exactly once, in order. The machine
//! only holds state: the owner runs the actions it hands back, under the
//! same lock that guards the machine, so ordering is preserved.

use std::collections::VecDeque;

/// Join state of the control channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No join has been issued on the current connection.
    #[default]
    Unjoined,
    /// A join was issued and has not been acknowledged yet.
    Joining,
    /// The control channel is joined; operations go straight to the wire.
    Joined,
}

/// Join lifecycle plus the queue of deferred actions.
#[derive(Debug)]
pub struct ConnectionStateMachine<A> {
    state: ConnectionState,
    outgoing: VecDeque<A>,
}

impl<A> Default for ConnectionStateMachine<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> ConnectionStateMachine<A> {
    /// Create a machine in the `Unjoined` state with an empty queue.
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Unjoined,
            outgoing: VecDeque::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the control channel is joined.
    pub fn is_joined(&self) -> bool {
        self.state == ConnectionState::Joined
    }

    /// Number of actions waiting for the join.
    pub fn queued(&self) -> usize {
        self.outgoing.len()
    }

    /// The socket connected: move `Unjoined -> Joining`.
    ///
    /// Returns `true` if the caller must issue the channel join.
    pub fn begin_join(&mut self) -> bool {
        match self.state {
            ConnectionState::Unjoined => {
                self.state = ConnectionState::Joining;
                true
            }
            ConnectionState::Joining | ConnectionState::Joined => false,
        }
    }

    /// Whether a rejoin may be issued after a failed join attempt.
    pub fn can_rejoin(&self) -> bool {
        self.state == ConnectionState::Joining
    }

    /// Run `action` now if joined, otherwise queue it.
    ///
    /// Returns the action when it should run immediately.
    pub fn enqueue_or_send(&mut self, action: A) -> Option<A> {
        if self.is_joined() {
            Some(action)
        } else {
            self.outgoing.push_back(action);
            None
        }
    }

    /// The join was acknowledged: move `Joining -> Joined` and drain the queue.
    ///
    /// The returned actions must be run in order. A duplicate acknowledgement
    /// returns nothing.
    pub fn join_acknowledged(&mut self) -> Vec<A> {
        match self.state {
            ConnectionState::Joining => {
                self.state = ConnectionState::Joined;
                self.outgoing.drain(..).collect()
            }
            ConnectionState::Unjoined | ConnectionState::Joined => Vec::new(),
        }
    }

    /// The connection went away: back to `Unjoined`, queued actions are abandoned.
    ///
    /// Returns how many queued actions were dropped.
    pub fn reset(&mut self) -> usize {
        self.state = ConnectionState::Unjoined;
        let dropped = self.outgoing.len();
        self.outgoing.clear();
        dropped
    }
}
