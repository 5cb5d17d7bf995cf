//! Log targets.
//!
//! The crate logs through `tracing` and never installs a subscriber. Use
//! these targets in filter directives to select a subsystem, for example
//! `RUST_LOG=absinthe_socket::socket=debug`.

/// Target names for log filtering.
pub mod targets {
    /// Crate-wide target.
    pub const CRATE: &str = "absinthe_socket";
    /// Phoenix socket: connection, heartbeats, reconnects, frame decoding.
    pub const SOCKET: &str = "absinthe_socket::socket";
    /// Control channel: join and reply bookkeeping.
    pub const CHANNEL: &str = "absinthe_socket::channel";
    /// Transport facade: operation dispatch and receive path.
    pub const TRANSPORT: &str = "absinthe_socket::transport";
    /// Subscription registry.
    pub const REGISTRY: &str = "absinthe_socket::registry";
}
