//! # Network Module
//!
//! Session layer between a node and the shared message broker. Everything
//! above this module (discovery, RPC, certification) only ever sees
//! subjects and byte payloads; how they travel is decided here.
//!
//! ## Architecture
//!
//! ```text
//! transport.rs   Connector/Transport traits, endpoints, broker messages
//! handshake.rs   Signed session handshake presented on every connect
//! backoff.rs     Bounded exponential backoff with jitter
//! relay.rs       Relay selection strategy for NAT-traversal fallback
//! connection.rs  Session state machine, reconnect, subscriptions
//! nats.rs        NATS text protocol over TCP
//! memory.rs      In-process broker for tests and demos
//! subjects.rs    Subject naming conventions
//! ```
//!
//! ## Design Decisions
//!
//! - The connection manager is the only writer of the broker link. Connect,
//!   reconnect and disconnect take the same async mutex, so two reconnects
//!   can never race each other onto the broker.
//! - Broker subscriptions are reference counted per subject. Any number of
//!   local consumers can watch the same subject over one broker SUB.
//! - Transports are trait objects. The session logic is tested end to end
//!   against the in-process broker without opening a socket.

pub mod backoff;
pub mod connection;
pub mod handshake;
pub mod memory;
pub mod nats;
pub mod relay;
pub mod subjects;
pub mod transport;

pub use backoff::Backoff;
pub use connection::{
    ConnectionManager, ConnectionSettings, SessionInfo, SessionState, Subscription,
    SubscriptionTask,
};
pub use handshake::{Handshake, HandshakeError};
pub use memory::MemoryBroker;
pub use nats::NatsConnector;
pub use relay::{NoRelay, RelayDirectory, RelaySelector};
pub use transport::{BrokerMessage, Connector, Endpoint, Link, Scheme, Transport, TransportError};
