// Copyright (c) 2026 AgentMesh Contributors. MIT License.
// See LICENSE for details.

//! # AgentMesh Client Core
//!
//! Everything an agent needs to take part in the mesh: a persistent
//! cryptographic identity, a resilient session to the shared broker, peer
//! discovery, and signed agent-to-agent calls with optional certificates.
//!
//! ## Architecture
//!
//! The crate is split along the concerns of a mesh client, leaves first:
//!
//! - **identity**: Ed25519 keys, peer IDs, on-disk identity lifecycle.
//! - **network**: broker transports, session state machine, reconnect and
//!   relay fallback, subscriptions.
//! - **discovery**: presence announcements and capability lookup.
//! - **rpc**: signed envelopes, call correlation, handler dispatch.
//! - **certify**: attribute certificates, trust store, certification client.
//! - **listener**: raw tap on a node's inbound traffic for debugging.
//! - **node**: [`AgentNode`], one identity wired to one of each of the above.
//! - **config**: protocol constants and [`ClientConfig`].
//! - **error**: [`MeshError`], the one error type callers match on.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use agentmesh_protocol::{AgentNode, ClientConfig, MemoryBroker, Identity, PeerFilter};
//! use serde_json::json;
//!
//! # async fn run() -> agentmesh_protocol::MeshResult<()> {
//! let broker = MemoryBroker::new();
//! let config = ClientConfig { broker_url: "memory://local".into(), ..Default::default() };
//! let node = AgentNode::new(config, Identity::ephemeral(), Arc::new(broker))?;
//! node.connect().await?;
//! node.announce([("ping".to_string(), json!(true))].into_iter().collect()).await?;
//! let peers = node.discover(&PeerFilter::capability("ping")).await?;
//! # Ok(()) }
//! ```

pub mod certify;
pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod listener;
pub mod network;
pub mod node;
pub mod rpc;

pub use certify::{Attributes, Authority, Certificate, CertificationClient, TrustStore};
pub use config::ClientConfig;
pub use discovery::{Capabilities, DiscoveryService, PeerFilter, PeerRecord};
pub use error::{MeshError, MeshResult};
pub use identity::{Identity, IdentityManager, PeerId};
pub use listener::Listener;
pub use network::{ConnectionManager, MemoryBroker, NatsConnector, SessionState};
pub use node::{AgentNode, NodeStatus};
pub use rpc::{Envelope, EnvelopeKind, RemoteFault, RpcEngine};
