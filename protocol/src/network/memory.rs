//! # In-Process Broker
//!
//! A [`Connector`] that keeps every link inside the current process. All
//! endpoints with the `memory://` scheme reach the same message space, so a
//! "relay" is simply another host name on the same broker. This is what the
//! integration tests and the demo use to run many peers in one runtime.
//!
//! Fault injection hooks:
//!
//! - [`set_reachable`](MemoryBroker::set_reachable) makes a host refuse new
//!   connections, which drives the relay fallback path.
//! - [`sever_all`](MemoryBroker::sever_all) drops every live link, which is
//!   what a broker restart looks like to clients.
//! - [`set_heartbeat_stalled`](MemoryBroker::set_heartbeat_stalled) makes
//!   pings time out while messages keep flowing.
//!
//! Delivery uses `try_send`; a slow consumer loses messages instead of
//! blocking publishers, which matches how a real broker treats slow
//! subscribers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::handshake::Handshake;
use super::transport::{
    BrokerMessage, Connector, Endpoint, Link, Scheme, Transport, TransportError, LINK_BUFFER,
};
use crate::config::{MAX_CLOCK_SKEW, MAX_PAYLOAD_BYTES};
use crate::identity::PeerId;

struct Client {
    peer: PeerId,
    host: String,
    tx: mpsc::Sender<BrokerMessage>,
    subjects: HashSet<String>,
}

#[derive(Default)]
struct BrokerState {
    clients: DashMap<u64, Client>,
    unreachable: DashMap<String, ()>,
    attempts: DashMap<String, u32>,
    token: Option<String>,
    next_id: AtomicU64,
    heartbeat_stalled: AtomicBool,
}

impl BrokerState {
    fn route(&self, msg: &BrokerMessage) {
        for client in self.clients.iter() {
            if !client.subjects.contains(&msg.subject) {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = client.tx.try_send(msg.clone()) {
                warn!(peer = %client.peer, subject = %msg.subject, "memory broker: slow consumer, message dropped");
            }
        }
    }
}

/// Shared in-process broker. Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that only accepts handshakes carrying `token`.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            state: Arc::new(BrokerState {
                token: Some(token.into()),
                ..BrokerState::default()
            }),
        }
    }

    /// Whether new connections to `host` succeed. Existing links are kept.
    pub fn set_reachable(&self, host: &str, reachable: bool) {
        if reachable {
            self.state.unreachable.remove(host);
        } else {
            self.state.unreachable.insert(host.to_string(), ());
        }
    }

    /// Drops every live link. Clients see their inbound stream end.
    pub fn sever_all(&self) {
        let n = self.state.clients.len();
        self.state.clients.clear();
        debug!(links = n, "memory broker: severed all links");
    }

    /// Drops the links belonging to one peer.
    pub fn sever(&self, peer: &PeerId) {
        self.state.clients.retain(|_, c| &c.peer != peer);
    }

    /// While stalled, every `ping` times out.
    pub fn set_heartbeat_stalled(&self, stalled: bool) {
        self.state.heartbeat_stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        self.state.clients.len()
    }

    /// Live links attached through `host`.
    pub fn connections_to(&self, host: &str) -> usize {
        self.state.clients.iter().filter(|c| c.host == host).count()
    }

    /// Connect attempts seen for `host`, successful or not.
    pub fn attempts(&self, host: &str) -> u32 {
        self.state.attempts.get(host).map(|a| *a).unwrap_or(0)
    }

    /// Injects a raw message as if some client had published it.
    pub fn inject(&self, subject: &str, payload: impl Into<Bytes>) {
        self.state.route(&BrokerMessage {
            subject: subject.to_string(),
            payload: payload.into(),
        });
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, endpoint: &Endpoint, hello: &Handshake) -> Result<Link, TransportError> {
        if endpoint.scheme() != Scheme::Memory {
            return Err(TransportError::Unreachable(endpoint.to_string()));
        }
        *self
            .state
            .attempts
            .entry(endpoint.host().to_string())
            .or_insert(0) += 1;

        if self.state.unreachable.contains_key(endpoint.host()) {
            return Err(TransportError::Unreachable(endpoint.to_string()));
        }
        hello
            .verify_with_token(self.state.token.as_deref(), MAX_CLOCK_SKEW)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;

        let (tx, rx) = mpsc::channel(LINK_BUFFER);
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        self.state.clients.insert(
            id,
            Client {
                peer: hello.peer_id().clone(),
                host: endpoint.host().to_string(),
                tx,
                subjects: HashSet::new(),
            },
        );
        debug!(peer = %hello.peer_id().short(), endpoint = %endpoint, "memory broker: link opened");

        Ok(Link {
            transport: Arc::new(MemoryTransport {
                state: self.state.clone(),
                id,
                endpoint: endpoint.clone(),
            }),
            inbound: rx,
        })
    }
}

struct MemoryTransport {
    state: Arc<BrokerState>,
    id: u64,
    endpoint: Endpoint,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.state.clients.contains_key(&self.id) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_BYTES,
            });
        }
        self.state.route(&BrokerMessage {
            subject: subject.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<(), TransportError> {
        let mut client = self
            .state
            .clients
            .get_mut(&self.id)
            .ok_or(TransportError::Closed)?;
        client.subjects.insert(subject.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, subject: &str) -> Result<(), TransportError> {
        let mut client = self
            .state
            .clients
            .get_mut(&self.id)
            .ok_or(TransportError::Closed)?;
        client.subjects.remove(subject);
        Ok(())
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.state.heartbeat_stalled.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout);
        }
        Ok(())
    }

    async fn close(&self) {
        self.state.clients.remove(&self.id);
    }
}
