//! # Transport Seam
//!
//! The connection manager never talks to a socket directly. It asks a
//! [`Connector`] for a [`Link`]: a [`Transport`] handle for outbound
//! operations plus a channel of inbound [`BrokerMessage`]s. When the link
//! dies, the inbound channel closes, which is how the manager notices.
//!
//! Two connectors ship with the crate:
//!
//! - [`NatsConnector`](super::nats::NatsConnector): NATS text protocol over TCP.
//! - [`MemoryBroker`](super::memory::MemoryBroker): in-process broker for
//!   tests and multi-peer demos.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use super::handshake::Handshake;
use crate::config::DEFAULT_NATS_PORT;
use crate::error::{MeshError, MeshResult};

/// Failures reported by a transport or connector.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint could not be reached at all.
    #[error("endpoint {0} unreachable")]
    Unreachable(String),

    /// The broker refused the handshake or credentials.
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// The link is gone.
    #[error("link closed")]
    Closed,

    /// Operation did not complete in time.
    #[error("timed out")]
    Timeout,

    /// Payload exceeds the broker limit.
    #[error("payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// The peer spoke something other than the expected protocol.
    #[error("broker protocol violation: {0}")]
    Protocol(String),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Supported endpoint schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Nats,
    Memory,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Nats => "nats",
            Scheme::Memory => "memory",
        }
    }
}

/// A parsed broker or relay address: `nats://host[:port]` or `memory://name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: Option<u16>,
}

impl Endpoint {
    pub fn parse(url: &str) -> MeshResult<Self> {
        let url = url.trim();
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| MeshError::Configuration(format!("invalid endpoint {url:?}: missing scheme")))?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "nats" => Scheme::Nats,
            "memory" => Scheme::Memory,
            other => {
                return Err(MeshError::Configuration(format!(
                    "unsupported endpoint scheme {other:?}"
                )))
            }
        };
        let authority = rest.trim_end_matches('/');
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => {
                let port = p.parse::<u16>().map_err(|_| {
                    MeshError::Configuration(format!("invalid port in endpoint {url:?}"))
                })?;
                (h, Some(port))
            }
            None => (authority, None),
        };
        if host.is_empty() || host.contains(char::is_whitespace) || host.contains('/') {
            return Err(MeshError::Configuration(format!(
                "invalid host in endpoint {url:?}"
            )));
        }
        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit port, or the scheme default.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_NATS_PORT)
    }

    /// `host:port` for socket connects.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, port),
            None => write!(f, "{}://{}", self.scheme.as_str(), self.host),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages, links, traits
// ---------------------------------------------------------------------------

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub subject: String,
    pub payload: Bytes,
}

/// Inbound buffer per link. Messages beyond this are dropped by the broker
/// side, never by blocking the publisher.
pub const LINK_BUFFER: usize = 1024;

/// Outbound half of a broker link.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Endpoint this link is attached to.
    fn endpoint(&self) -> &Endpoint;

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError>;

    async fn subscribe(&self, subject: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, subject: &str) -> Result<(), TransportError>;

    /// Round-trip keep-alive.
    async fn ping(&self) -> Result<(), TransportError>;

    async fn close(&self);
}

/// A live broker link.
pub struct Link {
    pub transport: Arc<dyn Transport>,
    pub inbound: mpsc::Receiver<BrokerMessage>,
}

/// Opens links to endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint, hello: &Handshake) -> Result<Link, TransportError>;
}
