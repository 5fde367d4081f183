//! # Agent Node
//!
//! One agent on the mesh: an identity plus one instance of every client
//! component, wired together. There is no process-wide "current session";
//! any number of nodes can live in one process (the integration tests run
//! whole meshes this way over a [`MemoryBroker`](crate::network::MemoryBroker)).
//!
//! ```text
//!               AgentNode
//!   ┌──────────────┼──────────────────┐
//!   │        ConnectionManager        │
//!   │     ┌────────┼─────────┐        │
//!   │ Discovery  RpcEngine  Listener  │
//!   │              │                  │
//!   │     CertificationClient         │
//!   └─────────────────────────────────┘
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::certify::{Attributes, Certificate, CertificationClient, TrustStore};
use crate::config::ClientConfig;
use crate::discovery::{Capabilities, DiscoveryService, DiscoverySettings, PeerFilter, PeerRecord};
use crate::error::{MeshError, MeshResult};
use crate::identity::{Identity, IdentityManager, PeerId};
use crate::listener::Listener;
use crate::network::{
    Connector, ConnectionManager, NatsConnector, RelayDirectory, Scheme, SessionState,
};
use crate::rpc::{CallStream, Envelope, HandlerResult, InboundRequest, RpcEngine, RpcOptions};

/// Snapshot returned by [`AgentNode::status`].
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub peer_id: PeerId,
    pub state: SessionState,
    pub endpoint: Option<String>,
    pub relay_in_use: bool,
    pub retry_count: u32,
    pub reconnects: u64,
    pub known_peers: usize,
    pub announcing: bool,
    pub certificate: Option<CertificateStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CertificateStatus {
    pub issuer: PeerId,
    pub expires_at: DateTime<Utc>,
    pub valid: bool,
}

pub struct AgentNode {
    config: ClientConfig,
    conn: ConnectionManager,
    rpc: RpcEngine,
    discovery: DiscoveryService,
    certification: CertificationClient,
    relays: Arc<RelayDirectory>,
}

impl AgentNode {
    /// Builds a node from configuration, loading the identity stored in
    /// `identity_dir` and picking the connector from the broker URL scheme.
    pub fn open(config: ClientConfig) -> MeshResult<Self> {
        config.validate()?;
        let store = IdentityManager::new(config.identity_path()?);
        let identity = store.load()?;
        let connector: Arc<dyn Connector> = match config.broker_endpoint()?.scheme() {
            Scheme::Nats => Arc::new(NatsConnector::new(config.connect_timeout())),
            Scheme::Memory => {
                return Err(MeshError::Configuration(
                    "memory:// brokers exist only in-process; use AgentNode::new".into(),
                ))
            }
        };
        Self::assemble(config, identity, connector, Some(store))
    }

    /// Builds a node around an explicit identity and connector. Nothing is
    /// persisted.
    pub fn new(config: ClientConfig, identity: Identity, connector: Arc<dyn Connector>) -> MeshResult<Self> {
        config.validate()?;
        Self::assemble(config, identity, connector, None)
    }

    fn assemble(
        config: ClientConfig,
        identity: Identity,
        connector: Arc<dyn Connector>,
        store: Option<IdentityManager>,
    ) -> MeshResult<Self> {
        let trust = Arc::new(TrustStore::from_config(&config.trusted_authorities)?);
        let relays = Arc::new(RelayDirectory::new(config.relay_endpoints()?));
        let conn = ConnectionManager::new(Arc::new(identity), connector, relays.clone());
        let rpc = RpcEngine::new(conn.clone(), trust, RpcOptions::from_config(&config));
        let discovery = DiscoveryService::new(
            conn.clone(),
            DiscoverySettings::from_config(&config),
            Some(relays.clone()),
        );
        let mut certification = CertificationClient::new(rpc.clone(), config.cert_renewal_margin());
        if let Some(store) = store {
            certification = certification.with_store(store);
        }
        Ok(Self {
            config,
            conn,
            rpc,
            discovery,
            certification,
            relays,
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        self.conn.peer_id()
    }

    pub fn identity(&self) -> &Arc<Identity> {
        self.conn.identity()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.conn
    }

    pub fn rpc(&self) -> &RpcEngine {
        &self.rpc
    }

    pub fn discovery(&self) -> &DiscoveryService {
        &self.discovery
    }

    pub fn certification(&self) -> &CertificationClient {
        &self.certification
    }

    pub fn relays(&self) -> &Arc<RelayDirectory> {
        &self.relays
    }

    pub fn state(&self) -> SessionState {
        self.conn.state()
    }

    /// Opens the session, then starts serving RPC and caching presence.
    pub async fn connect(&self) -> MeshResult<()> {
        self.conn.connect(&self.config).await?;
        self.rpc.start().await?;
        self.discovery.start().await?;
        info!(peer = %self.peer_id().short(), "node online");
        Ok(())
    }

    /// Closes the session for good and fails outstanding calls.
    pub async fn disconnect(&self) {
        self.discovery.stop();
        self.rpc.stop();
        self.conn.disconnect().await;
    }

    /// Announces presence at the configured interval.
    pub async fn announce(&self, capabilities: Capabilities) -> MeshResult<()> {
        self.discovery
            .announce(capabilities, self.config.announce_interval())
            .await
    }

    /// Discovers peers over the configured window.
    pub async fn discover(&self, filter: &PeerFilter) -> MeshResult<Vec<PeerRecord>> {
        self.discovery
            .discover(filter, self.config.discovery_window())
            .await
    }

    /// Calls `action` on `target` with the configured timeout, presenting
    /// this node's certificate (renewed first if it is close to expiry).
    pub async fn call(&self, target: &PeerId, action: &str, payload: Value) -> MeshResult<Value> {
        self.rpc
            .call(
                target,
                action,
                payload,
                self.config.call_timeout(),
                self.certification.presentable(self.config.call_timeout()).await,
            )
            .await
    }

    /// Like [`call`](Self::call) with an explicit timeout and certificate.
    pub async fn call_with(
        &self,
        target: &PeerId,
        action: &str,
        payload: Value,
        timeout: Duration,
        certificate: Option<Certificate>,
    ) -> MeshResult<Value> {
        self.rpc
            .call(target, action, payload, timeout, certificate)
            .await
    }

    /// Streaming call; the configured call timeout bounds the gap between
    /// items.
    pub async fn call_stream(
        &self,
        target: &PeerId,
        action: &str,
        payload: Value,
    ) -> MeshResult<CallStream> {
        self.rpc
            .call_stream(
                target,
                action,
                payload,
                self.config.call_timeout(),
                self.certification.presentable(self.config.call_timeout()).await,
            )
            .await
    }

    /// Serves `action` from this node.
    pub fn handle<F, Fut>(&self, action: &str, handler: F)
    where
        F: Fn(InboundRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.rpc.handle(action, handler);
    }

    /// Taps the inbound subject. See [`Listener`].
    pub async fn listen<F, Fut>(&self, handler: F) -> MeshResult<Listener>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Listener::start(&self.conn, handler).await
    }

    /// Obtains (or reuses) a certificate from `authority`.
    pub async fn certify(&self, authority: &PeerId, attributes: Attributes) -> MeshResult<Certificate> {
        self.certification
            .certify(authority, attributes, self.config.call_timeout())
            .await
    }

    pub fn status(&self) -> NodeStatus {
        let info = self.conn.info();
        let now = Utc::now();
        let certificate = self.certification.current().map(|cert| CertificateStatus {
            valid: cert
                .validate_for(self.peer_id(), self.rpc.trust(), now)
                .is_ok(),
            issuer: cert.issuer,
            expires_at: cert.expires_at,
        });
        NodeStatus {
            peer_id: self.peer_id().clone(),
            state: info.state,
            endpoint: info.endpoint,
            relay_in_use: info.relay_in_use,
            retry_count: info.retry_count,
            reconnects: info.reconnects,
            known_peers: self.discovery.peers().len(),
            announcing: self.discovery.is_announcing(),
            certificate,
        }
    }
}

impl std::fmt::Debug for AgentNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentNode")
            .field("peer_id", self.peer_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
