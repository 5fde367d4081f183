//! # Client Configuration & Constants
//!
//! Every tunable of the client core lives here: protocol constants, default
//! timeouts, and the [`ClientConfig`] that the credential/config provider
//! hands to an [`AgentNode`](crate::node::AgentNode).
//!
//! Configuration is resolved in layers, last one wins:
//!
//! 1. Built-in defaults ([`ClientConfig::default`]).
//! 2. The first TOML file found: explicit path, `./agentmesh.toml`,
//!    `<home>/.agentmesh/config.toml` (home from the `dirs` crate).
//! 3. Environment overrides (`AGENTMESH_BROKER_URL`, `AGENTMESH_SECRET_TOKEN`,
//!    `AGENTMESH_RELAYS`, `AGENTMESH_IDENTITY_DIR`).

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MeshError, MeshResult};
use crate::identity::{PeerId, PublicKey};
use crate::network::Endpoint;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Client protocol version, sent in every handshake.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Envelope wire format version. Bumped on incompatible schema changes.
pub const WIRE_VERSION: u16 = 1;

// ---------------------------------------------------------------------------
// Broker & Subjects
// ---------------------------------------------------------------------------

/// Public demo broker used when nothing else is configured.
pub const DEFAULT_BROKER_URL: &str = "nats://demo.nats.io:4222";

/// Default NATS port when a URL omits it.
pub const DEFAULT_NATS_PORT: u16 = 4222;

/// Root token of every subject this client publishes or subscribes to.
pub const DEFAULT_SUBJECT_PREFIX: &str = "mesh";

/// Largest payload accepted for a single publish. Matches the NATS server
/// default `max_payload`.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Time allowed for a single transport connect + handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for `call()`.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Keep-alive ping interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Consecutive missed heartbeats before the session reconnects.
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;

/// Connect retries after the first attempt before the session closes.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// First backoff step.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Backoff ceiling.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Presence re-announcement interval.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// A peer not heard from for this long is dropped from the local view.
/// Three missed announcements at the default interval.
pub const DEFAULT_PEER_EXPIRY: Duration = Duration::from_secs(90);

/// Default collection window for `discover()`.
pub const DEFAULT_DISCOVERY_WINDOW: Duration = Duration::from_secs(3);

/// Envelope time-to-live in seconds. Receivers drop requests older than this.
pub const DEFAULT_ENVELOPE_TTL_SECS: u64 = 60;

/// Certificates are renewed when they are this close to expiry.
pub const DEFAULT_CERT_RENEWAL_MARGIN: Duration = Duration::from_secs(300);

/// Clock skew tolerated on handshake and certificate timestamps.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

pub const ENV_BROKER_URL: &str = "AGENTMESH_BROKER_URL";
pub const ENV_SECRET_TOKEN: &str = "AGENTMESH_SECRET_TOKEN";
pub const ENV_RELAYS: &str = "AGENTMESH_RELAYS";
pub const ENV_IDENTITY_DIR: &str = "AGENTMESH_IDENTITY_DIR";

/// Project-local config file name.
pub const LOCAL_CONFIG_FILE: &str = "agentmesh.toml";

/// Per-user state directory under the home directory.
pub const HOME_DIR_NAME: &str = ".agentmesh";

/// Returns `<home>/.agentmesh`. Fails when the platform reports no home
/// directory; identity keys must never land in an arbitrary working dir.
pub fn default_home() -> MeshResult<PathBuf> {
    home_under(dirs::home_dir())
}

fn home_under(home: Option<PathBuf>) -> MeshResult<PathBuf> {
    home.map(|h| h.join(HOME_DIR_NAME)).ok_or_else(|| {
        MeshError::Configuration(format!(
            "cannot determine the home directory; set identity_dir or {ENV_IDENTITY_DIR}"
        ))
    })
}

// ---------------------------------------------------------------------------
// Trusted authorities
// ---------------------------------------------------------------------------

/// A certificate authority the client accepts certificates from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedAuthority {
    /// The authority's peer ID.
    pub peer_id: String,
    /// Hex-encoded Ed25519 public key of the authority.
    pub public_key: String,
}

impl TrustedAuthority {
    /// Parses and cross-checks the entry.
    pub fn parse(&self) -> MeshResult<(PeerId, PublicKey)> {
        let peer_id = PeerId::parse(&self.peer_id)?;
        let key = PublicKey::from_hex(&self.public_key)?;
        if !peer_id.matches_key(&key) {
            return Err(MeshError::Configuration(format!(
                "trusted authority {} does not match its public key",
                self.peer_id
            )));
        }
        Ok((peer_id, key))
    }
}

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Everything a session needs from the credential/config provider.
///
/// Durations are stored as milliseconds so the TOML stays readable; use the
/// accessor methods to get [`Duration`]s.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker URL, e.g. `nats://broker.example.com:4222`.
    pub broker_url: String,
    /// Secret token presented to the broker.
    pub secret_token: Option<String>,
    /// Relay endpoints tried when the direct broker connection fails.
    pub relay_urls: Vec<String>,
    /// Human-readable name included in handshakes and announcements.
    pub display_name: Option<String>,
    /// Relay endpoint this node advertises to others (requires the `relay`
    /// capability in its announcements to be picked up).
    pub relay_hint: Option<String>,
    /// Directory holding `identity.json` and `identity.key`. Unset means
    /// `<home>/.agentmesh/identity`; see [`identity_path`](Self::identity_path).
    pub identity_dir: Option<PathBuf>,
    /// Subject namespace.
    pub subject_prefix: String,
    pub connect_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_missed_heartbeats: u32,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub announce_interval_ms: u64,
    pub peer_expiry_ms: u64,
    pub discovery_window_ms: u64,
    pub envelope_ttl_secs: u64,
    pub cert_renewal_margin_ms: u64,
    /// Reject inbound requests that carry no valid certificate.
    pub require_certificate: bool,
    /// Answer inbound requests. One-shot client sessions turn this off so
    /// they never race a long-running server sharing the same identity.
    pub serve_requests: bool,
    /// Authorities whose certificates are accepted.
    pub trusted_authorities: Vec<TrustedAuthority>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            secret_token: None,
            relay_urls: Vec::new(),
            display_name: None,
            relay_hint: None,
            identity_dir: None,
            subject_prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT.as_millis() as u64,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE.as_millis() as u64,
            backoff_max_ms: DEFAULT_BACKOFF_MAX.as_millis() as u64,
            announce_interval_ms: DEFAULT_ANNOUNCE_INTERVAL.as_millis() as u64,
            peer_expiry_ms: DEFAULT_PEER_EXPIRY.as_millis() as u64,
            discovery_window_ms: DEFAULT_DISCOVERY_WINDOW.as_millis() as u64,
            envelope_ttl_secs: DEFAULT_ENVELOPE_TTL_SECS,
            cert_renewal_margin_ms: DEFAULT_CERT_RENEWAL_MARGIN.as_millis() as u64,
            require_certificate: false,
            serve_requests: true,
            trusted_authorities: Vec::new(),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The token is a credential; show only whether one is set.
        f.debug_struct("ClientConfig")
            .field("broker_url", &self.broker_url)
            .field(
                "secret_token",
                &self.secret_token.as_ref().map(|_| "<redacted>"),
            )
            .field("relay_urls", &self.relay_urls)
            .field("display_name", &self.display_name)
            .field("relay_hint", &self.relay_hint)
            .field("identity_dir", &self.identity_dir)
            .field("subject_prefix", &self.subject_prefix)
            .field("serve_requests", &self.serve_requests)
            .field("max_retries", &self.max_retries)
            .field("trusted_authorities", &self.trusted_authorities.len())
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    /// Loads configuration from the first file found in the search path,
    /// then applies environment overrides and validates the result.
    pub fn load(explicit: Option<&Path>) -> MeshResult<Self> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(MeshError::Configuration(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            candidates.push(path.to_path_buf());
        }
        candidates.push(PathBuf::from(LOCAL_CONFIG_FILE));
        match default_home() {
            Ok(home) => candidates.push(home.join("config.toml")),
            Err(e) => debug!(error = %e, "skipping per-user config file"),
        }

        let mut config = match candidates.iter().find(|p| p.exists()) {
            Some(path) => {
                debug!(path = %path.display(), "loading client config");
                Self::from_file(path)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML config file. Does not apply env overrides.
    pub fn from_file(path: &Path) -> MeshResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
            .map_err(|e| MeshError::Configuration(format!("{}: {}", path.display(), e)))
    }

    /// Parses TOML text.
    pub fn from_toml(text: &str) -> MeshResult<Self> {
        toml::from_str(text).map_err(|e| MeshError::Configuration(e.to_string()))
    }

    /// Applies environment overrides through `lookup` (injectable for tests).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BROKER_URL).filter(|s| !s.is_empty()) {
            self.broker_url = url;
        }
        if let Some(token) = lookup(ENV_SECRET_TOKEN).filter(|s| !s.is_empty()) {
            self.secret_token = Some(token);
        }
        if let Some(relays) = lookup(ENV_RELAYS) {
            self.relay_urls = relays
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(dir) = lookup(ENV_IDENTITY_DIR).filter(|s| !s.is_empty()) {
            self.identity_dir = Some(PathBuf::from(dir));
        }
    }

    /// Rejects configurations the session cannot run with.
    pub fn validate(&self) -> MeshResult<()> {
        if self.broker_url.trim().is_empty() {
            return Err(MeshError::Configuration("broker_url is empty".into()));
        }
        Endpoint::parse(&self.broker_url)?;
        for relay in self.relay_urls.iter().chain(self.relay_hint.iter()) {
            Endpoint::parse(relay)?;
        }
        if self.subject_prefix.is_empty()
            || !crate::network::subjects::is_valid_token(&self.subject_prefix)
        {
            return Err(MeshError::Configuration(format!(
                "invalid subject_prefix {:?}",
                self.subject_prefix
            )));
        }
        let timeouts = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("call_timeout_ms", self.call_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("backoff_base_ms", self.backoff_base_ms),
            ("announce_interval_ms", self.announce_interval_ms),
            ("peer_expiry_ms", self.peer_expiry_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(MeshError::Configuration(format!("{name} must be > 0")));
            }
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(MeshError::Configuration(
                "backoff_max_ms must be >= backoff_base_ms".into(),
            ));
        }
        if self.max_missed_heartbeats == 0 {
            return Err(MeshError::Configuration(
                "max_missed_heartbeats must be > 0".into(),
            ));
        }
        for authority in &self.trusted_authorities {
            authority.parse()?;
        }
        Ok(())
    }

    /// Where the identity lives: `identity_dir` if set, else
    /// `<home>/.agentmesh/identity`.
    pub fn identity_path(&self) -> MeshResult<PathBuf> {
        match &self.identity_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(default_home()?.join("identity")),
        }
    }

    /// The broker endpoint, parsed.
    pub fn broker_endpoint(&self) -> MeshResult<Endpoint> {
        Endpoint::parse(&self.broker_url)
    }

    /// The relay endpoints, parsed, in configured order.
    pub fn relay_endpoints(&self) -> MeshResult<Vec<Endpoint>> {
        self.relay_urls.iter().map(|u| Endpoint::parse(u)).collect()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn peer_expiry(&self) -> Duration {
        Duration::from_millis(self.peer_expiry_ms)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }

    pub fn cert_renewal_margin(&self) -> Duration {
        Duration::from_millis(self.cert_renewal_margin_ms)
    }
}
