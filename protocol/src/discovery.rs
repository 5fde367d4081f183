//! # Discovery Service
//!
//! Presence on the mesh. Every node that wants to be found publishes a
//! signed announcement to `<prefix>.presence` on a fixed interval; anyone
//! looking for peers asks on `<prefix>.directory` and listens to presence
//! for a short window.
//!
//! ## Announcements
//!
//! ```text
//! { peer_id, public_key, display_name?, capabilities, relay_hint?,
//!   timestamp, signature }
//! ```
//!
//! The signature covers every other field. Receivers check that the public
//! key derives to `peer_id` before trusting anything else in it, so a peer
//! cannot announce on behalf of another.
//!
//! ## Local view
//!
//! [`DiscoveryService::start`] keeps a cache of every valid announcement
//! seen. Records not refreshed within `peer_expiry` disappear from
//! [`DiscoveryService::peers`]. Announcements from peers that carry a truthy
//! `relay` capability and a relay hint feed the [`RelayDirectory`] used for
//! connection fallback.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::{ClientConfig, MAX_CLOCK_SKEW};
use crate::error::{MeshError, MeshResult};
use crate::identity::{canonical_bytes, Identity, PeerId, PublicKey, Signature};
use crate::network::{
    subjects, BrokerMessage, ConnectionManager, Endpoint, RelayDirectory, SessionState,
    Subscription, SubscriptionTask,
};

/// Capability map advertised in announcements.
pub type Capabilities = BTreeMap<String, Value>;

/// Capability that marks a peer as a relay operator.
pub const RELAY_CAPABILITY: &str = "relay";

/// Minimum gap between re-announcements triggered by the same querier.
const QUERY_COOLDOWN: Duration = Duration::from_millis(250);

/// Queriers remembered for the cooldown before stale entries are pruned.
const MAX_TRACKED_QUERIERS: usize = 1024;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnnouncementError {
    #[error("announcement peer id does not match its public key")]
    PeerIdMismatch,

    #[error("announcement signature does not verify")]
    BadSignature,

    #[error("announcement timestamp outside the accepted window")]
    Stale,

    #[error("announcement encoding failed: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub peer_id: PeerId,
    pub public_key: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_hint: Option<String>,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub signature: Signature,
}

#[derive(Serialize)]
struct SignedAnnouncement<'a> {
    peer_id: &'a PeerId,
    public_key: &'a PublicKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<&'a str>,
    capabilities: &'a Capabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    relay_hint: Option<&'a str>,
    timestamp: i64,
}

impl Announcement {
    pub fn new(
        identity: &Identity,
        display_name: Option<String>,
        capabilities: Capabilities,
        relay_hint: Option<String>,
    ) -> MeshResult<Self> {
        let peer_id = identity.peer_id().clone();
        let public_key = identity.public_key();
        let timestamp = Utc::now().timestamp_millis();
        let signature = identity.sign_canonical(&SignedAnnouncement {
            peer_id: &peer_id,
            public_key: &public_key,
            display_name: display_name.as_deref(),
            capabilities: &capabilities,
            relay_hint: relay_hint.as_deref(),
            timestamp,
        })?;
        Ok(Self {
            peer_id,
            public_key,
            display_name,
            capabilities,
            relay_hint,
            timestamp,
            signature,
        })
    }

    /// Checks the key binding and signature, and that the timestamp is
    /// neither older than `max_age` nor from the future beyond clock skew.
    pub fn verify(&self, now_ms: i64, max_age: Duration) -> Result<(), AnnouncementError> {
        if !self.peer_id.matches_key(&self.public_key) {
            return Err(AnnouncementError::PeerIdMismatch);
        }
        let bytes = canonical_bytes(&SignedAnnouncement {
            peer_id: &self.peer_id,
            public_key: &self.public_key,
            display_name: self.display_name.as_deref(),
            capabilities: &self.capabilities,
            relay_hint: self.relay_hint.as_deref(),
            timestamp: self.timestamp,
        })
        .map_err(|e| AnnouncementError::Encoding(e.to_string()))?;
        if !self.public_key.verify(&bytes, &self.signature) {
            return Err(AnnouncementError::BadSignature);
        }
        let max_age = max_age.as_millis() as i64;
        let skew = MAX_CLOCK_SKEW.as_millis() as i64;
        if self.timestamp < now_ms.saturating_sub(max_age)
            || self.timestamp > now_ms.saturating_add(skew)
        {
            return Err(AnnouncementError::Stale);
        }
        Ok(())
    }

    /// Whether capability `name` is present with a value other than
    /// `false` or `null`.
    pub fn has_capability(&self, name: &str) -> bool {
        has_capability(&self.capabilities, name)
    }
}

fn has_capability(capabilities: &Capabilities, name: &str) -> bool {
    !matches!(capabilities.get(name), None | Some(Value::Null) | Some(Value::Bool(false)))
}

/// Published on the directory subject to ask peers to announce now.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DirectoryQuery {
    from: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    capability: Option<String>,
}

// ---------------------------------------------------------------------------
// Records & filters
// ---------------------------------------------------------------------------

/// What this node knows about another peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub public_key: PublicKey,
    pub display_name: Option<String>,
    pub capabilities: Capabilities,
    pub relay_hint: Option<String>,
    /// When the latest announcement arrived, local clock.
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    fn from_announcement(a: Announcement, seen: DateTime<Utc>) -> Self {
        Self {
            peer_id: a.peer_id,
            public_key: a.public_key,
            display_name: a.display_name,
            capabilities: a.capabilities,
            relay_hint: a.relay_hint,
            last_seen: seen,
        }
    }

    pub fn has_capability(&self, name: &str) -> bool {
        has_capability(&self.capabilities, name)
    }
}

/// Narrows `discover` results. An empty filter matches every peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerFilter {
    pub capability: Option<String>,
    /// Case-insensitive substring of the display name or peer ID.
    pub name: Option<String>,
}

impl PeerFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn capability(name: impl Into<String>) -> Self {
        Self {
            capability: Some(name.into()),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn matches(&self, record: &PeerRecord) -> bool {
        if let Some(cap) = &self.capability {
            if !record.has_capability(cap) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            let needle = name.to_lowercase();
            let in_name = record
                .display_name
                .as_deref()
                .is_some_and(|n| n.to_lowercase().contains(&needle));
            if !in_name && !record.peer_id.as_str().to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub display_name: Option<String>,
    pub relay_hint: Option<String>,
    pub peer_expiry: Duration,
}

impl DiscoverySettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            display_name: config.display_name.clone(),
            relay_hint: config.relay_hint.clone(),
            peer_expiry: config.peer_expiry(),
        }
    }
}

struct DiscoveryInner {
    conn: ConnectionManager,
    settings: DiscoverySettings,
    relays: Option<Arc<RelayDirectory>>,
    peers: DashMap<PeerId, PeerRecord>,
    cache_task: Mutex<Option<SubscriptionTask>>,
    announcer: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DiscoveryInner {
    fn drop(&mut self) {
        if let Some(task) = self.announcer.get_mut().take() {
            task.abort();
        }
    }
}

/// Announces this node and finds others. Cheap to clone.
#[derive(Clone)]
pub struct DiscoveryService {
    inner: Arc<DiscoveryInner>,
}

impl DiscoveryService {
    pub fn new(
        conn: ConnectionManager,
        settings: DiscoverySettings,
        relays: Option<Arc<RelayDirectory>>,
    ) -> Self {
        Self {
            inner: Arc::new(DiscoveryInner {
                conn,
                settings,
                relays,
                peers: DashMap::new(),
                cache_task: Mutex::new(None),
                announcer: Mutex::new(None),
            }),
        }
    }

    /// Starts the background cache of announcements. Idempotent.
    pub async fn start(&self) -> MeshResult<()> {
        if let Some(task) = self.inner.cache_task.lock().as_ref() {
            if !task.is_finished() {
                return Ok(());
            }
        }
        let subject = subjects::presence(&self.inner.conn.prefix());
        let weak = Arc::downgrade(&self.inner);
        let task = self
            .inner
            .conn
            .subscribe_with(&subject, move |msg| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        let _ = inner.observe(&msg);
                    }
                }
            })
            .await?;
        *self.inner.cache_task.lock() = Some(task);
        debug!(%subject, "discovery cache running");
        Ok(())
    }

    /// Stops the cache and any announcer.
    pub fn stop(&self) {
        self.inner.cache_task.lock().take();
        self.stop_announcing();
    }

    /// Publishes a presence announcement now and then every `interval`
    /// until the session closes. Replaces any earlier announcer.
    pub async fn announce(&self, capabilities: Capabilities, interval: Duration) -> MeshResult<()> {
        if interval.is_zero() {
            return Err(MeshError::Configuration("announce interval must be > 0".into()));
        }
        let conn = &self.inner.conn;
        if !conn.state().is_connected() {
            return Err(MeshError::NotConnected);
        }
        let presence = subjects::presence(&conn.prefix());
        let announcer = Announcer {
            conn: conn.clone(),
            presence,
            display_name: self.inner.settings.display_name.clone(),
            relay_hint: self.inner.settings.relay_hint.clone(),
            capabilities,
        };
        announcer.publish().await?;
        let queries = conn.subscribe(&subjects::directory(&conn.prefix())).await?;

        let task = tokio::spawn(announcer.run(interval, queries));
        if let Some(old) = self.inner.announcer.lock().replace(task) {
            old.abort();
            debug!("previous announcer replaced");
        }
        info!(interval_ms = interval.as_millis() as u64, "announcing presence");
        Ok(())
    }

    pub fn stop_announcing(&self) {
        if let Some(task) = self.inner.announcer.lock().take() {
            task.abort();
        }
    }

    pub fn is_announcing(&self) -> bool {
        self.inner
            .announcer
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Asks the mesh who is there and collects answers for `window`.
    /// Results exclude this node and are ordered most recently seen first.
    pub async fn discover(&self, filter: &PeerFilter, window: Duration) -> MeshResult<Vec<PeerRecord>> {
        let inner = &self.inner;
        let conn = &inner.conn;
        if !conn.state().is_connected() {
            return Err(MeshError::NotConnected);
        }
        let mut presence = conn.subscribe(&subjects::presence(&conn.prefix())).await?;
        let query = DirectoryQuery {
            from: conn.peer_id().clone(),
            capability: filter.capability.clone(),
        };
        conn.publish(&subjects::directory(&conn.prefix()), serde_json::to_vec(&query)?)
            .await?;

        let mut found: HashMap<PeerId, PeerRecord> = HashMap::new();
        let deadline = Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, presence.next()).await {
                Ok(Some(msg)) => {
                    if let Some(record) = inner.observe(&msg) {
                        found.insert(record.peer_id.clone(), record);
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        drop(presence);

        for record in self.peers() {
            found.entry(record.peer_id.clone()).or_insert(record);
        }
        let me = conn.peer_id();
        let mut out: Vec<PeerRecord> = found
            .into_values()
            .filter(|r| &r.peer_id != me && filter.matches(r))
            .collect();
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        debug!(found = out.len(), ?filter, "discovery finished");
        Ok(out)
    }

    /// Every unexpired cached record, most recently seen first.
    pub fn peers(&self) -> Vec<PeerRecord> {
        let inner = &self.inner;
        let expiry = chrono::Duration::from_std(inner.settings.peer_expiry)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(expiry);
        if let Some(cutoff) = cutoff {
            inner.peers.retain(|_, r| r.last_seen >= cutoff);
        }
        let mut out: Vec<PeerRecord> = inner.peers.iter().map(|r| r.value().clone()).collect();
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        out
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.peers().into_iter().find(|r| &r.peer_id == peer_id)
    }
}

impl DiscoveryInner {
    /// Validates an announcement and folds it into the cache. Returns the
    /// record for any valid announcement from another peer.
    fn observe(&self, msg: &BrokerMessage) -> Option<PeerRecord> {
        let announcement: Announcement = match serde_json::from_slice(&msg.payload) {
            Ok(a) => a,
            Err(e) => {
                debug!(error = %e, "ignoring non-announcement on presence subject");
                return None;
            }
        };
        let now = Utc::now();
        if let Err(e) = announcement.verify(now.timestamp_millis(), self.settings.peer_expiry) {
            warn!(peer = %announcement.peer_id.short(), error = %e, "dropping invalid announcement");
            return None;
        }
        if &announcement.peer_id == self.conn.peer_id() {
            return None;
        }

        if announcement.has_capability(RELAY_CAPABILITY) {
            if let (Some(relays), Some(hint)) = (&self.relays, &announcement.relay_hint) {
                match Endpoint::parse(hint) {
                    Ok(endpoint) => relays.learn(endpoint),
                    Err(e) => debug!(hint = %hint, error = %e, "unusable relay hint"),
                }
            }
        }

        let record = PeerRecord::from_announcement(announcement, now);
        trace!(peer = %record.peer_id.short(), "announcement recorded");
        self.peers.insert(record.peer_id.clone(), record.clone());
        Some(record)
    }
}

// ---------------------------------------------------------------------------
// Announcer task
// ---------------------------------------------------------------------------

/// Per-querier cooldown for answering directory queries. One chatty peer
/// cannot starve the answers another peer is waiting for.
#[derive(Debug, Default)]
struct QueryThrottle {
    last: HashMap<PeerId, Instant>,
}

impl QueryThrottle {
    fn admit(&mut self, from: &PeerId, now: Instant) -> bool {
        if let Some(at) = self.last.get(from) {
            if now.saturating_duration_since(*at) < QUERY_COOLDOWN {
                return false;
            }
        }
        if self.last.len() >= MAX_TRACKED_QUERIERS {
            self.last
                .retain(|_, at| now.saturating_duration_since(*at) < QUERY_COOLDOWN);
        }
        self.last.insert(from.clone(), now);
        true
    }
}

struct Announcer {
    conn: ConnectionManager,
    presence: String,
    display_name: Option<String>,
    relay_hint: Option<String>,
    capabilities: Capabilities,
}

impl Announcer {
    async fn publish(&self) -> MeshResult<()> {
        let announcement = Announcement::new(
            self.conn.identity(),
            self.display_name.clone(),
            self.capabilities.clone(),
            self.relay_hint.clone(),
        )?;
        let bytes = serde_json::to_vec(&announcement)?;
        self.conn.publish(&self.presence, bytes).await
    }

    async fn publish_logged(&self) {
        if let Err(e) = self.publish().await {
            debug!(error = %e, "announcement not sent");
        }
    }

    fn answers(&self, query: &DirectoryQuery) -> bool {
        &query.from != self.conn.peer_id()
            && query
                .capability
                .as_deref()
                .map_or(true, |c| has_capability(&self.capabilities, c))
    }

    async fn run(self, interval: Duration, mut queries: Subscription) {
        let mut state = self.conn.watch_state();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut throttle = QueryThrottle::default();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.conn.state().is_connected() {
                        self.publish_logged().await;
                    }
                }
                msg = queries.next() => {
                    let Some(msg) = msg else { return };
                    let Ok(query) = serde_json::from_slice::<DirectoryQuery>(&msg.payload) else {
                        continue;
                    };
                    if self.answers(&query)
                        && self.conn.state().is_connected()
                        && throttle.admit(&query.from, Instant::now())
                    {
                        trace!(from = %query.from.short(), "answering directory query");
                        self.publish_logged().await;
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let now = *state.borrow_and_update();
                    match now {
                        SessionState::Closed => {
                            debug!("announcer stopped: session closed");
                            return;
                        }
                        SessionState::Connected => {
                            // Back after a reconnect: announce at once.
                            self.publish_logged().await;
                            ticker.reset();
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn caps(v: Value) -> Capabilities {
        v.as_object()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    fn record(name: Option<&str>, c: Value) -> PeerRecord {
        let id = Identity::ephemeral();
        PeerRecord {
            peer_id: id.peer_id().clone(),
            public_key: id.public_key(),
            display_name: name.map(String::from),
            capabilities: caps(c),
            relay_hint: None,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn announcement_signs_and_verifies() {
        let id = Identity::ephemeral();
        let a = Announcement::new(&id, Some("alpha".into()), caps(json!({"ping": true})), None).unwrap();
        let now = Utc::now().timestamp_millis();
        a.verify(now, Duration::from_secs(90)).unwrap();

        let mut forged = a.clone();
        forged.capabilities.insert("admin".into(), json!(true));
        assert_eq!(
            forged.verify(now, Duration::from_secs(90)),
            Err(AnnouncementError::BadSignature)
        );

        let mut spoofed = a.clone();
        spoofed.peer_id = Identity::ephemeral().peer_id().clone();
        assert_eq!(
            spoofed.verify(now, Duration::from_secs(90)),
            Err(AnnouncementError::PeerIdMismatch)
        );

        assert_eq!(
            a.verify(now + 200_000, Duration::from_secs(90)),
            Err(AnnouncementError::Stale)
        );
    }

    #[test]
    fn capability_truthiness() {
        let r = record(None, json!({"ping": true, "gpu": false, "storage": null, "tier": 0}));
        assert!(r.has_capability("ping"));
        assert!(!r.has_capability("gpu"));
        assert!(!r.has_capability("storage"));
        assert!(r.has_capability("tier"));
        assert!(!r.has_capability("missing"));
    }

    #[test]
    fn filter_by_capability_and_name() {
        let alpha = record(Some("Alpha Worker"), json!({"ping": true}));
        let beta = record(Some("beta"), json!({"translate": {"langs": ["en"]}}));

        assert!(PeerFilter::any().matches(&alpha));
        assert!(PeerFilter::capability("ping").matches(&alpha));
        assert!(!PeerFilter::capability("ping").matches(&beta));
        assert!(PeerFilter::any().with_name("WORKER").matches(&alpha));
        assert!(!PeerFilter::any().with_name("worker").matches(&beta));
        assert!(PeerFilter::capability("translate").with_name("bet").matches(&beta));

        let by_id = &beta.peer_id.as_str()[6..14];
        assert!(PeerFilter::any().with_name(by_id.to_uppercase()).matches(&beta));
    }

    #[test]
    fn announcement_wire_shape() {
        let id = Identity::ephemeral();
        let a = Announcement::new(&id, None, caps(json!({"ping": true})), Some("nats://relay:4222".into()))
            .unwrap();
        let v = serde_json::to_value(&a).unwrap();
        assert!(v.get("display_name").is_none());
        assert_eq!(v["relay_hint"], json!("nats://relay:4222"));
        assert_eq!(v["capabilities"], json!({"ping": true}));
        let back: Announcement = serde_json::from_value(v).unwrap();
        back.verify(Utc::now().timestamp_millis(), Duration::from_secs(90)).unwrap();
    }

    #[test]
    fn query_cooldown_is_per_querier() {
        let (chatty, quiet) = (Identity::ephemeral(), Identity::ephemeral());
        let mut throttle = QueryThrottle::default();
        let t0 = Instant::now();
        let ms = Duration::from_millis;

        assert!(throttle.admit(chatty.peer_id(), t0));
        assert!(!throttle.admit(chatty.peer_id(), t0 + ms(100)));
        // Another peer asking inside the chatty one's cooldown still gets an answer.
        assert!(throttle.admit(quiet.peer_id(), t0 + ms(100)));
        assert!(!throttle.admit(quiet.peer_id(), t0 + ms(200)));
        assert!(throttle.admit(chatty.peer_id(), t0 + QUERY_COOLDOWN));
    }

    #[test]
    fn query_throttle_prunes_stale_queriers() {
        let mut throttle = QueryThrottle::default();
        let t0 = Instant::now();
        for _ in 0..MAX_TRACKED_QUERIERS {
            assert!(throttle.admit(Identity::ephemeral().peer_id(), t0));
        }
        let later = t0 + QUERY_COOLDOWN * 2;
        assert!(throttle.admit(Identity::ephemeral().peer_id(), later));
        assert_eq!(throttle.last.len(), 1);
    }
}
