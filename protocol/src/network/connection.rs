//! # Connection Manager
//!
//! Owns the single broker session of a node:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected ◀──┐
//!       │                       │                 │        │ ok
//!       │                       │ exhausted       ▼ lost   │
//!       │                       ▼           Reconnecting ──┘
//!       └──────disconnect────▶ Closed ◀──── exhausted / disconnect
//! ```
//!
//! Connect algorithm, per attempt:
//!
//! 1. Build a fresh signed [`Handshake`] and dial the broker endpoint.
//! 2. If that fails, ask the [`RelaySelector`] for relays and dial them in
//!    order. The first one that accepts wins and `relay_in_use` is set.
//! 3. A rejected handshake aborts immediately with
//!    [`MeshError::Authentication`]. Any other failure sleeps with
//!    [`Backoff`] and tries again, up to `max_retries` retries.
//!
//! Once connected, a dispatcher task fans inbound messages out to local
//! subscriptions and a heartbeat task pings the broker. Either one noticing
//! a dead link moves the session to `Reconnecting`; the reconnect re-runs
//! the algorithm above and re-subscribes every live subject on the new link,
//! so callers keep their [`Subscription`] handles across broker restarts.
//!
//! Connect, reconnect and disconnect are serialised by an async mutex. Session
//! state is published on a `watch` channel; `Closed` is terminal.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::handshake::Handshake;
use super::relay::RelaySelector;
use super::subjects;
use super::transport::{BrokerMessage, Connector, Endpoint, Link, Transport, TransportError};
use crate::config::{ClientConfig, DEFAULT_SUBJECT_PREFIX, MAX_PAYLOAD_BYTES};
use crate::error::{MeshError, MeshResult};
use crate::identity::{Identity, PeerId};

/// Per-subscription buffer between the dispatcher and the consumer.
pub const SUBSCRIPTION_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the session for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub state: SessionState,
    pub endpoint: Option<String>,
    pub relay_in_use: bool,
    pub retry_count: u32,
    pub reconnects: u64,
    pub subscriptions: usize,
}

/// The parts of [`ClientConfig`] the session runs with.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub broker: Endpoint,
    pub token: Option<String>,
    pub display_name: Option<String>,
    pub subject_prefix: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl ConnectionSettings {
    pub fn from_config(config: &ClientConfig) -> MeshResult<Self> {
        config.validate()?;
        Ok(Self {
            broker: config.broker_endpoint()?,
            token: config.secret_token.clone(),
            display_name: config.display_name.clone(),
            subject_prefix: config.subject_prefix.clone(),
            connect_timeout: config.connect_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            max_missed_heartbeats: config.max_missed_heartbeats,
            max_retries: config.max_retries,
            backoff: Backoff::new(config.backoff_base(), config.backoff_max()),
        })
    }
}

#[derive(Default)]
struct Session {
    transport: Option<Arc<dyn Transport>>,
    endpoint: Option<Endpoint>,
    relay_in_use: bool,
    retry_count: u32,
    reconnects: u64,
    /// Bumped for every installed link so stale tasks can tell they are stale.
    generation: u64,
    tasks: Vec<JoinHandle<()>>,
}

struct SubscriptionSlot {
    subject: String,
    tx: mpsc::Sender<BrokerMessage>,
}

/// A link that passed the handshake but is not yet installed.
struct Established {
    link: Link,
    endpoint: Endpoint,
    relay: bool,
}

enum AttemptError {
    Rejected(String),
    Failed(String),
}

// ---------------------------------------------------------------------------
// Inner
// ---------------------------------------------------------------------------

struct Inner {
    identity: Arc<Identity>,
    connector: Arc<dyn Connector>,
    relays: Arc<dyn RelaySelector>,
    state_tx: watch::Sender<SessionState>,
    session: Mutex<Session>,
    settings: RwLock<Option<Arc<ConnectionSettings>>>,
    subscriptions: DashMap<u64, SubscriptionSlot>,
    /// Broker-level subscriptions, reference counted by local subscribers.
    subject_refs: Mutex<HashMap<String, usize>>,
    next_sub_id: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
}

impl Inner {
    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Moves to `to` unless the session is closed. Returns false when closed.
    fn transition(&self, to: SessionState) -> bool {
        let mut allowed = false;
        self.state_tx.send_if_modified(|state| {
            if *state == SessionState::Closed {
                return false;
            }
            allowed = true;
            if *state == to {
                return false;
            }
            *state = to;
            true
        });
        allowed
    }

    /// Moves `from → to` only if currently in `from`.
    fn transition_from(&self, from: SessionState, to: SessionState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn mark_closed(&self) {
        self.state_tx.send_if_modified(|state| {
            if *state == SessionState::Closed {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
    }

    fn prefix(&self) -> String {
        self.settings
            .read()
            .as_ref()
            .map(|s| s.subject_prefix.clone())
            .unwrap_or_else(|| DEFAULT_SUBJECT_PREFIX.to_string())
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.session.lock().transport.clone()
    }

    fn live_subjects(&self) -> Vec<String> {
        self.subject_refs.lock().keys().cloned().collect()
    }

    // -- connect algorithm --------------------------------------------------

    async fn dial(
        &self,
        settings: &ConnectionSettings,
        endpoint: &Endpoint,
    ) -> Result<Link, TransportError> {
        let hello = Handshake::new(
            &self.identity,
            settings.token.clone(),
            settings.display_name.clone(),
        )
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let link = tokio::time::timeout(
            settings.connect_timeout,
            self.connector.connect(endpoint, &hello),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        // Announce the signed handshake, credential stripped.
        match serde_json::to_vec(&hello.public_copy()) {
            Ok(body) => {
                let subject = subjects::handshake(&settings.subject_prefix);
                if let Err(e) = link.transport.publish(&subject, Bytes::from(body)).await {
                    debug!(error = %e, "could not publish handshake");
                }
            }
            Err(e) => debug!(error = %e, "could not encode handshake"),
        }
        Ok(link)
    }

    async fn attempt(&self, settings: &ConnectionSettings) -> Result<Established, AttemptError> {
        let direct_err = match self.dial(settings, &settings.broker).await {
            Ok(link) => {
                return Ok(Established {
                    link,
                    endpoint: settings.broker.clone(),
                    relay: false,
                })
            }
            Err(TransportError::Rejected(reason)) => return Err(AttemptError::Rejected(reason)),
            Err(e) => e,
        };
        debug!(endpoint = %settings.broker, error = %direct_err, "direct connect failed");

        let mut reasons = vec![format!("{}: {direct_err}", settings.broker)];
        for relay in self.relays.candidates(&settings.broker) {
            match self.dial(settings, &relay).await {
                Ok(link) => {
                    info!(relay = %relay, "connected through relay");
                    return Ok(Established {
                        link,
                        endpoint: relay,
                        relay: true,
                    });
                }
                Err(TransportError::Rejected(reason)) => {
                    return Err(AttemptError::Rejected(format!("relay {relay}: {reason}")))
                }
                Err(e) => {
                    debug!(relay = %relay, error = %e, "relay connect failed");
                    reasons.push(format!("{relay}: {e}"));
                }
            }
        }
        Err(AttemptError::Failed(reasons.join("; ")))
    }

    /// Runs attempts with backoff until one succeeds, the handshake is
    /// rejected, retries run out, or the session is closed underneath us.
    async fn establish(&self, settings: &ConnectionSettings) -> MeshResult<Established> {
        let attempts = settings.max_retries.saturating_add(1);
        let mut state_rx = self.state_tx.subscribe();
        let mut last_reason = String::from("no attempt made");

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = settings.backoff.delay(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = state_rx.wait_for(|s| *s == SessionState::Closed) => {
                        return Err(MeshError::NotConnected);
                    }
                }
            }
            if self.state() == SessionState::Closed {
                return Err(MeshError::NotConnected);
            }
            self.session.lock().retry_count = attempt;

            let outcome = tokio::select! {
                outcome = self.attempt(settings) => outcome,
                _ = state_rx.wait_for(|s| *s == SessionState::Closed) => {
                    return Err(MeshError::NotConnected);
                }
            };
            match outcome {
                Ok(established) => return Ok(established),
                Err(AttemptError::Rejected(reason)) => {
                    warn!(%reason, "broker rejected handshake");
                    return Err(MeshError::Authentication(reason));
                }
                Err(AttemptError::Failed(reason)) => {
                    warn!(attempt = attempt + 1, of = attempts, %reason, "connect attempt failed");
                    last_reason = reason;
                }
            }
        }

        Err(MeshError::Connection {
            endpoint: settings.broker.to_string(),
            attempts,
            reason: last_reason,
        })
    }

    /// Makes `established` the live link: re-subscribes, spawns the
    /// dispatcher and heartbeat, and moves to `Connected`.
    async fn install(
        self: &Arc<Self>,
        established: Established,
        settings: &ConnectionSettings,
        reconnect: bool,
    ) -> MeshResult<()> {
        let Established {
            link,
            endpoint,
            relay,
        } = established;
        let transport = link.transport;

        let before: HashSet<String> = self.live_subjects().into_iter().collect();
        for subject in &before {
            if let Err(e) = transport.subscribe(subject).await {
                warn!(%subject, error = %e, "re-subscribe failed");
            }
        }

        let installed = {
            let mut session = self.session.lock();
            if self.state() == SessionState::Closed {
                false
            } else {
                for task in session.tasks.drain(..) {
                    task.abort();
                }
                session.generation += 1;
                let generation = session.generation;
                session.transport = Some(transport.clone());
                session.endpoint = Some(endpoint.clone());
                session.relay_in_use = relay;
                session.retry_count = 0;
                if reconnect {
                    session.reconnects += 1;
                }
                let weak = Arc::downgrade(self);
                session.tasks.push(tokio::spawn(run_dispatcher(
                    weak.clone(),
                    generation,
                    link.inbound,
                )));
                session.tasks.push(tokio::spawn(run_heartbeat(
                    weak,
                    generation,
                    transport.clone(),
                    settings.heartbeat_interval,
                    settings.max_missed_heartbeats,
                )));
                self.transition(SessionState::Connected);
                true
            }
        };
        if !installed {
            transport.close().await;
            return Err(MeshError::NotConnected);
        }

        // Subjects registered while the link was being installed.
        for subject in self.live_subjects() {
            if !before.contains(&subject) {
                if let Err(e) = transport.subscribe(&subject).await {
                    warn!(%subject, error = %e, "late subscribe failed");
                }
            }
        }

        info!(
            peer = %self.identity.peer_id().short(),
            endpoint = %endpoint,
            relay,
            "session connected"
        );
        Ok(())
    }

    /// Called by link tasks. Only the first report for the current link
    /// starts a reconnect.
    fn link_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        if self.session.lock().generation != generation {
            return;
        }
        if !self.transition_from(SessionState::Connected, SessionState::Reconnecting) {
            return;
        }
        warn!(%reason, "broker link lost, reconnecting");
        let inner = self.clone();
        tokio::spawn(async move { inner.reconnect(generation).await });
    }

    async fn reconnect(self: Arc<Self>, generation: u64) {
        let _guard = self.connect_lock.lock().await;
        if self.state() != SessionState::Reconnecting {
            return;
        }
        let old = {
            let mut session = self.session.lock();
            if session.generation != generation {
                return;
            }
            session.transport.take()
        };
        if let Some(old) = old {
            old.close().await;
        }
        let Some(settings) = self.settings.read().clone() else {
            return;
        };

        let result = match self.establish(&settings).await {
            Ok(established) => self.install(established, &settings, true).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(error = %e, "reconnect failed, closing session");
            self.mark_closed();
            self.teardown().await;
        }
    }

    /// Stops link tasks, drops every subscription, closes the transport.
    async fn teardown(&self) {
        let (transport, tasks) = {
            let mut session = self.session.lock();
            session.endpoint = None;
            session.relay_in_use = false;
            (session.transport.take(), std::mem::take(&mut session.tasks))
        };
        for task in tasks {
            task.abort();
        }
        let subjects: Vec<String> = self.subject_refs.lock().drain().map(|(s, _)| s).collect();
        self.subscriptions.clear();
        if let Some(transport) = transport {
            for subject in subjects {
                let _ = transport.unsubscribe(&subject).await;
            }
            transport.close().await;
        }
    }

    // -- subscriptions ------------------------------------------------------

    fn deliver(&self, msg: BrokerMessage) {
        for slot in self.subscriptions.iter() {
            if slot.subject != msg.subject {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = slot.tx.try_send(msg.clone()) {
                warn!(subject = %msg.subject, "subscriber lagging, message dropped");
            }
        }
    }

    fn release(&self, id: u64) {
        let Some((_, slot)) = self.subscriptions.remove(&id) else {
            return;
        };
        let last = {
            let mut refs = self.subject_refs.lock();
            match refs.get_mut(&slot.subject) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    refs.remove(&slot.subject);
                    true
                }
                None => false,
            }
        };
        if !last {
            return;
        }
        if let (Some(transport), Ok(handle)) =
            (self.transport(), tokio::runtime::Handle::try_current())
        {
            let subject = slot.subject;
            handle.spawn(async move {
                if let Err(e) = transport.unsubscribe(&subject).await {
                    debug!(%subject, error = %e, "unsubscribe failed");
                }
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Link tasks
// ---------------------------------------------------------------------------

async fn run_dispatcher(
    inner: Weak<Inner>,
    generation: u64,
    mut inbound: mpsc::Receiver<BrokerMessage>,
) {
    while let Some(msg) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.deliver(msg);
    }
    if let Some(inner) = inner.upgrade() {
        inner.link_lost(generation, "inbound stream closed");
    }
}

async fn run_heartbeat(
    inner: Weak<Inner>,
    generation: u64,
    transport: Arc<dyn Transport>,
    interval: Duration,
    max_missed: u32,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut missed = 0u32;
    loop {
        ticker.tick().await;
        match tokio::time::timeout(interval, transport.ping()).await {
            Ok(Ok(())) => missed = 0,
            Ok(Err(e)) => {
                missed += 1;
                warn!(missed, error = %e, "heartbeat failed");
            }
            Err(_) => {
                missed += 1;
                warn!(missed, "heartbeat timed out");
            }
        }
        if missed >= max_missed {
            if let Some(inner) = inner.upgrade() {
                inner.link_lost(generation, "missed heartbeats");
            }
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Handle to a node's broker session. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        identity: Arc<Identity>,
        connector: Arc<dyn Connector>,
        relays: Arc<dyn RelaySelector>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                identity,
                connector,
                relays,
                state_tx,
                session: Mutex::new(Session::default()),
                settings: RwLock::new(None),
                subscriptions: DashMap::new(),
                subject_refs: Mutex::new(HashMap::new()),
                next_sub_id: AtomicU64::new(1),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.inner.identity
    }

    pub fn peer_id(&self) -> &PeerId {
        self.inner.identity.peer_id()
    }

    /// Subject prefix of the current (or last) session.
    pub fn prefix(&self) -> String {
        self.inner.prefix()
    }

    /// This node's inbound A2A subject.
    pub fn inbound_subject(&self) -> String {
        subjects::inbound(&self.inner.prefix(), self.peer_id())
    }

    /// Opens the session. A no-op when already connected; fails with
    /// [`MeshError::NotConnected`] once the session has been closed.
    pub async fn connect(&self, config: &ClientConfig) -> MeshResult<()> {
        let settings = Arc::new(ConnectionSettings::from_config(config)?);
        let _guard = self.inner.connect_lock.lock().await;
        match self.inner.state() {
            SessionState::Connected => {
                debug!("connect: already connected");
                return Ok(());
            }
            SessionState::Closed => return Err(MeshError::NotConnected),
            _ => {}
        }
        *self.inner.settings.write() = Some(settings.clone());
        if !self.inner.transition(SessionState::Connecting) {
            return Err(MeshError::NotConnected);
        }
        info!(
            peer = %self.peer_id().short(),
            broker = %settings.broker,
            "connecting"
        );

        let result = match self.inner.establish(&settings).await {
            Ok(established) => self.inner.install(established, &settings, false).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(MeshError::Authentication(reason)) => {
                self.inner.transition(SessionState::Disconnected);
                Err(MeshError::Authentication(reason))
            }
            Err(e) => {
                self.inner.mark_closed();
                self.inner.teardown().await;
                Err(e)
            }
        }
    }

    /// Closes the session for good. Idempotent; interrupts a connect that is
    /// backing off.
    pub async fn disconnect(&self) {
        let was = self.state();
        self.inner.mark_closed();
        let _guard = self.inner.connect_lock.lock().await;
        self.inner.teardown().await;
        if was != SessionState::Closed {
            info!(peer = %self.peer_id().short(), "disconnected");
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// A receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Waits until the session is in `target`. Returns the state actually
    /// reached, which is `Closed` if the session ended first.
    pub async fn wait_for_state(&self, target: SessionState) -> SessionState {
        let mut rx = self.watch_state();
        let reached = match rx
            .wait_for(|s| *s == target || *s == SessionState::Closed)
            .await
        {
            Ok(state) => *state,
            Err(_) => SessionState::Closed,
        };
        reached
    }

    pub fn info(&self) -> SessionInfo {
        let session = self.inner.session.lock();
        SessionInfo {
            state: self.inner.state(),
            endpoint: session.endpoint.as_ref().map(|e| e.to_string()),
            relay_in_use: session.relay_in_use,
            retry_count: session.retry_count,
            reconnects: session.reconnects,
            subscriptions: self.inner.subscriptions.len(),
        }
    }

    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> MeshResult<()> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_BYTES,
            }
            .into());
        }
        if !self.state().is_connected() {
            return Err(MeshError::NotConnected);
        }
        let transport = self.inner.transport().ok_or(MeshError::NotConnected)?;
        transport.publish(subject, payload).await?;
        Ok(())
    }

    /// Registers a local subscription. The broker subscription is shared by
    /// every local subscriber of the same subject and survives reconnects.
    pub async fn subscribe(&self, subject: &str) -> MeshResult<Subscription> {
        if !subjects::is_valid_subject(subject) {
            return Err(MeshError::Protocol(format!("invalid subject {subject:?}")));
        }
        if matches!(
            self.state(),
            SessionState::Disconnected | SessionState::Closed
        ) {
            return Err(MeshError::NotConnected);
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscriptions.insert(
            id,
            SubscriptionSlot {
                subject: subject.to_string(),
                tx,
            },
        );
        let first = {
            let mut refs = self.inner.subject_refs.lock();
            let count = refs.entry(subject.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };
        let subscription = Subscription {
            id,
            subject: subject.to_string(),
            rx,
            inner: Arc::downgrade(&self.inner),
        };
        if first {
            if let Some(transport) = self.inner.transport() {
                if let Err(e) = transport.subscribe(subject).await {
                    warn!(%subject, error = %e, "broker subscribe failed, will retry on reconnect");
                }
            }
        }
        debug!(%subject, id, "subscribed");
        Ok(subscription)
    }

    /// Subscribes and drives `handler` for every message on its own task.
    /// Dropping the returned handle stops the task and the subscription.
    pub async fn subscribe_with<F, Fut>(
        &self,
        subject: &str,
        handler: F,
    ) -> MeshResult<SubscriptionTask>
    where
        F: Fn(BrokerMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut subscription = self.subscribe(subject).await?;
        let subject = subscription.subject().to_string();
        let task = tokio::spawn(async move {
            while let Some(msg) = subscription.next().await {
                handler(msg).await;
            }
        });
        Ok(SubscriptionTask {
            subject,
            task: Some(task),
        })
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("peer_id", self.peer_id())
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Subscription handles
// ---------------------------------------------------------------------------

/// A local subscription. Ends when cancelled, dropped, or the session closes.
pub struct Subscription {
    id: u64,
    subject: String,
    rx: mpsc::Receiver<BrokerMessage>,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<BrokerMessage> {
        self.rx.recv().await
    }

    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.release(self.id);
        }
    }
}

/// A subscription driven by its own task. See
/// [`ConnectionManager::subscribe_with`].
pub struct SubscriptionTask {
    subject: String,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionTask {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    pub fn cancel(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SubscriptionTask {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::MemoryBroker;
    use crate::network::relay::{NoRelay, RelayDirectory};

    fn config(broker: &str) -> ClientConfig {
        ClientConfig {
            broker_url: broker.to_string(),
            heartbeat_interval_ms: 50,
            backoff_base_ms: 5,
            backoff_max_ms: 20,
            max_retries: 2,
            connect_timeout_ms: 500,
            ..ClientConfig::default()
        }
    }

    fn manager(broker: &MemoryBroker) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(Identity::ephemeral()),
            Arc::new(broker.clone()),
            Arc::new(NoRelay),
        )
    }

    #[tokio::test]
    async fn connect_is_idempotent_and_disconnect_is_terminal() {
        let broker = MemoryBroker::new();
        let conn = manager(&broker);
        assert_eq!(conn.state(), SessionState::Disconnected);
        conn.connect(&config("memory://broker")).await.unwrap();
        conn.connect(&config("memory://broker")).await.unwrap();
        assert_eq!(conn.state(), SessionState::Connected);
        assert_eq!(broker.connection_count(), 1);

        conn.disconnect().await;
        conn.disconnect().await;
        assert_eq!(conn.state(), SessionState::Closed);
        assert_eq!(broker.connection_count(), 0);
        assert!(matches!(
            conn.connect(&config("memory://broker")).await,
            Err(MeshError::NotConnected)
        ));
        assert!(matches!(
            conn.publish("mesh.x", Bytes::new()).await,
            Err(MeshError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn subscription_receives_and_refcounts() {
        let broker = MemoryBroker::new();
        let a = manager(&broker);
        let b = manager(&broker);
        a.connect(&config("memory://broker")).await.unwrap();
        b.connect(&config("memory://broker")).await.unwrap();

        let mut s1 = b.subscribe("mesh.topic").await.unwrap();
        let mut s2 = b.subscribe("mesh.topic").await.unwrap();
        a.publish("mesh.topic", Bytes::from_static(b"one")).await.unwrap();
        assert_eq!(&s1.next().await.unwrap().payload[..], b"one");
        assert_eq!(&s2.next().await.unwrap().payload[..], b"one");

        s1.cancel();
        a.publish("mesh.topic", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(&s2.next().await.unwrap().payload[..], b"two");
        assert_eq!(b.info().subscriptions, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_close_the_session() {
        let broker = MemoryBroker::new();
        broker.set_reachable("down", false);
        let conn = manager(&broker);
        let err = conn.connect(&config("memory://down")).await.unwrap_err();
        match err {
            MeshError::Connection { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(broker.attempts("down"), 3);
        assert_eq!(conn.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn rejected_handshake_is_authentication_failure() {
        let broker = MemoryBroker::with_token("right");
        let conn = manager(&broker);
        let mut cfg = config("memory://broker");
        cfg.secret_token = Some("wrong".into());
        assert!(matches!(
            conn.connect(&cfg).await,
            Err(MeshError::Authentication(_))
        ));
        assert_eq!(broker.attempts("broker"), 1);
        assert_eq!(conn.state(), SessionState::Disconnected);

        cfg.secret_token = Some("right".into());
        conn.connect(&cfg).await.unwrap();
    }

    #[tokio::test]
    async fn falls_back_to_relay() {
        let broker = MemoryBroker::new();
        broker.set_reachable("broker", false);
        let relays = RelayDirectory::new(vec![Endpoint::parse("memory://relay-1").unwrap()]);
        let conn = ConnectionManager::new(
            Arc::new(Identity::ephemeral()),
            Arc::new(broker.clone()),
            Arc::new(relays),
        );
        conn.connect(&config("memory://broker")).await.unwrap();
        let info = conn.info();
        assert!(info.relay_in_use);
        assert_eq!(info.endpoint.as_deref(), Some("memory://relay-1"));
        assert_eq!(broker.connections_to("relay-1"), 1);
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[tokio::test]
    async fn reconnects_after_link_loss_and_keeps_subscriptions() {
        let broker = MemoryBroker::new();
        let a = manager(&broker);
        let b = manager(&broker);
        a.connect(&config("memory://broker")).await.unwrap();
        b.connect(&config("memory://broker")).await.unwrap();
        let mut sub = b.subscribe("mesh.after").await.unwrap();

        broker.sever_all();
        eventually("both peers to reconnect", || {
            [&a, &b]
                .iter()
                .all(|c| c.state() == SessionState::Connected && c.info().reconnects == 1)
        })
        .await;

        a.publish("mesh.after", Bytes::from_static(b"still here"))
            .await
            .unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&msg.payload[..], b"still here");
    }

    #[tokio::test]
    async fn state_watch_sees_reconnecting_before_connected() {
        let broker = MemoryBroker::new();
        let conn = manager(&broker);
        let mut cfg = config("memory://broker");
        cfg.max_retries = 50;
        conn.connect(&cfg).await.unwrap();
        let mut states = conn.watch_state();
        assert_eq!(*states.borrow_and_update(), SessionState::Connected);

        broker.set_reachable("broker", false);
        broker.sever_all();
        let seen = tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| *s != SessionState::Connected),
        )
        .await
        .unwrap()
        .map(|s| *s)
        .unwrap();
        assert_eq!(seen, SessionState::Reconnecting);
        assert!(!conn.state().is_connected());

        broker.set_reachable("broker", true);
        let seen = tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| *s != SessionState::Reconnecting),
        )
        .await
        .unwrap()
        .map(|s| *s)
        .unwrap();
        assert_eq!(seen, SessionState::Connected);
        assert_eq!(conn.info().reconnects, 1);
    }

    #[tokio::test]
    async fn missed_heartbeats_trigger_reconnect() {
        let broker = MemoryBroker::new();
        let conn = manager(&broker);
        conn.connect(&config("memory://broker")).await.unwrap();
        broker.set_heartbeat_stalled(true);
        eventually("a reconnect", || conn.info().reconnects >= 1).await;
        broker.set_heartbeat_stalled(false);
        eventually("connected", || conn.state() == SessionState::Connected).await;
    }

    #[tokio::test]
    async fn disconnect_interrupts_backoff() {
        let broker = MemoryBroker::new();
        broker.set_reachable("down", false);
        let conn = manager(&broker);
        let mut cfg = config("memory://down");
        cfg.backoff_base_ms = 10_000;
        cfg.backoff_max_ms = 10_000;
        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.connect(&cfg).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(1), conn.disconnect())
            .await
            .unwrap();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(MeshError::NotConnected)));
        assert_eq!(conn.state(), SessionState::Closed);
    }
}
