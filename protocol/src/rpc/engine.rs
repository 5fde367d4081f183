//! # RPC Call Engine
//!
//! Both halves of the A2A protocol over one inbound subscription
//! (`<prefix>.peer.<own id>`):
//!
//! **Outbound calls.** [`RpcEngine::call`] signs a `request`, registers a
//! pending entry *before* publishing, and waits for the `response` with the
//! same request id. [`RpcEngine::call_stream`] does the same but yields
//! `stream` payloads until `end`.
//!
//! **Inbound requests.** Each request is dispatched on its own task to the
//! handler registered for its action (or the `*` handler). The handler's
//! result goes back to the caller's inbound subject as a `response`, or as
//! a series of `stream` envelopes followed by `end`.
//!
//! Inbound path, in order:
//!
//! 1. Parse. Malformed envelopes are logged and dropped.
//! 2. Verify sender key and signature. Failures are dropped.
//! 3. Drop envelopes addressed to someone else or past their ttl.
//! 4. Replies resolve pending calls; requests are dispatched, unless the
//!    engine was built with `serve_requests` off, in which case they are
//!    dropped so another session under the same identity answers them.
//!
//! Replies are routed without waiting on any consumer. A streaming caller
//! that falls [`STREAM_BUFFER`] items behind has its call ended with an
//! error rather than stalling the inbound path for everyone else.
//!
//! Dispatch checks certificates first: an attached certificate must validate
//! against the trust store and name the sender as subject, and a missing
//! one is refused when `require_certificate` is set. Refusals answer with
//! error `-32001`; unknown actions with `-32601`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::envelope::{Envelope, EnvelopeError, EnvelopeKind, RemoteFault, ERR_AUTH};
use super::pending::{Completion, PendingTable, StreamSlot};
use crate::certify::{Certificate, TrustStore};
use crate::config::{ClientConfig, DEFAULT_ENVELOPE_TTL_SECS};
use crate::error::{MeshError, MeshResult};
use crate::identity::PeerId;
use crate::network::{subjects, BrokerMessage, ConnectionManager, SessionState, SubscriptionTask};

/// Handler registered under this action receives every unhandled action.
pub const WILDCARD_ACTION: &str = "*";

/// Buffered `stream` envelopes per streaming call. A consumer further
/// behind than this loses the call.
pub const STREAM_BUFFER: usize = 256;

/// How often overdue pending entries are swept.
const JANITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Extra time a pending entry may outlive its deadline before the sweep
/// removes it. Callers normally time out first.
const SWEEP_GRACE: Duration = Duration::from_secs(2);

/// A request as seen by a handler.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub request_id: Uuid,
    pub sender: PeerId,
    pub action: String,
    pub payload: Value,
    /// Present only if it validated.
    pub certificate: Option<Certificate>,
}

pub type HandlerResult = Result<Value, RemoteFault>;

type UnaryFn = Arc<dyn Fn(InboundRequest) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
type StreamFn =
    Arc<dyn Fn(InboundRequest, StreamSink) -> BoxFuture<'static, Result<(), RemoteFault>> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Unary(UnaryFn),
    Stream(StreamFn),
}

#[derive(Debug, Clone)]
pub struct RpcOptions {
    /// ttl stamped on outgoing requests, seconds.
    pub ttl_secs: u64,
    /// Refuse inbound requests without a valid certificate.
    pub require_certificate: bool,
    /// Answer inbound requests. Off for client-only sessions.
    pub serve_requests: bool,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_ENVELOPE_TTL_SECS,
            require_certificate: false,
            serve_requests: true,
        }
    }
}

impl RpcOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            ttl_secs: config.envelope_ttl_secs,
            require_certificate: config.require_certificate,
            serve_requests: config.serve_requests,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct EngineInner {
    conn: ConnectionManager,
    trust: Arc<TrustStore>,
    options: RpcOptions,
    pending: PendingTable,
    handlers: DashMap<String, Handler>,
    /// Actions served even without a certificate.
    open_actions: DashMap<String, ()>,
    inbound: Mutex<Option<SubscriptionTask>>,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

/// Sends calls and serves handlers for one node. Cheap to clone.
#[derive(Clone)]
pub struct RpcEngine {
    inner: Arc<EngineInner>,
}

impl RpcEngine {
    pub fn new(conn: ConnectionManager, trust: Arc<TrustStore>, options: RpcOptions) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                conn,
                trust,
                options,
                pending: PendingTable::new(),
                handlers: DashMap::new(),
                open_actions: DashMap::new(),
                inbound: Mutex::new(None),
                janitor: Mutex::new(None),
            }),
        }
    }

    /// Subscribes to the inbound subject. Idempotent.
    pub async fn start(&self) -> MeshResult<()> {
        if let Some(task) = self.inner.inbound.lock().as_ref() {
            if !task.is_finished() {
                return Ok(());
            }
        }
        let subject = self.inner.conn.inbound_subject();
        let weak = Arc::downgrade(&self.inner);
        let task = self
            .inner
            .conn
            .subscribe_with(&subject, move |msg| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_message(msg).await;
                    }
                }
            })
            .await?;
        *self.inner.inbound.lock() = Some(task);

        let janitor = tokio::spawn(run_janitor(
            Arc::downgrade(&self.inner),
            self.inner.conn.watch_state(),
        ));
        if let Some(old) = self.inner.janitor.lock().replace(janitor) {
            old.abort();
        }
        info!(%subject, "rpc engine listening");
        Ok(())
    }

    /// Stops serving requests and fails outstanding calls.
    pub fn stop(&self) {
        self.inner.inbound.lock().take();
        if let Some(janitor) = self.inner.janitor.lock().take() {
            janitor.abort();
        }
        self.inner.pending.clear();
    }

    /// Registers a single-response handler for `action` (`*` for all).
    pub fn handle<F, Fut>(&self, action: &str, handler: F)
    where
        F: Fn(InboundRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let f: UnaryFn = Arc::new(move |req| handler(req).boxed());
        self.inner
            .handlers
            .insert(action.to_string(), Handler::Unary(f));
    }

    /// Registers a streaming handler. Everything sent through the sink
    /// reaches the caller as `stream` items; returning ends the stream.
    pub fn handle_stream<F, Fut>(&self, action: &str, handler: F)
    where
        F: Fn(InboundRequest, StreamSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RemoteFault>> + Send + 'static,
    {
        let f: StreamFn = Arc::new(move |req, sink| handler(req, sink).boxed());
        self.inner
            .handlers
            .insert(action.to_string(), Handler::Stream(f));
    }

    pub fn remove_handler(&self, action: &str) -> bool {
        self.inner.handlers.remove(action).is_some()
    }

    /// Serves `action` to callers without a certificate even when
    /// certificates are otherwise required.
    pub fn allow_uncertified(&self, action: &str) {
        self.inner.open_actions.insert(action.to_string(), ());
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.conn
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.inner.trust
    }

    /// Calls `action` on `target` and waits up to `timeout` for the response.
    pub async fn call(
        &self,
        target: &PeerId,
        action: &str,
        payload: Value,
        timeout: Duration,
        certificate: Option<Certificate>,
    ) -> MeshResult<Value> {
        let inner = &self.inner;
        if !inner.conn.state().is_connected() {
            return Err(MeshError::NotConnected);
        }
        let request = Envelope::request(
            inner.conn.identity(),
            target,
            action,
            payload,
            inner.options.ttl_secs,
            certificate,
        )?;
        let id = request.request_id;
        let bytes = request.to_bytes()?;

        let (tx, mut rx) = oneshot::channel();
        inner
            .pending
            .register(id, target.clone(), Instant::now() + timeout, Completion::Single(tx))?;
        let _guard = PendingGuard {
            table: &inner.pending,
            id,
        };

        let subject = subjects::inbound(&inner.conn.prefix(), target);
        inner.conn.publish(&subject, bytes).await?;
        debug!(request_id = %id, %action, target = %target.short(), "request sent");

        let response = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(self.abandoned(target, timeout)),
            Err(_) => {
                if inner.pending.expire(&id) {
                    debug!(request_id = %id, "call timed out");
                    return Err(unreachable(target, timeout));
                }
                // Resolved in the same instant the timer fired.
                match rx.try_recv() {
                    Ok(response) => response,
                    Err(_) => return Err(unreachable(target, timeout)),
                }
            }
        };
        interpret(target, response)
    }

    /// Calls a streaming action. The request is sent when the stream is
    /// first polled; `idle_timeout` bounds the gap between items.
    pub async fn call_stream(
        &self,
        target: &PeerId,
        action: &str,
        payload: Value,
        idle_timeout: Duration,
        certificate: Option<Certificate>,
    ) -> MeshResult<CallStream> {
        let inner = &self.inner;
        if !inner.conn.state().is_connected() {
            return Err(MeshError::NotConnected);
        }
        let request = Envelope::request(
            inner.conn.identity(),
            target,
            action,
            payload,
            inner.options.ttl_secs,
            certificate,
        )?;
        let id = request.request_id;
        let bytes = request.to_bytes()?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let slot = StreamSlot::new(tx);
        let overflowed = slot.overflow_flag();
        inner.pending.register(
            id,
            target.clone(),
            Instant::now() + idle_timeout,
            Completion::Stream(slot),
        )?;

        let conn = inner.conn.clone();
        let subject = subjects::inbound(&conn.prefix(), target);
        let send = async move { conn.publish(&subject, bytes).await }.boxed();

        Ok(CallStream {
            id,
            peer: target.clone(),
            rx,
            overflowed,
            idle_timeout,
            idle: Box::pin(tokio::time::sleep(idle_timeout)),
            send: Some(send),
            engine: Arc::downgrade(&self.inner),
            done: false,
        })
    }

    fn abandoned(&self, target: &PeerId, timeout: Duration) -> MeshError {
        if self.inner.conn.state().is_connected() {
            unreachable(target, timeout)
        } else {
            MeshError::NotConnected
        }
    }
}

fn unreachable(peer: &PeerId, timeout: Duration) -> MeshError {
    MeshError::PeerUnreachable {
        peer: peer.to_string(),
        timeout_ms: timeout.as_millis() as u64,
    }
}

fn fault_to_error(peer: &PeerId, fault: RemoteFault) -> MeshError {
    if fault.code == ERR_AUTH {
        MeshError::Authentication(fault.message)
    } else {
        MeshError::Remote {
            peer: peer.to_string(),
            code: fault.code,
            message: fault.message,
        }
    }
}

fn interpret(peer: &PeerId, response: Envelope) -> MeshResult<Value> {
    if let Some(fault) = response.error {
        return Err(fault_to_error(peer, fault));
    }
    match response.kind {
        EnvelopeKind::Response => Ok(response.payload),
        other => Err(MeshError::InvalidResponse {
            peer: peer.to_string(),
            reason: format!("expected a response, got {other}"),
        }),
    }
}

/// Releases a pending entry when the call future goes away, whatever the
/// reason.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.cancel(&self.id);
    }
}

async fn run_janitor(inner: Weak<EngineInner>, mut state: tokio::sync::watch::Receiver<SessionState>) {
    let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { return };
                let cutoff = Instant::now().checked_sub(SWEEP_GRACE).unwrap_or_else(Instant::now);
                let swept = inner.pending.sweep(cutoff);
                if swept > 0 {
                    debug!(swept, "dropped overdue pending calls");
                }
            }
            changed = state.changed() => {
                let closed = changed.is_err() || *state.borrow() == SessionState::Closed;
                if closed {
                    if let Some(inner) = inner.upgrade() {
                        inner.pending.clear();
                    }
                    return;
                }
            }
        }
    }
}

impl EngineInner {
    async fn on_message(self: Arc<Self>, msg: BrokerMessage) {
        let envelope = match Envelope::from_bytes(&msg.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(subject = %msg.subject, error = %e, "dropping malformed envelope");
                return;
            }
        };
        if let Err(e) = envelope.verify() {
            warn!(
                request_id = %envelope.request_id,
                sender = %envelope.sender_id.short(),
                error = %e,
                "dropping unverifiable envelope"
            );
            return;
        }
        if &envelope.target_id != self.conn.peer_id() {
            debug!(request_id = %envelope.request_id, "envelope addressed elsewhere");
            return;
        }
        if envelope.is_expired(Utc::now().timestamp_millis()) {
            debug!(request_id = %envelope.request_id, kind = %envelope.kind, "dropping expired envelope");
            return;
        }

        match envelope.kind {
            EnvelopeKind::Request if !self.options.serve_requests => {
                debug!(
                    request_id = %envelope.request_id,
                    action = %envelope.action,
                    "client-only session, request left to other sessions"
                );
            }
            EnvelopeKind::Request => {
                tokio::spawn(self.dispatch(envelope));
            }
            _ => {
                self.pending.resolve(envelope);
            }
        }
    }

    fn authorize(&self, request: &Envelope) -> Result<(), RemoteFault> {
        match &request.certificate {
            Some(cert) => cert
                .validate_for(&request.sender_id, &self.trust, Utc::now())
                .map_err(|e| RemoteFault::auth(e.to_string())),
            None if self.options.require_certificate
                && !self.open_actions.contains_key(&request.action) =>
            {
                Err(RemoteFault::auth("certificate required"))
            }
            None => Ok(()),
        }
    }

    async fn dispatch(self: Arc<Self>, request: Envelope) {
        let started = Instant::now();
        if let Err(fault) = self.authorize(&request) {
            warn!(
                action = %request.action,
                sender = %request.sender_id.short(),
                reason = %fault.message,
                "request refused"
            );
            self.reply(&request, EnvelopeKind::Response, Value::Null, Some(fault))
                .await;
            return;
        }

        let handler = self
            .handlers
            .get(&request.action)
            .map(|h| h.value().clone())
            .or_else(|| self.handlers.get(WILDCARD_ACTION).map(|h| h.value().clone()));
        let Some(handler) = handler else {
            debug!(action = %request.action, "no handler");
            let fault = RemoteFault::unknown_action(&request.action);
            self.reply(&request, EnvelopeKind::Response, Value::Null, Some(fault))
                .await;
            return;
        };

        let action = request.action.clone();
        let inbound = InboundRequest {
            request_id: request.request_id,
            sender: request.sender_id.clone(),
            action: request.action.clone(),
            payload: request.payload.clone(),
            certificate: request.certificate.clone(),
        };
        match handler {
            Handler::Unary(f) => {
                let (payload, fault) = match f(inbound).await {
                    Ok(value) => (value, None),
                    Err(fault) => (Value::Null, Some(fault)),
                };
                self.reply(&request, EnvelopeKind::Response, payload, fault)
                    .await;
            }
            Handler::Stream(f) => {
                let request = Arc::new(request);
                let sink = StreamSink {
                    inner: self.clone(),
                    request: request.clone(),
                };
                let fault = f(inbound, sink).await.err();
                self.reply(&request, EnvelopeKind::End, Value::Null, fault)
                    .await;
            }
        }
        debug!(
            %action,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request handled"
        );
    }

    async fn reply(
        &self,
        request: &Envelope,
        kind: EnvelopeKind,
        payload: Value,
        error: Option<RemoteFault>,
    ) {
        if let Err(e) = self.try_reply(request, kind, payload, error).await {
            warn!(request_id = %request.request_id, error = %e, "failed to send reply");
        }
    }

    async fn try_reply(
        &self,
        request: &Envelope,
        kind: EnvelopeKind,
        payload: Value,
        error: Option<RemoteFault>,
    ) -> MeshResult<()> {
        let identity = self.conn.identity();
        let envelope = request.reply(identity, kind, payload, error)?;
        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(EnvelopeError::TooLarge { size, max }) => {
                let fault = RemoteFault::handler(format!("reply of {size} bytes exceeds {max}"));
                request
                    .reply(identity, kind, Value::Null, Some(fault))?
                    .to_bytes()?
            }
            Err(e) => return Err(e.into()),
        };
        let subject = subjects::inbound(&self.conn.prefix(), &request.sender_id);
        self.conn.publish(&subject, bytes).await
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Handed to streaming handlers to emit items back to the caller.
pub struct StreamSink {
    inner: Arc<EngineInner>,
    request: Arc<Envelope>,
}

impl StreamSink {
    /// The calling peer.
    pub fn peer(&self) -> &PeerId {
        &self.request.sender_id
    }

    pub async fn send(&self, payload: Value) -> MeshResult<()> {
        self.inner
            .try_reply(&self.request, EnvelopeKind::Stream, payload, None)
            .await
    }
}

/// The items of a streaming call. Finite and not restartable; dropping it
/// (or calling [`cancel`](Self::cancel)) releases the pending entry at once.
pub struct CallStream {
    id: Uuid,
    peer: PeerId,
    rx: mpsc::Receiver<Envelope>,
    /// Set by the pending table when this stream fell too far behind.
    overflowed: Arc<AtomicBool>,
    idle_timeout: Duration,
    idle: Pin<Box<tokio::time::Sleep>>,
    send: Option<BoxFuture<'static, MeshResult<()>>>,
    engine: Weak<EngineInner>,
    done: bool,
}

impl CallStream {
    pub fn request_id(&self) -> Uuid {
        self.id
    }

    pub fn cancel(self) {}

    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(engine) = self.engine.upgrade() {
            engine.pending.cancel(&self.id);
        }
    }

    fn touch(&mut self) {
        self.idle
            .as_mut()
            .reset(tokio::time::Instant::now() + self.idle_timeout);
        if let Some(engine) = self.engine.upgrade() {
            engine
                .pending
                .extend(&self.id, Instant::now() + self.idle_timeout);
        }
    }

    fn on_envelope(&mut self, envelope: Envelope) -> Option<MeshResult<Value>> {
        if let Some(fault) = envelope.error {
            self.finish();
            return Some(Err(fault_to_error(&self.peer, fault)));
        }
        match envelope.kind {
            EnvelopeKind::Stream => Some(Ok(envelope.payload)),
            EnvelopeKind::Response => {
                self.finish();
                Some(Ok(envelope.payload))
            }
            EnvelopeKind::End => {
                self.finish();
                None
            }
            EnvelopeKind::Request => {
                self.finish();
                Some(Err(MeshError::InvalidResponse {
                    peer: self.peer.to_string(),
                    reason: "request envelope on a reply path".into(),
                }))
            }
        }
    }

    fn closed_error(&self) -> MeshError {
        if self.overflowed.load(Ordering::SeqCst) {
            return MeshError::Protocol(format!(
                "stream from {} ended: consumer fell more than {STREAM_BUFFER} items behind",
                self.peer.short()
            ));
        }
        match self.engine.upgrade() {
            Some(engine) if engine.conn.state().is_connected() => {
                unreachable(&self.peer, self.idle_timeout)
            }
            _ => MeshError::NotConnected,
        }
    }
}

impl Stream for CallStream {
    type Item = MeshResult<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if let Some(send) = this.send.as_mut() {
            match send.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => {
                    this.send = None;
                    this.finish();
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(Ok(())) => {
                    this.send = None;
                    this.touch();
                }
            }
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(envelope)) => {
                this.touch();
                Poll::Ready(this.on_envelope(envelope))
            }
            Poll::Ready(None) => {
                let err = this.closed_error();
                this.finish();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Pending => {
                if this.idle.as_mut().poll(cx).is_ready() {
                    debug!(request_id = %this.id, "stream idle timeout");
                    this.finish();
                    Poll::Ready(Some(Err(unreachable(&this.peer, this.idle_timeout))))
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl Drop for CallStream {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::network::{MemoryBroker, NoRelay};
    use futures::StreamExt;
    use serde_json::json;

    async fn engine(broker: &MemoryBroker, options: RpcOptions, trust: TrustStore) -> RpcEngine {
        engine_as(broker, Arc::new(Identity::ephemeral()), options, trust).await
    }

    async fn engine_as(
        broker: &MemoryBroker,
        identity: Arc<Identity>,
        options: RpcOptions,
        trust: TrustStore,
    ) -> RpcEngine {
        let conn = ConnectionManager::new(
            identity,
            Arc::new(broker.clone()),
            Arc::new(NoRelay),
        );
        let config = ClientConfig {
            broker_url: "memory://broker".into(),
            ..ClientConfig::default()
        };
        conn.connect(&config).await.unwrap();
        let engine = RpcEngine::new(conn, Arc::new(trust), options);
        engine.start().await.unwrap();
        engine
    }

    async fn pair() -> (RpcEngine, RpcEngine) {
        let broker = MemoryBroker::new();
        let a = engine(&broker, RpcOptions::default(), TrustStore::new()).await;
        let b = engine(&broker, RpcOptions::default(), TrustStore::new()).await;
        (a, b)
    }

    fn id(engine: &RpcEngine) -> PeerId {
        engine.connection().peer_id().clone()
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let (a, b) = pair().await;
        b.handle("echo", |req| async move { Ok(req.payload) });
        let out = a
            .call(&id(&b), "echo", json!({"msg": "hi"}), Duration::from_secs(2), None)
            .await
            .unwrap();
        assert_eq!(out, json!({"msg": "hi"}));
        assert_eq!(a.pending_count(), 0);
    }

    #[tokio::test]
    async fn silent_peer_times_out_and_releases_entry() {
        let (a, b) = pair().await;
        b.handle("slow", |_| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        });
        let started = Instant::now();
        let err = a
            .call(&id(&b), "slow", json!({}), Duration::from_millis(200), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::PeerUnreachable { timeout_ms: 200, .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(a.pending_count(), 0);
    }

    #[tokio::test]
    async fn late_reply_after_timeout_is_dropped() {
        let (a, b) = pair().await;
        b.handle("slow", |req| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(req.payload)
        });
        b.handle("echo", |req| async move { Ok(req.payload) });
        let target = id(&b);

        let err = a
            .call(&target, "slow", json!(1), Duration::from_millis(100), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::PeerUnreachable { .. }));
        assert_eq!(a.pending_count(), 0);

        // The slow response lands here and finds nothing to resolve.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(a.pending_count(), 0);

        let out = a
            .call(&target, "echo", json!(2), Duration::from_secs(2), None)
            .await
            .unwrap();
        assert_eq!(out, json!(2));
    }

    #[tokio::test]
    async fn client_only_session_leaves_requests_to_the_server() {
        let broker = MemoryBroker::new();
        let shared = Arc::new(Identity::ephemeral());
        let server = engine_as(&broker, shared.clone(), RpcOptions::default(), TrustStore::new()).await;
        let client_only = engine_as(
            &broker,
            shared,
            RpcOptions {
                serve_requests: false,
                ..RpcOptions::default()
            },
            TrustStore::new(),
        )
        .await;
        let caller = engine(&broker, RpcOptions::default(), TrustStore::new()).await;
        server.handle("ping", |_| async move { Ok(json!("pong")) });
        caller.handle("echo", |req| async move { Ok(req.payload) });

        // Both sessions receive every request; only the server may answer.
        let target = id(&server);
        for _ in 0..20 {
            let out = caller
                .call(&target, "ping", json!({}), Duration::from_secs(2), None)
                .await
                .unwrap();
            assert_eq!(out, json!("pong"));
        }

        // The client-only session still makes calls of its own.
        let out = client_only
            .call(&id(&caller), "echo", json!("hi"), Duration::from_secs(2), None)
            .await
            .unwrap();
        assert_eq!(out, json!("hi"));
    }

    #[tokio::test]
    async fn unknown_action_and_handler_errors() {
        let (a, b) = pair().await;
        b.handle("fail", |_| async move { Err(RemoteFault::invalid_params("bad input")) });

        match a
            .call(&id(&b), "nope", json!({}), Duration::from_secs(2), None)
            .await
        {
            Err(MeshError::Remote { code, .. }) => assert_eq!(code, -32601),
            other => panic!("unexpected {other:?}"),
        }
        match a
            .call(&id(&b), "fail", json!({}), Duration::from_secs(2), None)
            .await
        {
            Err(MeshError::Remote { code, message, .. }) => {
                assert_eq!(code, -32602);
                assert_eq!(message, "bad input");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn wildcard_handler_catches_everything() {
        let (a, b) = pair().await;
        b.handle(WILDCARD_ACTION, |req| async move { Ok(json!(req.action)) });
        let out = a
            .call(&id(&b), "anything.at.all", json!({}), Duration::from_secs(2), None)
            .await
            .unwrap();
        assert_eq!(out, json!("anything.at.all"));
    }

    #[tokio::test]
    async fn concurrent_calls_get_their_own_responses() {
        let (a, b) = pair().await;
        b.handle("double", |req| async move {
            let n = req.payload["n"].as_i64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis((50 - n) as u64)).await;
            Ok(json!({"n": n * 2}))
        });
        let target = id(&b);
        let calls = (0..40).map(|n| {
            let a = a.clone();
            let target = target.clone();
            async move {
                let out = a
                    .call(&target, "double", json!({"n": n}), Duration::from_secs(5), None)
                    .await
                    .unwrap();
                (n, out)
            }
        });
        for (n, out) in futures::future::join_all(calls).await {
            assert_eq!(out, json!({"n": n * 2}));
        }
        assert_eq!(a.pending_count(), 0);
    }

    #[tokio::test]
    async fn dropping_call_future_releases_entry() {
        let (a, b) = pair().await;
        b.handle("slow", |_| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        });
        let target = id(&b);
        let call = a.call(&target, "slow", json!({}), Duration::from_secs(10), None);
        let _ = tokio::time::timeout(Duration::from_millis(100), call).await;
        assert_eq!(a.pending_count(), 0);
    }

    #[tokio::test]
    async fn streaming_call_yields_items_then_ends() {
        let (a, b) = pair().await;
        b.handle_stream("count", |req, sink| async move {
            let upto = req.payload["upto"].as_u64().unwrap_or(0);
            for i in 0..upto {
                sink.send(json!(i))
                    .await
                    .map_err(|e| RemoteFault::handler(e.to_string()))?;
            }
            Ok(())
        });
        let stream = a
            .call_stream(&id(&b), "count", json!({"upto": 5}), Duration::from_secs(2), None)
            .await
            .unwrap();
        let items: Vec<Value> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
        assert_eq!(a.pending_count(), 0);
    }

    #[tokio::test]
    async fn stream_idle_timeout_and_cancel() {
        let (a, b) = pair().await;
        b.handle_stream("stall", |_, sink| async move {
            let _ = sink.send(json!("first")).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        let mut stream = a
            .call_stream(&id(&b), "stall", json!({}), Duration::from_millis(200), None)
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), json!("first"));
        assert!(matches!(
            stream.next().await,
            Some(Err(MeshError::PeerUnreachable { .. }))
        ));
        assert!(stream.next().await.is_none());
        assert_eq!(a.pending_count(), 0);

        let stream = a
            .call_stream(&id(&b), "stall", json!({}), Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(a.pending_count(), 1);
        stream.cancel();
        assert_eq!(a.pending_count(), 0);
    }

    #[tokio::test]
    async fn unread_stream_does_not_stall_other_replies() {
        let broker = MemoryBroker::new();
        let a = engine(&broker, RpcOptions::default(), TrustStore::new()).await;
        let b = engine(&broker, RpcOptions::default(), TrustStore::new()).await;
        let c = engine(&broker, RpcOptions::default(), TrustStore::new()).await;
        b.handle_stream("flood", |_, sink| async move {
            for i in 0..2_000u32 {
                sink.send(json!(i))
                    .await
                    .map_err(|e| RemoteFault::handler(e.to_string()))?;
                tokio::task::yield_now().await;
            }
            Ok(())
        });
        c.handle("ping", |_| async move { Ok(json!("pong")) });

        let mut stream = a
            .call_stream(&id(&b), "flood", json!({}), Duration::from_secs(10), None)
            .await
            .unwrap();
        assert!(stream.next().await.unwrap().is_ok());

        // Held but unread: the call is ended once its buffer fills.
        tokio::time::timeout(Duration::from_secs(5), async {
            while a.pending_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("overflowing stream should be released");

        let out = a
            .call(&id(&c), "ping", json!({}), Duration::from_secs(2), None)
            .await
            .unwrap();
        assert_eq!(out, json!("pong"));

        let rest: Vec<MeshResult<Value>> = stream.collect().await;
        assert!(rest.len() <= STREAM_BUFFER + 1);
        assert!(matches!(rest.last(), Some(Err(MeshError::Protocol(_)))));
        assert!(rest[..rest.len() - 1].iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn certificate_required_and_checked() {
        let broker = MemoryBroker::new();
        let authority = Identity::ephemeral();
        let mut trust = TrustStore::new();
        trust
            .trust(authority.peer_id().clone(), authority.public_key())
            .unwrap();
        let strict = RpcOptions {
            require_certificate: true,
            ..RpcOptions::default()
        };
        let server = engine(&broker, strict, trust).await;
        let client = engine(&broker, RpcOptions::default(), TrustStore::new()).await;
        server.handle("secret", |req| async move {
            Ok(json!({"role": req.certificate.map(|c| c.attributes["role"].clone())}))
        });
        server.handle("open", |_| async move { Ok(json!("ok")) });
        server.allow_uncertified("open");

        let err = client
            .call(&id(&server), "secret", json!({}), Duration::from_secs(2), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Authentication(_)));

        let out = client
            .call(&id(&server), "open", json!({}), Duration::from_secs(2), None)
            .await
            .unwrap();
        assert_eq!(out, json!("ok"));

        let mut attrs = crate::certify::Attributes::new();
        attrs.insert("role".into(), json!("worker"));
        let cert = Certificate::issue(
            &authority,
            id(&client),
            attrs.clone(),
            Duration::from_secs(60),
        )
        .unwrap();
        let out = client
            .call(&id(&server), "secret", json!({}), Duration::from_secs(2), Some(cert))
            .await
            .unwrap();
        assert_eq!(out, json!({"role": "worker"}));

        // A certificate issued to someone else is refused.
        let stolen = Certificate::issue(
            &authority,
            Identity::ephemeral().peer_id().clone(),
            attrs,
            Duration::from_secs(60),
        )
        .unwrap();
        let err = client
            .call(&id(&server), "secret", json!({}), Duration::from_secs(2), Some(stolen))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Authentication(_)));
    }

    #[tokio::test]
    async fn calls_resume_after_observed_reconnect() {
        let broker = MemoryBroker::new();
        let a = engine(&broker, RpcOptions::default(), TrustStore::new()).await;
        let b = engine(&broker, RpcOptions::default(), TrustStore::new()).await;
        b.handle("echo", |req| async move { Ok(req.payload) });
        let mut states = a.connection().watch_state();
        states.borrow_and_update();

        // Hold the broker down so the transient state lasts.
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
        assert!(matches!(
            a.call(&id(&b), "echo", json!(1), Duration::from_secs(1), None).await,
            Err(MeshError::NotConnected)
        ));

        broker.set_reachable("broker", true);
        let seen = tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s != SessionState::Reconnecting),
        )
        .await
        .unwrap()
        .map(|s| *s)
        .unwrap();
        assert_eq!(seen, SessionState::Connected);
        let b_state = tokio::time::timeout(
            Duration::from_secs(5),
            b.connection().wait_for_state(SessionState::Connected),
        )
        .await
        .unwrap();
        assert_eq!(b_state, SessionState::Connected);

        let out = a
            .call(&id(&b), "echo", json!(2), Duration::from_secs(2), None)
            .await
            .unwrap();
        assert_eq!(out, json!(2));
        assert_eq!(a.pending_count(), 0);
    }

    #[tokio::test]
    async fn calls_fail_fast_when_disconnected() {
        let (a, b) = pair().await;
        a.connection().disconnect().await;
        let err = a
            .call(&id(&b), "echo", json!({}), Duration::from_secs(2), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::NotConnected));
        assert!(matches!(
            a.call_stream(&id(&b), "echo", json!({}), Duration::from_secs(2), None)
                .await,
            Err(MeshError::NotConnected)
        ));
    }
}
