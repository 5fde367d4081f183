//! End-to-end integration tests for the AgentMesh client core.
//!
//! Every test builds a small mesh of [`AgentNode`]s on one in-process
//! [`MemoryBroker`] and drives it through the public API only: connect,
//! announce, discover, call, stream, certify, listen, disconnect. Broker
//! faults (restart, unreachable hosts, bad tokens) are injected through the
//! broker's test hooks.
//!
//! Each test owns its broker. No shared state, no ordering dependencies.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use agentmesh_protocol::certify::DEFAULT_VALIDITY;
use agentmesh_protocol::rpc::RemoteFault;
use agentmesh_protocol::{
    AgentNode, Attributes, Authority, Capabilities, ClientConfig, EnvelopeKind, Identity,
    MemoryBroker, MeshError, PeerFilter, SessionState,
};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

/// Fast timings so failure paths finish in well under a second.
fn config(url: &str) -> ClientConfig {
    ClientConfig {
        broker_url: url.into(),
        heartbeat_interval_ms: 50,
        max_missed_heartbeats: 2,
        backoff_base_ms: 10,
        backoff_max_ms: 100,
        max_retries: 5,
        call_timeout_ms: 2_000,
        discovery_window_ms: 300,
        announce_interval_ms: 1_000,
        ..ClientConfig::default()
    }
}

/// Logs go to the test writer; set `RUST_LOG` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn build(broker: &MemoryBroker, config: ClientConfig, identity: Identity) -> AgentNode {
    init_tracing();
    AgentNode::new(config, identity, Arc::new(broker.clone())).unwrap()
}

async fn online(broker: &MemoryBroker, config: ClientConfig) -> AgentNode {
    let node = build(broker, config, Identity::ephemeral());
    node.connect().await.unwrap();
    node
}

fn caps(value: Value) -> Capabilities {
    value
        .as_object()
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

fn attrs(value: Value) -> Attributes {
    caps(value)
}

/// Polls `check` until it holds or three seconds pass.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

fn serve_ping(node: &AgentNode) {
    node.handle("ping", |_| async move { Ok(json!({"pong": true})) });
}

// ---------------------------------------------------------------------------
// Discovery & calls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn announce_discover_and_ping() {
    let broker = MemoryBroker::new();
    let a = online(&broker, ClientConfig {
        display_name: Some("alpha".into()),
        ..config("memory://broker")
    })
    .await;
    let b = online(&broker, config("memory://broker")).await;

    serve_ping(&a);
    a.announce(caps(json!({"ping": true}))).await.unwrap();

    let found = b.discover(&PeerFilter::capability("ping")).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(&found[0].peer_id, a.peer_id());
    assert_eq!(found[0].display_name.as_deref(), Some("alpha"));

    let reply = b
        .call_with(a.peer_id(), "ping", json!({}), Duration::from_secs(2), None)
        .await
        .unwrap();
    assert_eq!(reply, json!({"pong": true}));
}

#[tokio::test]
async fn discover_filters_and_excludes_self() {
    let broker = MemoryBroker::new();
    let worker = online(&broker, ClientConfig {
        display_name: Some("Translator One".into()),
        ..config("memory://broker")
    })
    .await;
    let gpu = online(&broker, config("memory://broker")).await;
    let seeker = online(&broker, config("memory://broker")).await;

    worker
        .announce(caps(json!({"translate": {"langs": ["en", "pt"]}, "gpu": false})))
        .await
        .unwrap();
    gpu.announce(caps(json!({"gpu": true}))).await.unwrap();
    seeker.announce(caps(json!({"gpu": true}))).await.unwrap();

    let gpus = seeker.discover(&PeerFilter::capability("gpu")).await.unwrap();
    assert_eq!(gpus.len(), 1, "self and gpu=false must not match");
    assert_eq!(&gpus[0].peer_id, gpu.peer_id());

    let named = seeker
        .discover(&PeerFilter::any().with_name("translator"))
        .await
        .unwrap();
    assert_eq!(named.len(), 1);
    assert_eq!(&named[0].peer_id, worker.peer_id());

    let none = seeker.discover(&PeerFilter::capability("quantum")).await.unwrap();
    assert!(none.is_empty());

    let all = seeker.discover(&PeerFilter::any()).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.windows(2).all(|w| w[0].last_seen >= w[1].last_seen));
}

#[tokio::test]
async fn silent_target_times_out() {
    let broker = MemoryBroker::new();
    let a = online(&broker, config("memory://broker")).await;
    let b = online(&broker, config("memory://broker")).await;
    b.handle("slow", |_| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(Value::Null)
    });

    for target in [b.peer_id().clone(), Identity::ephemeral().peer_id().clone()] {
        let started = Instant::now();
        let err = a
            .call_with(&target, "slow", json!({}), Duration::from_millis(300), None)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        assert!(
            matches!(err, MeshError::PeerUnreachable { timeout_ms: 300, .. }),
            "got {err:?}"
        );
        assert!(elapsed >= Duration::from_millis(250) && elapsed < Duration::from_secs(2));
    }
    assert_eq!(a.rpc().pending_count(), 0);
}

#[tokio::test]
async fn late_reply_is_dropped_and_later_calls_work() {
    let broker = MemoryBroker::new();
    let a = online(&broker, config("memory://broker")).await;
    let b = online(&broker, config("memory://broker")).await;
    serve_ping(&b);
    b.handle("slow", |req| async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        Ok(req.payload)
    });

    let err = a
        .call_with(b.peer_id(), "slow", json!("late"), Duration::from_millis(150), None)
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::PeerUnreachable { .. }), "got {err:?}");

    // The response to the abandoned call arrives in this window.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.rpc().pending_count(), 0);

    let reply = a.call(b.peer_id(), "ping", json!({})).await.unwrap();
    assert_eq!(reply, json!({"pong": true}));
}

#[tokio::test]
async fn one_shot_session_sharing_an_identity_stays_silent() {
    let broker = MemoryBroker::new();
    let shared = Identity::ephemeral();
    let server = build(&broker, config("memory://broker"), shared.clone());
    server.connect().await.unwrap();
    serve_ping(&server);
    let one_shot = build(
        &broker,
        ClientConfig {
            serve_requests: false,
            ..config("memory://broker")
        },
        shared,
    );
    one_shot.connect().await.unwrap();
    let caller = online(&broker, config("memory://broker")).await;

    for _ in 0..20 {
        let reply = caller.call(server.peer_id(), "ping", json!({})).await;
        assert_eq!(reply.unwrap(), json!({"pong": true}));
    }
    assert_eq!(one_shot.peer_id(), server.peer_id());
}

#[tokio::test]
async fn concurrent_calls_to_many_peers_stay_separate() {
    let broker = MemoryBroker::new();
    let caller = online(&broker, config("memory://broker")).await;
    let mut servers = Vec::new();
    for i in 0..3 {
        let server = online(&broker, config("memory://broker")).await;
        server.handle("who", move |req| async move {
            Ok(json!({"server": i, "n": req.payload["n"]}))
        });
        servers.push(server);
    }

    let calls = (0..30).map(|n| {
        let server = n % 3;
        let target = servers[server].peer_id().clone();
        let caller = &caller;
        async move {
            let out = caller
                .call_with(&target, "who", json!({"n": n}), Duration::from_secs(3), None)
                .await
                .unwrap();
            (server, n, out)
        }
    });
    for (server, n, out) in futures::future::join_all(calls).await {
        assert_eq!(out, json!({"server": server, "n": n}));
    }
}

#[tokio::test]
async fn remote_errors_surface_with_codes() {
    let broker = MemoryBroker::new();
    let a = online(&broker, config("memory://broker")).await;
    let b = online(&broker, config("memory://broker")).await;
    b.handle("strict", |req| async move {
        if req.payload.get("n").is_none() {
            return Err(RemoteFault::invalid_params("missing n"));
        }
        Ok(json!("ok"))
    });

    let err = a.call(b.peer_id(), "nope", json!({})).await.unwrap_err();
    assert!(matches!(err, MeshError::Remote { code: -32601, .. }));

    let err = a.call(b.peer_id(), "strict", json!({})).await.unwrap_err();
    assert!(matches!(err, MeshError::Remote { code: -32602, .. }));

    assert_eq!(a.call(b.peer_id(), "strict", json!({"n": 1})).await.unwrap(), json!("ok"));
}

#[tokio::test]
async fn streaming_call_across_nodes() {
    let broker = MemoryBroker::new();
    let a = online(&broker, config("memory://broker")).await;
    let b = online(&broker, config("memory://broker")).await;
    b.rpc().handle_stream("tokens", |req, sink| async move {
        let text = req.payload["text"].as_str().unwrap_or_default().to_string();
        for word in text.split_whitespace() {
            sink.send(json!(word))
                .await
                .map_err(|e| RemoteFault::handler(e.to_string()))?;
        }
        Ok(())
    });

    let stream = a
        .call_stream(b.peer_id(), "tokens", json!({"text": "hello brave new mesh"}))
        .await
        .unwrap();
    let words: Vec<Value> = stream.map(|item| item.unwrap()).collect().await;
    assert_eq!(words, vec![json!("hello"), json!("brave"), json!("new"), json!("mesh")]);
    assert_eq!(a.rpc().pending_count(), 0);
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disconnect_fails_fast() {
    let broker = MemoryBroker::new();
    let a = online(&broker, config("memory://broker")).await;
    let b = online(&broker, config("memory://broker")).await;

    a.disconnect().await;
    a.disconnect().await;
    assert_eq!(a.state(), SessionState::Closed);

    let started = Instant::now();
    assert!(matches!(
        a.call(b.peer_id(), "ping", json!({})).await,
        Err(MeshError::NotConnected)
    ));
    assert!(matches!(
        a.discover(&PeerFilter::any()).await,
        Err(MeshError::NotConnected)
    ));
    assert!(matches!(
        a.announce(Capabilities::new()).await,
        Err(MeshError::NotConnected)
    ));
    assert!(started.elapsed() < Duration::from_millis(100));
    assert!(matches!(a.connect().await, Err(MeshError::NotConnected)));
}

#[tokio::test]
async fn broker_restart_reconnects_and_keeps_serving() {
    let broker = MemoryBroker::new();
    let a = online(&broker, config("memory://broker")).await;
    let b = online(&broker, config("memory://broker")).await;
    serve_ping(&a);
    a.announce(caps(json!({"ping": true}))).await.unwrap();
    let a_id = a.peer_id().clone();

    broker.sever_all();
    eventually("both sessions back", || async {
        a.status().reconnects >= 1
            && b.status().reconnects >= 1
            && a.state() == SessionState::Connected
            && b.state() == SessionState::Connected
    })
    .await;
    assert_eq!(a.peer_id(), &a_id);

    // Inbound subscriptions came back with the new link.
    let reply = b.call(&a_id, "ping", json!({})).await.unwrap();
    assert_eq!(reply, json!({"pong": true}));

    // The announcer is still alive and answers directory queries.
    let found = b.discover(&PeerFilter::capability("ping")).await.unwrap();
    assert_eq!(found.len(), 1);
}

#[tokio::test]
async fn reconnecting_is_observable_before_connected() {
    let broker = MemoryBroker::new();
    let a = online(&broker, config("memory://broker")).await;
    let b = online(&broker, config("memory://broker")).await;
    serve_ping(&a);
    let mut states = a.connection().watch_state();
    assert_eq!(*states.borrow_and_update(), SessionState::Connected);

    // Keep the broker down long enough that the transient state is held.
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
        a.call(b.peer_id(), "ping", json!({})).await,
        Err(MeshError::NotConnected)
    ));

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

    eventually("b back online", || async { b.state() == SessionState::Connected }).await;
    let reply = b.call(a.peer_id(), "ping", json!({})).await.unwrap();
    assert_eq!(reply, json!({"pong": true}));
}

#[tokio::test]
async fn unreachable_broker_falls_back_to_relay() {
    let broker = MemoryBroker::new();
    broker.set_reachable("primary", false);
    let relayed = online(&broker, ClientConfig {
        relay_urls: vec!["memory://relay-a".into()],
        ..config("memory://primary")
    })
    .await;
    let status = relayed.status();
    assert!(status.relay_in_use);
    assert_eq!(status.endpoint.as_deref(), Some("memory://relay-a"));
    assert_eq!(broker.connections_to("relay-a"), 1);

    // Peers on the direct endpoint and on the relay share one message space.
    broker.set_reachable("primary", true);
    let direct = online(&broker, config("memory://primary")).await;
    assert!(!direct.status().relay_in_use);
    serve_ping(&relayed);
    let reply = direct.call(relayed.peer_id(), "ping", json!({})).await.unwrap();
    assert_eq!(reply, json!({"pong": true}));
}

#[tokio::test]
async fn relays_are_learned_from_announcements() {
    let broker = MemoryBroker::new();
    let relay_operator = online(&broker, ClientConfig {
        relay_hint: Some("memory://relay-r".into()),
        ..config("memory://broker")
    })
    .await;
    let observer = online(&broker, config("memory://broker")).await;

    relay_operator
        .announce(caps(json!({"relay": true})))
        .await
        .unwrap();
    eventually("relay learned", || async {
        observer
            .relays()
            .learned()
            .iter()
            .any(|e| e.host() == "relay-r")
    })
    .await;
}

#[tokio::test]
async fn exhausted_retries_close_the_session() {
    let broker = MemoryBroker::new();
    broker.set_reachable("primary", false);
    broker.set_reachable("relay-a", false);
    let node = build(
        &broker,
        ClientConfig {
            max_retries: 2,
            relay_urls: vec!["memory://relay-a".into()],
            ..config("memory://primary")
        },
        Identity::ephemeral(),
    );
    match node.connect().await {
        Err(MeshError::Connection { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected connection error, got {other:?}"),
    }
    assert_eq!(node.state(), SessionState::Closed);
    assert_eq!(broker.attempts("primary"), 3);
}

#[tokio::test]
async fn broker_token_is_enforced() {
    let broker = MemoryBroker::with_token("s3cret");
    let intruder = build(
        &broker,
        ClientConfig {
            secret_token: Some("guess".into()),
            ..config("memory://broker")
        },
        Identity::ephemeral(),
    );
    assert!(matches!(
        intruder.connect().await,
        Err(MeshError::Authentication(_))
    ));
    assert_eq!(intruder.state(), SessionState::Disconnected);

    let member = build(
        &broker,
        ClientConfig {
            secret_token: Some("s3cret".into()),
            ..config("memory://broker")
        },
        Identity::ephemeral(),
    );
    member.connect().await.unwrap();
    assert_eq!(member.state(), SessionState::Connected);
}

// ---------------------------------------------------------------------------
// Certification
// ---------------------------------------------------------------------------

struct CertifiedMesh {
    authority: Authority,
    _authority_node: AgentNode,
    client: AgentNode,
    server: AgentNode,
}

async fn certified_mesh(broker: &MemoryBroker) -> CertifiedMesh {
    certified_mesh_with(broker, DEFAULT_VALIDITY, config("memory://broker")).await
}

/// `client_config` applies to the client only; `validity` to every
/// certificate the authority issues.
async fn certified_mesh_with(
    broker: &MemoryBroker,
    validity: Duration,
    client_config: ClientConfig,
) -> CertifiedMesh {
    let authority_identity = Identity::ephemeral();
    let authority = Authority::new(Arc::new(authority_identity.clone()), validity)
        .allow_only(["role"]);
    let authority_node = build(broker, config("memory://broker"), authority_identity);
    authority_node.connect().await.unwrap();
    authority.install(authority_node.rpc()).unwrap();

    let trusted = vec![authority.trusted_authority()];
    let client = online(broker, ClientConfig {
        trusted_authorities: trusted.clone(),
        ..client_config
    })
    .await;
    let server = online(broker, ClientConfig {
        trusted_authorities: trusted,
        require_certificate: true,
        ..config("memory://broker")
    })
    .await;
    server.handle("whoami", |req| async move {
        let role = req
            .certificate
            .and_then(|c| c.attributes.get("role").cloned())
            .unwrap_or(Value::Null);
        Ok(json!({"role": role}))
    });
    CertifiedMesh {
        authority,
        _authority_node: authority_node,
        client,
        server,
    }
}

#[tokio::test]
async fn certified_call_is_accepted() {
    let broker = MemoryBroker::new();
    let mesh = certified_mesh(&broker).await;

    let err = mesh
        .client
        .call(mesh.server.peer_id(), "whoami", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Authentication(_)), "got {err:?}");

    let cert = mesh
        .client
        .certify(mesh.authority.peer_id(), attrs(json!({"role": "worker"})))
        .await
        .unwrap();
    assert_eq!(&cert.subject, mesh.client.peer_id());
    assert!(mesh.client.status().certificate.is_some_and(|c| c.valid));

    let reply = mesh
        .client
        .call(mesh.server.peer_id(), "whoami", json!({}))
        .await
        .unwrap();
    assert_eq!(reply, json!({"role": "worker"}));

    // Second request for the same attributes is served from cache.
    let again = mesh
        .client
        .certify(mesh.authority.peer_id(), attrs(json!({"role": "worker"})))
        .await
        .unwrap();
    assert_eq!(again, cert);
}

#[tokio::test]
async fn short_lived_certificate_is_renewed_between_calls() {
    let broker = MemoryBroker::new();
    let mesh = certified_mesh_with(
        &broker,
        Duration::from_millis(1_500),
        ClientConfig {
            cert_renewal_margin_ms: 500,
            ..config("memory://broker")
        },
    )
    .await;
    let first = mesh
        .client
        .certify(mesh.authority.peer_id(), attrs(json!({"role": "worker"})))
        .await
        .unwrap();
    let reply = mesh
        .client
        .call(mesh.server.peer_id(), "whoami", json!({}))
        .await
        .unwrap();
    assert_eq!(reply, json!({"role": "worker"}));

    // The first certificate has expired by now.
    tokio::time::sleep(Duration::from_millis(1_700)).await;
    let reply = mesh
        .client
        .call(mesh.server.peer_id(), "whoami", json!({}))
        .await
        .unwrap();
    assert_eq!(reply, json!({"role": "worker"}));
    let status = mesh.client.status().certificate.unwrap();
    assert!(status.valid);
    assert!(status.expires_at > first.expires_at);
}

#[tokio::test]
async fn certification_failures_are_authentication_errors() {
    let broker = MemoryBroker::new();
    let mesh = certified_mesh(&broker).await;

    // Attribute the authority refuses to vouch for.
    let err = mesh
        .client
        .certify(mesh.authority.peer_id(), attrs(json!({"admin": true})))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Authentication(_)), "got {err:?}");

    // An authority this client does not trust.
    let rogue_identity = Identity::ephemeral();
    let rogue = Authority::new(Arc::new(rogue_identity.clone()), DEFAULT_VALIDITY);
    let rogue_node = build(&broker, config("memory://broker"), rogue_identity);
    rogue_node.connect().await.unwrap();
    rogue.install(rogue_node.rpc()).unwrap();
    let err = mesh
        .client
        .certify(rogue.peer_id(), attrs(json!({"role": "worker"})))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Authentication(_)), "got {err:?}");

    // A certificate from the rogue, attached by hand, is refused by the server.
    let forged = rogue
        .issue(mesh.client.peer_id(), attrs(json!({"role": "admin"})))
        .unwrap();
    let err = mesh
        .client
        .call_with(
            mesh.server.peer_id(),
            "whoami",
            json!({}),
            Duration::from_secs(2),
            Some(forged),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Authentication(_)), "got {err:?}");
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

#[tokio::test]
async fn listener_observes_without_stealing_replies() {
    let broker = MemoryBroker::new();
    let a = online(&broker, config("memory://broker")).await;
    let b = online(&broker, config("memory://broker")).await;
    serve_ping(&b);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = a
        .listen(move |envelope| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((envelope.kind, envelope.request_id));
            }
        })
        .await
        .unwrap();

    let reply = a.call(b.peer_id(), "ping", json!({})).await.unwrap();
    assert_eq!(reply, json!({"pong": true}));

    let (kind, _) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(kind, EnvelopeKind::Response);
    assert_eq!(a.rpc().pending_count(), 0);
    listener.cancel();
}
