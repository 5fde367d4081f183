//! Interactive walkthrough of an AgentMesh session lifecycle.
//!
//! Spins up four agents on an in-process broker and walks through presence,
//! discovery, request/response calls, streaming, certification, a broker
//! restart, and relay fallback. The output uses ANSI escape codes for
//! colored, storytelling-style terminal rendering.
//!
//! Run with:
//!   cargo run --example demo

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::{json, Value};

use agentmesh_protocol::certify::DEFAULT_VALIDITY;
use agentmesh_protocol::rpc::RemoteFault;
use agentmesh_protocol::{
    AgentNode, Attributes, Authority, Capabilities, ClientConfig, Identity, MemoryBroker,
    PeerFilter, SessionState,
};

// ---------------------------------------------------------------------------
// ANSI color constants
// ---------------------------------------------------------------------------

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const MAGENTA: &str = "\x1b[35m";
const CYAN: &str = "\x1b[36m";
const WHITE: &str = "\x1b[37m";

const BG_BLUE: &str = "\x1b[44m";

// ---------------------------------------------------------------------------
// Display helpers
// ---------------------------------------------------------------------------

fn banner(title: &str) {
    println!();
    println!("{BG_BLUE}{BOLD}{WHITE}{:68}{RESET}", "");
    println!("{BG_BLUE}{BOLD}{WHITE}    {title:<64}{RESET}");
    println!("{BG_BLUE}{BOLD}{WHITE}{:68}{RESET}", "");
    println!();
}

fn section(num: u32, title: &str) {
    println!();
    println!(
        "{BOLD}{CYAN}===[{YELLOW} Step {num} {CYAN}]=============================================================={RESET}"
    );
    println!("{BOLD}{WHITE}  {title}{RESET}");
    println!(
        "{CYAN}------------------------------------------------------------------------{RESET}"
    );
}

fn subsection(text: &str) {
    println!("{DIM}{CYAN}  >> {text}{RESET}");
}

fn success(text: &str) {
    println!("{GREEN}  [OK] {text}{RESET}");
}

fn info(label: &str, value: &str) {
    println!("{WHITE}  {BOLD}{label}:{RESET} {YELLOW}{value}{RESET}");
}

fn timing(label: &str, elapsed: Duration) {
    let ms = elapsed.as_secs_f64() * 1000.0;
    println!("{DIM}{MAGENTA}  [{label}: {ms:.2} ms]{RESET}");
}

// ---------------------------------------------------------------------------
// Setup helpers
// ---------------------------------------------------------------------------

fn config(name: &str) -> ClientConfig {
    ClientConfig {
        broker_url: "memory://hub".into(),
        display_name: Some(name.into()),
        heartbeat_interval_ms: 100,
        backoff_base_ms: 20,
        backoff_max_ms: 200,
        discovery_window_ms: 300,
        call_timeout_ms: 2_000,
        ..ClientConfig::default()
    }
}

fn caps(value: Value) -> Capabilities {
    value
        .as_object()
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

#[tokio::main]
async fn main() {
    let demo_start = Instant::now();
    let broker = MemoryBroker::new();

    banner("AGENTMESH  --  Session Lifecycle Demo");

    // -----------------------------------------------------------------------
    // Step 1: Identities
    // -----------------------------------------------------------------------

    section(1, "Agent Identities");
    subsection("Generating Ed25519 keys and deriving Bech32 peer IDs...");

    let t = Instant::now();
    let authority_identity = Identity::ephemeral();
    let authority = Authority::new(Arc::new(authority_identity.clone()), DEFAULT_VALIDITY)
        .allow_only(["role"]);
    let trusted = vec![authority.trusted_authority()];

    let translator = AgentNode::new(
        ClientConfig {
            trusted_authorities: trusted.clone(),
            require_certificate: true,
            ..config("translator")
        },
        Identity::ephemeral(),
        Arc::new(broker.clone()),
    )
    .unwrap();
    let planner = AgentNode::new(
        ClientConfig {
            trusted_authorities: trusted,
            ..config("planner")
        },
        Identity::ephemeral(),
        Arc::new(broker.clone()),
    )
    .unwrap();
    let registrar = AgentNode::new(config("registrar"), authority_identity, Arc::new(broker.clone())).unwrap();
    timing("3x identity generation", t.elapsed());

    for (name, node) in [("translator", &translator), ("planner", &planner), ("registrar", &registrar)] {
        info(name, node.peer_id().as_str());
    }

    // -----------------------------------------------------------------------
    // Step 2: Sessions
    // -----------------------------------------------------------------------

    section(2, "Broker Sessions");
    subsection("Connecting every agent to memory://hub...");

    let t = Instant::now();
    for node in [&translator, &planner, &registrar] {
        node.connect().await.unwrap();
    }
    authority.install(registrar.rpc()).unwrap();
    timing("3x connect + handshake", t.elapsed());
    success("All sessions connected; registrar serves mesh.certify");

    // -----------------------------------------------------------------------
    // Step 3: Presence & discovery
    // -----------------------------------------------------------------------

    section(3, "Presence & Discovery");
    subsection("translator announces its capabilities; planner searches for them...");

    translator.handle("translate", |req| async move {
        let text = req.payload["text"]
            .as_str()
            .ok_or_else(|| RemoteFault::invalid_params("text must be a string"))?;
        let role = req
            .certificate
            .and_then(|c| c.attributes.get("role").cloned())
            .unwrap_or(Value::Null);
        Ok(json!({"text": text.to_uppercase(), "caller_role": role}))
    });
    translator.rpc().handle_stream("spell", |req, sink| async move {
        let word = req.payload["word"].as_str().unwrap_or_default().to_string();
        for ch in word.chars() {
            sink.send(json!(ch.to_string()))
                .await
                .map_err(|e| RemoteFault::handler(e.to_string()))?;
        }
        Ok(())
    });
    translator
        .announce(caps(json!({"translate": {"langs": ["en", "pt"]}})))
        .await
        .unwrap();

    let t = Instant::now();
    let found = planner
        .discover(&PeerFilter::capability("translate"))
        .await
        .unwrap();
    timing("discovery window", t.elapsed());
    for peer in &found {
        println!(
            "  {GREEN}[FOUND]{RESET} {BOLD}{}{RESET} {DIM}{}{RESET}",
            peer.display_name.as_deref().unwrap_or("-"),
            peer.peer_id.short()
        );
    }
    assert_eq!(found.len(), 1, "expected exactly the translator");

    // -----------------------------------------------------------------------
    // Step 4: Certification
    // -----------------------------------------------------------------------

    section(4, "Certification");
    subsection("An uncertified call is refused, then planner obtains a certificate...");

    let refused = planner
        .call(translator.peer_id(), "translate", json!({"text": "hello"}))
        .await;
    info("uncertified call", &format!("{:?}", refused.err()));

    let mut attributes = Attributes::new();
    attributes.insert("role".into(), json!("planner"));
    let cert = planner.certify(authority.peer_id(), attributes).await.unwrap();
    info("issuer", &cert.issuer.short());
    info("expires", &cert.expires_at.to_rfc3339());
    success("Certificate issued and cached");

    // -----------------------------------------------------------------------
    // Step 5: Calls
    // -----------------------------------------------------------------------

    section(5, "Request / Response and Streaming");

    let t = Instant::now();
    let reply = planner
        .call(translator.peer_id(), "translate", json!({"text": "hello mesh"}))
        .await
        .unwrap();
    timing("certified call", t.elapsed());
    info("reply", &reply.to_string());

    let stream = planner
        .call_stream(translator.peer_id(), "spell", json!({"word": "mesh"}))
        .await
        .unwrap();
    let letters: Vec<String> = stream
        .filter_map(|item| async move { item.ok().map(|v| v.to_string()) })
        .collect()
        .await;
    info("streamed", &letters.join(" "));
    success("Single and streaming calls completed");

    // -----------------------------------------------------------------------
    // Step 6: Broker restart
    // -----------------------------------------------------------------------

    section(6, "Broker Restart");
    subsection("Severing every link; sessions reconnect with backoff...");

    let t = Instant::now();
    broker.sever_all();
    while !(planner.status().reconnects >= 1
        && planner.state() == SessionState::Connected
        && translator.state() == SessionState::Connected)
    {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    timing("recovery", t.elapsed());
    let reply = planner
        .call(translator.peer_id(), "translate", json!({"text": "still here"}))
        .await
        .unwrap();
    info("reply after restart", &reply.to_string());
    success("Same peer IDs, subscriptions restored");

    // -----------------------------------------------------------------------
    // Step 7: Relay fallback
    // -----------------------------------------------------------------------

    section(7, "Relay Fallback");
    subsection("The hub becomes unreachable for new links; a newcomer uses a relay...");

    broker.set_reachable("hub", false);
    let newcomer = AgentNode::new(
        ClientConfig {
            relay_urls: vec!["memory://relay-eu".into()],
            ..config("newcomer")
        },
        Identity::ephemeral(),
        Arc::new(broker.clone()),
    )
    .unwrap();
    newcomer.connect().await.unwrap();
    let status = newcomer.status();
    info("endpoint", status.endpoint.as_deref().unwrap_or("-"));
    info("relay in use", &status.relay_in_use.to_string());
    let peers = newcomer.discover(&PeerFilter::any()).await.unwrap();
    info("peers visible through relay", &peers.len().to_string());

    // -----------------------------------------------------------------------
    // Final Summary
    // -----------------------------------------------------------------------

    for node in [&newcomer, &planner, &translator, &registrar] {
        node.disconnect().await;
    }

    banner("DEMO COMPLETE");
    info("Agents", "4 (translator, planner, registrar, newcomer)");
    info("Signing algorithm", "Ed25519 (ed25519-dalek 2.1)");
    info("Peer ID format", "Bech32 over BLAKE3 of the public key");
    info("Total time", &format!("{:.2} ms", demo_start.elapsed().as_secs_f64() * 1000.0));
    println!();
}
