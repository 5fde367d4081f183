// Copyright (c) 2026 AgentMesh Contributors. MIT License.
// See LICENSE for details.

//! # AgentMesh CLI
//!
//! Entry point for the `agentmesh` binary. Parses CLI arguments, initializes
//! logging, builds an [`AgentNode`] from configuration and runs one command.
//!
//! Results go to stdout (JSON where structured); logs go to stderr.

mod cli;
mod logging;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::signal;

use agentmesh_protocol::config::PROTOCOL_VERSION;
use agentmesh_protocol::{
    AgentNode, Attributes, Capabilities, ClientConfig, IdentityManager, NodeStatus, PeerFilter,
    PeerId,
};

use cli::{AgentMeshCli, Commands, GlobalArgs, IdentityCommand};
use metrics::AgentMetrics;

/// How often the `connect` loop samples node status into metrics.
const STATUS_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = AgentMeshCli::parse();
    logging::init_logging(&cli.global.log_level, cli.global.log_format);

    match cli.command {
        Commands::Version => {
            print_version();
            Ok(())
        }
        Commands::Identity(cmd) => identity_command(&cli.global, cmd),
        Commands::Connect(args) => connect(&cli.global, args).await,
        Commands::Status => status(&cli.global).await,
        Commands::Discover(args) => discover(&cli.global, args).await,
        Commands::Call(args) => call(&cli.global, args).await,
        Commands::Listen => listen(&cli.global).await,
        Commands::Certify(args) => certify(&cli.global, args).await,
    }
}

/// Resolves configuration: file and environment, then CLI overrides.
fn load_config(global: &GlobalArgs) -> Result<ClientConfig> {
    let mut config =
        ClientConfig::load(global.config.as_deref()).context("failed to load configuration")?;
    if let Some(dir) = &global.identity_dir {
        config.identity_dir = Some(dir.clone());
    }
    Ok(config)
}

/// Whether a session answers requests addressed to this identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Long-running agent (`connect`).
    Server,
    /// One-shot command. Requests are left to a server running under the
    /// same identity.
    Client,
}

fn session_config(mut config: ClientConfig, role: Role) -> ClientConfig {
    config.serve_requests = role == Role::Server;
    config
}

/// Opens the node and connects it.
async fn online(global: &GlobalArgs, role: Role) -> Result<AgentNode> {
    let config = session_config(load_config(global)?, role);
    let node = AgentNode::open(config).context("failed to open agent node")?;
    node.connect()
        .await
        .with_context(|| format!("failed to connect to {}", node.config().broker_url))?;
    Ok(node)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_peer(s: &str) -> Result<PeerId> {
    PeerId::parse(s).with_context(|| format!("invalid peer ID {s:?}"))
}

// ---------------------------------------------------------------------------
// identity
// ---------------------------------------------------------------------------

fn identity_command(global: &GlobalArgs, cmd: IdentityCommand) -> Result<()> {
    let config = load_config(global)?;
    let manager = IdentityManager::new(config.identity_path()?);
    match cmd {
        IdentityCommand::Generate { force } => {
            let identity = manager.generate(force).context("failed to generate identity")?;
            println!("Identity generated.");
            println!("  Peer ID    : {}", identity.peer_id());
            println!("  Public key : {}", identity.public_key().to_hex());
            println!("  Directory  : {}", manager.dir().display());
        }
        IdentityCommand::Show => {
            manager.load().context("failed to load identity")?;
            print_json(&manager.read_bundle()?)?;
        }
        IdentityCommand::Export {
            path,
            include_secret,
        } => {
            manager
                .export(&path, include_secret)
                .with_context(|| format!("failed to export identity to {}", path.display()))?;
            println!("Identity exported to {}", path.display());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// connect
// ---------------------------------------------------------------------------

async fn connect(global: &GlobalArgs, args: cli::ConnectArgs) -> Result<()> {
    let node = Arc::new(online(global, Role::Server).await?);
    let metrics = Arc::new(AgentMetrics::new().context("failed to create metrics registry")?);
    install_builtin_handlers(&node, &metrics);

    let capabilities: Capabilities = args.capabilities.into_iter().collect();
    node.announce(capabilities)
        .await
        .context("failed to announce presence")?;

    let checked = args
        .health_check
        .iter()
        .map(|p| parse_peer(p))
        .collect::<Result<Vec<_>>>()?;

    tracing::info!(
        peer_id = %node.peer_id(),
        metrics_port = ?args.metrics_port,
        health_checks = checked.len(),
        "agent online"
    );
    println!("{}", node.peer_id());

    let metrics_server = match args.metrics_port {
        Some(port) => {
            let router = axum::Router::new()
                .route("/metrics", axum::routing::get(metrics::metrics_handler))
                .with_state(Arc::clone(&metrics));
            let addr = format!("0.0.0.0:{port}");
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
            tracing::info!("metrics server listening on {addr}");
            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, router).await {
                    tracing::error!(error = %e, "metrics server error");
                }
            }))
        }
        None => None,
    };

    let sampler = {
        let node = Arc::clone(&node);
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let mut status_tick = tokio::time::interval(STATUS_SAMPLE_INTERVAL);
            let mut check_tick = tokio::time::interval(node.config().announce_interval());
            loop {
                tokio::select! {
                    _ = status_tick.tick() => metrics.observe_status(&node.status()),
                    _ = check_tick.tick() => {
                        for peer in &checked {
                            let started = Instant::now();
                            let result = node.call(peer, "ping", json!({})).await;
                            metrics.observe_call(&result, started.elapsed());
                            if let Err(e) = result {
                                tracing::warn!(peer = %peer.short(), error = %e, "health check failed");
                            }
                        }
                    }
                }
            }
        })
    };

    let mut state = node.connection().watch_state();
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
        _ = state.wait_for(|s| *s == agentmesh_protocol::SessionState::Closed) => {
            tracing::error!("session closed; giving up");
        }
    }

    sampler.abort();
    if let Some(server) = metrics_server {
        server.abort();
    }
    node.disconnect().await;
    tracing::info!("agent offline");
    Ok(())
}

/// `ping`, `echo` and `mesh.status`, served by every online CLI agent.
fn install_builtin_handlers(node: &Arc<AgentNode>, metrics: &Arc<AgentMetrics>) {
    let served = metrics.requests_served_total.clone();
    node.handle("ping", move |_| {
        served.inc();
        async move { Ok(json!({"pong": true})) }
    });

    let served = metrics.requests_served_total.clone();
    node.handle("echo", move |req| {
        served.inc();
        async move { Ok(req.payload) }
    });

    let served = metrics.requests_served_total.clone();
    let weak = Arc::downgrade(node);
    node.handle("mesh.status", move |_| {
        served.inc();
        let status = weak.upgrade().map(|n| n.status());
        async move {
            let status = status.ok_or_else(|| {
                agentmesh_protocol::RemoteFault::handler("agent shutting down")
            })?;
            serde_json::to_value(status)
                .map_err(|e| agentmesh_protocol::RemoteFault::handler(e.to_string()))
        }
    });
}

// ---------------------------------------------------------------------------
// one-shot commands
// ---------------------------------------------------------------------------

/// Reports local state even when the broker cannot be reached.
async fn status(global: &GlobalArgs) -> Result<()> {
    let mut config = session_config(load_config(global)?, Role::Client);
    config.max_retries = 0;
    let node = AgentNode::open(config).context("failed to open agent node")?;
    if let Err(e) = node.connect().await {
        tracing::warn!(error = %e, broker = %node.config().broker_url, "broker unreachable");
    }
    print!("{}", render_status(&node.status()));
    node.disconnect().await;
    Ok(())
}

fn render_status(status: &NodeStatus) -> String {
    let connection = if status.state.is_connected() {
        let endpoint = status.endpoint.as_deref().unwrap_or("-");
        let via = if status.relay_in_use { " via relay" } else { "" };
        format!("Online ({endpoint}{via})")
    } else {
        "Offline".to_string()
    };
    let certificate = match &status.certificate {
        Some(cert) => format!(
            "{} from {}, expires {}",
            if cert.valid { "valid" } else { "invalid" },
            cert.issuer.short(),
            cert.expires_at.to_rfc3339()
        ),
        None => "none".to_string(),
    };
    let mut out = String::new();
    out.push_str(&format!("Peer ID     : {}\n", status.peer_id));
    out.push_str(&format!("Connection  : {connection}\n"));
    out.push_str(&format!("Certificate : {certificate}\n"));
    if status.state.is_connected() {
        out.push_str(&format!("Known peers : {}\n", status.known_peers));
        out.push_str(&format!("Reconnects  : {}\n", status.reconnects));
    }
    out
}

async fn discover(global: &GlobalArgs, args: cli::DiscoverArgs) -> Result<()> {
    let node = online(global, Role::Client).await?;
    let filter = PeerFilter {
        capability: args.capability,
        name: args.name,
    };
    let window = args
        .window_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| node.config().discovery_window());
    let peers = node.discovery().discover(&filter, window).await;
    node.disconnect().await;
    let peers = peers.context("discovery failed")?;
    if peers.is_empty() {
        tracing::info!("no peers found");
    }
    print_json(&peers)
}

async fn call(global: &GlobalArgs, args: cli::CallArgs) -> Result<()> {
    let target = parse_peer(&args.peer)?;
    let node = online(global, Role::Client).await?;
    let timeout = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| node.config().call_timeout());
    let certificate = node.certification().presentable(timeout).await;

    let result = if args.stream {
        call_streaming(&node, &target, &args.action, args.payload, timeout, certificate).await
    } else {
        let started = Instant::now();
        let result = node
            .call_with(&target, &args.action, args.payload, timeout, certificate)
            .await;
        tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "call finished");
        result
            .map_err(anyhow::Error::from)
            .and_then(|value| print_json(&value))
    };
    node.disconnect().await;
    result.with_context(|| format!("call {} on {} failed", args.action, target.short()))
}

/// Prints each streamed item as one JSON line.
async fn call_streaming(
    node: &AgentNode,
    target: &PeerId,
    action: &str,
    payload: Value,
    idle_timeout: Duration,
    certificate: Option<agentmesh_protocol::Certificate>,
) -> Result<()> {
    let mut stream = node
        .rpc()
        .call_stream(target, action, payload, idle_timeout, certificate)
        .await?;
    while let Some(item) = stream.next().await {
        println!("{}", serde_json::to_string(&item?)?);
    }
    Ok(())
}

async fn listen(global: &GlobalArgs) -> Result<()> {
    let node = online(global, Role::Client).await?;
    let listener = node
        .listen(|envelope| async move {
            match serde_json::to_string(&envelope) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "failed to print envelope"),
            }
        })
        .await
        .context("failed to start listener")?;
    tracing::info!(subject = listener.subject(), "listening; Ctrl+C to stop");
    shutdown_signal().await;
    listener.cancel();
    node.disconnect().await;
    Ok(())
}

async fn certify(global: &GlobalArgs, args: cli::CertifyArgs) -> Result<()> {
    let authority = parse_peer(&args.authority)?;
    if args.attributes.is_empty() {
        bail!("at least one --attr is required");
    }
    let attributes: Attributes = args.attributes.into_iter().collect();
    let node = online(global, Role::Client).await?;
    let result = node.certify(&authority, attributes).await;
    node.disconnect().await;
    let cert = result.with_context(|| format!("certification by {} failed", authority.short()))?;
    print_json(&cert)
}

/// Prints version information to stdout.
fn print_version() {
    println!("agentmesh {}", env!("CARGO_PKG_VERSION"));
    println!("protocol  {PROTOCOL_VERSION}");
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. If a handler cannot be
/// installed, that signal is simply never observed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
