//! # CLI Interface
//!
//! Defines the command-line argument structure for `agentmesh` using
//! `clap` derive. The command table is static: every subcommand the client
//! core exposes is listed here.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;

/// AgentMesh command-line client.
///
/// Manages the local agent identity, connects to the mesh, discovers peers
/// and calls them.
#[derive(Parser, Debug)]
#[command(
    name = "agentmesh",
    about = "AgentMesh agent-to-agent network client",
    version,
    propagate_version = true
)]
pub struct AgentMeshCli {
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Path to the client configuration file (TOML).
    ///
    /// When omitted, `./agentmesh.toml` and then `~/.agentmesh/config.toml`
    /// are tried.
    #[arg(long, short = 'c', global = true, env = "AGENTMESH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the agent identity. Overrides the config file.
    #[arg(long, global = true, env = "AGENTMESH_IDENTITY_DIR")]
    pub identity_dir: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Pretty, env = "AGENTMESH_LOG_FORMAT")]
    pub log_format: LogFormatArg,

    /// Default log filter when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "agentmesh=info,agentmesh_protocol=info")]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage the local agent identity.
    #[command(subcommand)]
    Identity(IdentityCommand),
    /// Connect, announce, and stay online serving built-in actions until
    /// interrupted.
    Connect(ConnectArgs),
    /// Print identity, certificate and connection state. Works offline.
    Status,
    /// Find peers on the mesh.
    Discover(DiscoverArgs),
    /// Call an action on a peer and print the result.
    Call(CallArgs),
    /// Print every envelope addressed to this agent until interrupted.
    Listen,
    /// Obtain a certificate from an authority peer.
    Certify(CertifyArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum IdentityCommand {
    /// Generate a new identity.
    Generate {
        /// Replace an existing identity. Its peer ID is lost for good.
        #[arg(long)]
        force: bool,
    },
    /// Print the public identity.
    Show,
    /// Write the public identity (and optionally the secret key) to a file.
    Export {
        /// Destination file.
        path: PathBuf,
        /// Include the secret key. The file is then readable only by you.
        #[arg(long)]
        include_secret: bool,
    },
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Capability to announce, as `name` or `name=value` (value parsed as
    /// JSON when possible). Repeatable.
    #[arg(long = "capability", short = 'C', value_parser = parse_key_value)]
    pub capabilities: Vec<(String, Value)>,

    /// Serve Prometheus metrics on this port.
    #[arg(long, env = "AGENTMESH_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Peer to ping on every announce interval. Results feed the call
    /// metrics. Repeatable.
    #[arg(long = "health-check")]
    pub health_check: Vec<String>,
}

#[derive(Args, Debug)]
pub struct DiscoverArgs {
    /// Only peers advertising this capability.
    #[arg(long)]
    pub capability: Option<String>,

    /// Only peers whose display name or peer ID contains this text.
    #[arg(long)]
    pub name: Option<String>,

    /// Collection window in milliseconds. Defaults to the configured window.
    #[arg(long)]
    pub window_ms: Option<u64>,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Peer ID of the target agent.
    pub peer: String,

    /// Action to invoke.
    pub action: String,

    /// JSON payload.
    #[arg(long, default_value = "{}", value_parser = parse_json)]
    pub payload: Value,

    /// Timeout in milliseconds. Defaults to the configured call timeout.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Treat the action as streaming and print each item as it arrives.
    #[arg(long)]
    pub stream: bool,
}

#[derive(Args, Debug)]
pub struct CertifyArgs {
    /// Peer ID of the authority.
    pub authority: String,

    /// Attribute to request, as `name=value`. Repeatable.
    #[arg(long = "attr", short = 'a', value_parser = parse_key_value)]
    pub attributes: Vec<(String, Value)>,
}

/// Parses `name` (true) or `name=value`, where value is JSON if it parses
/// and a string otherwise.
pub fn parse_key_value(s: &str) -> Result<(String, Value), String> {
    let (name, value) = match s.split_once('=') {
        Some((name, raw)) => {
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            (name, value)
        }
        None => (s, Value::Bool(true)),
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing name in {s:?}"));
    }
    Ok((name.to_string(), value))
}

pub fn parse_json(s: &str) -> Result<Value, String> {
    serde_json::from_str(s).map_err(|e| format!("invalid JSON payload: {e}"))
}
