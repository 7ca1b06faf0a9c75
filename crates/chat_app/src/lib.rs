//! Launcher wiring: command line, config file and console input.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chat_discovery::ServerConfig;
use chat_peer::PeerConfig;
use chat_proto::DEFAULT_DISCOVERY_PORT;
use clap::{Parser, Subcommand};
use serde::Deserialize;

pub const CONFIG_FILE: &str = "rendezchat.toml";

#[derive(Debug, Parser)]
#[command(name = "rendezchat", version, about = "Rendezvous-assisted P2P chat")]
pub struct Cli {
    /// Optional TOML config; command-line flags override it.
    #[arg(long, default_value = CONFIG_FILE)]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the discovery server.
    Server {
        #[arg(long)]
        listen: Option<String>,
    },
    /// Run an interactive peer.
    Peer {
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Discovery server, host:port.
        #[arg(long)]
        discovery: Option<String>,
        /// IP to advertise to other peers.
        #[arg(long)]
        ip: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub peer: PeerSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerSection {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_discovery")]
    pub discovery: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_secs: u64,
    #[serde(default = "default_connectivity_ttl")]
    pub connectivity_ttl_secs: u64,
    #[serde(default = "default_broadcast_concurrency")]
    pub broadcast_concurrency: usize,
}

fn default_listen() -> String {
    format!("0.0.0.0:{DEFAULT_DISCOVERY_PORT}")
}
fn default_heartbeat_timeout() -> u64 {
    30
}
fn default_sweep_interval() -> u64 {
    10
}
fn default_discovery() -> String {
    format!("127.0.0.1:{DEFAULT_DISCOVERY_PORT}")
}
fn default_heartbeat_interval() -> u64 {
    10
}
fn default_retry_interval() -> u64 {
    15
}
fn default_gossip_interval() -> u64 {
    5
}
fn default_connectivity_ttl() -> u64 {
    300
}
fn default_broadcast_concurrency() -> usize {
    16
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for PeerSection {
    fn default() -> Self {
        Self {
            username: None,
            port: None,
            discovery: default_discovery(),
            ip: None,
            heartbeat_interval_secs: default_heartbeat_interval(),
            retry_interval_secs: default_retry_interval(),
            gossip_interval_secs: default_gossip_interval(),
            connectivity_ttl_secs: default_connectivity_ttl(),
            broadcast_concurrency: default_broadcast_concurrency(),
        }
    }
}

/// Read `path` if it exists; a missing file means all defaults.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let text =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_config(&text).with_context(|| format!("parse {}", path.display()))
}

pub fn parse_config(text: &str) -> Result<FileConfig> {
    Ok(toml::from_str(text)?)
}

impl FileConfig {
    pub fn server_config(&self, listen: Option<String>) -> ServerConfig {
        ServerConfig {
            listen: listen.unwrap_or_else(|| self.server.listen.clone()),
            heartbeat_timeout: Duration::from_secs(self.server.heartbeat_timeout_secs),
            sweep_interval: Duration::from_secs(self.server.sweep_interval_secs),
            ..ServerConfig::default()
        }
    }

    /// Merge the `[peer]` section with command-line overrides.
    pub fn peer_config(
        &self,
        username: Option<String>,
        port: Option<u16>,
        discovery: Option<String>,
        ip: Option<String>,
    ) -> Result<PeerConfig> {
        let Some(username) = username.or_else(|| self.peer.username.clone()) else {
            bail!("a username is required (--username or [peer].username)");
        };
        let Some(port) = port.or(self.peer.port) else {
            bail!("a listen port is required (--port or [peer].port)");
        };
        Ok(PeerConfig {
            username,
            listen_port: port,
            discovery_addr: discovery.unwrap_or_else(|| self.peer.discovery.clone()),
            advertise_ip: ip.or_else(|| self.peer.ip.clone()),
            heartbeat_interval: Duration::from_secs(self.peer.heartbeat_interval_secs),
            retry_interval: Duration::from_secs(self.peer.retry_interval_secs),
            gossip_interval: Duration::from_secs(self.peer.gossip_interval_secs),
            connectivity_ttl: Duration::from_secs(self.peer.connectivity_ttl_secs),
            broadcast_concurrency: self.peer.broadcast_concurrency,
            ..PeerConfig::default()
        })
    }
}

/// One line typed at the peer console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Empty,
    Peers,
    Sync,
    Refresh,
    Direct { target: String, text: String },
    Broadcast(String),
    Invalid(String),
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    match line {
        "/peers" => return Input::Peers,
        "/sync" => return Input::Sync,
        "/refresh" => return Input::Refresh,
        _ => {}
    }
    if let Some(rest) = line.strip_prefix("/msg ") {
        return match rest.trim_start().split_once(' ') {
            Some((target, text)) if !text.trim().is_empty() => Input::Direct {
                target: target.to_string(),
                text: text.trim().to_string(),
            },
            _ => Input::Invalid("usage: /msg PEER_ID TEXT".into()),
        };
    }
    if line.starts_with('/') {
        return Input::Invalid(format!("unknown command {line}"));
    }
    Input::Broadcast(line.to_string())
}
