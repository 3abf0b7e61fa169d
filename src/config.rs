use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::Path;

use crate::crypto::{sha256, NodeSeed};
use crate::overlay::peer::NodeInfo;

/// Main configuration for the node
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub node: NodeConfig,
    pub overlay: OverlayConfig,
}

/// Database configuration
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// Node identity and protocol versions
#[derive(Clone, Deserialize)]
pub struct NodeConfig {
    /// Hex-encoded 32-byte ed25519 seed
    pub seed: String,
    /// Passphrase whose SHA-256 is the network id; peers on a different
    /// network are rejected during the handshake
    pub network_passphrase: String,
    #[serde(default = "default_version_str")]
    pub version_str: String,
    #[serde(default = "default_protocol_version")]
    pub ledger_version: u32,
    #[serde(default = "default_protocol_version")]
    pub overlay_version: u32,
}

/// Custom Debug that redacts the seed to prevent accidental log leakage.
impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("seed", &"<redacted>")
            .field("network_passphrase", &self.network_passphrase)
            .field("version_str", &self.version_str)
            .field("ledger_version", &self.ledger_version)
            .field("overlay_version", &self.overlay_version)
            .finish()
    }
}

/// Overlay configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OverlayConfig {
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,
    #[serde(default = "default_target_peer_connections")]
    pub target_peer_connections: usize,
    /// Seed peers as "ip:port" entries; entries without a port use the
    /// default peer port
    #[serde(default)]
    pub known_peers: Vec<String>,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Default functions
fn default_peer_port() -> u16 {
    11625
}

fn default_target_peer_connections() -> usize {
    8
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_protocol_version() -> u32 {
    1
}

fn default_version_str() -> String {
    format!("lumen-node {}", env!("CARGO_PKG_VERSION"))
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| eyre!("DATABASE_URL environment variable is required"))?,
        };

        let node = NodeConfig {
            seed: env::var("NODE_SEED")
                .map_err(|_| eyre!("NODE_SEED environment variable is required"))?,
            network_passphrase: env::var("NETWORK_PASSPHRASE")
                .map_err(|_| eyre!("NETWORK_PASSPHRASE environment variable is required"))?,
            version_str: env::var("VERSION_STR").unwrap_or_else(|_| default_version_str()),
            ledger_version: env::var("LEDGER_PROTOCOL_VERSION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_protocol_version),
            overlay_version: env::var("OVERLAY_PROTOCOL_VERSION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_protocol_version),
        };

        let overlay = OverlayConfig {
            peer_port: env::var("PEER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_peer_port),
            target_peer_connections: env::var("TARGET_PEER_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_target_peer_connections),
            known_peers: env::var("KNOWN_PEERS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            metrics_port: env::var("METRICS_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_metrics_port),
        };

        let config = Config {
            database,
            node,
            overlay,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        // A malformed seed must fail at startup, not on the first handshake
        NodeSeed::from_hex(&self.node.seed)
            .wrap_err("node.seed must be a 64-char hex ed25519 seed")?;

        if self.node.network_passphrase.is_empty() {
            return Err(eyre!("node.network_passphrase cannot be empty"));
        }

        if self.overlay.peer_port == 0 {
            return Err(eyre!("overlay.peer_port cannot be 0"));
        }

        if self.overlay.target_peer_connections == 0 {
            return Err(eyre!("overlay.target_peer_connections cannot be 0"));
        }

        for peer in &self.overlay.known_peers {
            self.parse_peer(peer)
                .wrap_err_with(|| format!("invalid KNOWN_PEERS entry {:?}", peer))?;
        }

        Ok(())
    }

    /// Parse one "ip" or "ip:port" known-peer entry.
    pub fn parse_peer(&self, entry: &str) -> Result<(String, u16)> {
        match entry.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(eyre!("empty host"));
                }
                let port: u16 = port.parse().wrap_err("invalid port")?;
                if port == 0 {
                    return Err(eyre!("port cannot be 0"));
                }
                Ok((host.to_string(), port))
            }
            None => Ok((entry.to_string(), self.overlay.peer_port)),
        }
    }

    /// The identity this node presents in HELLO.
    pub fn node_info(&self) -> Result<NodeInfo> {
        Ok(NodeInfo {
            seed: NodeSeed::from_hex(&self.node.seed)?,
            network_id: sha256(self.node.network_passphrase.as_bytes()),
            ledger_version: self.node.ledger_version,
            overlay_version: self.node.overlay_version,
            version_str: self.node.version_str.clone(),
            listening_port: self.overlay.peer_port,
        })
    }
}
