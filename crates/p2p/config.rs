use crate::types::Node;
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use std::{net::IpAddr, path::PathBuf};
use thiserror::Error;

/// Listen port used when none is configured.
pub const DEFAULT_PORT: u16 = 8001;
pub const DEFAULT_MIN_CONNECTIONS: usize = 8;
pub const DEFAULT_MAX_CONNECTIONS: usize = 50;
/// Handshakes must complete within this window.
pub const DEFAULT_HANDSHAKE_EXPIRY_MS: u64 = 5_000;
/// Per-frame body ceiling. A maximum-size packet spans 32 frames.
pub const DEFAULT_MAX_FRAME_BODY_SIZE: usize = 128 * 1024;
/// Whole-payload ceiling after chunk reassembly.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid node key: {0}")]
    InvalidNodeKey(String),
    #[error("min_connections ({min}) must not exceed max_connections ({max})")]
    InvalidPoolBounds { min: usize, max: usize },
}

/// Recognized networking options. `Default` supplies the documented
/// defaults; deployments usually override `port`, `seed_nodes` and the
/// network identity pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// TCP and UDP listen port.
    pub port: u16,
    /// Peers on a different network id are rejected during the handshake.
    pub network_id: u8,
    /// Peers on a different protocol version are rejected during the handshake.
    pub network_version: u16,
    pub min_connections: usize,
    pub max_connections: usize,
    /// Endpoints contacted on bootstrap, as `xdnode://` URLs.
    pub seed_nodes: Vec<Node>,
    /// IPs that are never banned and never randomly evicted.
    pub trust_nodes: Vec<IpAddr>,
    /// Hex-encoded long-term signing key. When absent an ephemeral key is
    /// generated, which is only useful for tests.
    pub node_key: Option<String>,
    /// Free-form client identifier advertised in the handshake.
    pub client_id: String,
    /// Capability strings advertised in the handshake.
    pub capabilities: Vec<String>,
    /// Free-form deployment tag advertised in the handshake.
    pub tag: String,
    /// Address advertised to peers in discovery messages. Defaults to
    /// loopback, which is only useful for local setups and tests.
    pub public_ip: Option<IpAddr>,
    pub net_handshake_expiry: u64,
    pub net_max_frame_body_size: usize,
    pub net_max_packet_size: usize,
    /// Apply Snappy to frame payloads on encode.
    pub enable_frame_compression: bool,
    /// Root directory for the reputation store.
    pub data_dir: PathBuf,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            network_id: 0,
            network_version: 1,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            seed_nodes: Vec::new(),
            trust_nodes: Vec::new(),
            node_key: None,
            client_id: concat!("xdag-p2p/", env!("CARGO_PKG_VERSION")).to_owned(),
            capabilities: vec!["xdag/1".to_owned()],
            tag: String::new(),
            public_ip: None,
            net_handshake_expiry: DEFAULT_HANDSHAKE_EXPIRY_MS,
            net_max_frame_body_size: DEFAULT_MAX_FRAME_BODY_SIZE,
            net_max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            enable_frame_compression: false,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl NetConfig {
    /// Loads the configured signing key, or generates an ephemeral one when
    /// no `node_key` is set.
    pub fn signing_key(&self) -> Result<SecretKey, ConfigError> {
        match &self.node_key {
            Some(raw) => {
                let raw = raw.strip_prefix("0x").unwrap_or(raw);
                let bytes = hex::decode(raw)
                    .map_err(|e| ConfigError::InvalidNodeKey(e.to_string()))?;
                SecretKey::from_slice(&bytes)
                    .map_err(|e| ConfigError::InvalidNodeKey(e.to_string()))
            }
            None => Ok(SecretKey::new(&mut rand::rngs::OsRng)),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidPoolBounds {
                min: self.min_connections,
                max: self.max_connections,
            });
        }
        self.signing_key().map(|_| ())
    }

    pub fn reputation_dir(&self) -> PathBuf {
        self.data_dir.join("reputation")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = NetConfig::default();
        config.validate().unwrap();
        assert!(config.min_connections <= config.max_connections);
        assert!(config.net_max_frame_body_size <= config.net_max_packet_size);
    }

    #[test]
    fn node_key_round_trips_through_hex() {
        let key = SecretKey::new(&mut rand::rngs::OsRng);
        let config = NetConfig {
            node_key: Some(hex::encode(key.secret_bytes())),
            ..Default::default()
        };
        assert_eq!(config.signing_key().unwrap(), key);
    }

    #[test]
    fn malformed_node_key_is_rejected() {
        let config = NetConfig {
            node_key: Some("not-hex".into()),
            ..Default::default()
        };
        assert!(config.signing_key().is_err());
    }

    #[test]
    fn inverted_pool_bounds_are_rejected() {
        let config = NetConfig {
            min_connections: 10,
            max_connections: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn seed_nodes_deserialize_from_urls() {
        let json = r#"{
            "port": 9001,
            "seed_nodes": ["xdnode://aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa@10.0.0.1:9001"]
        }"#;
        let config: NetConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.seed_nodes.len(), 1);
        assert_eq!(config.seed_nodes[0].tcp_port, 9001);
    }
}
