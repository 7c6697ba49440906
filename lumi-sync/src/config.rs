//! Server configuration read from `LUMI_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::hub::HubConfig;
use crate::peer::PeerConfig;
use crate::protocol::ServerIdentity;

pub const ENV_ROOT: &str = "LUMI_ROOT";
pub const ENV_PORT: &str = "LUMI_PORT";
pub const ENV_SERVER_ID: &str = "LUMI_SERVER_ID";
pub const ENV_PEERS: &str = "LUMI_PEERS";
pub const ENV_PASSWORD: &str = "LUMI_PASSWORD";

const DEFAULT_PORT: u16 = 8080;

/// Everything needed to run one server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Directory holding the note files
    pub root_dir: PathBuf,
    /// Identity stamped on events this server produces
    pub server_id: ServerIdentity,
    /// Peer endpoints to dial, e.g. `ws://host:8080/ws/peer`
    pub peers: Vec<String>,
    /// Shared secret clients pass as `?token=`
    pub token: String,
    pub reconnect_delay: Duration,
    pub outbound_capacity: usize,
    pub seen_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let hub = HubConfig::default();
        let peer = PeerConfig::default();
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            root_dir: PathBuf::from("./notes"),
            server_id: ServerIdentity::generate(),
            peers: Vec::new(),
            token: "dev".to_string(),
            reconnect_delay: peer.reconnect_delay,
            outbound_capacity: hub.outbound_capacity,
            seen_capacity: peer.seen_capacity,
        }
    }
}

impl ServerConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset and empty values take the
    /// defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(root) = get(ENV_ROOT) {
            config.root_dir = PathBuf::from(root);
        }
        if let Some(port) = get(ENV_PORT) {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port.clone()))?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(id) = get(ENV_SERVER_ID) {
            config.server_id = ServerIdentity::new(id.trim());
        }
        if let Some(peers) = get(ENV_PEERS) {
            config.peers = parse_peers(&peers);
        }
        if let Some(token) = get(ENV_PASSWORD) {
            config.token = token;
        }
        Ok(config)
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            outbound_capacity: self.outbound_capacity,
            ..HubConfig::default()
        }
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            reconnect_delay: self.reconnect_delay,
            seen_capacity: self.seen_capacity,
        }
    }
}

/// Comma separated list; entries are trimmed and blanks dropped.
pub fn parse_peers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid port {0:?}")]
    InvalidPort(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.root_dir, PathBuf::from("./notes"));
        assert_eq!(config.token, "dev");
        assert!(config.peers.is_empty());
        assert_eq!(config.server_id.as_str().len(), 16);
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_environment_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            (ENV_ROOT, "/srv/notes"),
            (ENV_PORT, "9001"),
            (ENV_SERVER_ID, "srv-A"),
            (ENV_PEERS, " ws://b:8080/ws/peer , ,ws://c:8080/ws/peer,"),
            (ENV_PASSWORD, "s3cret"),
        ]))
        .unwrap();

        assert_eq!(config.root_dir, PathBuf::from("/srv/notes"));
        assert_eq!(config.bind_addr, "0.0.0.0:9001");
        assert_eq!(config.server_id.as_str(), "srv-A");
        assert_eq!(
            config.peers,
            vec![
                "ws://b:8080/ws/peer".to_string(),
                "ws://c:8080/ws/peer".to_string()
            ]
        );
        assert_eq!(config.token, "s3cret");
    }

    #[test]
    fn test_empty_values_use_defaults() {
        let config =
            ServerConfig::from_lookup(lookup(&[(ENV_PASSWORD, ""), (ENV_PORT, " ")])).unwrap();
        assert_eq!(config.token, "dev");
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_invalid_port() {
        let err = ServerConfig::from_lookup(lookup(&[(ENV_PORT, "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort(p) if p == "eighty"));
    }

    #[test]
    fn test_derived_component_configs() {
        let config = ServerConfig {
            reconnect_delay: Duration::from_millis(10),
            outbound_capacity: 7,
            seen_capacity: 9,
            ..ServerConfig::default()
        };
        assert_eq!(config.hub_config().outbound_capacity, 7);
        assert_eq!(config.peer_config().reconnect_delay, Duration::from_millis(10));
        assert_eq!(config.peer_config().seen_capacity, 9);
    }
}
