//! Runtime configuration for the rendezvous server and the client session

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::session::TurnPolicy;

pub const DEFAULT_RENDEZVOUS_PORT: u16 = 3479;
pub const DEFAULT_HEALTH_PORT: u16 = 3480;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Rendezvous server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// `None` disables the health endpoint
    pub health_addr: Option<String>,
    pub registry: RegistryConfig,
    pub room_max_age: Duration,
    pub sweep_interval: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", DEFAULT_RENDEZVOUS_PORT),
            health_addr: Some(format!("0.0.0.0:{}", DEFAULT_HEALTH_PORT)),
            registry: RegistryConfig::default(),
            room_max_age: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `GAMEWORK_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `GAMEWORK_*` key
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = lookup("GAMEWORK_BIND") {
            config.bind_addr = addr;
        }
        match lookup("GAMEWORK_HEALTH_BIND") {
            Some(addr) if addr.is_empty() || addr == "off" => config.health_addr = None,
            Some(addr) => config.health_addr = Some(addr),
            None => {}
        }
        if let Some(n) = parse_var::<usize>(&lookup, "GAMEWORK_MAX_PEERS")? {
            config.registry.default_max_peers = n;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "GAMEWORK_PENDING_LIMIT")? {
            config.registry.pending_limit = n;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "GAMEWORK_ROOM_MAX_AGE_SECS")? {
            config.room_max_age = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "GAMEWORK_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "GAMEWORK_PING_INTERVAL_SECS")? {
            config.ping_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "GAMEWORK_PONG_TIMEOUT_SECS")? {
            config.pong_timeout = Duration::from_secs(secs.max(1));
        }

        Ok(config)
    }
}

/// Room registry limits
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Used when CreateRoomRequest carries no maxPeers
    pub default_max_peers: usize,
    /// Upper bound for a requested maxPeers
    pub max_peers_limit: usize,
    /// Per-peer bound on messages held for a dropped connection
    pub pending_limit: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_max_peers: 8,
            max_peers_limit: 64,
            pending_limit: 64,
        }
    }
}

/// Client signaling link settings
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    /// Base delay; attempt n waits `reconnect_interval * 2^(n-1)`
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_interval: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
        }
    }
}

/// Session coordinator settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Actions held while no host is reachable
    pub max_pending_actions: usize,
    /// Negotiations not connected within this bound are failed
    pub handshake_timeout: Duration,
    pub turn_policy: TurnPolicy,
    /// maxPeers requested when this peer creates a room
    pub max_peers: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_pending_actions: 32,
            handshake_timeout: Duration::from_secs(30),
            turn_policy: TurnPolicy::Alternating,
            max_peers: None,
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn channel_defaults_match_reconnect_contract() {
        let config = ChannelConfig::new("ws://localhost:3479");
        assert_eq!(config.reconnect_interval, Duration::from_millis(1000));
        assert_eq!(config.max_reconnect_attempts, 5);
    }

    #[test]
    fn server_defaults_use_rendezvous_port() {
        let config = ServerConfig::default();
        assert!(config.bind_addr.ends_with(":3479"));
        assert_eq!(config.registry.default_max_peers, 8);
        assert!(config.health_addr.is_some());
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let config = ServerConfig::from_lookup(vars(&[
            ("GAMEWORK_BIND", "127.0.0.1:9000"),
            ("GAMEWORK_HEALTH_BIND", "off"),
            ("GAMEWORK_MAX_PEERS", " 4 "),
            ("GAMEWORK_PING_INTERVAL_SECS", "0"),
            ("GAMEWORK_PONG_TIMEOUT_SECS", "3"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert!(config.health_addr.is_none());
        assert_eq!(config.registry.default_max_peers, 4);
        assert_eq!(config.registry.pending_limit, 64);
        assert_eq!(config.ping_interval, Duration::from_secs(1));
        assert_eq!(config.pong_timeout, Duration::from_secs(3));
        assert_eq!(config.room_max_age, Duration::from_secs(60 * 60));
    }

    #[test]
    fn bad_values_name_the_key() {
        let result = ServerConfig::from_lookup(vars(&[("GAMEWORK_PONG_TIMEOUT_SECS", "soon")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { key: "GAMEWORK_PONG_TIMEOUT_SECS", ref value })
                if value == "soon"
        ));
        assert!(parse_var::<usize>(vars(&[]), "GAMEWORK_MAX_PEERS").unwrap().is_none());
    }
}
