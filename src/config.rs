//! # Client Configuration
//!
//! All tunables for one client instance. Values come from three layers,
//! later layers winning: built-in defaults, an optional JSON config file,
//! and command-line flags. Unknown keys in the file are ignored so a shared
//! config can carry deployment-specific extras.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::identity::{validate_name, validate_namespace, PeerId};

/// Registration TTL bounds accepted by the directory (seconds).
pub const MIN_TTL_SECONDS: u64 = 1;
pub const MAX_TTL_SECONDS: u64 = 86_400;

/// Default registration TTL requested from the directory.
pub const DEFAULT_TTL_SECONDS: u64 = 7_200;

/// Default interval between DISCOVER sweeps.
pub const DEFAULT_DISCOVERY_INTERVAL: u64 = 15;

/// Default keep-alive PING interval per session.
pub const DEFAULT_PING_INTERVAL: u64 = 30;

/// Default reconnect attempt cap before a peer is marked failed.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default base for the exponential reconnect backoff (seconds).
pub const DEFAULT_RECONNECT_BACKOFF_BASE: u64 = 1;

/// Default cap on concurrently open sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigError(String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Effective client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local part of the identity.
    pub name: String,
    /// Realm part of the identity.
    pub namespace: String,
    /// Directory endpoint.
    pub rendezvous_host: String,
    pub rendezvous_port: u16,
    /// Port the inbound session listener binds.
    pub listen_port: u16,
    /// Registration TTL requested from the directory (seconds).
    pub ttl_seconds: u64,
    /// Seconds between DISCOVER sweeps.
    pub discovery_interval: u64,
    /// Seconds between keep-alive PINGs per session.
    pub ping_interval: u64,
    /// Outbound attempts per peer before it is marked failed.
    pub max_reconnect_attempts: u32,
    /// Base of the exponential reconnect backoff (seconds).
    pub reconnect_backoff_base: u64,
    /// Cap on concurrently open sessions.
    pub max_sessions: usize,
    /// Hop limit stamped on originated SEND/PUB/WHO_HAS.
    pub relay_ttl: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "anon".to_string(),
            namespace: "lobby".to_string(),
            rendezvous_host: "127.0.0.1".to_string(),
            rendezvous_port: 8080,
            listen_port: 6000,
            ttl_seconds: DEFAULT_TTL_SECONDS,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_backoff_base: DEFAULT_RECONNECT_BACKOFF_BASE,
            max_sessions: DEFAULT_MAX_SESSIONS,
            relay_ttl: crate::wire::DEFAULT_RELAY_TTL,
        }
    }
}

impl Config {
    /// Load from a JSON file over the defaults. Recognized keys override;
    /// unknown keys are ignored.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
        Ok(config)
    }

    /// The local `name@namespace` identity.
    pub fn peer_id(&self) -> Result<PeerId, crate::identity::IdentityError> {
        PeerId::new(&self.name, &self.namespace)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval)
    }

    /// Check every field against the protocol limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_name(&self.name).map_err(|e| ConfigError(e.to_string()))?;
        validate_namespace(&self.namespace).map_err(|e| ConfigError(e.to_string()))?;
        if self.rendezvous_host.is_empty() {
            return Err(ConfigError("rendezvous_host must not be empty".into()));
        }
        if self.rendezvous_port == 0 {
            return Err(ConfigError("rendezvous_port must be 1..=65535".into()));
        }
        if self.listen_port == 0 {
            return Err(ConfigError("listen_port must be 1..=65535".into()));
        }
        if !(MIN_TTL_SECONDS..=MAX_TTL_SECONDS).contains(&self.ttl_seconds) {
            return Err(ConfigError(format!(
                "ttl_seconds must be {}..={}, got {}",
                MIN_TTL_SECONDS, MAX_TTL_SECONDS, self.ttl_seconds
            )));
        }
        if self.discovery_interval == 0 {
            return Err(ConfigError("discovery_interval must be positive".into()));
        }
        if self.ping_interval == 0 {
            return Err(ConfigError("ping_interval must be positive".into()));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError("max_sessions must be positive".into()));
        }
        if self.relay_ttl == 0 {
            return Err(ConfigError("relay_ttl must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.ttl_seconds, 7200);
        assert_eq!(config.discovery_interval, 15);
        assert_eq!(config.ping_interval, 30);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.max_sessions, 64);
        assert_eq!(config.relay_ttl, 8);
    }

    #[test]
    fn peer_id_combines_name_and_namespace() {
        let config = Config {
            name: "alice".into(),
            namespace: "CIC".into(),
            ..Config::default()
        };
        assert_eq!(config.peer_id().unwrap().to_string(), "alice@CIC");
    }

    #[test]
    fn validation_rejects_out_of_range_fields() {
        let mut config = Config::default();
        config.ttl_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ttl_seconds = 86_401;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.name = "a".repeat(65);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.listen_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_overrides_and_ignores_unknown_keys() {
        let dir = std::env::temp_dir().join("parley-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(
            &path,
            r#"{"name":"bob","listen_port":6002,"color_scheme":"dark"}"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.name, "bob");
        assert_eq!(config.listen_port, 6002);
        assert_eq!(config.namespace, "lobby");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = std::env::temp_dir().join("parley-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Config::from_file(&path).is_err());
    }
}
