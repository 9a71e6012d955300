//! Server configuration loaded at startup.
//!
//! A single JSON file describes the downstream port, the upstream session
//! fleet, and the dispatcher/monitor cadences. Every field has a default so
//! a partial file (or none at all) yields a runnable configuration.

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

fn default_port() -> u16 {
    7799
}

fn default_max_subscriptions() -> usize {
    500
}

fn default_priority() -> u8 {
    1
}

fn default_enabled() -> bool {
    true
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_maintenance_interval() -> u64 {
    60
}

fn default_max_retry() -> u32 {
    3
}

fn default_auto_failover() -> bool {
    true
}

fn default_cache_capacity() -> usize {
    50_000
}

/// One upstream endpoint the session pool connects to.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Identity of the session, unique within the pool.
    #[serde(alias = "connection_id")]
    pub session_id: String,
    /// Endpoint address handed to the feed connector.
    pub front_addr: String,
    /// Broker identifier used for the anonymous market-data login.
    pub broker_id: String,
    /// Subscription capacity of this session.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Downstream WebSocket port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upstream session fleet.
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    /// Seconds between session health sweeps.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    /// Seconds between dispatcher maintenance passes.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
    /// Retry budget for failed subscriptions.
    #[serde(default = "default_max_retry")]
    pub max_retry_count: u32,
    /// Migrate subscriptions off a failed session automatically.
    #[serde(default = "default_auto_failover")]
    pub auto_failover: bool,
    /// Pre-sized quote cache slot count.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            upstreams: Vec::new(),
            health_check_interval_secs: default_health_check_interval(),
            maintenance_interval_secs: default_maintenance_interval(),
            max_retry_count: default_max_retry(),
            auto_failover: default_auto_failover(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl ServerConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be nonzero".into()));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::Invalid("cache_capacity must be nonzero".into()));
        }
        let mut ids = HashSet::new();
        for upstream in &self.upstreams {
            if upstream.session_id.is_empty() {
                return Err(ConfigError::Invalid("upstream session_id is empty".into()));
            }
            if !ids.insert(upstream.session_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate upstream session_id: {}",
                    upstream.session_id
                )));
            }
            if upstream.max_subscriptions == 0 {
                return Err(ConfigError::Invalid(format!(
                    "upstream {} has zero max_subscriptions",
                    upstream.session_id
                )));
            }
        }
        Ok(())
    }

    /// Enabled upstream entries only.
    pub fn enabled_upstreams(&self) -> impl Iterator<Item = &UpstreamConfig> {
        self.upstreams.iter().filter(|u| u.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_runnable() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 7799);
        assert_eq!(config.health_check_interval_secs, 30);
        assert_eq!(config.maintenance_interval_secs, 60);
        assert_eq!(config.max_retry_count, 3);
        assert!(config.auto_failover);
        assert_eq!(config.cache_capacity, 50_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_full_file() {
        let config = ServerConfig::from_json(
            r#"{
                "port": 8899,
                "upstreams": [
                    {"session_id": "telecom", "front_addr": "tcp://10.0.0.1:10210", "broker_id": "9999"},
                    {"session_id": "unicom", "front_addr": "tcp://10.0.0.2:10211", "broker_id": "9999",
                     "max_subscriptions": 200, "priority": 2, "enabled": false}
                ],
                "max_retry_count": 5
            }"#,
        )
        .unwrap();

        assert_eq!(config.port, 8899);
        assert_eq!(config.upstreams.len(), 2);
        assert_eq!(config.upstreams[0].max_subscriptions, 500);
        assert!(config.upstreams[0].enabled);
        assert_eq!(config.upstreams[1].max_subscriptions, 200);
        assert_eq!(config.max_retry_count, 5);
        assert_eq!(config.enabled_upstreams().count(), 1);
    }

    #[test]
    fn rejects_duplicate_session_ids() {
        let err = ServerConfig::from_json(
            r#"{"upstreams": [
                {"session_id": "a", "front_addr": "x", "broker_id": "1"},
                {"session_id": "a", "front_addr": "y", "broker_id": "1"}
            ]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = ServerConfig::from_json(r#"{"cache_capacity": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
