//! Server configuration.
//!
//! Settings come from an optional TOML file; command-line flags parsed in the
//! binary override individual fields afterwards.

use crate::error::ServerError;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Upper bound for the slot pool regardless of configuration.
pub const MAX_SLOTS: usize = 1024;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Size of the slot pool.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Logical ticks per second.
    #[serde(default = "default_tick_rate")]
    pub tick_rate: u32,
    /// Interval between network polls in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_client_timeout_secs")]
    pub client_timeout_secs: u64,
    /// The server owns world state; host arbitration is disabled.
    #[serde(default)]
    pub authoritative: bool,
    #[serde(default)]
    pub big_mode: bool,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_game_type")]
    pub game_type: String,
    #[serde(default = "default_map_name")]
    pub map_name: String,
    #[serde(default)]
    pub rcon_password: Option<String>,
    /// Proxies whose out-of-band traffic bypasses address rate limiting.
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
    /// Initial overrides for named rate limiters.
    #[serde(default)]
    pub rate_limiters: HashMap<String, RateLimitOverride>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct RateLimitOverride {
    pub rate: f64,
    pub burst: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    30120
}

fn default_max_clients() -> usize {
    48
}

fn default_tick_rate() -> u32 {
    20
}

fn default_poll_interval_ms() -> u64 {
    2
}

fn default_client_timeout_secs() -> u64 {
    30
}

fn default_hostname() -> String {
    "default session server".to_string()
}

fn default_game_type() -> String {
    "freeroam".to_string()
}

fn default_map_name() -> String {
    "world".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_clients: default_max_clients(),
            tick_rate: default_tick_rate(),
            poll_interval_ms: default_poll_interval_ms(),
            client_timeout_secs: default_client_timeout_secs(),
            authoritative: false,
            big_mode: false,
            hostname: default_hostname(),
            game_type: default_game_type(),
            map_name: default_map_name(),
            rcon_password: None,
            trusted_proxies: Vec::new(),
            rate_limiters: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Loads `path` if it exists, otherwise returns defaults.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&contents)?;
            info!("Loaded configuration from {}", path.display());
            Ok(config.normalized())
        } else {
            info!("No {} found, using default configuration", path.display());
            Ok(Self::default())
        }
    }

    /// Clamps values into ranges the server can operate with.
    pub fn normalized(mut self) -> Self {
        self.max_clients = self.max_clients.clamp(1, MAX_SLOTS);
        self.tick_rate = self.tick_rate.clamp(1, 1000);
        self.poll_interval_ms = self.poll_interval_ms.max(1);
        self
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate as f64)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn rcon_enabled(&self) -> bool {
        self.rcon_password
            .as_deref()
            .map_or(false, |password| !password.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.max_clients, 48);
        assert_eq!(config.tick_rate, 20);
        assert!(!config.authoritative);
        assert!(!config.rcon_enabled());
        assert_eq!(config.tick_duration(), Duration::from_millis(50));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            port = 40000
            authoritative = true
            rcon_password = "hunter2"
            trusted_proxies = ["10.0.0.1"]

            [rate_limiters.netEvent]
            rate = 10.0
            burst = 20.0
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 40000);
        assert_eq!(config.max_clients, 48);
        assert!(config.authoritative);
        assert!(config.rcon_enabled());
        assert_eq!(config.trusted_proxies, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(
            config.rate_limiters.get("netEvent"),
            Some(&RateLimitOverride {
                rate: 10.0,
                burst: 20.0
            })
        );
    }

    #[test]
    fn test_normalized_clamps() {
        let config = ServerConfig {
            max_clients: 0,
            tick_rate: 0,
            ..ServerConfig::default()
        }
        .normalized();

        assert_eq!(config.max_clients, 1);
        assert_eq!(config.tick_rate, 1);

        let config = ServerConfig {
            max_clients: 100_000,
            ..ServerConfig::default()
        }
        .normalized();
        assert_eq!(config.max_clients, MAX_SLOTS);
    }

    #[test]
    fn test_empty_rcon_password_disables_rcon() {
        let config = ServerConfig {
            rcon_password: Some(String::new()),
            ..ServerConfig::default()
        };
        assert!(!config.rcon_enabled());
    }
}
