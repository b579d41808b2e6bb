//! Configuration
//!
//! TOML-based configuration with support for:
//! - MQTT and MQTT-SN listeners (bind address, mount point, limits)
//! - Delivery limits (inflight window, queue depth, retry interval)
//! - Password file, ACL file and client id prefixes
//! - Persistence directory and autosave interval
//! - Bridge connections
//! - Environment variable overrides (WRENMQ_* prefix)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

mod bridge;

pub use bridge::{BridgeConfig, BridgeDirection, BridgeProtocol, BridgeTopicRule, StartType};

#[cfg(test)]
mod tests;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading the config file
    Io(std::io::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    /// MQTT/TCP listeners
    pub listener: Vec<ListenerEntry>,
    /// MQTT-SN/UDP listeners
    pub sn_listener: Vec<SnListenerEntry>,
    pub limits: LimitsConfig,
    pub auth: AuthConfig,
    pub persistence: PersistenceConfig,
    pub bridge: Vec<BridgeConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// One MQTT/TCP listener
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerEntry {
    /// Bind address
    pub bind: SocketAddr,

    /// Prefix transparently prepended to all topics from clients on this
    /// listener
    #[serde(default)]
    pub mount_point: Option<String>,

    /// Per-listener connection cap (0 = unlimited)
    #[serde(default)]
    pub max_connections: usize,
}

/// One MQTT-SN/UDP listener
#[derive(Debug, Clone, Deserialize)]
pub struct SnListenerEntry {
    /// Bind address
    pub bind: SocketAddr,

    /// Gateway id announced to searching clients
    #[serde(default = "default_gateway_id")]
    pub gateway_id: u8,

    /// Pre-defined topic ids shared by every client on this listener
    #[serde(default)]
    pub predefined_topics: Vec<PredefinedTopic>,
}

/// A pre-defined MQTT-SN topic id
#[derive(Debug, Clone, Deserialize)]
pub struct PredefinedTopic {
    pub id: u16,
    pub topic: String,
}

fn default_gateway_id() -> u8 {
    1
}

/// Delivery limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum accepted packet size in bytes
    pub max_packet_size: usize,

    /// Per-client cap on concurrent QoS>=1 outbound exchanges
    pub max_inflight_messages: usize,

    /// Per-client cap on queued messages
    pub max_queued_messages: usize,

    /// Retransmission interval
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 1024 * 1024,
            max_inflight_messages: 20,
            max_queued_messages: 1000,
            retry_interval: Duration::from_secs(20),
        }
    }
}

/// Authentication and authorization configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Password file of `username:password` lines; unset disables
    /// authentication
    pub password_file: Option<PathBuf>,

    /// ACL file; checks run only when a password file is also configured
    pub acl_file: Option<PathBuf>,

    /// Accept connections without credentials
    pub allow_anonymous: Option<bool>,

    /// Client id prefixes accepted on connect (empty = all)
    pub clientid_prefixes: Vec<String>,
}

impl AuthConfig {
    pub fn allow_anonymous(&self) -> bool {
        self.allow_anonymous.unwrap_or(true)
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,

    /// Directory holding the persistence files
    pub dir: PathBuf,

    /// Autosave interval; zero saves only at shutdown and on SIGHUP
    #[serde(with = "humantime_serde")]
    pub autosave_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from("."),
            autosave_interval: Duration::from_secs(0),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, applying `${VAR}` environment
    /// substitution and WRENMQ_* overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        let cfg = config::Config::builder()
            .add_source(File::from_str(&substituted, FileFormat::Toml))
            .add_source(Environment::with_prefix("WRENMQ").separator("__"))
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        let cfg = config::Config::builder()
            .add_source(Environment::with_prefix("WRENMQ").separator("__"))
            .build()?;
        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for bridge in &self.bridge {
            if bridge.addresses.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "bridge connection {} has no addresses",
                    bridge.name
                )));
            }
            if bridge
                .topics
                .iter()
                .any(|rule| crate::topic::validate_topic_filter(&rule.pattern).is_err())
            {
                return Err(ConfigError::Validation(format!(
                    "bridge connection {} has an invalid topic pattern",
                    bridge.name
                )));
            }
        }
        if self.auth.acl_file.is_some() && self.auth.password_file.is_none() {
            return Err(ConfigError::Validation(
                "acl_file requires password_file".to_string(),
            ));
        }
        Ok(())
    }

    /// Listeners to bind, defaulting to plain MQTT on 1883
    pub fn listeners(&self) -> Vec<ListenerEntry> {
        if self.listener.is_empty() {
            vec![ListenerEntry {
                bind: "0.0.0.0:1883".parse().unwrap(),
                mount_point: None,
                max_connections: 0,
            }]
        } else {
            self.listener.clone()
        }
    }
}
