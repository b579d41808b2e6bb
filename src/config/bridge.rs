//! Bridge configuration

use serde::Deserialize;

use crate::topic::Priority;

/// How a bridge connection is brought up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartType {
    /// Started at broker start, restarted on failure
    #[default]
    Automatic,
    /// Started only on request
    Manual,
    /// Started when enough messages queue up; stopped when idle
    Lazy,
    /// Started once; not restarted after it has succeeded
    Once,
}

/// Wire protocol a bridge connection speaks to the remote broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum BridgeProtocol {
    /// MQTT v3 over TCP
    #[default]
    #[serde(rename = "mqtt")]
    Mqtt,
    /// MQTT-SN over UDP ("mqtts" accepted for compatibility)
    #[serde(rename = "mqtt-sn", alias = "mqtts")]
    MqttSn,
}

/// Direction a topics rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeDirection {
    /// Local publications are forwarded to the remote broker
    #[default]
    Out,
    /// Remote publications are forwarded to the local broker
    In,
    /// Both directions
    Both,
}

/// One topics rule: a pattern with local/remote prefixes
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeTopicRule {
    /// Topic filter, without either prefix
    pub pattern: String,

    #[serde(default)]
    pub direction: BridgeDirection,

    /// Prefix the pattern carries on the local broker
    #[serde(default)]
    pub local_prefix: Option<String>,

    /// Prefix the pattern carries on the remote broker
    #[serde(default)]
    pub remote_prefix: Option<String>,

    /// Queueing priority for deliveries through this rule
    #[serde(default)]
    pub priority: Priority,
}

/// Configuration for one bridge connection
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Unique name for this connection
    pub name: String,

    /// Remote broker addresses; the first is the main address, the rest
    /// are fallbacks
    pub addresses: Vec<String>,

    /// Wire protocol spoken to the remote broker
    #[serde(default)]
    pub protocol: BridgeProtocol,

    /// Client id used on the remote broker (default: derived from name)
    #[serde(default)]
    pub client_id: Option<String>,

    /// Username for authentication
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<String>,

    /// Keepalive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,

    /// Clean session override; unset means clean iff more than one
    /// address is configured
    #[serde(default)]
    pub clean_session: Option<bool>,

    #[serde(default)]
    pub start_type: StartType,

    /// Rotate through addresses without switching back to the main one
    #[serde(default)]
    pub round_robin: bool,

    /// First attempt uses the private protocol version so the remote end
    /// sets no_local, preventing publish loops
    #[serde(default = "default_true")]
    pub try_private: bool,

    /// Publish connection-state notifications
    #[serde(default = "default_true")]
    pub notifications: bool,

    /// Override the notification topic (`%s` expands to the client id)
    #[serde(default)]
    pub notification_topic: Option<String>,

    /// Lazy connections stop after this many seconds without traffic
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Lazy connections start once this many messages are queued
    #[serde(default = "default_threshold")]
    pub threshold: usize,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// First reconnect interval in seconds
    #[serde(default)]
    pub start_interval: Option<u64>,

    /// Reconnect interval ceiling in seconds
    #[serde(default)]
    pub max_interval: Option<u64>,

    /// Topics rules
    #[serde(default)]
    pub topics: Vec<BridgeTopicRule>,
}

fn default_keepalive() -> u16 {
    60
}

fn default_true() -> bool {
    true
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_threshold() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

impl BridgeConfig {
    /// Client id used on the remote end
    pub fn effective_client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("wrenmq.{}", self.name))
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: "bridge".to_string(),
            addresses: Vec::new(),
            protocol: BridgeProtocol::default(),
            client_id: None,
            username: None,
            password: None,
            keepalive: default_keepalive(),
            clean_session: None,
            start_type: StartType::default(),
            round_robin: false,
            try_private: true,
            notifications: true,
            notification_topic: None,
            idle_timeout: default_idle_timeout(),
            threshold: default_threshold(),
            connect_timeout: default_connect_timeout(),
            start_interval: None,
            max_interval: None,
            topics: Vec::new(),
        }
    }
}
