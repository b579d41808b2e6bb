//! WrenMQ - lightweight MQTT v3.1 / MQTT-SN broker for small devices
//!
//! A publish/subscribe message broker speaking TCP-framed MQTT v3 and
//! UDP-framed MQTT-SN, with retained-message and durable-subscription
//! persistence and outbound bridges to peer brokers.

pub mod acl;
pub mod auth;
pub mod bridge;
pub mod broker;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod topic;

pub use acl::AclProvider;
pub use auth::AuthProvider;
pub use bridge::BridgeManager;
pub use broker::{Broker, BrokerConfig};
pub use config::Config;
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use persistence::PersistenceManager;
pub use protocol::QoS;
pub use topic::SubscriptionEngine;
