//! Configuration tests

use std::io::Write;

use pretty_assertions::assert_eq;

use super::*;

fn load(contents: &str) -> Result<Config, ConfigError> {
    let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    Config::load(file.path())
}

#[test]
fn test_defaults() {
    let config = load("").unwrap();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.limits.max_inflight_messages, 20);
    assert_eq!(config.limits.max_queued_messages, 1000);
    assert!(config.bridge.is_empty());
    assert!(!config.persistence.enabled);

    let listeners = config.listeners();
    assert_eq!(listeners.len(), 1);
    assert_eq!(listeners[0].bind.port(), 1883);
}

#[test]
fn test_listeners_and_limits() {
    let config = load(
        r#"
        [[listener]]
        bind = "127.0.0.1:1883"
        mount_point = "site/"

        [[listener]]
        bind = "127.0.0.1:2883"
        max_connections = 50

        [[sn_listener]]
        bind = "127.0.0.1:1884"
        gateway_id = 3
        predefined_topics = [{ id = 1, topic = "sensor/temp" }]

        [limits]
        max_inflight_messages = 10
        max_queued_messages = 200
        retry_interval = "30s"
        "#,
    )
    .unwrap();

    assert_eq!(config.listener.len(), 2);
    assert_eq!(config.listener[0].mount_point.as_deref(), Some("site/"));
    assert_eq!(config.listener[1].max_connections, 50);
    assert_eq!(config.sn_listener.len(), 1);
    assert_eq!(config.sn_listener[0].gateway_id, 3);
    assert_eq!(config.sn_listener[0].predefined_topics[0].id, 1);
    assert_eq!(config.limits.max_inflight_messages, 10);
    assert_eq!(config.limits.retry_interval, Duration::from_secs(30));
}

#[test]
fn test_bridge_config() {
    let config = load(
        r#"
        [[bridge]]
        name = "uplink"
        addresses = ["broker.example.com:1883", "fallback.example.com:1883"]
        start_type = "lazy"
        threshold = 25
        start_interval = 10
        max_interval = 60

        [[bridge.topics]]
        pattern = "data/#"
        direction = "both"
        local_prefix = "site/"
        "#,
    )
    .unwrap();

    let bridge = &config.bridge[0];
    assert_eq!(bridge.name, "uplink");
    assert_eq!(bridge.addresses.len(), 2);
    assert_eq!(bridge.protocol, BridgeProtocol::Mqtt);
    assert_eq!(bridge.start_type, StartType::Lazy);
    assert_eq!(bridge.threshold, 25);
    assert!(bridge.try_private);
    assert!(bridge.notifications);
    assert_eq!(bridge.clean_session, None);
    assert_eq!(bridge.effective_client_id(), "wrenmq.uplink");

    let rule = &bridge.topics[0];
    assert_eq!(rule.direction, BridgeDirection::Both);
    assert_eq!(rule.local_prefix.as_deref(), Some("site/"));
    assert_eq!(rule.remote_prefix, None);
}

#[test]
fn test_bridge_sn_protocol() {
    let config = load(
        r#"
        [[bridge]]
        name = "sensors"
        addresses = ["gw.example.com:1884"]
        protocol = "mqtt-sn"
        "#,
    )
    .unwrap();
    assert_eq!(config.bridge[0].protocol, BridgeProtocol::MqttSn);

    // The historical spelling is accepted too
    let config = load(
        r#"
        [[bridge]]
        name = "sensors"
        addresses = ["gw.example.com:1884"]
        protocol = "mqtts"
        "#,
    )
    .unwrap();
    assert_eq!(config.bridge[0].protocol, BridgeProtocol::MqttSn);
}

#[test]
fn test_bridge_without_addresses_rejected() {
    let result = load(
        r#"
        [[bridge]]
        name = "broken"
        addresses = []
        "#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_bad_bridge_pattern_rejected() {
    let result = load(
        r#"
        [[bridge]]
        name = "broken"
        addresses = ["h:1883"]
        topics = [{ pattern = "a/#/b" }]
        "#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_acl_requires_password_file() {
    let result = load(
        r#"
        [auth]
        acl_file = "acl.txt"
        "#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_env_substitution() {
    std::env::set_var("WRENMQ_TEST_LEVEL", "debug");
    let config = load(
        r#"
        [log]
        level = "${WRENMQ_TEST_LEVEL:-warn}"
        "#,
    )
    .unwrap();
    assert_eq!(config.log.level, "debug");

    std::env::remove_var("WRENMQ_TEST_LEVEL");
    let config = load(
        r#"
        [log]
        level = "${WRENMQ_TEST_LEVEL:-warn}"
        "#,
    )
    .unwrap();
    assert_eq!(config.log.level, "warn");
}
