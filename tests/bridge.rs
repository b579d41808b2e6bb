//! Bridge end-to-end tests
//!
//! Two brokers in one process: a local broker with a bridge connection to
//! a remote broker, exercising prefix rewriting in both directions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use wrenmq::bridge::BridgeManager;
use wrenmq::broker::{Broker, BrokerConfig, ListenerConfig, SnListenerConfig};
use wrenmq::codec::{Decoder, Encoder};
use wrenmq::config::{BridgeConfig, BridgeDirection, BridgeProtocol, BridgeTopicRule};
use wrenmq::hooks::DefaultHooks;
use wrenmq::protocol::{Connect, Packet, Publish, QoS, Subscribe};
use wrenmq::topic::Priority;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(23000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(2, Ordering::SeqCst)
}

fn config(port: u16) -> BrokerConfig {
    BrokerConfig {
        listeners: vec![ListenerConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], port)),
            mount_point: None,
            max_connections: 0,
        }],
        sn_listeners: Vec::new(),
        max_packet_size: 1024 * 1024,
        max_inflight_messages: 20,
        max_queued_messages: 1000,
        retry_interval: Duration::from_secs(20),
        clientid_prefixes: Vec::new(),
    }
}

async fn start_plain_broker(port: u16) -> Arc<Broker> {
    let broker = Arc::new(Broker::new(config(port), Arc::new(DefaultHooks)));
    let runner = broker.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker
}

/// Broker with a TCP listener on `port` and an MQTT-SN gateway on `port+1`
async fn start_sn_broker(port: u16) -> Arc<Broker> {
    let mut cfg = config(port);
    cfg.sn_listeners = vec![SnListenerConfig {
        bind: SocketAddr::from(([127, 0, 0, 1], port + 1)),
        gateway_id: 1,
        predefined_topics: Vec::new(),
    }];
    let broker = Arc::new(Broker::new(cfg, Arc::new(DefaultHooks)));
    let runner = broker.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker
}

async fn start_bridged_broker_with(
    port: u16,
    remote_port: u16,
    protocol: BridgeProtocol,
) -> Arc<Broker> {
    let bridge_cfg = BridgeConfig {
        name: "uplink".to_string(),
        addresses: vec![format!("127.0.0.1:{}", remote_port)],
        protocol,
        topics: vec![BridgeTopicRule {
            pattern: "data/#".to_string(),
            direction: BridgeDirection::Both,
            local_prefix: Some("site/".to_string()),
            remote_prefix: None,
            priority: Priority::Normal,
        }],
        ..Default::default()
    };

    let mut broker = Broker::new(config(port), Arc::new(DefaultHooks));
    let manager = BridgeManager::new(broker.shared().clone(), vec![bridge_cfg]);
    broker.set_bridge_manager(manager);
    let broker = Arc::new(broker);
    let runner = broker.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker
}

async fn start_bridged_broker(port: u16, remote_port: u16) -> Arc<Broker> {
    start_bridged_broker_with(port, remote_port, BridgeProtocol::Mqtt).await
}

struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
}

impl TestClient {
    async fn connect(port: u16, client_id: &str) -> Self {
        let stream = TcpStream::connect(SocketAddr::from(([127, 0, 0, 1], port)))
            .await
            .expect("failed to connect");
        let mut client = Self {
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            read_buf: BytesMut::new(),
        };
        client
            .send(&Packet::Connect(Box::new(Connect {
                client_id: client_id.to_string(),
                ..Default::default()
            })))
            .await;
        assert!(matches!(client.recv().await, Packet::ConnAck(_)));
        client
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder.encode(packet, &mut buf).unwrap();
        self.stream.write_all(&buf).await.unwrap();
    }

    async fn recv(&mut self) -> Packet {
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.read_buf).unwrap() {
                self.read_buf.advance(consumed);
                return packet;
            }
            timeout(Duration::from_secs(10), self.stream.read_buf(&mut self.read_buf))
                .await
                .expect("timed out")
                .expect("read failed");
        }
    }

    async fn subscribe(&mut self, filter: &str) {
        self.send(&Packet::Subscribe(Subscribe {
            msg_id: 1,
            filters: vec![(filter.to_string(), QoS::AtMostOnce)],
        }))
        .await;
        assert!(matches!(self.recv().await, Packet::SubAck(_)));
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) {
        self.send(&Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from(topic),
            msg_id: None,
            payload: Bytes::copy_from_slice(payload),
        }))
        .await;
    }

    async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }
}

/// Wait for the bridge's session to appear on the remote broker
async fn wait_for_bridge(remote: &Broker) {
    for _ in 0..100 {
        if remote.shared().sessions.connected_count() > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("bridge never connected");
}

// S4: local publish on site/data/x reaches the remote as data/x; remote
// publish on data/y reaches local subscribers as site/data/y.
#[tokio::test]
async fn test_prefix_rewrite_outbound() {
    let remote_port = next_port();
    let local_port = next_port();
    let remote = start_plain_broker(remote_port).await;
    let _local = start_bridged_broker(local_port, remote_port).await;
    wait_for_bridge(&remote).await;

    let mut remote_sub = TestClient::connect(remote_port, "remote-sub").await;
    remote_sub.subscribe("data/#").await;

    let mut local_pub = TestClient::connect(local_port, "local-pub").await;
    local_pub.publish("site/data/x", b"up").await;

    let publish = remote_sub.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "data/x");
    assert_eq!(&publish.payload[..], b"up");
}

#[tokio::test]
async fn test_prefix_rewrite_inbound() {
    let remote_port = next_port();
    let local_port = next_port();
    let remote = start_plain_broker(remote_port).await;
    let _local = start_bridged_broker(local_port, remote_port).await;
    wait_for_bridge(&remote).await;

    let mut local_sub = TestClient::connect(local_port, "local-sub").await;
    local_sub.subscribe("site/data/#").await;

    let mut remote_pub = TestClient::connect(remote_port, "remote-pub").await;
    remote_pub.publish("data/y", b"down").await;

    let publish = local_sub.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "site/data/y");
    assert_eq!(&publish.payload[..], b"down");
}

#[tokio::test]
async fn test_no_publish_loop() {
    let remote_port = next_port();
    let local_port = next_port();
    let remote = start_plain_broker(remote_port).await;
    let local = start_bridged_broker(local_port, remote_port).await;
    wait_for_bridge(&remote).await;

    let mut local_sub = TestClient::connect(local_port, "local-sub").await;
    local_sub.subscribe("site/data/#").await;

    // A local publication crosses to the remote broker but must not come
    // back through the inbound direction of the same rule.
    let mut local_pub = TestClient::connect(local_port, "local-pub").await;
    local_pub.publish("site/data/loop", b"once").await;

    let publish = local_sub.expect_publish().await;
    assert_eq!(&publish.payload[..], b"once");

    // No echo within a generous window
    let extra = timeout(Duration::from_secs(1), local_sub.recv()).await;
    assert!(extra.is_err(), "publication looped back: {:?}", extra);
    let _ = local;
}

// The same prefix rewriting over an MQTT-SN bridge link: the bridge
// connects to the remote broker's gateway over UDP, registering topic
// ids before publishing.
#[tokio::test]
async fn test_sn_bridge_outbound() {
    let remote_port = next_port();
    let local_port = next_port();
    let remote = start_sn_broker(remote_port).await;
    let _local =
        start_bridged_broker_with(local_port, remote_port + 1, BridgeProtocol::MqttSn).await;
    wait_for_bridge(&remote).await;

    let mut remote_sub = TestClient::connect(remote_port, "remote-sub").await;
    remote_sub.subscribe("data/#").await;

    let mut local_pub = TestClient::connect(local_port, "local-pub").await;
    local_pub.publish("site/data/x", b"up").await;

    let publish = remote_sub.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "data/x");
    assert_eq!(&publish.payload[..], b"up");
}

#[tokio::test]
async fn test_sn_bridge_inbound() {
    let remote_port = next_port();
    let local_port = next_port();
    let remote = start_sn_broker(remote_port).await;
    let _local =
        start_bridged_broker_with(local_port, remote_port + 1, BridgeProtocol::MqttSn).await;
    wait_for_bridge(&remote).await;

    let mut local_sub = TestClient::connect(local_port, "local-sub").await;
    local_sub.subscribe("site/data/#").await;

    // Give the bridge's remote SUBSCRIBE time to complete its SUBACK
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut remote_pub = TestClient::connect(remote_port, "remote-pub").await;
    remote_pub.publish("data/y", b"down").await;

    let publish = local_sub.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "site/data/y");
    assert_eq!(&publish.payload[..], b"down");
}

#[tokio::test]
async fn test_unmatched_topics_not_forwarded() {
    let remote_port = next_port();
    let local_port = next_port();
    let remote = start_plain_broker(remote_port).await;
    let _local = start_bridged_broker(local_port, remote_port).await;
    wait_for_bridge(&remote).await;

    let mut remote_sub = TestClient::connect(remote_port, "remote-sub").await;
    remote_sub.subscribe("#").await;

    let mut local_pub = TestClient::connect(local_port, "local-pub").await;
    local_pub.publish("private/topic", b"stays").await;

    let extra = timeout(Duration::from_secs(1), remote_sub.recv()).await;
    assert!(extra.is_err(), "unmatched topic crossed the bridge");
}
