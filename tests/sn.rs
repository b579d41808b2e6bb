//! End-to-end MQTT-SN gateway tests
//!
//! Drives the UDP front end with raw datagrams: gateway discovery, the
//! connect/will handshake, topic registration, publishing in the
//! different topic-id modes, and cross-protocol delivery to MQTT clients.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use wrenmq::broker::{Broker, BrokerConfig, ListenerConfig, SnListenerConfig};
use wrenmq::codec::sn::{decode_datagram, encode_datagram};
use wrenmq::codec::{Decoder, Encoder};
use wrenmq::hooks::DefaultHooks;
use wrenmq::protocol::sn::*;
use wrenmq::protocol::{Connect, Packet, Publish, QoS, Subscribe};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(21000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(2, Ordering::SeqCst)
}

/// Starts a broker with one TCP and one UDP listener on (port, port+1)
async fn start_broker(port: u16) -> Arc<Broker> {
    let config = BrokerConfig {
        listeners: vec![ListenerConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], port)),
            mount_point: None,
            max_connections: 0,
        }],
        sn_listeners: vec![SnListenerConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], port + 1)),
            gateway_id: 1,
            predefined_topics: vec![(42, "predefined/topic".to_string())],
        }],
        max_packet_size: 1024 * 1024,
        max_inflight_messages: 20,
        max_queued_messages: 1000,
        retry_interval: Duration::from_secs(20),
        clientid_prefixes: Vec::new(),
    };
    let broker = Arc::new(Broker::new(config, Arc::new(DefaultHooks)));
    let runner = broker.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker
}

/// Raw MQTT-SN test client over UDP
struct SnClient {
    socket: UdpSocket,
}

impl SnClient {
    async fn open(gateway_port: u16) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .connect(SocketAddr::from(([127, 0, 0, 1], gateway_port)))
            .await
            .unwrap();
        Self { socket }
    }

    async fn send(&self, packet: &SnPacket) {
        let mut buf = BytesMut::new();
        encode_datagram(packet, &mut buf).unwrap();
        self.socket.send(&buf).await.unwrap();
    }

    async fn recv(&self) -> SnPacket {
        self.try_recv(Duration::from_secs(5))
            .await
            .expect("timed out waiting for datagram")
    }

    async fn try_recv(&self, wait: Duration) -> Option<SnPacket> {
        let mut buf = [0u8; 2048];
        match timeout(wait, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => Some(decode_datagram(&buf[..n]).unwrap().packet),
            _ => None,
        }
    }

    async fn connect(gateway_port: u16, client_id: &str) -> Self {
        let client = Self::open(gateway_port).await;
        client
            .send(&SnPacket::Connect {
                flags: SnFlags {
                    clean_session: true,
                    ..Default::default()
                },
                duration: 60,
                client_id: client_id.to_string(),
            })
            .await;
        assert_eq!(
            client.recv().await,
            SnPacket::ConnAck {
                return_code: SnReturnCode::Accepted
            }
        );
        client
    }

    async fn register(&self, topic: &str, msg_id: u16) -> u16 {
        self.send(&SnPacket::Register {
            topic_id: 0,
            msg_id,
            topic: topic.to_string(),
        })
        .await;
        match self.recv().await {
            SnPacket::RegAck {
                topic_id,
                msg_id: acked,
                return_code,
            } => {
                assert_eq!(acked, msg_id);
                assert_eq!(return_code, SnReturnCode::Accepted);
                topic_id
            }
            other => panic!("expected REGACK, got {:?}", other),
        }
    }
}

/// Minimal MQTT helper for the cross-protocol tests
struct MqttClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
}

impl MqttClient {
    async fn connect(port: u16, client_id: &str) -> Self {
        let stream = TcpStream::connect(SocketAddr::from(([127, 0, 0, 1], port)))
            .await
            .unwrap();
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
            timeout(Duration::from_secs(5), self.stream.read_buf(&mut self.read_buf))
                .await
                .expect("timed out")
                .expect("read failed");
        }
    }
}

#[tokio::test]
async fn test_gateway_discovery() {
    let port = next_port();
    let _broker = start_broker(port).await;

    let client = SnClient::open(port + 1).await;
    client.send(&SnPacket::SearchGw { radius: 1 }).await;
    match client.recv().await {
        SnPacket::GwInfo { gw_id, .. } => assert_eq!(gw_id, 1),
        other => panic!("expected GWINFO, got {:?}", other),
    }
}

#[tokio::test]
async fn test_connect_register_publish_to_mqtt() {
    let port = next_port();
    let _broker = start_broker(port).await;

    let mut subscriber = MqttClient::connect(port, "watcher").await;
    subscriber
        .send(&Packet::Subscribe(Subscribe {
            msg_id: 1,
            filters: vec![("sensor/temp".to_string(), QoS::AtMostOnce)],
        }))
        .await;
    assert!(matches!(subscriber.recv().await, Packet::SubAck(_)));

    let sn = SnClient::connect(port + 1, "node-1").await;
    let topic_id = sn.register("sensor/temp", 1).await;

    sn.send(&SnPacket::Publish {
        flags: SnFlags {
            qos: 0,
            topic_id_type: TopicIdType::Normal,
            ..Default::default()
        },
        topic_id,
        msg_id: 0,
        topic_name: None,
        payload: Bytes::from_static(b"21.5"),
    })
    .await;

    match subscriber.recv().await {
        Packet::Publish(publish) => {
            assert_eq!(publish.topic.as_ref(), "sensor/temp");
            assert_eq!(&publish.payload[..], b"21.5");
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[tokio::test]
async fn test_qos1_publish_acked() {
    let port = next_port();
    let _broker = start_broker(port).await;

    let sn = SnClient::connect(port + 1, "node-2").await;
    let topic_id = sn.register("a/b", 1).await;

    sn.send(&SnPacket::Publish {
        flags: SnFlags {
            qos: 1,
            topic_id_type: TopicIdType::Normal,
            ..Default::default()
        },
        topic_id,
        msg_id: 4,
        topic_name: None,
        payload: Bytes::from_static(b"v"),
    })
    .await;

    assert_eq!(
        sn.recv().await,
        SnPacket::PubAck {
            topic_id,
            msg_id: 4,
            return_code: SnReturnCode::Accepted
        }
    );
}

#[tokio::test]
async fn test_unknown_topic_id_refused() {
    let port = next_port();
    let _broker = start_broker(port).await;

    let sn = SnClient::connect(port + 1, "node-3").await;
    sn.send(&SnPacket::Publish {
        flags: SnFlags {
            qos: 1,
            topic_id_type: TopicIdType::Normal,
            ..Default::default()
        },
        topic_id: 999,
        msg_id: 1,
        topic_name: None,
        payload: Bytes::from_static(b"?"),
    })
    .await;

    assert_eq!(
        sn.recv().await,
        SnPacket::PubAck {
            topic_id: 999,
            msg_id: 1,
            return_code: SnReturnCode::InvalidTopicId
        }
    );
}

#[tokio::test]
async fn test_predefined_topic_publish() {
    let port = next_port();
    let _broker = start_broker(port).await;

    let mut subscriber = MqttClient::connect(port, "watcher").await;
    subscriber
        .send(&Packet::Subscribe(Subscribe {
            msg_id: 1,
            filters: vec![("predefined/topic".to_string(), QoS::AtMostOnce)],
        }))
        .await;
    assert!(matches!(subscriber.recv().await, Packet::SubAck(_)));

    let sn = SnClient::connect(port + 1, "node-4").await;
    sn.send(&SnPacket::Publish {
        flags: SnFlags {
            qos: 0,
            topic_id_type: TopicIdType::Predefined,
            ..Default::default()
        },
        topic_id: 42,
        msg_id: 0,
        topic_name: None,
        payload: Bytes::from_static(b"pre"),
    })
    .await;

    match subscriber.recv().await {
        Packet::Publish(publish) => assert_eq!(publish.topic.as_ref(), "predefined/topic"),
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[tokio::test]
async fn test_subscribe_with_registration_and_delivery() {
    let port = next_port();
    let _broker = start_broker(port).await;

    let sn = SnClient::connect(port + 1, "node-5").await;
    sn.send(&SnPacket::Subscribe {
        flags: SnFlags {
            qos: 0,
            topic_id_type: TopicIdType::Normal,
            ..Default::default()
        },
        msg_id: 2,
        topic: SnTopic::Name("updates/all".to_string()),
    })
    .await;
    let granted_topic_id = match sn.recv().await {
        SnPacket::SubAck {
            topic_id,
            msg_id,
            return_code,
            ..
        } => {
            assert_eq!(msg_id, 2);
            assert_eq!(return_code, SnReturnCode::Accepted);
            assert_ne!(topic_id, 0);
            topic_id
        }
        other => panic!("expected SUBACK, got {:?}", other),
    };

    // An MQTT publisher reaches the MQTT-SN subscriber; the concrete
    // topic was registered at subscribe time, so no REGISTER roundtrip
    // is needed.
    let mut publisher = MqttClient::connect(port, "pub").await;
    publisher
        .send(&Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from("updates/all"),
            msg_id: None,
            payload: Bytes::from_static(b"news"),
        }))
        .await;

    match sn.recv().await {
        SnPacket::Publish {
            topic_id, payload, ..
        } => {
            assert_eq!(topic_id, granted_topic_id);
            assert_eq!(&payload[..], b"news");
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[tokio::test]
async fn test_wildcard_subscription_gets_register_first() {
    let port = next_port();
    let _broker = start_broker(port).await;

    let sn = SnClient::connect(port + 1, "node-6").await;
    sn.send(&SnPacket::Subscribe {
        flags: SnFlags {
            qos: 0,
            topic_id_type: TopicIdType::Normal,
            ..Default::default()
        },
        msg_id: 2,
        topic: SnTopic::Name("wild/#".to_string()),
    })
    .await;
    match sn.recv().await {
        SnPacket::SubAck { topic_id, .. } => assert_eq!(topic_id, 0),
        other => panic!("expected SUBACK, got {:?}", other),
    }

    let mut publisher = MqttClient::connect(port, "pub").await;
    publisher
        .send(&Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from("wild/one"),
            msg_id: None,
            payload: Bytes::from_static(b"w"),
        }))
        .await;

    // The gateway must register the concrete topic before publishing it
    let (topic_id, reg_msg_id) = match sn.recv().await {
        SnPacket::Register {
            topic_id,
            msg_id,
            topic,
        } => {
            assert_eq!(topic, "wild/one");
            (topic_id, msg_id)
        }
        other => panic!("expected REGISTER, got {:?}", other),
    };
    sn.send(&SnPacket::RegAck {
        topic_id,
        msg_id: reg_msg_id,
        return_code: SnReturnCode::Accepted,
    })
    .await;

    match sn.recv().await {
        SnPacket::Publish {
            topic_id: published_id,
            payload,
            ..
        } => {
            assert_eq!(published_id, topic_id);
            assert_eq!(&payload[..], b"w");
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[tokio::test]
async fn test_will_handshake() {
    let port = next_port();
    let _broker = start_broker(port).await;

    let mut watcher = MqttClient::connect(port, "watcher").await;
    watcher
        .send(&Packet::Subscribe(Subscribe {
            msg_id: 1,
            filters: vec![("status/node".to_string(), QoS::AtMostOnce)],
        }))
        .await;
    assert!(matches!(watcher.recv().await, Packet::SubAck(_)));

    let sn = SnClient::open(port + 1).await;
    sn.send(&SnPacket::Connect {
        flags: SnFlags {
            will: true,
            clean_session: true,
            ..Default::default()
        },
        duration: 60,
        client_id: "node-7".to_string(),
    })
    .await;

    assert_eq!(sn.recv().await, SnPacket::WillTopicReq);
    sn.send(&SnPacket::WillTopic {
        flags: Some(SnFlags::default()),
        topic: "status/node".to_string(),
    })
    .await;

    assert_eq!(sn.recv().await, SnPacket::WillMsgReq);
    sn.send(&SnPacket::WillMsg {
        message: Bytes::from_static(b"lost"),
    })
    .await;

    assert_eq!(
        sn.recv().await,
        SnPacket::ConnAck {
            return_code: SnReturnCode::Accepted
        }
    );

    // A malformed datagram terminates the session and fires the will
    sn.socket.send(&[3, 0xFF]).await.unwrap();

    match watcher.recv().await {
        Packet::Publish(publish) => {
            assert_eq!(publish.topic.as_ref(), "status/node");
            assert_eq!(&publish.payload[..], b"lost");
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[tokio::test]
async fn test_qos3_anonymous_publish() {
    let port = next_port();
    let _broker = start_broker(port).await;

    let mut subscriber = MqttClient::connect(port, "watcher").await;
    subscriber
        .send(&Packet::Subscribe(Subscribe {
            msg_id: 1,
            filters: vec![("predefined/topic".to_string(), QoS::AtMostOnce)],
        }))
        .await;
    assert!(matches!(subscriber.recv().await, Packet::SubAck(_)));

    // No CONNECT at all: a QoS 3 publish with a pre-defined topic id
    let anon = SnClient::open(port + 1).await;
    anon.send(&SnPacket::Publish {
        flags: SnFlags {
            qos: 3,
            topic_id_type: TopicIdType::Predefined,
            ..Default::default()
        },
        topic_id: 42,
        msg_id: 0,
        topic_name: None,
        payload: Bytes::from_static(b"oneshot"),
    })
    .await;

    match subscriber.recv().await {
        Packet::Publish(publish) => {
            assert_eq!(publish.topic.as_ref(), "predefined/topic");
            assert_eq!(&publish.payload[..], b"oneshot");
            assert_eq!(publish.qos, QoS::AtMostOnce);
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }

    // No acknowledgement is ever sent
    assert!(anon.try_recv(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn test_qos3_normal_embedded_topic_publish() {
    let port = next_port();
    let _broker = start_broker(port).await;

    let mut subscriber = MqttClient::connect(port, "watcher").await;
    subscriber
        .send(&Packet::Subscribe(Subscribe {
            msg_id: 1,
            filters: vec![("oneshot/data".to_string(), QoS::AtMostOnce)],
        }))
        .await;
    assert!(matches!(subscriber.recv().await, Packet::SubAck(_)));

    // No CONNECT: a QoS 3 NORMAL-type publish carries its topic name
    // embedded in the frame, with the topic id field holding the length
    let anon = SnClient::open(port + 1).await;
    anon.send(&SnPacket::Publish {
        flags: SnFlags {
            qos: 3,
            topic_id_type: TopicIdType::Normal,
            ..Default::default()
        },
        topic_id: 0,
        msg_id: 0,
        topic_name: Some("oneshot/data".to_string()),
        payload: Bytes::from_static(b"fire"),
    })
    .await;

    match subscriber.recv().await {
        Packet::Publish(publish) => {
            assert_eq!(publish.topic.as_ref(), "oneshot/data");
            assert_eq!(&publish.payload[..], b"fire");
            assert_eq!(publish.qos, QoS::AtMostOnce);
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }

    // Still no acknowledgement
    assert!(anon.try_recv(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn test_disconnect_acknowledged() {
    let port = next_port();
    let _broker = start_broker(port).await;

    let sn = SnClient::connect(port + 1, "node-8").await;
    sn.send(&SnPacket::Disconnect { duration: None }).await;
    assert_eq!(sn.recv().await, SnPacket::Disconnect { duration: None });
}
