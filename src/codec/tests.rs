//! Codec tests
//!
//! Round-trips for MQTT v3 and MQTT-SN packets, plus framing edge cases.

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use test_case::test_case;

use super::sn::{decode_datagram, encode_datagram, encode_reply};
use super::{read_variable_int, write_variable_int, Decoder, Encoder};
use crate::protocol::sn::*;
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, SubAck, Subscribe, UnsubAck, Unsubscribe, Will, PROTOCOL_NAME_V3,
    PROTOCOL_VERSION_V3,
};
use std::sync::Arc;

fn encode_packet(packet: &Packet) -> BytesMut {
    let encoder = Encoder::new();
    let mut buf = BytesMut::new();
    encoder.encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    let mut decoder = Decoder::new();
    match decoder.decode(buf)? {
        Some((packet, consumed)) => {
            assert_eq!(consumed, buf.len());
            Ok(packet)
        }
        None => Err(DecodeError::InsufficientData),
    }
}

fn roundtrip(packet: Packet) {
    let encoded = encode_packet(&packet);
    let decoded = decode_packet(&encoded).unwrap();
    assert_eq!(packet, decoded);
}

// ============================================================================
// Remaining-length encoding
// ============================================================================

#[test_case(0, &[0x00]; "zero")]
#[test_case(127, &[0x7F]; "one byte max")]
#[test_case(128, &[0x80, 0x01]; "two bytes min")]
#[test_case(16_383, &[0xFF, 0x7F]; "two bytes max")]
#[test_case(16_384, &[0x80, 0x80, 0x01]; "three bytes min")]
#[test_case(268_435_455, &[0xFF, 0xFF, 0xFF, 0x7F]; "four bytes max")]
fn test_variable_int(value: u32, expected: &[u8]) {
    let mut buf = BytesMut::new();
    write_variable_int(&mut buf, value).unwrap();
    assert_eq!(&buf[..], expected);

    let (decoded, consumed) = read_variable_int(expected).unwrap();
    assert_eq!(decoded, value);
    assert_eq!(consumed, expected.len());
}

#[test]
fn test_variable_int_fifth_byte_rejected() {
    let result = read_variable_int(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
    assert_eq!(result, Err(DecodeError::InvalidRemainingLength));
}

// ============================================================================
// MQTT v3 packets
// ============================================================================

#[test]
fn test_connect_roundtrip() {
    roundtrip(Packet::Connect(Box::new(Connect {
        protocol_name: PROTOCOL_NAME_V3.to_string(),
        protocol_version: PROTOCOL_VERSION_V3,
        client_id: "client-1".to_string(),
        clean_session: true,
        keep_alive: 60,
        will: None,
        username: None,
        password: None,
    })));
}

#[test]
fn test_connect_with_will_and_credentials() {
    roundtrip(Packet::Connect(Box::new(Connect {
        protocol_name: PROTOCOL_NAME_V3.to_string(),
        protocol_version: PROTOCOL_VERSION_V3,
        client_id: "client-2".to_string(),
        clean_session: false,
        keep_alive: 120,
        will: Some(Will {
            topic: "will/topic".to_string(),
            payload: Bytes::from_static(b"gone"),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        username: Some("alice".to_string()),
        password: Some(Bytes::from_static(b"secret")),
    })));
}

#[test]
fn test_connack_roundtrip() {
    for code in [
        ConnectReturnCode::Accepted,
        ConnectReturnCode::UnacceptableProtocolVersion,
        ConnectReturnCode::IdentifierRejected,
        ConnectReturnCode::BrokerUnavailable,
        ConnectReturnCode::BadUsernameOrPassword,
        ConnectReturnCode::NotAuthorized,
    ] {
        roundtrip(Packet::ConnAck(ConnAck { return_code: code }));
    }
}

#[test]
fn test_publish_qos0_roundtrip() {
    roundtrip(Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: true,
        topic: Arc::from("sensor/1"),
        msg_id: None,
        payload: Bytes::from_static(b"42"),
    }));
}

#[test]
fn test_publish_qos2_roundtrip() {
    roundtrip(Packet::Publish(Publish {
        dup: true,
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: Arc::from("a/b/c"),
        msg_id: Some(7),
        payload: Bytes::from_static(b"payload"),
    }));
}

#[test]
fn test_publish_empty_payload() {
    roundtrip(Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: true,
        topic: Arc::from("clear/me"),
        msg_id: None,
        payload: Bytes::new(),
    }));
}

#[test]
fn test_publish_zero_msg_id_rejected() {
    // qos 1 with msg id 0
    let bytes = [0x32, 0x07, 0x00, 0x01, b'a', 0x00, 0x00, b'x', b'y'];
    assert!(decode_packet(&bytes).is_err());
}

#[test]
fn test_acks_roundtrip() {
    roundtrip(Packet::PubAck(PubAck { msg_id: 1 }));
    roundtrip(Packet::PubRec(PubRec { msg_id: 2 }));
    roundtrip(Packet::PubRel(PubRel {
        msg_id: 3,
        dup: false,
    }));
    roundtrip(Packet::PubComp(PubComp { msg_id: 4 }));
    roundtrip(Packet::UnsubAck(UnsubAck { msg_id: 5 }));
}

#[test]
fn test_subscribe_roundtrip() {
    roundtrip(Packet::Subscribe(Subscribe {
        msg_id: 10,
        filters: vec![
            ("sensor/+".to_string(), QoS::AtLeastOnce),
            ("control/#".to_string(), QoS::ExactlyOnce),
        ],
    }));
}

#[test]
fn test_suback_roundtrip() {
    roundtrip(Packet::SubAck(SubAck {
        msg_id: 10,
        granted: vec![QoS::AtLeastOnce, QoS::AtMostOnce],
    }));
}

#[test]
fn test_unsubscribe_roundtrip() {
    roundtrip(Packet::Unsubscribe(Unsubscribe {
        msg_id: 11,
        filters: vec!["a/b".to_string(), "c/#".to_string()],
    }));
}

#[test]
fn test_ping_and_disconnect_roundtrip() {
    roundtrip(Packet::PingReq);
    roundtrip(Packet::PingResp);
    roundtrip(Packet::Disconnect);
}

#[test]
fn test_incomplete_frame_returns_none() {
    let full = encode_packet(&Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: Arc::from("t"),
        msg_id: None,
        payload: Bytes::from_static(b"hello"),
    }));

    let mut decoder = Decoder::new();
    for len in 0..full.len() {
        assert!(decoder.decode(&full[..len]).unwrap().is_none());
    }
    assert!(decoder.decode(&full).unwrap().is_some());
}

#[test]
fn test_two_packets_in_one_buffer() {
    let mut buf = encode_packet(&Packet::PingReq);
    buf.extend_from_slice(&encode_packet(&Packet::PingResp));

    let mut decoder = Decoder::new();
    let (first, consumed) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingReq);
    let (second, _) = decoder.decode(&buf[consumed..]).unwrap().unwrap();
    assert_eq!(second, Packet::PingResp);
}

#[test]
fn test_max_packet_size_enforced() {
    let mut decoder = Decoder::new().with_max_packet_size(16);
    let packet = Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: Arc::from("topic"),
        msg_id: None,
        payload: Bytes::from(vec![0u8; 64]),
    });
    let encoded = encode_packet(&packet);
    assert_eq!(decoder.decode(&encoded), Err(DecodeError::PacketTooLarge));
}

#[test]
fn test_subscribe_bad_flags_rejected() {
    // SUBSCRIBE must carry flags 0x2
    let bytes = [0x80, 0x08, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'b', 0x00];
    assert!(decode_packet(&bytes).is_err());
}

// ============================================================================
// MQTT-SN packets
// ============================================================================

fn sn_roundtrip(packet: SnPacket) {
    let mut buf = BytesMut::new();
    encode_datagram(&packet, &mut buf).unwrap();
    let frame = decode_datagram(&buf).unwrap();
    assert_eq!(frame.packet, packet);
    assert_eq!(frame.encapsulation, None);
}

#[test]
fn test_sn_connect_roundtrip() {
    sn_roundtrip(SnPacket::Connect {
        flags: SnFlags {
            will: true,
            clean_session: true,
            ..Default::default()
        },
        duration: 30,
        client_id: "node-7".to_string(),
    });
}

#[test]
fn test_sn_gateway_discovery_roundtrip() {
    sn_roundtrip(SnPacket::Advertise {
        gw_id: 1,
        duration: 900,
    });
    sn_roundtrip(SnPacket::SearchGw { radius: 1 });
    sn_roundtrip(SnPacket::GwInfo {
        gw_id: 1,
        gw_addr: Bytes::new(),
    });
}

#[test]
fn test_sn_will_handshake_roundtrip() {
    sn_roundtrip(SnPacket::WillTopicReq);
    sn_roundtrip(SnPacket::WillTopic {
        flags: Some(SnFlags {
            qos: 1,
            retain: true,
            ..Default::default()
        }),
        topic: "will/here".to_string(),
    });
    sn_roundtrip(SnPacket::WillMsgReq);
    sn_roundtrip(SnPacket::WillMsg {
        message: Bytes::from_static(b"offline"),
    });
}

#[test]
fn test_sn_register_roundtrip() {
    sn_roundtrip(SnPacket::Register {
        topic_id: 3,
        msg_id: 9,
        topic: "sensor/temperature".to_string(),
    });
    sn_roundtrip(SnPacket::RegAck {
        topic_id: 3,
        msg_id: 9,
        return_code: SnReturnCode::Accepted,
    });
}

#[test]
fn test_sn_publish_roundtrip() {
    sn_roundtrip(SnPacket::Publish {
        flags: SnFlags {
            qos: 1,
            topic_id_type: TopicIdType::Normal,
            ..Default::default()
        },
        topic_id: 3,
        msg_id: 12,
        topic_name: None,
        payload: Bytes::from_static(b"21.5"),
    });
}

#[test]
fn test_sn_qos3_normal_embedded_topic_name() {
    // A connectionless NORMAL-type publish reinterprets the topic id
    // field as the length of a topic name carried between the message id
    // and the payload.
    let packet = SnPacket::Publish {
        flags: SnFlags {
            qos: 3,
            topic_id_type: TopicIdType::Normal,
            ..Default::default()
        },
        topic_id: 0,
        msg_id: 0,
        topic_name: Some("a/b".to_string()),
        payload: Bytes::from_static(b"xy"),
    };

    let mut buf = BytesMut::new();
    encode_datagram(&packet, &mut buf).unwrap();
    // len, type, flags, name length (in the topic id field), msg id,
    // name, payload
    assert_eq!(
        &buf[..],
        &[
            12, SN_PUBLISH, 0x60, 0x00, 0x03, 0x00, 0x00, b'a', b'/', b'b', b'x', b'y'
        ]
    );

    let frame = decode_datagram(&buf).unwrap();
    assert_eq!(frame.packet, packet);
}

#[test]
fn test_sn_qos3_normal_truncated_name_rejected() {
    // Claims a 10-byte embedded name but carries only 2 bytes
    let bytes = [9, SN_PUBLISH, 0x60, 0x00, 0x0A, 0x00, 0x00, b'a', b'b'];
    assert!(decode_datagram(&bytes).is_err());
}

#[test]
fn test_sn_qos3_publish_flags() {
    // QoS 3 is encoded as both QoS bits set
    let packet = SnPacket::Publish {
        flags: SnFlags {
            qos: 3,
            topic_id_type: TopicIdType::Short,
            ..Default::default()
        },
        topic_id: u16::from_be_bytes([b'a', b'b']),
        msg_id: 0,
        topic_name: None,
        payload: Bytes::from_static(b"x"),
    };
    let mut buf = BytesMut::new();
    encode_datagram(&packet, &mut buf).unwrap();
    assert_eq!(buf[2] & 0x60, 0x60);
    let frame = decode_datagram(&buf).unwrap();
    assert_eq!(frame.packet, packet);
}

#[test]
fn test_sn_subscribe_topic_forms() {
    sn_roundtrip(SnPacket::Subscribe {
        flags: SnFlags {
            qos: 1,
            topic_id_type: TopicIdType::Normal,
            ..Default::default()
        },
        msg_id: 1,
        topic: SnTopic::Name("sensor/#".to_string()),
    });
    sn_roundtrip(SnPacket::Subscribe {
        flags: SnFlags {
            topic_id_type: TopicIdType::Predefined,
            ..Default::default()
        },
        msg_id: 2,
        topic: SnTopic::Predefined(5),
    });
    sn_roundtrip(SnPacket::Subscribe {
        flags: SnFlags {
            topic_id_type: TopicIdType::Short,
            ..Default::default()
        },
        msg_id: 3,
        topic: SnTopic::Short([b'a', b'b']),
    });
}

#[test]
fn test_sn_suback_and_acks_roundtrip() {
    sn_roundtrip(SnPacket::SubAck {
        flags: SnFlags {
            qos: 1,
            ..Default::default()
        },
        topic_id: 4,
        msg_id: 3,
        return_code: SnReturnCode::Accepted,
    });
    sn_roundtrip(SnPacket::PubAck {
        topic_id: 4,
        msg_id: 5,
        return_code: SnReturnCode::InvalidTopicId,
    });
    sn_roundtrip(SnPacket::PubRec { msg_id: 6 });
    sn_roundtrip(SnPacket::PubRel { msg_id: 6 });
    sn_roundtrip(SnPacket::PubComp { msg_id: 6 });
    sn_roundtrip(SnPacket::UnsubAck { msg_id: 7 });
}

#[test]
fn test_sn_ping_disconnect_roundtrip() {
    sn_roundtrip(SnPacket::PingReq { client_id: None });
    sn_roundtrip(SnPacket::PingReq {
        client_id: Some("sleepy".to_string()),
    });
    sn_roundtrip(SnPacket::PingResp);
    sn_roundtrip(SnPacket::Disconnect { duration: None });
    sn_roundtrip(SnPacket::Disconnect { duration: Some(300) });
}

#[test]
fn test_sn_will_update_roundtrip() {
    sn_roundtrip(SnPacket::WillTopicUpd {
        flags: Some(SnFlags::default()),
        topic: "new/will".to_string(),
    });
    sn_roundtrip(SnPacket::WillTopicResp {
        return_code: SnReturnCode::Accepted,
    });
    sn_roundtrip(SnPacket::WillMsgUpd {
        message: Bytes::from_static(b"new"),
    });
    sn_roundtrip(SnPacket::WillMsgResp {
        return_code: SnReturnCode::Accepted,
    });
}

#[test]
fn test_sn_long_frame_uses_three_byte_length() {
    let packet = SnPacket::Publish {
        flags: SnFlags::default(),
        topic_id: 1,
        msg_id: 0,
        topic_name: None,
        payload: Bytes::from(vec![0x55u8; 400]),
    };
    let mut buf = BytesMut::new();
    encode_datagram(&packet, &mut buf).unwrap();
    assert_eq!(buf[0], 0x01);
    assert_eq!(u16::from_be_bytes([buf[1], buf[2]]) as usize, buf.len());

    let frame = decode_datagram(&buf).unwrap();
    assert_eq!(frame.packet, packet);
}

#[test]
fn test_sn_forwarder_encapsulation() {
    let inner = SnPacket::PingReq { client_id: None };
    let enc = SnEncapsulation {
        ctrl: 0,
        wireless_node_id: Bytes::from_static(&[0xAA, 0xBB, 0xCC]),
    };

    let mut buf = BytesMut::new();
    encode_reply(Some(&enc), &inner, &mut buf).unwrap();

    // Outer frame: len(1) type(1) ctrl(1) + node id
    assert_eq!(buf[0], 6);
    assert_eq!(buf[1], SN_FRWDENCAP);

    let frame = decode_datagram(&buf).unwrap();
    assert_eq!(frame.packet, inner);
    assert_eq!(frame.encapsulation, Some(enc));
}

#[test]
fn test_sn_length_mismatch_rejected() {
    // CONNACK claiming 5 bytes but carrying 4
    let bytes = [5, SN_CONNACK, 0];
    assert!(decode_datagram(&bytes).is_err());
}

#[test]
fn test_sn_empty_will_topic_deletes() {
    let bytes = [2, SN_WILLTOPIC];
    let frame = decode_datagram(&bytes).unwrap();
    assert_eq!(
        frame.packet,
        SnPacket::WillTopic {
            flags: None,
            topic: String::new(),
        }
    );
}
