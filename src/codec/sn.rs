//! MQTT-SN packet codec
//!
//! One UDP datagram carries one MQTT-SN packet. The length field is a single
//! octet unless the first octet is 0x01, in which case the two following
//! octets hold the total length big-endian (allowing frames up to 65535).
//!
//! A forwarder encapsulation frame wraps another MQTT-SN frame: its own
//! length covers only the ctrl octet and the wireless node id, and the
//! encapsulated frame follows with its own length field. Replies to an
//! encapsulated packet must be wrapped the same way so the forwarder can
//! route them back to the wireless node.

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::sn::*;
use crate::protocol::{DecodeError, EncodeError};

/// Parse the 1- or 3-octet length and the message type octet.
/// Returns (total_length, msg_type, header_size).
fn parse_header(buf: &[u8]) -> Result<(usize, u8, usize), DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    if buf[0] == 0x01 {
        if buf.len() < 4 {
            return Err(DecodeError::InsufficientData);
        }
        let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        Ok((len, buf[3], 4))
    } else {
        Ok((buf[0] as usize, buf[1], 2))
    }
}

/// Decode one datagram into a frame, recovering the forwarder encapsulation
/// header when present.
pub fn decode_datagram(buf: &[u8]) -> Result<SnFrame, DecodeError> {
    let (len, msg_type, header_size) = parse_header(buf)?;

    if msg_type == SN_FRWDENCAP {
        // Length covers ctrl + wireless node id only; the encapsulated
        // frame follows with its own header.
        if len < header_size + 1 || buf.len() < len {
            return Err(DecodeError::MalformedPacket("short encapsulation frame"));
        }
        let ctrl = buf[header_size];
        let wireless_node_id = Bytes::copy_from_slice(&buf[header_size + 1..len]);
        let inner = &buf[len..];
        let (inner_len, inner_type, inner_header) = parse_header(inner)?;
        if inner_len != inner.len() {
            return Err(DecodeError::MalformedPacket("encapsulated length mismatch"));
        }
        let packet = decode_body(inner_type, &inner[inner_header..inner_len])?;
        return Ok(SnFrame {
            packet,
            encapsulation: Some(SnEncapsulation {
                ctrl,
                wireless_node_id,
            }),
        });
    }

    if len != buf.len() {
        return Err(DecodeError::MalformedPacket("datagram length mismatch"));
    }

    let packet = decode_body(msg_type, &buf[header_size..len])?;
    Ok(SnFrame {
        packet,
        encapsulation: None,
    })
}

fn read_u16(body: &[u8], pos: usize) -> Result<u16, DecodeError> {
    if body.len() < pos + 2 {
        return Err(DecodeError::InsufficientData);
    }
    Ok(u16::from_be_bytes([body[pos], body[pos + 1]]))
}

fn read_flags(body: &[u8], pos: usize) -> Result<SnFlags, DecodeError> {
    if body.len() <= pos {
        return Err(DecodeError::InsufficientData);
    }
    SnFlags::from_byte(body[pos]).ok_or(DecodeError::InvalidFlags)
}

/// Strings in MQTT-SN are not length-prefixed; they run to the frame end.
fn read_tail_string(body: &[u8], pos: usize) -> Result<String, DecodeError> {
    let s = std::str::from_utf8(&body[pos..]).map_err(|_| DecodeError::InvalidUtf8)?;
    Ok(s.to_string())
}

fn decode_body(msg_type: u8, body: &[u8]) -> Result<SnPacket, DecodeError> {
    let packet = match msg_type {
        SN_ADVERTISE => {
            if body.is_empty() {
                return Err(DecodeError::InsufficientData);
            }
            SnPacket::Advertise {
                gw_id: body[0],
                duration: read_u16(body, 1)?,
            }
        }
        SN_SEARCHGW => {
            if body.is_empty() {
                return Err(DecodeError::InsufficientData);
            }
            SnPacket::SearchGw { radius: body[0] }
        }
        SN_GWINFO => {
            if body.is_empty() {
                return Err(DecodeError::InsufficientData);
            }
            SnPacket::GwInfo {
                gw_id: body[0],
                gw_addr: Bytes::copy_from_slice(&body[1..]),
            }
        }
        SN_CONNECT => {
            let flags = read_flags(body, 0)?;
            if body.len() < 2 || body[1] != SN_PROTOCOL_ID {
                return Err(DecodeError::MalformedPacket("bad MQTT-SN protocol id"));
            }
            let duration = read_u16(body, 2)?;
            let client_id = read_tail_string(body, 4)?;
            SnPacket::Connect {
                flags,
                duration,
                client_id,
            }
        }
        SN_CONNACK => {
            if body.is_empty() {
                return Err(DecodeError::InsufficientData);
            }
            SnPacket::ConnAck {
                return_code: SnReturnCode::from_u8(body[0])
                    .ok_or(DecodeError::MalformedPacket("unknown return code"))?,
            }
        }
        SN_WILLTOPICREQ => SnPacket::WillTopicReq,
        SN_WILLTOPIC => {
            if body.is_empty() {
                // Empty WILLTOPIC deletes the will
                SnPacket::WillTopic {
                    flags: None,
                    topic: String::new(),
                }
            } else {
                let flags = read_flags(body, 0)?;
                SnPacket::WillTopic {
                    flags: Some(flags),
                    topic: read_tail_string(body, 1)?,
                }
            }
        }
        SN_WILLMSGREQ => SnPacket::WillMsgReq,
        SN_WILLMSG => SnPacket::WillMsg {
            message: Bytes::copy_from_slice(body),
        },
        SN_REGISTER => SnPacket::Register {
            topic_id: read_u16(body, 0)?,
            msg_id: read_u16(body, 2)?,
            topic: read_tail_string(body, 4)?,
        },
        SN_REGACK => {
            if body.len() < 5 {
                return Err(DecodeError::InsufficientData);
            }
            SnPacket::RegAck {
                topic_id: read_u16(body, 0)?,
                msg_id: read_u16(body, 2)?,
                return_code: SnReturnCode::from_u8(body[4])
                    .ok_or(DecodeError::MalformedPacket("unknown return code"))?,
            }
        }
        SN_PUBLISH => {
            let flags = read_flags(body, 0)?;
            let msg_id = read_u16(body, 3)?;
            if body.len() < 5 {
                return Err(DecodeError::InsufficientData);
            }
            // A connectionless (QoS 3) NORMAL-type publish reinterprets
            // the topic id field as the length of a topic name embedded
            // between the message id and the payload.
            if flags.topic_id_type == TopicIdType::Normal && flags.qos == 3 {
                let topic_len = read_u16(body, 1)? as usize;
                if body.len() < 5 + topic_len {
                    return Err(DecodeError::MalformedPacket("embedded topic name truncated"));
                }
                let name = std::str::from_utf8(&body[5..5 + topic_len])
                    .map_err(|_| DecodeError::InvalidUtf8)?;
                SnPacket::Publish {
                    flags,
                    topic_id: 0,
                    msg_id,
                    topic_name: Some(name.to_string()),
                    payload: Bytes::copy_from_slice(&body[5 + topic_len..]),
                }
            } else {
                SnPacket::Publish {
                    flags,
                    topic_id: read_u16(body, 1)?,
                    msg_id,
                    topic_name: None,
                    payload: Bytes::copy_from_slice(&body[5..]),
                }
            }
        }
        SN_PUBACK => {
            if body.len() < 5 {
                return Err(DecodeError::InsufficientData);
            }
            SnPacket::PubAck {
                topic_id: read_u16(body, 0)?,
                msg_id: read_u16(body, 2)?,
                return_code: SnReturnCode::from_u8(body[4])
                    .ok_or(DecodeError::MalformedPacket("unknown return code"))?,
            }
        }
        SN_PUBREC => SnPacket::PubRec {
            msg_id: read_u16(body, 0)?,
        },
        SN_PUBREL => SnPacket::PubRel {
            msg_id: read_u16(body, 0)?,
        },
        SN_PUBCOMP => SnPacket::PubComp {
            msg_id: read_u16(body, 0)?,
        },
        SN_SUBSCRIBE | SN_UNSUBSCRIBE => {
            let flags = read_flags(body, 0)?;
            let msg_id = read_u16(body, 1)?;
            let topic = match flags.topic_id_type {
                TopicIdType::Normal => SnTopic::Name(read_tail_string(body, 3)?),
                TopicIdType::Predefined => SnTopic::Predefined(read_u16(body, 3)?),
                TopicIdType::Short => {
                    if body.len() < 5 {
                        return Err(DecodeError::InsufficientData);
                    }
                    SnTopic::Short([body[3], body[4]])
                }
            };
            if msg_type == SN_SUBSCRIBE {
                SnPacket::Subscribe {
                    flags,
                    msg_id,
                    topic,
                }
            } else {
                SnPacket::Unsubscribe {
                    flags,
                    msg_id,
                    topic,
                }
            }
        }
        SN_SUBACK => {
            let flags = read_flags(body, 0)?;
            if body.len() < 6 {
                return Err(DecodeError::InsufficientData);
            }
            SnPacket::SubAck {
                flags,
                topic_id: read_u16(body, 1)?,
                msg_id: read_u16(body, 3)?,
                return_code: SnReturnCode::from_u8(body[5])
                    .ok_or(DecodeError::MalformedPacket("unknown return code"))?,
            }
        }
        SN_UNSUBACK => SnPacket::UnsubAck {
            msg_id: read_u16(body, 0)?,
        },
        SN_PINGREQ => SnPacket::PingReq {
            client_id: if body.is_empty() {
                None
            } else {
                Some(read_tail_string(body, 0)?)
            },
        },
        SN_PINGRESP => SnPacket::PingResp,
        SN_DISCONNECT => SnPacket::Disconnect {
            duration: if body.len() >= 2 {
                Some(read_u16(body, 0)?)
            } else {
                None
            },
        },
        SN_WILLTOPICUPD => {
            if body.is_empty() {
                SnPacket::WillTopicUpd {
                    flags: None,
                    topic: String::new(),
                }
            } else {
                SnPacket::WillTopicUpd {
                    flags: Some(read_flags(body, 0)?),
                    topic: read_tail_string(body, 1)?,
                }
            }
        }
        SN_WILLTOPICRESP => {
            if body.is_empty() {
                return Err(DecodeError::InsufficientData);
            }
            SnPacket::WillTopicResp {
                return_code: SnReturnCode::from_u8(body[0])
                    .ok_or(DecodeError::MalformedPacket("unknown return code"))?,
            }
        }
        SN_WILLMSGUPD => SnPacket::WillMsgUpd {
            message: Bytes::copy_from_slice(body),
        },
        SN_WILLMSGRESP => {
            if body.is_empty() {
                return Err(DecodeError::InsufficientData);
            }
            SnPacket::WillMsgResp {
                return_code: SnReturnCode::from_u8(body[0])
                    .ok_or(DecodeError::MalformedPacket("unknown return code"))?,
            }
        }
        other => return Err(DecodeError::InvalidPacketType(other)),
    };

    Ok(packet)
}

/// Encode a packet as a bare datagram.
pub fn encode_datagram(packet: &SnPacket, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut body = BytesMut::with_capacity(32);
    encode_body(packet, &mut body)?;
    write_frame(packet.packet_type(), &body, buf)
}

/// Encode a reply to a frame, wrapping it in a forwarder encapsulation
/// when the request arrived through one.
pub fn encode_reply(
    encapsulation: Option<&SnEncapsulation>,
    packet: &SnPacket,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    if let Some(enc) = encapsulation {
        let outer_len = 3 + enc.wireless_node_id.len();
        if outer_len > 255 {
            return Err(EncodeError::PacketTooLarge);
        }
        buf.put_u8(outer_len as u8);
        buf.put_u8(SN_FRWDENCAP);
        buf.put_u8(enc.ctrl);
        buf.put_slice(&enc.wireless_node_id);
    }
    encode_datagram(packet, buf)
}

fn write_frame(msg_type: u8, body: &[u8], buf: &mut BytesMut) -> Result<(), EncodeError> {
    let short_len = 2 + body.len();
    if short_len <= 255 {
        buf.put_u8(short_len as u8);
    } else {
        let long_len = 4 + body.len();
        if long_len > 65535 {
            return Err(EncodeError::PacketTooLarge);
        }
        buf.put_u8(0x01);
        buf.put_u16(long_len as u16);
    }
    buf.put_u8(msg_type);
    buf.put_slice(body);
    Ok(())
}

fn encode_body(packet: &SnPacket, body: &mut BytesMut) -> Result<(), EncodeError> {
    match packet {
        SnPacket::Advertise { gw_id, duration } => {
            body.put_u8(*gw_id);
            body.put_u16(*duration);
        }
        SnPacket::SearchGw { radius } => {
            body.put_u8(*radius);
        }
        SnPacket::GwInfo { gw_id, gw_addr } => {
            body.put_u8(*gw_id);
            body.put_slice(gw_addr);
        }
        SnPacket::Connect {
            flags,
            duration,
            client_id,
        } => {
            body.put_u8(flags.to_byte());
            body.put_u8(SN_PROTOCOL_ID);
            body.put_u16(*duration);
            body.put_slice(client_id.as_bytes());
        }
        SnPacket::ConnAck { return_code } => {
            body.put_u8(*return_code as u8);
        }
        SnPacket::WillTopicReq | SnPacket::WillMsgReq | SnPacket::PingResp => {}
        SnPacket::WillTopic { flags, topic } | SnPacket::WillTopicUpd { flags, topic } => {
            if let Some(flags) = flags {
                body.put_u8(flags.to_byte());
                body.put_slice(topic.as_bytes());
            }
        }
        SnPacket::WillMsg { message } | SnPacket::WillMsgUpd { message } => {
            body.put_slice(message);
        }
        SnPacket::Register {
            topic_id,
            msg_id,
            topic,
        } => {
            body.put_u16(*topic_id);
            body.put_u16(*msg_id);
            body.put_slice(topic.as_bytes());
        }
        SnPacket::RegAck {
            topic_id,
            msg_id,
            return_code,
        } => {
            body.put_u16(*topic_id);
            body.put_u16(*msg_id);
            body.put_u8(*return_code as u8);
        }
        SnPacket::Publish {
            flags,
            topic_id,
            msg_id,
            topic_name,
            payload,
        } => {
            body.put_u8(flags.to_byte());
            match topic_name {
                // Connectionless NORMAL-type publish: the topic id field
                // holds the embedded name's length
                Some(name) => {
                    if name.len() > 65535 {
                        return Err(EncodeError::StringTooLong);
                    }
                    body.put_u16(name.len() as u16);
                    body.put_u16(*msg_id);
                    body.put_slice(name.as_bytes());
                }
                None => {
                    body.put_u16(*topic_id);
                    body.put_u16(*msg_id);
                }
            }
            body.put_slice(payload);
        }
        SnPacket::PubAck {
            topic_id,
            msg_id,
            return_code,
        } => {
            body.put_u16(*topic_id);
            body.put_u16(*msg_id);
            body.put_u8(*return_code as u8);
        }
        SnPacket::PubRec { msg_id } | SnPacket::PubRel { msg_id } | SnPacket::PubComp { msg_id } => {
            body.put_u16(*msg_id);
        }
        SnPacket::Subscribe {
            flags,
            msg_id,
            topic,
        }
        | SnPacket::Unsubscribe {
            flags,
            msg_id,
            topic,
        } => {
            body.put_u8(flags.to_byte());
            body.put_u16(*msg_id);
            match topic {
                SnTopic::Name(name) => body.put_slice(name.as_bytes()),
                SnTopic::Predefined(id) => body.put_u16(*id),
                SnTopic::Short(chars) => body.put_slice(chars),
            }
        }
        SnPacket::SubAck {
            flags,
            topic_id,
            msg_id,
            return_code,
        } => {
            body.put_u8(flags.to_byte());
            body.put_u16(*topic_id);
            body.put_u16(*msg_id);
            body.put_u8(*return_code as u8);
        }
        SnPacket::UnsubAck { msg_id } => {
            body.put_u16(*msg_id);
        }
        SnPacket::PingReq { client_id } => {
            if let Some(id) = client_id {
                body.put_slice(id.as_bytes());
            }
        }
        SnPacket::Disconnect { duration } => {
            if let Some(d) = duration {
                body.put_u16(*d);
            }
        }
        SnPacket::WillTopicResp { return_code } | SnPacket::WillMsgResp { return_code } => {
            body.put_u8(*return_code as u8);
        }
    }
    Ok(())
}
