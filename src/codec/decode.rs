//! MQTT v3 packet decoder

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, SubAck, Subscribe, UnsubAck, Unsubscribe, Will,
};

/// MQTT v3 packet decoder
pub struct Decoder {
    /// Maximum accepted packet size
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode a packet from the buffer.
    /// Returns (packet, bytes_consumed), or None if the frame is incomplete.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        // Fixed header: type << 4 | dup << 3 | qos << 1 | retain
        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        let total_len = 1 + len_bytes + remaining_length as usize;

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        if buf.len() < total_len {
            return Ok(None);
        }

        let payload_start = 1 + len_bytes;
        let payload = &buf[payload_start..total_len];

        let packet = match packet_type {
            1 => self.decode_connect(payload)?,
            2 => self.decode_connack(flags, payload)?,
            3 => self.decode_publish(flags, payload)?,
            4 => Packet::PubAck(PubAck {
                msg_id: Self::decode_ack_id(payload)?,
            }),
            5 => Packet::PubRec(PubRec {
                msg_id: Self::decode_ack_id(payload)?,
            }),
            6 => Packet::PubRel(PubRel {
                msg_id: Self::decode_ack_id(payload)?,
                dup: (flags & 0x08) != 0,
            }),
            7 => Packet::PubComp(PubComp {
                msg_id: Self::decode_ack_id(payload)?,
            }),
            8 => self.decode_subscribe(flags, payload)?,
            9 => self.decode_suback(payload)?,
            10 => self.decode_unsubscribe(flags, payload)?,
            11 => Packet::UnsubAck(UnsubAck {
                msg_id: Self::decode_ack_id(payload)?,
            }),
            12 => Packet::PingReq,
            13 => Packet::PingResp,
            14 => Packet::Disconnect,
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }

    fn decode_connect(&mut self, payload: &[u8]) -> Result<Packet, DecodeError> {
        let mut pos = 0;

        // Protocol name and version; validity is judged by the connect
        // handler so it can answer with the right CONNACK code.
        let (protocol_name, len) = read_string(&payload[pos..])?;
        let protocol_name = protocol_name.to_string();
        pos += len;

        if pos >= payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        let protocol_version = payload[pos];
        pos += 1;

        if pos >= payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        let connect_flags = payload[pos];
        pos += 1;

        // Reserved bit must be zero
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::MalformedPacket("reserved connect flag set"));
        }

        let clean_session = (connect_flags & 0x02) != 0;
        let will_flag = (connect_flags & 0x04) != 0;
        let will_qos = (connect_flags & 0x18) >> 3;
        let will_retain = (connect_flags & 0x20) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        if !will_flag && (will_qos != 0 || will_retain) {
            return Err(DecodeError::MalformedPacket("will flags without will"));
        }

        let keep_alive = read_u16(&payload[pos..])?;
        pos += 2;

        let (client_id, len) = read_string(&payload[pos..])?;
        let client_id = client_id.to_string();
        pos += len;

        let will = if will_flag {
            let qos = QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?;
            let (topic, len) = read_string(&payload[pos..])?;
            let topic = topic.to_string();
            pos += len;
            let (message, len) = read_binary(&payload[pos..])?;
            let message = Bytes::copy_from_slice(message);
            pos += len;
            Some(Will {
                topic,
                payload: message,
                qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = if username_flag {
            let (u, len) = read_string(&payload[pos..])?;
            let u = u.to_string();
            pos += len;
            Some(u)
        } else {
            None
        };

        let password = if password_flag {
            let (p, len) = read_binary(&payload[pos..])?;
            let p = Bytes::copy_from_slice(p);
            pos += len;
            Some(p)
        } else {
            None
        };

        let _ = pos;

        Ok(Packet::Connect(Box::new(Connect {
            protocol_name,
            protocol_version,
            client_id,
            clean_session,
            keep_alive,
            will,
            username,
            password,
        })))
    }

    fn decode_connack(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }
        // First byte is reserved in v3.1
        let return_code = ConnectReturnCode::from_u8(payload[1])
            .ok_or(DecodeError::MalformedPacket("unknown connack return code"))?;
        Ok(Packet::ConnAck(ConnAck { return_code }))
    }

    fn decode_publish(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags & 0x06) >> 1;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        let retain = (flags & 0x01) != 0;

        let mut pos = 0;
        let (topic, len) = read_string(&payload[pos..])?;
        let topic: Arc<str> = Arc::from(topic);
        pos += len;

        let msg_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&payload[pos..])?;
            pos += 2;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("zero message id"));
            }
            Some(id)
        } else {
            None
        };

        let body = Bytes::copy_from_slice(&payload[pos..]);

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic,
            msg_id,
            payload: body,
        }))
    }

    fn decode_ack_id(payload: &[u8]) -> Result<u16, DecodeError> {
        read_u16(payload)
    }

    fn decode_subscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        // SUBSCRIBE is sent with the QoS-1 bit set
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }

        let mut pos = 0;
        let msg_id = read_u16(&payload[pos..])?;
        pos += 2;

        let mut filters = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            let filter = filter.to_string();
            pos += len;

            if pos >= payload.len() {
                return Err(DecodeError::InsufficientData);
            }
            let qos_byte = payload[pos];
            pos += 1;
            let qos = QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?;

            filters.push((filter, qos));
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket("subscribe with no filters"));
        }

        Ok(Packet::Subscribe(Subscribe { msg_id, filters }))
    }

    fn decode_suback(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        let mut pos = 0;
        let msg_id = read_u16(&payload[pos..])?;
        pos += 2;

        let mut granted = Vec::new();
        while pos < payload.len() {
            let qos = QoS::from_u8(payload[pos]).ok_or(DecodeError::InvalidQoS(payload[pos]))?;
            granted.push(qos);
            pos += 1;
        }

        Ok(Packet::SubAck(SubAck { msg_id, granted }))
    }

    fn decode_unsubscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }

        let mut pos = 0;
        let msg_id = read_u16(&payload[pos..])?;
        pos += 2;

        let mut filters = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            filters.push(filter.to_string());
            pos += len;
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket("unsubscribe with no filters"));
        }

        Ok(Packet::Unsubscribe(Unsubscribe { msg_id, filters }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
