//! MQTT v3 packet encoder

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck,
    Subscribe, UnsubAck, Unsubscribe,
};

/// MQTT v3 packet encoder
#[derive(Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet into the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(connect) => self.encode_connect(connect, buf),
            Packet::ConnAck(connack) => self.encode_connack(connack, buf),
            Packet::Publish(publish) => self.encode_publish(publish, buf),
            Packet::PubAck(p) => self.encode_ack(0x40, p.msg_id, buf),
            Packet::PubRec(p) => self.encode_ack(0x50, p.msg_id, buf),
            Packet::PubRel(p) => self.encode_pubrel(p, buf),
            Packet::PubComp(p) => self.encode_ack(0x70, p.msg_id, buf),
            Packet::Subscribe(subscribe) => self.encode_subscribe(subscribe, buf),
            Packet::SubAck(suback) => self.encode_suback(suback, buf),
            Packet::Unsubscribe(unsubscribe) => self.encode_unsubscribe(unsubscribe, buf),
            Packet::UnsubAck(p) => self.encode_ack(0xB0, p.msg_id, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0);
                buf.put_u8(0);
                Ok(())
            }
            Packet::PingResp => {
                buf.put_u8(0xD0);
                buf.put_u8(0);
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_u8(0xE0);
                buf.put_u8(0);
                Ok(())
            }
        }
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::with_capacity(64);

        write_string(&mut body, &packet.protocol_name)?;
        body.put_u8(packet.protocol_version);

        let mut connect_flags = 0u8;
        if packet.clean_session {
            connect_flags |= 0x02;
        }
        if let Some(ref will) = packet.will {
            connect_flags |= 0x04;
            connect_flags |= (will.qos as u8) << 3;
            if will.retain {
                connect_flags |= 0x20;
            }
        }
        if packet.password.is_some() {
            connect_flags |= 0x40;
        }
        if packet.username.is_some() {
            connect_flags |= 0x80;
        }
        body.put_u8(connect_flags);
        body.put_u16(packet.keep_alive);

        write_string(&mut body, &packet.client_id)?;

        if let Some(ref will) = packet.will {
            write_string(&mut body, &will.topic)?;
            write_binary(&mut body, &will.payload)?;
        }
        if let Some(ref username) = packet.username {
            write_string(&mut body, username)?;
        }
        if let Some(ref password) = packet.password {
            write_binary(&mut body, password)?;
        }

        buf.put_u8(0x10);
        write_variable_int(buf, body.len() as u32)?;
        buf.put_slice(&body);
        Ok(())
    }

    fn encode_connack(&self, packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x20);
        buf.put_u8(2);
        buf.put_u8(0); // reserved
        buf.put_u8(packet.return_code as u8);
        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut first_byte = 0x30;
        if packet.dup {
            first_byte |= 0x08;
        }
        first_byte |= (packet.qos as u8) << 1;
        if packet.retain {
            first_byte |= 0x01;
        }

        let mut remaining = 2 + packet.topic.len() + packet.payload.len();
        if packet.qos != QoS::AtMostOnce {
            remaining += 2;
        }

        buf.put_u8(first_byte);
        write_variable_int(buf, remaining as u32)?;
        write_string(buf, &packet.topic)?;
        if packet.qos != QoS::AtMostOnce {
            buf.put_u16(packet.msg_id.unwrap_or(0));
        }
        buf.put_slice(&packet.payload);
        Ok(())
    }

    fn encode_ack(&self, first_byte: u8, msg_id: u16, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(first_byte);
        buf.put_u8(2);
        buf.put_u16(msg_id);
        Ok(())
    }

    fn encode_pubrel(&self, packet: &PubRel, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // PUBREL carries the QoS-1 bit; dup is set on retransmission
        let mut first_byte = 0x62;
        if packet.dup {
            first_byte |= 0x08;
        }
        buf.put_u8(first_byte);
        buf.put_u8(2);
        buf.put_u16(packet.msg_id);
        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining = 2;
        for (filter, _) in &packet.filters {
            remaining += 2 + filter.len() + 1;
        }

        buf.put_u8(0x82);
        write_variable_int(buf, remaining as u32)?;
        buf.put_u16(packet.msg_id);
        for (filter, qos) in &packet.filters {
            write_string(buf, filter)?;
            buf.put_u8(*qos as u8);
        }
        Ok(())
    }

    fn encode_suback(&self, packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x90);
        write_variable_int(buf, (2 + packet.granted.len()) as u32)?;
        buf.put_u16(packet.msg_id);
        for qos in &packet.granted {
            buf.put_u8(*qos as u8);
        }
        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let mut remaining = 2;
        for filter in &packet.filters {
            remaining += 2 + filter.len();
        }

        buf.put_u8(0xA2);
        write_variable_int(buf, remaining as u32)?;
        buf.put_u16(packet.msg_id);
        for filter in &packet.filters {
            write_string(buf, filter)?;
        }
        Ok(())
    }
}
