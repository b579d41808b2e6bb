//! MQTT-SN packet definitions
//!
//! Packet layouts follow the MQTT-SN v1.2 specification. The flags octet is
//! shared between CONNECT, WILLTOPIC, PUBLISH, SUBSCRIBE, UNSUBSCRIBE and
//! SUBACK; not every field is meaningful in every packet.

use bytes::Bytes;

/// MQTT-SN protocol id carried by CONNECT.
pub const SN_PROTOCOL_ID: u8 = 0x01;

/// Message type codes
pub const SN_ADVERTISE: u8 = 0x00;
pub const SN_SEARCHGW: u8 = 0x01;
pub const SN_GWINFO: u8 = 0x02;
pub const SN_CONNECT: u8 = 0x04;
pub const SN_CONNACK: u8 = 0x05;
pub const SN_WILLTOPICREQ: u8 = 0x06;
pub const SN_WILLTOPIC: u8 = 0x07;
pub const SN_WILLMSGREQ: u8 = 0x08;
pub const SN_WILLMSG: u8 = 0x09;
pub const SN_REGISTER: u8 = 0x0A;
pub const SN_REGACK: u8 = 0x0B;
pub const SN_PUBLISH: u8 = 0x0C;
pub const SN_PUBACK: u8 = 0x0D;
pub const SN_PUBCOMP: u8 = 0x0E;
pub const SN_PUBREC: u8 = 0x0F;
pub const SN_PUBREL: u8 = 0x10;
pub const SN_SUBSCRIBE: u8 = 0x12;
pub const SN_SUBACK: u8 = 0x13;
pub const SN_UNSUBSCRIBE: u8 = 0x14;
pub const SN_UNSUBACK: u8 = 0x15;
pub const SN_PINGREQ: u8 = 0x16;
pub const SN_PINGRESP: u8 = 0x17;
pub const SN_DISCONNECT: u8 = 0x18;
pub const SN_WILLTOPICUPD: u8 = 0x1A;
pub const SN_WILLTOPICRESP: u8 = 0x1B;
pub const SN_WILLMSGUPD: u8 = 0x1C;
pub const SN_WILLMSGRESP: u8 = 0x1D;
/// Forwarder encapsulation frame
pub const SN_FRWDENCAP: u8 = 0xFE;

/// MQTT-SN return codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SnReturnCode {
    /// Accepted
    #[default]
    Accepted = 0,
    /// Rejected: congestion
    Congestion = 1,
    /// Rejected: invalid topic id
    InvalidTopicId = 2,
    /// Rejected: not supported
    NotSupported = 3,
}

impl SnReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(SnReturnCode::Accepted),
            1 => Some(SnReturnCode::Congestion),
            2 => Some(SnReturnCode::InvalidTopicId),
            3 => Some(SnReturnCode::NotSupported),
            _ => None,
        }
    }
}

/// Topic id type carried in the low two bits of the flags octet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TopicIdType {
    /// Topic id in PUBLISH, topic name in SUBSCRIBE
    #[default]
    Normal = 0,
    /// Pre-defined topic id, fixed by out-of-band agreement
    Predefined = 1,
    /// Two-character short topic name carried in the topic id field
    Short = 2,
}

impl TopicIdType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TopicIdType::Normal),
            1 => Some(TopicIdType::Predefined),
            2 => Some(TopicIdType::Short),
            _ => None,
        }
    }
}

/// The MQTT-SN flags octet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnFlags {
    pub dup: bool,
    /// QoS 0..2, or 3 for the connectionless one-shot publish
    pub qos: u8,
    pub retain: bool,
    pub will: bool,
    pub clean_session: bool,
    pub topic_id_type: TopicIdType,
}

impl SnFlags {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(Self {
            dup: (byte & 0x80) != 0,
            qos: (byte & 0x60) >> 5,
            retain: (byte & 0x10) != 0,
            will: (byte & 0x08) != 0,
            clean_session: (byte & 0x04) != 0,
            topic_id_type: TopicIdType::from_u8(byte & 0x03)?,
        })
    }

    pub fn to_byte(self) -> u8 {
        ((self.dup as u8) << 7)
            | ((self.qos & 0x03) << 5)
            | ((self.retain as u8) << 4)
            | ((self.will as u8) << 3)
            | ((self.clean_session as u8) << 2)
            | (self.topic_id_type as u8)
    }
}

/// Topic reference in SUBSCRIBE / UNSUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnTopic {
    /// Full topic name (NORMAL topic id type)
    Name(String),
    /// Pre-defined topic id
    Predefined(u16),
    /// Two-character short name
    Short([u8; 2]),
}

/// MQTT-SN packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnPacket {
    Advertise {
        gw_id: u8,
        duration: u16,
    },
    SearchGw {
        radius: u8,
    },
    GwInfo {
        gw_id: u8,
        gw_addr: Bytes,
    },
    Connect {
        flags: SnFlags,
        duration: u16,
        client_id: String,
    },
    ConnAck {
        return_code: SnReturnCode,
    },
    WillTopicReq,
    WillTopic {
        /// None means "delete the will"
        flags: Option<SnFlags>,
        topic: String,
    },
    WillMsgReq,
    WillMsg {
        message: Bytes,
    },
    Register {
        topic_id: u16,
        msg_id: u16,
        topic: String,
    },
    RegAck {
        topic_id: u16,
        msg_id: u16,
        return_code: SnReturnCode,
    },
    Publish {
        flags: SnFlags,
        topic_id: u16,
        msg_id: u16,
        /// Topic name embedded in a connectionless (QoS 3) NORMAL-type
        /// publish; on the wire the topic id field carries the name's
        /// length and the name sits between the message id and the
        /// payload. None for every other publish form.
        topic_name: Option<String>,
        payload: Bytes,
    },
    PubAck {
        topic_id: u16,
        msg_id: u16,
        return_code: SnReturnCode,
    },
    PubRec {
        msg_id: u16,
    },
    PubRel {
        msg_id: u16,
    },
    PubComp {
        msg_id: u16,
    },
    Subscribe {
        flags: SnFlags,
        msg_id: u16,
        topic: SnTopic,
    },
    SubAck {
        flags: SnFlags,
        topic_id: u16,
        msg_id: u16,
        return_code: SnReturnCode,
    },
    Unsubscribe {
        flags: SnFlags,
        msg_id: u16,
        topic: SnTopic,
    },
    UnsubAck {
        msg_id: u16,
    },
    PingReq {
        client_id: Option<String>,
    },
    PingResp,
    Disconnect {
        /// A sleeping client supplies the duration it intends to sleep
        duration: Option<u16>,
    },
    WillTopicUpd {
        flags: Option<SnFlags>,
        topic: String,
    },
    WillTopicResp {
        return_code: SnReturnCode,
    },
    WillMsgUpd {
        message: Bytes,
    },
    WillMsgResp {
        return_code: SnReturnCode,
    },
}

impl SnPacket {
    /// Get the wire message type code
    pub fn packet_type(&self) -> u8 {
        match self {
            SnPacket::Advertise { .. } => SN_ADVERTISE,
            SnPacket::SearchGw { .. } => SN_SEARCHGW,
            SnPacket::GwInfo { .. } => SN_GWINFO,
            SnPacket::Connect { .. } => SN_CONNECT,
            SnPacket::ConnAck { .. } => SN_CONNACK,
            SnPacket::WillTopicReq => SN_WILLTOPICREQ,
            SnPacket::WillTopic { .. } => SN_WILLTOPIC,
            SnPacket::WillMsgReq => SN_WILLMSGREQ,
            SnPacket::WillMsg { .. } => SN_WILLMSG,
            SnPacket::Register { .. } => SN_REGISTER,
            SnPacket::RegAck { .. } => SN_REGACK,
            SnPacket::Publish { .. } => SN_PUBLISH,
            SnPacket::PubAck { .. } => SN_PUBACK,
            SnPacket::PubRec { .. } => SN_PUBREC,
            SnPacket::PubRel { .. } => SN_PUBREL,
            SnPacket::PubComp { .. } => SN_PUBCOMP,
            SnPacket::Subscribe { .. } => SN_SUBSCRIBE,
            SnPacket::SubAck { .. } => SN_SUBACK,
            SnPacket::Unsubscribe { .. } => SN_UNSUBSCRIBE,
            SnPacket::UnsubAck { .. } => SN_UNSUBACK,
            SnPacket::PingReq { .. } => SN_PINGREQ,
            SnPacket::PingResp => SN_PINGRESP,
            SnPacket::Disconnect { .. } => SN_DISCONNECT,
            SnPacket::WillTopicUpd { .. } => SN_WILLTOPICUPD,
            SnPacket::WillTopicResp { .. } => SN_WILLTOPICRESP,
            SnPacket::WillMsgUpd { .. } => SN_WILLMSGUPD,
            SnPacket::WillMsgResp { .. } => SN_WILLMSGRESP,
        }
    }
}

/// A datagram as recovered from the wire: the packet plus, when the frame
/// arrived inside a forwarder encapsulation, the forwarder ctrl octet and
/// wireless node id that must be echoed on the reply path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnFrame {
    pub packet: SnPacket,
    pub encapsulation: Option<SnEncapsulation>,
}

/// Forwarder encapsulation header fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnEncapsulation {
    /// Ctrl octet (broadcast radius in the low bits)
    pub ctrl: u8,
    /// Wireless node id of the originating device
    pub wireless_node_id: Bytes,
}
