//! MQTT protocol definitions and types
//!
//! Defines core protocol types shared by the MQTT v3 (TCP) and MQTT-SN
//! (UDP) variants of the broker.

mod error;
mod packet;
pub mod sn;

pub use error::{DecodeError, EncodeError, ProtocolError};
pub use packet::*;

/// Protocol name carried by a v3.1 CONNECT packet.
pub const PROTOCOL_NAME_V3: &str = "MQIsdp";
/// Legacy protocol name accepted for back-compat.
pub const PROTOCOL_NAME_V2: &str = "MQIpdp";

/// Public v3.1 protocol version byte.
pub const PROTOCOL_VERSION_V3: u8 = 3;
/// Legacy protocol version accepted with [`PROTOCOL_NAME_V2`].
pub const PROTOCOL_VERSION_V2: u8 = 2;
/// Private bridge protocol version: a broker connecting with this version
/// asks the remote end to set no_local on its session, suppressing publish
/// loops between bridged brokers.
pub const PRIVATE_PROTOCOL_VERSION: u8 = 0x83;

/// Check whether a (protocol name, version) pair from CONNECT is one we speak.
pub fn protocol_supported(name: &str, version: u8) -> bool {
    (name == PROTOCOL_NAME_V3
        && (version == PROTOCOL_VERSION_V3 || version == PRIVATE_PROTOCOL_VERSION))
        || (name == PROTOCOL_NAME_V2 && version == PROTOCOL_VERSION_V2)
}

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Returns the minimum of two QoS levels (delivery is capped at the
    /// lower of the publication and subscription grants)
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

/// CONNACK return codes (v3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnectReturnCode {
    /// Connection accepted
    #[default]
    Accepted = 0,
    /// The broker does not support the requested protocol name/version
    UnacceptableProtocolVersion = 1,
    /// Client identifier rejected (empty, or too long for v3.1)
    IdentifierRejected = 2,
    /// The broker is unavailable (shutting down, or listener full)
    BrokerUnavailable = 3,
    /// Bad user name or password
    BadUsernameOrPassword = 4,
    /// Not authorized to connect
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ConnectReturnCode::Accepted),
            1 => Some(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Some(ConnectReturnCode::IdentifierRejected),
            3 => Some(ConnectReturnCode::BrokerUnavailable),
            4 => Some(ConnectReturnCode::BadUsernameOrPassword),
            5 => Some(ConnectReturnCode::NotAuthorized),
            _ => None,
        }
    }
}

/// MQTT packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            5 => Some(PacketType::PubRec),
            6 => Some(PacketType::PubRel),
            7 => Some(PacketType::PubComp),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }
}
