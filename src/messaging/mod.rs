// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The MQTT-SN message model and its wire codec.
//!
//! [`Message`] is the in-memory form shared by both protocol revisions; the
//! classification surface on it (`needs_id`, `originates_exchange`,
//! `requires_response`, `is_terminal`, ...) is the contract the state service
//! consumes. [`wire`] carries the length-prefixed v1.2 frame grammar.

mod flags;
mod wire;

pub use self::flags::TopicIdType;
pub use self::wire::{decode, encode};

use crate::errors::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol revision, negotiated by the `protocol_id` octet of CONNECT.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// MQTT-SN 1.2.
    V1_2,
    /// MQTT-SN 2.0. Shares the 1.2 framing for the message subset carried
    /// here; the revision is recorded per peer so the extended encoding can
    /// slot in behind the same classification surface.
    V2_0,
}

impl ProtocolVersion {
    /// Parse the CONNECT `protocol_id` octet.
    pub fn from_protocol_id(id: u8) -> Result<Self> {
        match id {
            0x01 => Ok(Self::V1_2),
            0x02 => Ok(Self::V2_0),
            other => Err(Error::FailedToParse(format!(
                "unsupported protocol id {:#04x}",
                other
            ))),
        }
    }

    /// The CONNECT `protocol_id` octet for this revision.
    pub fn protocol_id(self) -> u8 {
        match self {
            Self::V1_2 => 0x01,
            Self::V2_0 => 0x02,
        }
    }
}

/// Quality of service of a publish.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Confirmed by PUBACK.
    AtLeastOnce,
    /// Two-turn handshake via PUBREC/PUBREL/PUBCOMP.
    ExactlyOnce,
    /// The connectionless "-1" publish. Delivered like QoS 0.
    MinusOne,
}

impl QoS {
    pub(crate) fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0b00 => Ok(Self::AtMostOnce),
            0b01 => Ok(Self::AtLeastOnce),
            0b10 => Ok(Self::ExactlyOnce),
            0b11 => Ok(Self::MinusOne),
            other => Err(Error::FailedToParse(format!("bad qos bits {}", other))),
        }
    }

    pub(crate) fn bits(self) -> u8 {
        match self {
            Self::AtMostOnce => 0b00,
            Self::AtLeastOnce => 0b01,
            Self::ExactlyOnce => 0b10,
            Self::MinusOne => 0b11,
        }
    }

    /// True for the levels whose delivery is confirmed by the peer.
    pub fn is_confirmable(self) -> bool {
        matches!(self, Self::AtLeastOnce | Self::ExactlyOnce)
    }
}

/// Wire return codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ReturnCode {
    /// Request accepted.
    Accepted,
    /// Rejected, gateway congested.
    Congested,
    /// Rejected, the topic id is not known.
    InvalidTopicId,
    /// Rejected, feature not supported.
    NotSupported,
}

impl ReturnCode {
    pub(crate) fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::Congested),
            2 => Ok(Self::InvalidTopicId),
            3 => Ok(Self::NotSupported),
            other => Err(Error::FailedToParse(format!(
                "unknown return code {}",
                other
            ))),
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::Congested => 1,
            Self::InvalidTopicId => 2,
            Self::NotSupported => 3,
        }
    }

    /// True for every code but `Accepted`.
    pub fn is_error(self) -> bool {
        !matches!(self, Self::Accepted)
    }
}

/// How a publish references its topic in the 16-bit `topic_id` field.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TopicRef {
    /// A per-session alias established by REGISTER.
    Normal(u16),
    /// A predefined id shared by out-of-band agreement.
    Predefined(u16),
    /// A 1- or 2-ASCII-char topic packed straight into the field.
    Short([u8; 2]),
}

impl TopicRef {
    /// The raw 16-bit field value.
    pub fn raw_id(&self) -> u16 {
        match self {
            Self::Normal(id) | Self::Predefined(id) => *id,
            Self::Short([a, b]) => u16::from_be_bytes([*a, *b]),
        }
    }

    pub(crate) fn id_type(&self) -> TopicIdType {
        match self {
            Self::Normal(_) => TopicIdType::Normal,
            Self::Predefined(_) => TopicIdType::Predefined,
            Self::Short(_) => TopicIdType::Short,
        }
    }

    pub(crate) fn from_wire(id_type: TopicIdType, raw: u16) -> Self {
        match id_type {
            TopicIdType::Normal => Self::Normal(raw),
            TopicIdType::Predefined => Self::Predefined(raw),
            TopicIdType::Short => {
                let [a, b] = raw.to_be_bytes();
                Self::Short([a, b])
            }
        }
    }

    /// Pack a 1- or 2-ASCII-char topic path, if it fits.
    pub fn short(path: &str) -> Option<Self> {
        let bytes = path.as_bytes();
        match bytes {
            [a] if a.is_ascii() => Some(Self::Short([*a, 0])),
            [a, b] if a.is_ascii() && b.is_ascii() => Some(Self::Short([*a, *b])),
            _ => None,
        }
    }

    /// The topic path of a short topic.
    pub fn short_path(&self) -> Option<String> {
        match self {
            Self::Short([a, 0]) => Some((*a as char).to_string()),
            Self::Short([a, b]) => Some(format!("{}{}", *a as char, *b as char)),
            _ => None,
        }
    }
}

/// Topic as carried by SUBSCRIBE/UNSUBSCRIBE: a full name, or an id form.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TopicSpec {
    /// A full topic name (or filter).
    Name(String),
    /// A predefined topic id.
    Predefined(u16),
    /// A short topic.
    Short([u8; 2]),
}

/// Wire message types.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum MsgType {
    Connect = 0x04,
    Connack = 0x05,
    WillTopicReq = 0x06,
    WillTopic = 0x07,
    WillMsgReq = 0x08,
    WillMsg = 0x09,
    Register = 0x0A,
    Regack = 0x0B,
    Publish = 0x0C,
    Puback = 0x0D,
    Pubcomp = 0x0E,
    Pubrec = 0x0F,
    Pubrel = 0x10,
    Subscribe = 0x12,
    Suback = 0x13,
    Unsubscribe = 0x14,
    Unsuback = 0x15,
    Pingreq = 0x16,
    Pingresp = 0x17,
    Disconnect = 0x18,
    WillTopicUpd = 0x1A,
    WillTopicResp = 0x1B,
    WillMsgUpd = 0x1C,
    WillMsgResp = 0x1D,
}

impl MsgType {
    pub(crate) fn from_u8(byte: u8) -> Result<Self> {
        use MsgType::*;
        let msg_type = match byte {
            0x04 => Connect,
            0x05 => Connack,
            0x06 => WillTopicReq,
            0x07 => WillTopic,
            0x08 => WillMsgReq,
            0x09 => WillMsg,
            0x0A => Register,
            0x0B => Regack,
            0x0C => Publish,
            0x0D => Puback,
            0x0E => Pubcomp,
            0x0F => Pubrec,
            0x10 => Pubrel,
            0x12 => Subscribe,
            0x13 => Suback,
            0x14 => Unsubscribe,
            0x15 => Unsuback,
            0x16 => Pingreq,
            0x17 => Pingresp,
            0x18 => Disconnect,
            0x1A => WillTopicUpd,
            0x1B => WillTopicResp,
            0x1C => WillMsgUpd,
            0x1D => WillMsgResp,
            other => {
                return Err(Error::FailedToParse(format!(
                    "unknown message type {:#04x}",
                    other
                )))
            }
        };
        Ok(msg_type)
    }
}

/// An MQTT-SN message, decoupled from its wire form.
#[derive(Clone, Debug, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum Message {
    Connect {
        will: bool,
        clean_session: bool,
        version: ProtocolVersion,
        duration: u16,
        client_id: String,
    },
    Connack {
        return_code: ReturnCode,
    },
    WillTopicReq,
    WillTopic {
        qos: QoS,
        retain: bool,
        topic: String,
    },
    WillMsgReq,
    WillMsg {
        data: Bytes,
    },
    Register {
        topic_id: u16,
        msg_id: u16,
        topic_name: String,
    },
    Regack {
        topic_id: u16,
        msg_id: u16,
        return_code: ReturnCode,
    },
    Publish {
        dup: bool,
        qos: QoS,
        retain: bool,
        topic: TopicRef,
        msg_id: u16,
        data: Bytes,
    },
    Puback {
        topic_id: u16,
        msg_id: u16,
        return_code: ReturnCode,
    },
    Pubcomp {
        msg_id: u16,
    },
    Pubrec {
        msg_id: u16,
    },
    Pubrel {
        msg_id: u16,
    },
    Subscribe {
        dup: bool,
        qos: QoS,
        msg_id: u16,
        topic: TopicSpec,
    },
    Suback {
        qos: QoS,
        topic_id: u16,
        msg_id: u16,
        return_code: ReturnCode,
    },
    Unsubscribe {
        msg_id: u16,
        topic: TopicSpec,
    },
    Unsuback {
        msg_id: u16,
    },
    Pingreq {
        client_id: Option<String>,
    },
    Pingresp,
    Disconnect {
        duration: Option<u16>,
    },
    WillTopicUpd {
        qos: QoS,
        retain: bool,
        topic: String,
    },
    WillTopicResp {
        return_code: ReturnCode,
    },
    WillMsgUpd {
        data: Bytes,
    },
    WillMsgResp {
        return_code: ReturnCode,
    },
}

impl Message {
    /// The wire type of this message.
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::Connect { .. } => MsgType::Connect,
            Self::Connack { .. } => MsgType::Connack,
            Self::WillTopicReq => MsgType::WillTopicReq,
            Self::WillTopic { .. } => MsgType::WillTopic,
            Self::WillMsgReq => MsgType::WillMsgReq,
            Self::WillMsg { .. } => MsgType::WillMsg,
            Self::Register { .. } => MsgType::Register,
            Self::Regack { .. } => MsgType::Regack,
            Self::Publish { .. } => MsgType::Publish,
            Self::Puback { .. } => MsgType::Puback,
            Self::Pubcomp { .. } => MsgType::Pubcomp,
            Self::Pubrec { .. } => MsgType::Pubrec,
            Self::Pubrel { .. } => MsgType::Pubrel,
            Self::Subscribe { .. } => MsgType::Subscribe,
            Self::Suback { .. } => MsgType::Suback,
            Self::Unsubscribe { .. } => MsgType::Unsubscribe,
            Self::Unsuback { .. } => MsgType::Unsuback,
            Self::Pingreq { .. } => MsgType::Pingreq,
            Self::Pingresp => MsgType::Pingresp,
            Self::Disconnect { .. } => MsgType::Disconnect,
            Self::WillTopicUpd { .. } => MsgType::WillTopicUpd,
            Self::WillTopicResp { .. } => MsgType::WillTopicResp,
            Self::WillMsgUpd { .. } => MsgType::WillMsgUpd,
            Self::WillMsgResp { .. } => MsgType::WillMsgResp,
        }
    }

    /// True for kinds whose wire form carries a 16-bit packet id.
    pub fn needs_id(&self) -> bool {
        matches!(
            self,
            Self::Register { .. }
                | Self::Regack { .. }
                | Self::Publish { .. }
                | Self::Puback { .. }
                | Self::Pubcomp { .. }
                | Self::Pubrec { .. }
                | Self::Pubrel { .. }
                | Self::Subscribe { .. }
                | Self::Suback { .. }
                | Self::Unsubscribe { .. }
                | Self::Unsuback { .. }
        )
    }

    /// The packet id, or 0 when the kind carries none (or it is unassigned).
    pub fn msg_id(&self) -> u16 {
        match self {
            Self::Register { msg_id, .. }
            | Self::Regack { msg_id, .. }
            | Self::Publish { msg_id, .. }
            | Self::Puback { msg_id, .. }
            | Self::Pubcomp { msg_id }
            | Self::Pubrec { msg_id }
            | Self::Pubrel { msg_id }
            | Self::Subscribe { msg_id, .. }
            | Self::Suback { msg_id, .. }
            | Self::Unsubscribe { msg_id, .. }
            | Self::Unsuback { msg_id } => *msg_id,
            _ => 0,
        }
    }

    pub(crate) fn set_msg_id(&mut self, id: u16) {
        match self {
            Self::Register { msg_id, .. }
            | Self::Regack { msg_id, .. }
            | Self::Publish { msg_id, .. }
            | Self::Puback { msg_id, .. }
            | Self::Pubcomp { msg_id }
            | Self::Pubrec { msg_id }
            | Self::Pubrel { msg_id }
            | Self::Subscribe { msg_id, .. }
            | Self::Suback { msg_id, .. }
            | Self::Unsubscribe { msg_id, .. }
            | Self::Unsuback { msg_id } => *msg_id = id,
            _ => {}
        }
    }

    /// True for kinds that open (or continue) an exchange on the sender's
    /// initiative, as opposed to responses. On the receive path these are
    /// looked up against the REMOTE table.
    ///
    /// PUBREL is in this set: it continues the publisher-originated QoS 2
    /// flow, so it must find the publish pinned on the receiving side.
    pub fn originates_exchange(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::Register { .. }
                | Self::Publish { .. }
                | Self::Pubrel { .. }
                | Self::Subscribe { .. }
                | Self::Unsubscribe { .. }
                | Self::Pingreq { .. }
                | Self::WillTopicReq
                | Self::WillMsgReq
                | Self::WillTopicUpd { .. }
                | Self::WillMsgUpd { .. }
        )
    }

    /// True when the sender of this message awaits a terminal reply for it.
    pub fn requires_response(&self) -> bool {
        match self {
            Self::Connect { .. }
            | Self::Register { .. }
            | Self::Subscribe { .. }
            | Self::Unsubscribe { .. }
            | Self::Pingreq { .. }
            | Self::Disconnect { .. }
            | Self::WillTopicReq
            | Self::WillMsgReq
            | Self::WillTopicUpd { .. }
            | Self::WillMsgUpd { .. } => true,
            Self::Publish { qos, .. } => qos.is_confirmable(),
            _ => false,
        }
    }

    /// True for responses that close an inflight exchange.
    ///
    /// PUBREL is terminal: it closes the receiving side of an inbound QoS 2
    /// publish (the commit point for inbound exactly-once delivery).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Connack { .. }
                | Self::Regack { .. }
                | Self::Puback { .. }
                | Self::Pubcomp { .. }
                | Self::Pubrel { .. }
                | Self::Suback { .. }
                | Self::Unsuback { .. }
                | Self::Pingresp
                | Self::Disconnect { .. }
                | Self::WillTopic { .. }
                | Self::WillMsg { .. }
                | Self::WillTopicResp { .. }
                | Self::WillMsgResp { .. }
        )
    }

    /// The return code carried by this message, if its kind has one.
    pub fn return_code(&self) -> Option<ReturnCode> {
        match self {
            Self::Connack { return_code }
            | Self::Regack { return_code, .. }
            | Self::Puback { return_code, .. }
            | Self::Suback { return_code, .. }
            | Self::WillTopicResp { return_code }
            | Self::WillMsgResp { return_code } => Some(*return_code),
            _ => None,
        }
    }

    /// True when this is a terminal response carrying a non-zero return code.
    pub fn is_error_frame(&self) -> bool {
        self.return_code().map(ReturnCode::is_error).unwrap_or(false)
    }

    /// True for kinds that advance the session's liveness clock. Keepalives
    /// and error frames do not.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Pingreq { .. } | Self::Pingresp) && !self.is_error_frame()
    }

    /// The QoS, for publishes.
    pub fn qos(&self) -> Option<QoS> {
        match self {
            Self::Publish { qos, .. } => Some(*qos),
            _ => None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(id {})", self.msg_type(), self.msg_id())
    }
}

/// Whether `response` is a valid terminal for the stored `request`.
///
/// The id pairing is already established by the inflight lookup; this checks
/// the kind pairing only.
pub fn valid_response(request: &Message, response: &Message) -> bool {
    match (request, response) {
        (Message::Connect { .. }, Message::Connack { .. }) => true,
        (Message::Register { .. }, Message::Regack { .. }) => true,
        (
            Message::Publish {
                qos: QoS::AtLeastOnce,
                ..
            },
            Message::Puback { .. },
        ) => true,
        (
            Message::Publish {
                qos: QoS::ExactlyOnce,
                ..
            },
            Message::Pubcomp { .. } | Message::Pubrel { .. },
        ) => true,
        (Message::Subscribe { .. }, Message::Suback { .. }) => true,
        (Message::Unsubscribe { .. }, Message::Unsuback { .. }) => true,
        (Message::Pingreq { .. }, Message::Pingresp) => true,
        (Message::Disconnect { .. }, Message::Disconnect { .. }) => true,
        (Message::WillTopicReq, Message::WillTopic { .. }) => true,
        (Message::WillMsgReq, Message::WillMsg { .. }) => true,
        (Message::WillTopicUpd { .. }, Message::WillTopicResp { .. }) => true,
        (Message::WillMsgUpd { .. }, Message::WillMsgResp { .. }) => true,
        _ => false,
    }
}
