// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The single flags octet: DUP | QoS | RETAIN | WILL | CLEAN | TopicIdType.

use crate::errors::{Error, Result};
use crate::messaging::QoS;
use serde::{Deserialize, Serialize};

pub(crate) const FLAG_DUP: u8 = 0b1000_0000;
pub(crate) const FLAG_QOS_MASK: u8 = 0b0110_0000;
pub(crate) const FLAG_QOS_SHIFT: u8 = 5;
pub(crate) const FLAG_RETAIN: u8 = 0b0001_0000;
pub(crate) const FLAG_WILL: u8 = 0b0000_1000;
pub(crate) const FLAG_CLEAN_SESSION: u8 = 0b0000_0100;
pub(crate) const FLAG_TOPIC_ID_TYPE_MASK: u8 = 0b0000_0011;

/// The two topic-type bits of the flags octet.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TopicIdType {
    /// A registered per-session alias.
    Normal,
    /// A predefined topic id.
    Predefined,
    /// A short (1- or 2-char) topic.
    Short,
}

impl TopicIdType {
    pub(crate) fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0b00 => Ok(Self::Normal),
            0b01 => Ok(Self::Predefined),
            0b10 => Ok(Self::Short),
            other => Err(Error::FailedToParse(format!(
                "reserved topic id type {}",
                other
            ))),
        }
    }

    pub(crate) fn bits(self) -> u8 {
        match self {
            Self::Normal => 0b00,
            Self::Predefined => 0b01,
            Self::Short => 0b10,
        }
    }
}

pub(crate) fn encode_publish(dup: bool, qos: QoS, retain: bool, id_type: TopicIdType) -> u8 {
    let mut byte = (qos.bits() << FLAG_QOS_SHIFT) | id_type.bits();
    if dup {
        byte |= FLAG_DUP;
    }
    if retain {
        byte |= FLAG_RETAIN;
    }
    byte
}

pub(crate) fn decode_publish(byte: u8) -> Result<(bool, QoS, bool, TopicIdType)> {
    let dup = byte & FLAG_DUP != 0;
    let qos = QoS::from_bits((byte & FLAG_QOS_MASK) >> FLAG_QOS_SHIFT)?;
    let retain = byte & FLAG_RETAIN != 0;
    let id_type = TopicIdType::from_bits(byte & FLAG_TOPIC_ID_TYPE_MASK)?;
    Ok((dup, qos, retain, id_type))
}

pub(crate) fn encode_connect(will: bool, clean_session: bool) -> u8 {
    let mut byte = 0;
    if will {
        byte |= FLAG_WILL;
    }
    if clean_session {
        byte |= FLAG_CLEAN_SESSION;
    }
    byte
}

pub(crate) fn decode_connect(byte: u8) -> (bool, bool) {
    (byte & FLAG_WILL != 0, byte & FLAG_CLEAN_SESSION != 0)
}

pub(crate) fn encode_subscribe(dup: bool, qos: QoS, id_type: TopicIdType) -> u8 {
    let mut byte = (qos.bits() << FLAG_QOS_SHIFT) | id_type.bits();
    if dup {
        byte |= FLAG_DUP;
    }
    byte
}

pub(crate) fn decode_subscribe(byte: u8) -> Result<(bool, QoS, TopicIdType)> {
    let dup = byte & FLAG_DUP != 0;
    let qos = QoS::from_bits((byte & FLAG_QOS_MASK) >> FLAG_QOS_SHIFT)?;
    let id_type = TopicIdType::from_bits(byte & FLAG_TOPIC_ID_TYPE_MASK)?;
    Ok((dup, qos, id_type))
}

pub(crate) fn encode_will(qos: QoS, retain: bool) -> u8 {
    let mut byte = qos.bits() << FLAG_QOS_SHIFT;
    if retain {
        byte |= FLAG_RETAIN;
    }
    byte
}

pub(crate) fn decode_will(byte: u8) -> Result<(QoS, bool)> {
    let qos = QoS::from_bits((byte & FLAG_QOS_MASK) >> FLAG_QOS_SHIFT)?;
    Ok((qos, byte & FLAG_RETAIN != 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_flags_round_trip_every_qos() {
        for qos in [
            QoS::AtMostOnce,
            QoS::AtLeastOnce,
            QoS::ExactlyOnce,
            QoS::MinusOne,
        ] {
            let byte = encode_publish(true, qos, true, TopicIdType::Short);
            let (dup, parsed, retain, id_type) = decode_publish(byte).expect("valid flags");
            assert!(dup);
            assert!(retain);
            assert_eq!(parsed, qos);
            assert_eq!(id_type, TopicIdType::Short);
        }
    }

    #[test]
    fn dup_qos1_predefined_matches_known_layout() {
        // DUP=1, QoS=01, RETAIN=0, WILL=0, CLEAN=0, type=predefined(01)
        let byte = encode_publish(true, QoS::AtLeastOnce, false, TopicIdType::Predefined);
        assert_eq!(byte, 0b1010_0001);
    }

    #[test]
    fn reserved_topic_type_is_rejected() {
        assert!(decode_publish(0b0000_0011).is_err());
    }
}
