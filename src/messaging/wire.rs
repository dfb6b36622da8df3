// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Frame grammar: a 1-byte length (or the 3-byte long form whose first octet
//! is 0x01), a 1-byte message type, then the body. The length covers the
//! whole frame, length field included. 16-bit fields are big-endian.

use crate::errors::{Error, Result};
use crate::messaging::{
    flags, Message, MsgType, ProtocolVersion, QoS, ReturnCode, TopicRef, TopicSpec,
};
use bytes::{BufMut, Bytes, BytesMut};

/// Marker octet selecting the 3-byte length form.
const LONG_FORM: u8 = 0x01;

/// Largest frame the 1-byte length form can describe.
const SHORT_FORM_MAX: usize = 255;

/// Serialise a message into a datagram frame.
pub fn encode(msg: &Message) -> Result<Bytes> {
    let mut body = BytesMut::with_capacity(64);
    encode_body(msg, &mut body)?;

    // type octet + length field
    let short_total = body.len() + 2;
    let mut frame = BytesMut::with_capacity(short_total + 2);
    if short_total <= SHORT_FORM_MAX {
        frame.put_u8(short_total as u8);
    } else {
        let long_total = body.len() + 4;
        let total = u16::try_from(long_total)
            .map_err(|_| Error::Serialisation(format!("frame too large: {} octets", long_total)))?;
        frame.put_u8(LONG_FORM);
        frame.put_u16(total);
    }
    frame.put_u8(msg.msg_type() as u8);
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

/// Parse a datagram frame into a message.
pub fn decode(frame: &[u8]) -> Result<Message> {
    if frame.is_empty() {
        return Err(Error::FailedToParse("empty datagram".to_string()));
    }
    let (declared, header_len) = if frame[0] == LONG_FORM {
        if frame.len() < 4 {
            return Err(Error::FailedToParse(
                "truncated long-form header".to_string(),
            ));
        }
        (u16::from_be_bytes([frame[1], frame[2]]) as usize, 3)
    } else {
        (frame[0] as usize, 1)
    };
    if declared != frame.len() {
        return Err(Error::FailedToParse(format!(
            "length field says {} octets, datagram has {}",
            declared,
            frame.len()
        )));
    }
    if frame.len() < header_len + 1 {
        return Err(Error::FailedToParse("frame without type octet".to_string()));
    }
    let msg_type = MsgType::from_u8(frame[header_len])?;
    let mut body = &frame[header_len + 1..];
    decode_body(msg_type, &mut body)
}

fn encode_body(msg: &Message, out: &mut BytesMut) -> Result<()> {
    match msg {
        Message::Connect {
            will,
            clean_session,
            version,
            duration,
            client_id,
        } => {
            out.put_u8(flags::encode_connect(*will, *clean_session));
            out.put_u8(version.protocol_id());
            out.put_u16(*duration);
            out.put_slice(client_id.as_bytes());
        }
        Message::Connack { return_code } => out.put_u8(return_code.as_u8()),
        Message::WillTopicReq | Message::WillMsgReq | Message::Pingresp => {}
        Message::WillTopic { qos, retain, topic } | Message::WillTopicUpd { qos, retain, topic } => {
            out.put_u8(flags::encode_will(*qos, *retain));
            out.put_slice(topic.as_bytes());
        }
        Message::WillMsg { data } | Message::WillMsgUpd { data } => out.put_slice(data),
        Message::Register {
            topic_id,
            msg_id,
            topic_name,
        } => {
            out.put_u16(*topic_id);
            out.put_u16(*msg_id);
            out.put_slice(topic_name.as_bytes());
        }
        Message::Regack {
            topic_id,
            msg_id,
            return_code,
        }
        | Message::Puback {
            topic_id,
            msg_id,
            return_code,
        } => {
            out.put_u16(*topic_id);
            out.put_u16(*msg_id);
            out.put_u8(return_code.as_u8());
        }
        Message::Publish {
            dup,
            qos,
            retain,
            topic,
            msg_id,
            data,
        } => {
            out.put_u8(flags::encode_publish(*dup, *qos, *retain, topic.id_type()));
            out.put_u16(topic.raw_id());
            out.put_u16(*msg_id);
            out.put_slice(data);
        }
        Message::Pubcomp { msg_id } | Message::Pubrec { msg_id } | Message::Pubrel { msg_id } => {
            out.put_u16(*msg_id)
        }
        Message::Subscribe { dup, qos, msg_id, topic } => {
            encode_topic_spec(out, *dup, *qos, *msg_id, topic)
        }
        Message::Unsubscribe { msg_id, topic } => {
            encode_topic_spec(out, false, QoS::AtMostOnce, *msg_id, topic)
        }
        Message::Suback {
            qos,
            topic_id,
            msg_id,
            return_code,
        } => {
            out.put_u8(flags::encode_subscribe(false, *qos, flags::TopicIdType::Normal));
            out.put_u16(*topic_id);
            out.put_u16(*msg_id);
            out.put_u8(return_code.as_u8());
        }
        Message::Unsuback { msg_id } => out.put_u16(*msg_id),
        Message::Pingreq { client_id } => {
            if let Some(client_id) = client_id {
                out.put_slice(client_id.as_bytes());
            }
        }
        Message::Disconnect { duration } => {
            if let Some(duration) = duration {
                out.put_u16(*duration);
            }
        }
        Message::WillTopicResp { return_code } | Message::WillMsgResp { return_code } => {
            out.put_u8(return_code.as_u8())
        }
    }
    Ok(())
}

fn encode_topic_spec(out: &mut BytesMut, dup: bool, qos: QoS, msg_id: u16, topic: &TopicSpec) {
    let id_type = match topic {
        TopicSpec::Name(_) => flags::TopicIdType::Normal,
        TopicSpec::Predefined(_) => flags::TopicIdType::Predefined,
        TopicSpec::Short(_) => flags::TopicIdType::Short,
    };
    out.put_u8(flags::encode_subscribe(dup, qos, id_type));
    out.put_u16(msg_id);
    match topic {
        TopicSpec::Name(name) => out.put_slice(name.as_bytes()),
        TopicSpec::Predefined(id) => out.put_u16(*id),
        TopicSpec::Short(chars) => out.put_slice(chars),
    }
}

fn decode_body(msg_type: MsgType, body: &mut &[u8]) -> Result<Message> {
    let msg = match msg_type {
        MsgType::Connect => {
            let (will, clean_session) = flags::decode_connect(take_u8(body)?);
            let version = ProtocolVersion::from_protocol_id(take_u8(body)?)?;
            let duration = take_u16(body)?;
            let client_id = take_string(body)?;
            Message::Connect {
                will,
                clean_session,
                version,
                duration,
                client_id,
            }
        }
        MsgType::Connack => Message::Connack {
            return_code: ReturnCode::from_u8(take_u8(body)?)?,
        },
        MsgType::WillTopicReq => Message::WillTopicReq,
        MsgType::WillTopic | MsgType::WillTopicUpd => {
            // an empty WILLTOPIC clears the will
            let (qos, retain) = if body.is_empty() {
                (QoS::AtMostOnce, false)
            } else {
                flags::decode_will(take_u8(body)?)?
            };
            let topic = take_string(body)?;
            match msg_type {
                MsgType::WillTopic => Message::WillTopic { qos, retain, topic },
                _ => Message::WillTopicUpd { qos, retain, topic },
            }
        }
        MsgType::WillMsgReq => Message::WillMsgReq,
        MsgType::WillMsg => Message::WillMsg {
            data: take_bytes(body),
        },
        MsgType::WillMsgUpd => Message::WillMsgUpd {
            data: take_bytes(body),
        },
        MsgType::Register => Message::Register {
            topic_id: take_u16(body)?,
            msg_id: take_u16(body)?,
            topic_name: take_string(body)?,
        },
        MsgType::Regack => Message::Regack {
            topic_id: take_u16(body)?,
            msg_id: take_u16(body)?,
            return_code: ReturnCode::from_u8(take_u8(body)?)?,
        },
        MsgType::Publish => {
            let (dup, qos, retain, id_type) = flags::decode_publish(take_u8(body)?)?;
            let raw = take_u16(body)?;
            let msg_id = take_u16(body)?;
            Message::Publish {
                dup,
                qos,
                retain,
                topic: TopicRef::from_wire(id_type, raw),
                msg_id,
                data: take_bytes(body),
            }
        }
        MsgType::Puback => Message::Puback {
            topic_id: take_u16(body)?,
            msg_id: take_u16(body)?,
            return_code: ReturnCode::from_u8(take_u8(body)?)?,
        },
        MsgType::Pubcomp => Message::Pubcomp {
            msg_id: take_u16(body)?,
        },
        MsgType::Pubrec => Message::Pubrec {
            msg_id: take_u16(body)?,
        },
        MsgType::Pubrel => Message::Pubrel {
            msg_id: take_u16(body)?,
        },
        MsgType::Subscribe => {
            let (dup, qos, id_type) = flags::decode_subscribe(take_u8(body)?)?;
            let msg_id = take_u16(body)?;
            Message::Subscribe {
                dup,
                qos,
                msg_id,
                topic: decode_topic_spec(id_type, body)?,
            }
        }
        MsgType::Suback => {
            let (_, qos, _) = flags::decode_subscribe(take_u8(body)?)?;
            Message::Suback {
                qos,
                topic_id: take_u16(body)?,
                msg_id: take_u16(body)?,
                return_code: ReturnCode::from_u8(take_u8(body)?)?,
            }
        }
        MsgType::Unsubscribe => {
            let (_, _, id_type) = flags::decode_subscribe(take_u8(body)?)?;
            let msg_id = take_u16(body)?;
            Message::Unsubscribe {
                msg_id,
                topic: decode_topic_spec(id_type, body)?,
            }
        }
        MsgType::Unsuback => Message::Unsuback {
            msg_id: take_u16(body)?,
        },
        MsgType::Pingreq => {
            let client_id = if body.is_empty() {
                None
            } else {
                Some(take_string(body)?)
            };
            Message::Pingreq { client_id }
        }
        MsgType::Pingresp => Message::Pingresp,
        MsgType::Disconnect => {
            let duration = if body.is_empty() {
                None
            } else {
                Some(take_u16(body)?)
            };
            Message::Disconnect { duration }
        }
        MsgType::WillTopicResp => Message::WillTopicResp {
            return_code: ReturnCode::from_u8(take_u8(body)?)?,
        },
        MsgType::WillMsgResp => Message::WillMsgResp {
            return_code: ReturnCode::from_u8(take_u8(body)?)?,
        },
    };
    if !body.is_empty() {
        return Err(Error::FailedToParse(format!(
            "{} trailing octets after {:?} body",
            body.len(),
            msg_type
        )));
    }
    Ok(msg)
}

fn decode_topic_spec(id_type: flags::TopicIdType, body: &mut &[u8]) -> Result<TopicSpec> {
    let spec = match id_type {
        flags::TopicIdType::Normal => TopicSpec::Name(take_string(body)?),
        flags::TopicIdType::Predefined => TopicSpec::Predefined(take_u16(body)?),
        flags::TopicIdType::Short => {
            let raw = take_u16(body)?;
            let [a, b] = raw.to_be_bytes();
            TopicSpec::Short([a, b])
        }
    };
    Ok(spec)
}

fn take_u8(body: &mut &[u8]) -> Result<u8> {
    match body.split_first() {
        Some((byte, rest)) => {
            *body = rest;
            Ok(*byte)
        }
        None => Err(Error::FailedToParse("body truncated".to_string())),
    }
}

fn take_u16(body: &mut &[u8]) -> Result<u16> {
    if body.len() < 2 {
        return Err(Error::FailedToParse("body truncated".to_string()));
    }
    let value = u16::from_be_bytes([body[0], body[1]]);
    *body = &body[2..];
    Ok(value)
}

fn take_string(body: &mut &[u8]) -> Result<String> {
    let raw = take_bytes(body);
    String::from_utf8(raw.to_vec())
        .map_err(|_| Error::FailedToParse("non-utf8 string field".to_string()))
}

fn take_bytes(body: &mut &[u8]) -> Bytes {
    let raw = Bytes::copy_from_slice(body);
    *body = &[];
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::TopicIdType;

    #[test]
    fn publish_with_short_topic_encodes_the_chars_in_the_id_field() {
        let msg = Message::Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: TopicRef::short("ab").expect("two ascii chars"),
            msg_id: 9,
            data: Bytes::from_static(b"x"),
        };
        let frame = encode(&msg).expect("encodable");
        // len, type, flags, topic_id(2), msg_id(2), data(1)
        assert_eq!(frame.len(), 8);
        assert_eq!(frame[0], 8);
        assert_eq!(frame[1], MsgType::Publish as u8);
        assert_eq!(&frame[3..5], b"ab");
        assert_eq!(decode(&frame).expect("decodable"), msg);
    }

    #[test]
    fn qos_minus_one_publish_survives_the_wire() {
        let msg = Message::Publish {
            dup: false,
            qos: QoS::MinusOne,
            retain: false,
            topic: TopicRef::Predefined(12),
            msg_id: 0,
            data: Bytes::from_static(b"telemetry"),
        };
        let frame = encode(&msg).expect("encodable");
        match decode(&frame).expect("decodable") {
            Message::Publish { qos, topic, .. } => {
                assert_eq!(qos, QoS::MinusOne);
                assert_eq!(topic, TopicRef::Predefined(12));
            }
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn long_form_kicks_in_past_255_octets() {
        let msg = Message::Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: TopicRef::Normal(3),
            msg_id: 0,
            data: Bytes::from(vec![0x42; 400]),
        };
        let frame = encode(&msg).expect("encodable");
        assert_eq!(frame[0], 0x01);
        let declared = u16::from_be_bytes([frame[1], frame[2]]) as usize;
        assert_eq!(declared, frame.len());
        assert_eq!(decode(&frame).expect("decodable"), msg);
    }

    #[test]
    fn connect_carries_version_and_client_id() {
        let msg = Message::Connect {
            will: false,
            clean_session: true,
            version: ProtocolVersion::V1_2,
            duration: 300,
            client_id: "sensor-7".to_string(),
        };
        let frame = encode(&msg).expect("encodable");
        assert_eq!(decode(&frame).expect("decodable"), msg);
    }

    #[test]
    fn disconnect_duration_is_optional() {
        let plain = Message::Disconnect { duration: None };
        let sleepy = Message::Disconnect {
            duration: Some(120),
        };
        assert_eq!(
            decode(&encode(&plain).expect("encodable")).expect("decodable"),
            plain
        );
        assert_eq!(
            decode(&encode(&sleepy).expect("encodable")).expect("decodable"),
            sleepy
        );
    }

    #[test]
    fn subscribe_topic_forms() {
        for topic in [
            TopicSpec::Name("sensors/+/temp".to_string()),
            TopicSpec::Predefined(4),
            TopicSpec::Short([b'a', b'b']),
        ] {
            let msg = Message::Subscribe {
                dup: false,
                qos: QoS::AtLeastOnce,
                msg_id: 2,
                topic: topic.clone(),
            };
            assert_eq!(
                decode(&encode(&msg).expect("encodable")).expect("decodable"),
                msg
            );
        }
    }

    #[test]
    fn truncated_and_mismatched_frames_are_rejected() {
        // declared length longer than the datagram
        assert!(decode(&[9, MsgType::Pingresp as u8]).is_err());
        // declared length shorter than the datagram
        assert!(decode(&[2, MsgType::Pingresp as u8, 0xFF]).is_err());
        // body shorter than the fixed fields
        assert!(decode(&[4, MsgType::Puback as u8, 0, 0]).is_err());
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn short_topic_ref_packs_one_and_two_chars() {
        assert_eq!(TopicRef::short("a"), Some(TopicRef::Short([b'a', 0])));
        assert_eq!(TopicRef::short("ab"), Some(TopicRef::Short([b'a', b'b'])));
        assert_eq!(TopicRef::short("abc"), None);
        let short = TopicRef::short("ab").expect("fits");
        assert_eq!(short.id_type(), TopicIdType::Short);
        assert_eq!(short.short_path().as_deref(), Some("ab"));
    }
}
