//! Broker packet definitions
//!
//! Typed view of the frames exchanged with the publish/subscribe broker.
//! Strings are UTF-8 with a 2-byte big-endian length prefix; packet
//! identifiers are 2-byte big-endian.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::frame::{Frame, FrameError, PacketType};

/// Protocol name sent in CONNECT
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level sent in CONNECT (3.1.1)
pub const PROTOCOL_LEVEL: u8 = 4;

/// CONNACK return code for an accepted connection
pub const CONNACK_ACCEPTED: u8 = 0x00;

/// SUBACK return code for a refused subscription
pub const SUBACK_FAILURE: u8 = 0x80;

/// Delivery guarantee for a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
}

impl TryFrom<u8> for QoS {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            other => Err(FrameError::UnsupportedQos(other)),
        }
    }
}

/// CONNECT contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
}

/// PUBLISH contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    /// Present only when `qos` is above at-most-once
    pub packet_id: Option<u16>,
    pub dup: bool,
    pub retain: bool,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            packet_id: None,
            dup: false,
            retain: false,
        }
    }
}

/// A typed broker packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(ConnectOptions),
    ConnAck { session_present: bool, return_code: u8 },
    Publish(Publish),
    PubAck { packet_id: u16 },
    Subscribe { packet_id: u16, topics: Vec<(String, QoS)> },
    SubAck { packet_id: u16, return_codes: Vec<u8> },
    Unsubscribe { packet_id: u16, topics: Vec<String> },
    UnsubAck { packet_id: u16 },
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Encode into a frame
    pub fn to_frame(&self) -> Frame {
        match self {
            Packet::Connect(opts) => {
                let mut body = Vec::new();
                put_str(&mut body, PROTOCOL_NAME);
                body.push(PROTOCOL_LEVEL);

                let mut flags = 0u8;
                if opts.clean_session {
                    flags |= 0x02;
                }
                if opts.password.is_some() {
                    flags |= 0x40;
                }
                if opts.username.is_some() {
                    flags |= 0x80;
                }
                body.push(flags);
                body.extend_from_slice(&opts.keep_alive_secs.to_be_bytes());

                put_str(&mut body, &opts.client_id);
                if let Some(ref username) = opts.username {
                    put_str(&mut body, username);
                }
                if let Some(ref password) = opts.password {
                    put_str(&mut body, password);
                }
                Frame::new(PacketType::Connect, 0, body)
            }
            Packet::ConnAck {
                session_present,
                return_code,
            } => Frame::new(
                PacketType::ConnAck,
                0,
                vec![u8::from(*session_present), *return_code],
            ),
            Packet::Publish(publish) => {
                let mut body = Vec::with_capacity(2 + publish.topic.len() + 2 + publish.payload.len());
                put_str(&mut body, &publish.topic);
                if publish.qos != QoS::AtMostOnce {
                    body.extend_from_slice(&publish.packet_id.unwrap_or(0).to_be_bytes());
                }
                body.extend_from_slice(&publish.payload);

                let mut flags = (publish.qos as u8) << 1;
                if publish.dup {
                    flags |= 0x08;
                }
                if publish.retain {
                    flags |= 0x01;
                }
                Frame::new(PacketType::Publish, flags, body)
            }
            Packet::PubAck { packet_id } => {
                Frame::new(PacketType::PubAck, 0, packet_id.to_be_bytes().to_vec())
            }
            Packet::Subscribe { packet_id, topics } => {
                let mut body = packet_id.to_be_bytes().to_vec();
                for (topic, qos) in topics {
                    put_str(&mut body, topic);
                    body.push(*qos as u8);
                }
                Frame::new(PacketType::Subscribe, 0x02, body)
            }
            Packet::SubAck {
                packet_id,
                return_codes,
            } => {
                let mut body = packet_id.to_be_bytes().to_vec();
                body.extend_from_slice(return_codes);
                Frame::new(PacketType::SubAck, 0, body)
            }
            Packet::Unsubscribe { packet_id, topics } => {
                let mut body = packet_id.to_be_bytes().to_vec();
                for topic in topics {
                    put_str(&mut body, topic);
                }
                Frame::new(PacketType::Unsubscribe, 0x02, body)
            }
            Packet::UnsubAck { packet_id } => {
                Frame::new(PacketType::UnsubAck, 0, packet_id.to_be_bytes().to_vec())
            }
            Packet::PingReq => Frame::empty(PacketType::PingReq),
            Packet::PingResp => Frame::empty(PacketType::PingResp),
            Packet::Disconnect => Frame::empty(PacketType::Disconnect),
        }
    }

    /// Serialize straight to wire bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        self.to_frame().to_bytes()
    }

    /// Decode a frame into a typed packet
    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        let mut reader = Reader::new(&frame.payload);

        let packet = match frame.packet_type {
            PacketType::Connect => {
                let name = reader.string("protocol name")?;
                if name != PROTOCOL_NAME {
                    return Err(FrameError::Truncated("protocol name"));
                }
                let _level = reader.u8("protocol level")?;
                let flags = reader.u8("connect flags")?;
                let keep_alive_secs = reader.u16("keep alive")?;
                let client_id = reader.string("client id")?;
                let username = if flags & 0x80 != 0 {
                    Some(reader.string("username")?)
                } else {
                    None
                };
                let password = if flags & 0x40 != 0 {
                    Some(reader.string("password")?)
                } else {
                    None
                };
                Packet::Connect(ConnectOptions {
                    client_id,
                    username,
                    password,
                    keep_alive_secs,
                    clean_session: flags & 0x02 != 0,
                })
            }
            PacketType::ConnAck => {
                let ack_flags = reader.u8("connack flags")?;
                let return_code = reader.u8("connack return code")?;
                Packet::ConnAck {
                    session_present: ack_flags & 0x01 != 0,
                    return_code,
                }
            }
            PacketType::Publish => {
                let qos = QoS::try_from((frame.flags >> 1) & 0x03)?;
                let topic = reader.string("topic")?;
                let packet_id = if qos != QoS::AtMostOnce {
                    Some(reader.u16("packet id")?)
                } else {
                    None
                };
                Packet::Publish(Publish {
                    topic,
                    payload: frame.payload.slice(reader.position()..),
                    qos,
                    packet_id,
                    dup: frame.flags & 0x08 != 0,
                    retain: frame.flags & 0x01 != 0,
                })
            }
            PacketType::PubAck => Packet::PubAck {
                packet_id: reader.u16("packet id")?,
            },
            PacketType::Subscribe => {
                let packet_id = reader.u16("packet id")?;
                let mut topics = Vec::new();
                while !reader.is_empty() {
                    let topic = reader.string("topic filter")?;
                    let qos = QoS::try_from(reader.u8("requested qos")? & 0x03)?;
                    topics.push((topic, qos));
                }
                Packet::Subscribe { packet_id, topics }
            }
            PacketType::SubAck => {
                let packet_id = reader.u16("packet id")?;
                Packet::SubAck {
                    packet_id,
                    return_codes: reader.rest().to_vec(),
                }
            }
            PacketType::Unsubscribe => {
                let packet_id = reader.u16("packet id")?;
                let mut topics = Vec::new();
                while !reader.is_empty() {
                    topics.push(reader.string("topic filter")?);
                }
                Packet::Unsubscribe { packet_id, topics }
            }
            PacketType::UnsubAck => Packet::UnsubAck {
                packet_id: reader.u16("packet id")?,
            },
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect,
        };

        Ok(packet)
    }
}

fn put_str(buf: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(&bytes[..len]);
}

/// Cursor over a frame body
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos.min(self.data.len())..]
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], FrameError> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(FrameError::Truncated(what));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, FrameError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, FrameError> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn string(&mut self, what: &'static str) -> Result<String, FrameError> {
        let len = self.u16(what)? as usize;
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::InvalidUtf8(what))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pingreq_bytes() {
        assert_eq!(Packet::PingReq.to_bytes().unwrap(), vec![0xC0, 0x00]);
        assert_eq!(Packet::PingResp.to_bytes().unwrap(), vec![0xD0, 0x00]);
        assert_eq!(Packet::Disconnect.to_bytes().unwrap(), vec![0xE0, 0x00]);
    }

    #[test]
    fn test_connack_success_bytes() {
        let bytes = Packet::ConnAck {
            session_present: false,
            return_code: CONNACK_ACCEPTED,
        }
        .to_bytes()
        .unwrap();
        assert_eq!(bytes, vec![0x20, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_publish_layout() {
        let publish = Publish::new("ab", b"hi".to_vec());
        let bytes = Packet::Publish(publish).to_bytes().unwrap();
        assert_eq!(bytes, vec![0x30, 0x06, 0x00, 0x02, b'a', b'b', b'h', b'i']);
    }

    #[test]
    fn test_publish_qos1_carries_packet_id() {
        let mut publish = Publish::new("room/x", b"{}".to_vec());
        publish.qos = QoS::AtLeastOnce;
        publish.packet_id = Some(0x0102);
        publish.dup = true;

        let frame = Packet::Publish(publish.clone()).to_frame();
        assert_eq!(frame.header_byte(), 0x3A);

        let decoded = Packet::from_frame(&frame).unwrap();
        assert_eq!(decoded, Packet::Publish(publish));
    }

    #[test]
    fn test_connect_decodes_credentials() {
        let opts = ConnectOptions {
            client_id: "meshcall_1".to_string(),
            username: Some("user".to_string()),
            password: Some("secret".to_string()),
            keep_alive_secs: 20,
            clean_session: true,
        };
        let frame = Packet::Connect(opts.clone()).to_frame();
        assert_eq!(frame.payload[..6], [0x00, 0x04, b'M', b'Q', b'T', b'T']);
        assert_eq!(frame.payload[7], 0xC2);
        assert_eq!(Packet::from_frame(&frame).unwrap(), Packet::Connect(opts));
    }

    #[test]
    fn test_subscribe_flags_and_topics() {
        let packet = Packet::Subscribe {
            packet_id: 7,
            topics: vec![("meshcall/room1".to_string(), QoS::AtMostOnce)],
        };
        let frame = packet.to_frame();
        assert_eq!(frame.header_byte(), 0x82);
        assert_eq!(Packet::from_frame(&frame).unwrap(), packet);
    }

    #[test]
    fn test_truncated_publish_topic() {
        let frame = Frame::new(PacketType::Publish, 0, vec![0x00, 0x05, b'a']);
        assert_eq!(
            Packet::from_frame(&frame),
            Err(FrameError::Truncated("topic"))
        );
    }

    #[test]
    fn test_qos2_is_rejected() {
        let frame = Frame::new(PacketType::Publish, 0x04, vec![0x00, 0x01, b'a', 0, 1]);
        assert_eq!(
            Packet::from_frame(&frame),
            Err(FrameError::UnsupportedQos(2))
        );
    }
}
