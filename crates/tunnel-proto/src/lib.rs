//! Wire protocol of the reverse tunnel between an agent and the gateway.
//!
//! Every frame is `channel id (u32, big-endian) | length (u32, big-endian) |
//! payload`. Channel 0 is the control channel and carries one JSON-encoded
//! [`ControlMessage`] per frame; every other channel carries opaque session
//! bytes.

mod codec;

use core::fmt;

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub use self::codec::FrameCodec;

/// Per-frame payload cap. A peer sending more is considered broken.
pub const MAXIMUM_PAYLOAD_SIZE: usize = 64 * 1024;

/// Identifier of a logical channel inside a tunnel.
///
/// Ids are allocated by the gateway (the channel initiator) and never reused
/// while the channel is open.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(u32);

impl ChannelId {
    /// The control channel, always open, never carries session bytes.
    pub const CONTROL: ChannelId = ChannelId(0);

    pub fn is_control(self) -> bool {
        self == Self::CONTROL
    }
}

impl From<u32> for ChannelId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<ChannelId> for u32 {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("payload oversized: max is {max}, got {payload_size}")]
    PayloadOversized { payload_size: usize, max: usize },
    #[error("not enough bytes to decode frame header: received {received}, expected {expected}")]
    NotEnoughBytes { received: usize, expected: usize },
    #[error("invalid control message")]
    InvalidControlMessage {
        #[from]
        source: serde_json::Error,
    },
    #[error("session bytes received on the control channel")]
    DataOnControlChannel,
}

/// Frame header: channel id then payload length, both big-endian u32.
pub struct Header;

impl Header {
    pub const SIZE: usize = 8;
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Frame {
    pub channel: ChannelId,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(channel: ChannelId, payload: Bytes) -> Self {
        Self { channel, payload }
    }

    pub fn control(message: &ControlMessage) -> Result<Self, Error> {
        let payload = serde_json::to_vec(message)?;
        Ok(Self {
            channel: ChannelId::CONTROL,
            payload: Bytes::from(payload),
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        if self.payload.len() > MAXIMUM_PAYLOAD_SIZE {
            return Err(Error::PayloadOversized {
                payload_size: self.payload.len(),
                max: MAXIMUM_PAYLOAD_SIZE,
            });
        }

        dst.reserve(Header::SIZE + self.payload.len());
        dst.put_u32(self.channel.into());
        dst.put_u32(u32::try_from(self.payload.len()).expect("checked against MAXIMUM_PAYLOAD_SIZE"));
        dst.put_slice(&self.payload);

        Ok(())
    }

    pub fn decode(mut src: Bytes) -> Result<Self, Error> {
        if src.len() < Header::SIZE {
            return Err(Error::NotEnoughBytes {
                received: src.len(),
                expected: Header::SIZE,
            });
        }

        let channel = ChannelId::from(src.get_u32());
        let length = src.get_u32() as usize;

        if src.len() < length {
            return Err(Error::NotEnoughBytes {
                received: src.len(),
                expected: length,
            });
        }

        Ok(Self {
            channel,
            payload: src.split_to(length),
        })
    }

    /// Decodes the payload of a control frame.
    pub fn control_message(&self) -> Result<ControlMessage, Error> {
        debug_assert!(self.channel.is_control());
        let message = serde_json::from_slice(&self.payload)?;
        Ok(message)
    }
}

/// Reason a channel open was refused.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCode {
    /// The per-tunnel channel budget is exhausted.
    ResourceShortage,
    /// The onward TCP connection could not be established.
    ConnectFailed,
    /// The acceptor refuses this kind of request.
    Prohibited,
    GeneralFailure,
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasonCode::ResourceShortage => write!(f, "resource shortage"),
            ReasonCode::ConnectFailed => write!(f, "connect failed"),
            ReasonCode::Prohibited => write!(f, "prohibited"),
            ReasonCode::GeneralFailure => write!(f, "general failure"),
        }
    }
}

/// What the initiator wants the new channel connected to.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OpenRequest {
    /// An SSH session attributed to a gateway-assigned session id.
    Session { session_id: String },
    /// An onward TCP connection dialed by the acceptor.
    DirectTcpip { host: String, port: u16 },
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    Open {
        id: ChannelId,
        request: OpenRequest,
    },
    OpenSuccess {
        id: ChannelId,
    },
    OpenFailure {
        id: ChannelId,
        reason: ReasonCode,
        description: String,
    },
    Eof {
        id: ChannelId,
    },
    Close {
        id: ChannelId,
    },
    Keepalive {
        seq: u64,
    },
    KeepaliveAck {
        seq: u64,
    },
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::data(ChannelId::from(7), Bytes::from_static(b"abc"));

        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();

        assert_eq!(&buf[..], &[0, 0, 0, 7, 0, 0, 0, 3, b'a', b'b', b'c']);

        let decoded = Frame::decode(buf.freeze()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn oversized_payload_is_refused() {
        let frame = Frame::data(ChannelId::from(1), Bytes::from(vec![0u8; MAXIMUM_PAYLOAD_SIZE + 1]));

        let mut buf = BytesMut::new();
        assert!(matches!(
            frame.encode(&mut buf),
            Err(Error::PayloadOversized { .. })
        ));
    }

    #[test]
    fn control_message_wire_format() {
        let msg = ControlMessage::Open {
            id: ChannelId::from(3),
            request: OpenRequest::Session {
                session_id: "2b5c1f4e".to_owned(),
            },
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"open","id":3,"request":{"kind":"session","session_id":"2b5c1f4e"}}"#
        );

        let back: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn keepalive_wire_format() {
        let json = serde_json::to_string(&ControlMessage::KeepaliveAck { seq: 42 }).unwrap();
        assert_eq!(json, r#"{"type":"keepalive-ack","seq":42}"#);
    }

    #[test]
    fn open_failure_wire_format() {
        let msg = ControlMessage::OpenFailure {
            id: ChannelId::from(9),
            reason: ReasonCode::ResourceShortage,
            description: "too many channels".to_owned(),
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"open-failure","id":9,"reason":"resource-shortage","description":"too many channels"}"#
        );
    }
}
