//! Wire packet types and payload definitions.
//!
//! Every packet is one clear type byte followed by a bincode-encoded payload
//! body; the whole thing is sealed by [`crate::crypto`] before it reaches the
//! transport. Strict parsing: unknown type bytes and undecodable bodies are
//! protocol errors, which the session turns into silent drops.

use crate::av::CallSignal;
use crate::error::{Error, Result};
use crate::identity::NOSPAM_SIZE;
use serde::{Deserialize, Serialize};

/// Packet types, one byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Friend request carrying the target nospam and a greeting.
    FriendRequest = 0x01,
    /// Liveness keepalive.
    Ping = 0x02,
    /// Text message with a read-receipt id.
    Message = 0x03,
    /// IRC-style /me action.
    Action = 0x04,
    /// Sender changed their display name.
    Name = 0x05,
    /// Sender changed their status message.
    StatusMessage = 0x06,
    /// Sender changed their presence status.
    UserStatus = 0x07,
    /// Sender started or stopped typing.
    Typing = 0x08,
    /// Echo of a received message id.
    ReadReceipt = 0x09,
    /// File transfer offer.
    FileRequest = 0x0a,
    /// File transfer control (accept/pause/kill/finished).
    FileControl = 0x0b,
    /// File data chunk.
    FileData = 0x0c,
    /// Call signaling.
    CallSignal = 0x0d,
    /// Encoded audio frame for an active call.
    CallAudio = 0x0e,
    /// Encoded video frame for an active call.
    CallVideo = 0x0f,
}

impl PacketType {
    /// Parse a packet type from its wire byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Self::FriendRequest),
            0x02 => Ok(Self::Ping),
            0x03 => Ok(Self::Message),
            0x04 => Ok(Self::Action),
            0x05 => Ok(Self::Name),
            0x06 => Ok(Self::StatusMessage),
            0x07 => Ok(Self::UserStatus),
            0x08 => Ok(Self::Typing),
            0x09 => Ok(Self::ReadReceipt),
            0x0a => Ok(Self::FileRequest),
            0x0b => Ok(Self::FileControl),
            0x0c => Ok(Self::FileData),
            0x0d => Ok(Self::CallSignal),
            0x0e => Ok(Self::CallAudio),
            0x0f => Ok(Self::CallVideo),
            _ => Err(Error::Protocol(format!("unknown packet type {byte:#04x}"))),
        }
    }

    /// The wire byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// FRIEND_REQUEST payload.
///
/// The nospam is the one taken from the address the sender used; the
/// receiver drops requests whose nospam does not match its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequestPayload {
    /// Nospam from the target address.
    pub nospam: [u8; NOSPAM_SIZE],
    /// Greeting shown to the target.
    #[serde(with = "serde_bytes")]
    pub message: Vec<u8>,
}

/// MESSAGE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Sender-chosen id, echoed back as a read receipt.
    pub id: u32,
    /// Message body.
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

/// ACTION payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPayload {
    /// Action body.
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

/// FILE_REQUEST payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRequestPayload {
    /// Sender-assigned file number, scoped to this friend and direction.
    pub file_number: u8,
    /// Total size in bytes.
    pub file_size: u64,
    /// Suggested filename.
    #[serde(with = "serde_bytes")]
    pub filename: Vec<u8>,
}

/// FILE_CONTROL payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileControlPayload {
    /// True when the control targets a file the *packet sender* is sending.
    /// The receiver flips this to find its local slot.
    pub sending: bool,
    /// File number the control targets.
    pub file_number: u8,
    /// Control byte; see [`crate::transfer::ControlAction`].
    pub control: u8,
    /// Optional control-specific data.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// FILE_DATA payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDataPayload {
    /// File number the chunk belongs to.
    pub file_number: u8,
    /// Chunk bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// CALL_SIGNAL payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSignalPayload {
    /// Caller-chosen id shared by both ends of the call.
    pub call_id: u64,
    /// The signal itself.
    pub signal: CallSignal,
}

/// CALL_AUDIO payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallAudioPayload {
    /// Call the frame belongs to.
    pub call_id: u64,
    /// Sequence number for jitter-buffer ordering.
    pub seq: u32,
    /// Opaque encoded audio frame.
    #[serde(with = "serde_bytes")]
    pub frame: Vec<u8>,
}

/// CALL_VIDEO payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallVideoPayload {
    /// Call the frame belongs to.
    pub call_id: u64,
    /// Frame width in pixels.
    pub width: u16,
    /// Frame height in pixels.
    pub height: u16,
    /// Opaque encoded video frame.
    #[serde(with = "serde_bytes")]
    pub frame: Vec<u8>,
}

/// A decoded wire packet.
#[derive(Debug, Clone)]
pub enum Packet {
    /// Friend request.
    FriendRequest(FriendRequestPayload),
    /// Keepalive; no body.
    Ping,
    /// Text message.
    Message(MessagePayload),
    /// Action message.
    Action(ActionPayload),
    /// Display name update.
    Name(Vec<u8>),
    /// Status message update.
    StatusMessage(Vec<u8>),
    /// Presence status update; see [`crate::friend::UserStatus`].
    UserStatus(u8),
    /// Typing flag update.
    Typing(bool),
    /// Read receipt for a message id.
    ReadReceipt(u32),
    /// File transfer offer.
    FileRequest(FileRequestPayload),
    /// File transfer control.
    FileControl(FileControlPayload),
    /// File data chunk.
    FileData(FileDataPayload),
    /// Call signaling.
    CallSignal(CallSignalPayload),
    /// Call audio frame.
    CallAudio(CallAudioPayload),
    /// Call video frame.
    CallVideo(CallVideoPayload),
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Protocol(e.to_string()))
}

fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Protocol(e.to_string()))
}

impl Packet {
    /// The packet's wire type.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::FriendRequest(_) => PacketType::FriendRequest,
            Packet::Ping => PacketType::Ping,
            Packet::Message(_) => PacketType::Message,
            Packet::Action(_) => PacketType::Action,
            Packet::Name(_) => PacketType::Name,
            Packet::StatusMessage(_) => PacketType::StatusMessage,
            Packet::UserStatus(_) => PacketType::UserStatus,
            Packet::Typing(_) => PacketType::Typing,
            Packet::ReadReceipt(_) => PacketType::ReadReceipt,
            Packet::FileRequest(_) => PacketType::FileRequest,
            Packet::FileControl(_) => PacketType::FileControl,
            Packet::FileData(_) => PacketType::FileData,
            Packet::CallSignal(_) => PacketType::CallSignal,
            Packet::CallAudio(_) => PacketType::CallAudio,
            Packet::CallVideo(_) => PacketType::CallVideo,
        }
    }

    /// Serialize to wire bytes: type byte followed by the body.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = match self {
            Packet::FriendRequest(p) => encode(p)?,
            Packet::Ping => Vec::new(),
            Packet::Message(p) => encode(p)?,
            Packet::Action(p) => encode(p)?,
            Packet::Name(name) => encode(&serde_bytes::ByteBuf::from(name.clone()))?,
            Packet::StatusMessage(msg) => encode(&serde_bytes::ByteBuf::from(msg.clone()))?,
            Packet::UserStatus(status) => vec![*status],
            Packet::Typing(typing) => vec![u8::from(*typing)],
            Packet::ReadReceipt(id) => id.to_be_bytes().to_vec(),
            Packet::FileRequest(p) => encode(p)?,
            Packet::FileControl(p) => encode(p)?,
            Packet::FileData(p) => encode(p)?,
            Packet::CallSignal(p) => encode(p)?,
            Packet::CallAudio(p) => encode(p)?,
            Packet::CallVideo(p) => encode(p)?,
        };

        let mut out = Vec::with_capacity(1 + body.len());
        out.push(self.packet_type().to_byte());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse a packet from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (&tag, body) = bytes
            .split_first()
            .ok_or_else(|| Error::Protocol("empty packet".into()))?;

        match PacketType::from_byte(tag)? {
            PacketType::FriendRequest => Ok(Packet::FriendRequest(decode(body)?)),
            PacketType::Ping => Ok(Packet::Ping),
            PacketType::Message => Ok(Packet::Message(decode(body)?)),
            PacketType::Action => Ok(Packet::Action(decode(body)?)),
            PacketType::Name => {
                let buf: serde_bytes::ByteBuf = decode(body)?;
                Ok(Packet::Name(buf.into_vec()))
            }
            PacketType::StatusMessage => {
                let buf: serde_bytes::ByteBuf = decode(body)?;
                Ok(Packet::StatusMessage(buf.into_vec()))
            }
            PacketType::UserStatus => match body {
                [status] => Ok(Packet::UserStatus(*status)),
                _ => Err(Error::Protocol("bad user status body".into())),
            },
            PacketType::Typing => match body {
                [flag] => Ok(Packet::Typing(*flag != 0)),
                _ => Err(Error::Protocol("bad typing body".into())),
            },
            PacketType::ReadReceipt => {
                let arr: [u8; 4] = body
                    .try_into()
                    .map_err(|_| Error::Protocol("bad read receipt body".into()))?;
                Ok(Packet::ReadReceipt(u32::from_be_bytes(arr)))
            }
            PacketType::FileRequest => Ok(Packet::FileRequest(decode(body)?)),
            PacketType::FileControl => Ok(Packet::FileControl(decode(body)?)),
            PacketType::FileData => Ok(Packet::FileData(decode(body)?)),
            PacketType::CallSignal => Ok(Packet::CallSignal(decode(body)?)),
            PacketType::CallAudio => Ok(Packet::CallAudio(decode(body)?)),
            PacketType::CallVideo => Ok(Packet::CallVideo(decode(body)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_roundtrip() {
        for byte in 0x01..=0x0f {
            let pt = PacketType::from_byte(byte).expect("known type");
            assert_eq!(pt.to_byte(), byte);
        }
    }

    #[test]
    fn test_unknown_packet_type() {
        assert!(PacketType::from_byte(0x00).is_err());
        assert!(PacketType::from_byte(0xFF).is_err());
    }

    #[test]
    fn test_message_roundtrip() {
        let packet = Packet::Message(MessagePayload {
            id: 42,
            body: b"hello".to_vec(),
        });
        let bytes = packet.to_bytes().expect("encode");
        match Packet::from_bytes(&bytes).expect("decode") {
            Packet::Message(p) => {
                assert_eq!(p.id, 42);
                assert_eq!(p.body, b"hello");
            }
            other => panic!("wrong packet: {other:?}"),
        }
    }

    #[test]
    fn test_ping_is_one_byte() {
        let bytes = Packet::Ping.to_bytes().expect("encode");
        assert_eq!(bytes, vec![PacketType::Ping.to_byte()]);
        assert!(matches!(Packet::from_bytes(&bytes), Ok(Packet::Ping)));
    }

    #[test]
    fn test_read_receipt_roundtrip() {
        let bytes = Packet::ReadReceipt(7).to_bytes().expect("encode");
        assert!(matches!(Packet::from_bytes(&bytes), Ok(Packet::ReadReceipt(7))));
    }

    #[test]
    fn test_empty_packet_rejected() {
        assert!(Packet::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_truncated_body_rejected() {
        let packet = Packet::FileRequest(FileRequestPayload {
            file_number: 3,
            file_size: 1024,
            filename: b"notes.txt".to_vec(),
        });
        let bytes = packet.to_bytes().expect("encode");
        assert!(Packet::from_bytes(&bytes[..2]).is_err());
    }
}
