//! Bridge message envelope and payload types.
//!
//! A bridge message travels as one codec frame whose packet id is the
//! message kind. The packet body is:
//!
//! ```text
//! correlation_id u64 | sequence u64 | timestamp u64 | payload_len u32 | payload | tag [u8; 32]
//! ```
//!
//! The tag covers the kind byte and every field before it.

use crate::auth::{self, AuthTag, SharedSecret, TAG_LEN};
use crate::codec::Packet;
use crate::error::{ProxyError, Result};
use bifrost_event_system::{PlayerIdentity, SessionId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version of the bridge protocol spoken in `hello` messages.
pub const BRIDGE_PROTOCOL_VERSION: u32 = 1;

const HEADER_LEN: usize = 8 + 8 + 8 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Hello = 1,
    Heartbeat = 2,
    Event = 3,
    Command = 4,
    Handoff = 5,
    Ack = 6,
    Forward = 7,
    Release = 8,
}

impl TryFrom<u32> for MessageKind {
    type Error = ProxyError;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            1 => MessageKind::Hello,
            2 => MessageKind::Heartbeat,
            3 => MessageKind::Event,
            4 => MessageKind::Command,
            5 => MessageKind::Handoff,
            6 => MessageKind::Ack,
            7 => MessageKind::Forward,
            8 => MessageKind::Release,
            other => {
                return Err(ProxyError::ProtocolViolation(format!(
                    "unknown bridge message kind {}",
                    other
                )))
            }
        })
    }
}

/// A message waiting to be sequenced and signed by its channel.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    pub correlation_id: u64,
    pub payload: Bytes,
}

impl OutboundMessage {
    pub fn new(kind: MessageKind, correlation_id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            correlation_id,
            payload: payload.into(),
        }
    }

    pub fn json<T: Serialize>(kind: MessageKind, correlation_id: u64, payload: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| ProxyError::Network(format!("failed to encode {:?} payload: {}", kind, e)))?;
        Ok(Self::new(kind, correlation_id, bytes))
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageKind::Heartbeat, 0, Bytes::new())
    }

    /// Assigns the sequence number and timestamp and computes the tag.
    pub fn seal(self, sequence: u64, timestamp: u64, secret: &SharedSecret) -> BridgeMessage {
        let signed = signed_bytes(self.kind, self.correlation_id, sequence, timestamp, &self.payload);
        BridgeMessage {
            kind: self.kind,
            correlation_id: self.correlation_id,
            sequence,
            timestamp,
            payload: self.payload,
            tag: auth::tag(secret, &signed),
        }
    }
}

/// A signed bridge message as it appears on the wire.
#[derive(Debug, Clone)]
pub struct BridgeMessage {
    pub kind: MessageKind,
    pub correlation_id: u64,
    pub sequence: u64,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    pub payload: Bytes,
    pub tag: AuthTag,
}

fn signed_bytes(kind: MessageKind, correlation_id: u64, sequence: u64, timestamp: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + HEADER_LEN + payload.len());
    buf.push(kind as u8);
    buf.extend_from_slice(&correlation_id.to_be_bytes());
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

impl BridgeMessage {
    /// Checks the tag in constant time.
    pub fn verify(&self, secret: &SharedSecret) -> bool {
        let signed = signed_bytes(
            self.kind,
            self.correlation_id,
            self.sequence,
            self.timestamp,
            &self.payload,
        );
        auth::verify(secret, &signed, &self.tag)
    }

    pub fn to_packet(&self) -> Packet {
        let mut body = BytesMut::with_capacity(HEADER_LEN + self.payload.len() + TAG_LEN);
        body.put_u64(self.correlation_id);
        body.put_u64(self.sequence);
        body.put_u64(self.timestamp);
        body.put_u32(self.payload.len() as u32);
        body.put_slice(&self.payload);
        body.put_slice(&self.tag.0);
        Packet::new(self.kind as u32, body.freeze())
    }

    pub fn from_packet(packet: Packet) -> Result<Self> {
        let kind = MessageKind::try_from(packet.id)?;
        let mut body = packet.body;
        if body.len() < HEADER_LEN + TAG_LEN {
            return Err(ProxyError::ProtocolViolation(format!(
                "bridge message of {} bytes is too short",
                body.len()
            )));
        }
        let correlation_id = body.get_u64();
        let sequence = body.get_u64();
        let timestamp = body.get_u64();
        let payload_len = body.get_u32() as usize;
        if body.len() != payload_len + TAG_LEN {
            return Err(ProxyError::ProtocolViolation(format!(
                "bridge payload length {} does not match {} remaining bytes",
                payload_len,
                body.len()
            )));
        }
        let payload = body.split_to(payload_len);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&body);

        Ok(Self {
            kind,
            correlation_id,
            sequence,
            timestamp,
            payload,
            tag: AuthTag(tag),
        })
    }

    /// Parses the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// `hello` payload, sent by the proxy with a fresh challenge and answered by
/// the agent with the challenge echoed back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub protocol_version: u32,
    /// Proxy id or backend name of the sender
    pub peer: String,
    /// Base64 challenge chosen by the sender
    pub challenge: String,
    /// Base64 challenge being answered, if this is a reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffReason {
    Connect,
    Transfer,
}

/// `handoff` payload: a session is being assigned to the receiving backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffPayload {
    pub session_id: SessionId,
    pub player: PlayerIdentity,
    pub remote_addr: String,
    pub reason: HandoffReason,
    /// Name of the backend the session is leaving, for transfers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_backend: Option<String>,
}

/// `ack` payload; the correlation id names the acknowledged message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `event` payload: plugin messaging between agent and proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub channel: String,
    pub data: serde_json::Value,
}

/// `command` payload: a command line to run on the other side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command_line: String,
}

/// `release` payload: a session no longer lives on the receiving backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasePayload {
    pub session_id: SessionId,
    pub reason: String,
}

/// `forward` payload: one gameplay packet for a session stream.
///
/// Binary rather than JSON: `session uuid (16) | stream id u64 | packet id u32 | body`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardFrame {
    pub session_id: SessionId,
    pub stream_id: u64,
    pub packet: Packet,
}

impl ForwardFrame {
    const HEADER: usize = 16 + 8 + 4;

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER + self.packet.body.len());
        buf.put_slice(self.session_id.0.as_bytes());
        buf.put_u64(self.stream_id);
        buf.put_u32(self.packet.id);
        buf.put_slice(&self.packet.body);
        buf.freeze()
    }

    pub fn from_bytes(mut bytes: Bytes) -> Result<Self> {
        if bytes.len() < Self::HEADER {
            return Err(ProxyError::ProtocolViolation(
                "forward frame shorter than its header".to_string(),
            ));
        }
        let mut uuid = [0u8; 16];
        bytes.copy_to_slice(&mut uuid);
        let stream_id = bytes.get_u64();
        let id = bytes.get_u32();
        Ok(Self {
            session_id: SessionId(Uuid::from_bytes(uuid)),
            stream_id,
            packet: Packet { id, body: bytes },
        })
    }

    pub fn into_message(self) -> OutboundMessage {
        OutboundMessage::new(MessageKind::Forward, 0, self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> SharedSecret {
        SharedSecret::new(b"bridge-message-secret-123456789").unwrap()
    }

    #[test]
    fn test_sealed_message_survives_packet_conversion() {
        let ack = AckPayload {
            accepted: true,
            message: None,
        };
        let sealed = OutboundMessage::json(MessageKind::Ack, 42, &ack)
            .unwrap()
            .seal(7, 1_700_000_000_000, &secret());

        let decoded = BridgeMessage::from_packet(sealed.to_packet()).unwrap();
        assert_eq!(decoded.kind, MessageKind::Ack);
        assert_eq!(decoded.correlation_id, 42);
        assert_eq!(decoded.sequence, 7);
        assert!(decoded.verify(&secret()));
        assert_eq!(decoded.json::<AckPayload>().unwrap(), ack);
    }

    #[test]
    fn test_any_field_change_breaks_tag() {
        let sealed = OutboundMessage::new(MessageKind::Event, 1, &b"{}"[..]).seal(1, 5, &secret());

        let mut resequenced = sealed.clone();
        resequenced.sequence = 2;
        assert!(!resequenced.verify(&secret()));

        let mut rekinded = sealed.clone();
        rekinded.kind = MessageKind::Command;
        assert!(!rekinded.verify(&secret()));

        let mut repayloaded = sealed;
        repayloaded.payload = Bytes::from_static(b"[]");
        assert!(!repayloaded.verify(&secret()));
    }

    #[test]
    fn test_truncated_packet_rejected() {
        let packet = Packet::new(MessageKind::Heartbeat as u32, vec![0u8; 10]);
        assert!(matches!(
            BridgeMessage::from_packet(packet),
            Err(ProxyError::ProtocolViolation(_))
        ));
        let unknown = Packet::new(99, vec![0u8; 64]);
        assert!(BridgeMessage::from_packet(unknown).is_err());
    }

    #[test]
    fn test_forward_frame_layout() {
        let frame = ForwardFrame {
            session_id: SessionId::new(),
            stream_id: 4,
            packet: Packet::new(0x20, &b"move"[..]),
        };
        let decoded = ForwardFrame::from_bytes(frame.to_bytes()).unwrap();
        assert_eq!(decoded, frame);
    }
}
