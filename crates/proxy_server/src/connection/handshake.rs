//! Client handshake packets.
//!
//! The first packet on a connection's first bidirectional stream is a
//! [`ClientHandshake`]. The proxy answers on the same stream with either
//! [`HandshakeAccepted`] or [`HandshakeRejected`]. Bodies are JSON.

use super::client::CloseReason;
use crate::codec::Packet;
use crate::error::{ProxyError, Result};
use bifrost_event_system::{BackendId, PlayerIdentity, SessionId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const HANDSHAKE_PACKET_ID: u32 = 0;
pub const HANDSHAKE_ACCEPTED_PACKET_ID: u32 = 1;
pub const HANDSHAKE_REJECTED_PACKET_ID: u32 = 2;

const MAX_USERNAME_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHandshake {
    pub protocol_version: u32,
    pub player_uuid: Uuid,
    pub username: String,
}

impl ClientHandshake {
    /// Parses and sanity-checks the handshake packet.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if packet.id != HANDSHAKE_PACKET_ID {
            return Err(ProxyError::ProtocolViolation(format!(
                "expected handshake packet, got id {}",
                packet.id
            )));
        }
        let handshake: ClientHandshake = serde_json::from_slice(&packet.body)?;
        let name = handshake.username.trim();
        if name.is_empty() || name.len() > MAX_USERNAME_LEN {
            return Err(ProxyError::ProtocolViolation(format!(
                "username must be 1-{} characters",
                MAX_USERNAME_LEN
            )));
        }
        Ok(handshake)
    }

    pub fn identity(&self) -> PlayerIdentity {
        PlayerIdentity {
            uuid: self.player_uuid,
            username: self.username.trim().to_string(),
        }
    }

    pub fn to_packet(&self) -> Result<Packet> {
        Ok(Packet::new(HANDSHAKE_PACKET_ID, serde_json::to_vec(self)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAccepted {
    pub session_id: SessionId,
    /// Name of the backend the player was routed to
    pub backend: String,
    pub backend_id: BackendId,
}

impl HandshakeAccepted {
    pub fn to_packet(&self) -> Result<Packet> {
        Ok(Packet::new(HANDSHAKE_ACCEPTED_PACKET_ID, serde_json::to_vec(self)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRejected {
    pub code: u32,
    pub reason: String,
    /// Protocol version the proxy speaks, for clients that need to upgrade
    pub supported_version: u32,
}

impl HandshakeRejected {
    pub fn new(reason: CloseReason, detail: impl Into<String>, supported_version: u32) -> Self {
        Self {
            code: reason.code(),
            reason: detail.into(),
            supported_version,
        }
    }

    pub fn to_packet(&self) -> Result<Packet> {
        Ok(Packet::new(HANDSHAKE_REJECTED_PACKET_ID, serde_json::to_vec(self)?))
    }
}
