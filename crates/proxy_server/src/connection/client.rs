//! Per-connection state owned by the task driving one QUIC connection.

use crate::codec::{DecodeError, Packet, PacketCodec};
use bifrost_event_system::{current_timestamp, ConnectionId, SessionId};
use bytes::BytesMut;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio_util::codec::Decoder;

/// Instructions the session side sends to a connection task.
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Write a packet from the backend to the client stream
    Deliver { stream_id: u64, packet: Packet },
    /// Close the connection
    Close { reason: CloseReason },
}

/// Why the proxy closed a client connection.
///
/// Each reason maps to a QUIC application error code so clients can tell
/// them apart without parsing the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    Normal,
    IdleTimeout,
    ProtocolViolation,
    UnsupportedVersion,
    NoBackendAvailable,
    ServerShutdown,
    BackendUnavailable,
    ResourceExhausted,
    Kicked,
    ConnectDenied,
}

impl CloseReason {
    pub fn code(&self) -> u32 {
        match self {
            CloseReason::Normal => 0,
            CloseReason::IdleTimeout => 1,
            CloseReason::ProtocolViolation => 2,
            CloseReason::UnsupportedVersion => 3,
            CloseReason::NoBackendAvailable => 4,
            CloseReason::ServerShutdown => 5,
            CloseReason::BackendUnavailable => 6,
            CloseReason::ResourceExhausted => 7,
            CloseReason::Kicked => 8,
            CloseReason::ConnectDenied => 9,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => CloseReason::Normal,
            1 => CloseReason::IdleTimeout,
            2 => CloseReason::ProtocolViolation,
            3 => CloseReason::UnsupportedVersion,
            4 => CloseReason::NoBackendAvailable,
            5 => CloseReason::ServerShutdown,
            6 => CloseReason::BackendUnavailable,
            7 => CloseReason::ResourceExhausted,
            8 => CloseReason::Kicked,
            9 => CloseReason::ConnectDenied,
            _ => return None,
        })
    }

    pub fn message(&self) -> &'static str {
        match self {
            CloseReason::Normal => "closed",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::ProtocolViolation => "protocol violation",
            CloseReason::UnsupportedVersion => "unsupported protocol version",
            CloseReason::NoBackendAvailable => "no backend available",
            CloseReason::ServerShutdown => "server shutting down",
            CloseReason::BackendUnavailable => "backend unavailable",
            CloseReason::ResourceExhausted => "server full",
            CloseReason::Kicked => "kicked",
            CloseReason::ConnectDenied => "connection denied",
        }
    }
}

/// One client QUIC connection.
///
/// Streams are independent byte pipes. Each keeps its own reassembly
/// buffer, so a frame split across reads on one stream never mixes with
/// bytes from another.
#[derive(Debug)]
pub struct ClientConnection {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub protocol_version: Option<u32>,
    /// Unix timestamp in milliseconds
    pub created_at: u64,
    pub session: Option<SessionId>,
    codec: PacketCodec,
    buffers: HashMap<u64, BytesMut>,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, remote_addr: SocketAddr, codec: PacketCodec) -> Self {
        Self {
            id,
            remote_addr,
            protocol_version: None,
            created_at: current_timestamp(),
            session: None,
            codec,
            buffers: HashMap::new(),
        }
    }

    /// Appends bytes read from a stream and returns every complete packet.
    ///
    /// A malformed frame poisons the whole connection; the caller must close
    /// it with `ProtocolViolation`.
    pub fn on_stream_data(&mut self, stream_id: u64, data: &[u8]) -> Result<Vec<Packet>, DecodeError> {
        let buffer = self.buffers.entry(stream_id).or_default();
        buffer.extend_from_slice(data);

        let mut packets = Vec::new();
        while let Some(packet) = Decoder::decode(&mut self.codec, buffer)? {
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Forgets a finished stream. Leftover bytes mean the peer cut a frame short.
    pub fn on_stream_finished(&mut self, stream_id: u64) -> Result<(), DecodeError> {
        match self.buffers.remove(&stream_id) {
            Some(rest) if !rest.is_empty() => Err(DecodeError::Malformed(format!(
                "stream {} ended inside a frame ({} bytes left)",
                stream_id,
                rest.len()
            ))),
            _ => Ok(()),
        }
    }

    pub fn open_streams(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.buffers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn codec(&self) -> &PacketCodec {
        &self.codec
    }
}
