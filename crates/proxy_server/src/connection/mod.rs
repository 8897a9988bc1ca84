//! Client-facing QUIC connections.
//!
//! Every connection starts with a handshake on its first bidirectional
//! stream. Once the session is open, each stream is an independent pipe of
//! codec frames, relayed to the session's backend keyed by stream id.

pub mod client;
pub mod handshake;
pub mod manager;

pub use client::{ClientConnection, CloseReason, ConnectionCommand};
pub use handshake::{
    ClientHandshake, HandshakeAccepted, HandshakeRejected, HANDSHAKE_ACCEPTED_PACKET_ID,
    HANDSHAKE_PACKET_ID, HANDSHAKE_REJECTED_PACKET_ID,
};
pub use manager::{ConnectionManager, ConnectionSettings};
