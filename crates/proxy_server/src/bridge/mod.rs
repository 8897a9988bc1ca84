//! Authenticated control channel between the proxy and backend agents.
//!
//! The proxy dials every registered backend's agent over TCP. After a
//! challenge/response `hello` exchange signed with the backend's shared
//! secret the channel is Authenticated and carries heartbeats, session
//! handoffs, acks, plugin events, commands and relayed gameplay packets.
//!
//! Inbound traffic that needs session context is posted as a
//! [`BridgeEvent`] to whoever drains the manager's event receiver (the
//! session manager, via the server's router task).

pub mod channel;
pub mod manager;
pub mod message;

pub use channel::BridgeSettings;
pub use manager::BridgeManager;
pub use message::{
    AckPayload, BridgeMessage, CommandPayload, EventPayload, ForwardFrame, HandoffPayload,
    HandoffReason, HelloPayload, MessageKind, OutboundMessage, ReleasePayload,
    BRIDGE_PROTOCOL_VERSION,
};

use crate::error::Result;
use async_trait::async_trait;
use bifrost_event_system::BackendId;

/// Something that can deliver messages to backend agents.
///
/// Implemented by [`BridgeManager`]; the session manager only depends on
/// this trait so it can be driven without real sockets.
#[async_trait]
pub trait BridgeTransport: Send + Sync {
    /// Queues a message on the backend's channel, preserving per-channel order.
    ///
    /// Fails with `ChannelUnavailable` unless the channel is Authenticated.
    async fn send(&self, backend: BackendId, message: OutboundMessage) -> Result<()>;

    /// Tells the channel that a Draining backend just lost its last session.
    fn notify_drained(&self, backend: BackendId);
}

/// Inbound traffic and lifecycle changes that affect sessions.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// A verified message that is not channel housekeeping
    Message {
        backend: BackendId,
        message: BridgeMessage,
    },
    /// The backend stopped accepting sessions; move its sessions elsewhere
    Draining { backend: BackendId },
}
