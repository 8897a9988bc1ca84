//! Lifecycle events published by the proxy.
//!
//! Two of the events (`PreConnect`, `PreTransfer`) are published before the
//! proxy commits to a decision. Interceptors registered for them can answer
//! with a [`Verdict`] to deny the action or redirect the player. All other
//! events are notifications and any verdict returned for them is ignored.

use crate::types::{
    BackendId, ChannelState, PlayerIdentity, SessionId, SessionSnapshot,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Discriminant used to subscribe to a family of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    PreConnect,
    SessionConnected,
    PreTransfer,
    BackendSwitch,
    TransferFailed,
    SessionDisconnected,
    BackendStateChanged,
    SecurityViolation,
    BackendMessage,
}

impl EventKind {
    /// Whether interceptors on this kind can change the proxy's decision.
    pub fn is_interceptable(&self) -> bool {
        matches!(self, EventKind::PreConnect | EventKind::PreTransfer)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Category of a security-relevant failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationKind {
    /// A backend agent failed the secret handshake
    HandshakeAuthFailure,
    /// An authenticated channel delivered a message with a bad tag
    TamperedMessage,
    /// A message reused an old sequence number or carried a stale timestamp
    ReplayedMessage,
    /// One remote address keeps sending malformed client frames
    RepeatedProtocolViolation,
}

/// Every event the proxy publishes through the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProxyEvent {
    /// A client finished its handshake and is about to be assigned a backend.
    PreConnect {
        player: PlayerIdentity,
        remote_addr: SocketAddr,
        /// Backend the registry would prefer (the configured default), if any
        proposed: Option<BackendId>,
    },
    SessionConnected {
        session: SessionSnapshot,
    },
    /// A transfer was requested and has not been sent to the target yet.
    PreTransfer {
        session: SessionSnapshot,
        target: BackendId,
    },
    /// A transfer completed and the session now lives on `to`.
    BackendSwitch {
        session_id: SessionId,
        player: PlayerIdentity,
        from: BackendId,
        to: BackendId,
    },
    /// A transfer was rolled back; the session stays on `from`.
    TransferFailed {
        session_id: SessionId,
        from: BackendId,
        to: BackendId,
        reason: String,
    },
    SessionDisconnected {
        session_id: SessionId,
        player: PlayerIdentity,
        backend: BackendId,
        reason: String,
    },
    BackendStateChanged {
        backend: BackendId,
        name: String,
        from: ChannelState,
        to: ChannelState,
    },
    SecurityViolation {
        kind: ViolationKind,
        /// Backend name or remote address of the offending peer
        peer: String,
        detail: String,
    },
    /// Plugin-messaging payload received from a backend agent.
    BackendMessage {
        backend: BackendId,
        channel: String,
        data: serde_json::Value,
    },
}

impl ProxyEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ProxyEvent::PreConnect { .. } => EventKind::PreConnect,
            ProxyEvent::SessionConnected { .. } => EventKind::SessionConnected,
            ProxyEvent::PreTransfer { .. } => EventKind::PreTransfer,
            ProxyEvent::BackendSwitch { .. } => EventKind::BackendSwitch,
            ProxyEvent::TransferFailed { .. } => EventKind::TransferFailed,
            ProxyEvent::SessionDisconnected { .. } => EventKind::SessionDisconnected,
            ProxyEvent::BackendStateChanged { .. } => EventKind::BackendStateChanged,
            ProxyEvent::SecurityViolation { .. } => EventKind::SecurityViolation,
            ProxyEvent::BackendMessage { .. } => EventKind::BackendMessage,
        }
    }
}

/// Answer of an interceptor for a `PreConnect` or `PreTransfer` event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Verdict {
    /// Let the proxy proceed with its own choice
    #[default]
    Continue,
    /// Refuse the connection or transfer
    Deny { reason: String },
    /// Use this backend instead of the proposed one
    Redirect { backend: BackendId },
}

impl Verdict {
    pub fn deny(reason: impl Into<String>) -> Self {
        Verdict::Deny { reason: reason.into() }
    }

    pub fn redirect(backend: BackendId) -> Self {
        Verdict::Redirect { backend }
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, Verdict::Deny { .. })
    }
}
