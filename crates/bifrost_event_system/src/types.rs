//! Core identifiers and read-only snapshots shared between the proxy and plugins.
//!
//! Everything in this module is plain data. Plugins only ever see these
//! snapshot types, never the live session or backend structures, so a
//! handler cannot mutate proxy state behind the session manager's back.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// Unique identifier for a logical player session.
///
/// A session id stays the same for the lifetime of the client connection,
/// even when the player is moved between backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Creates a new random session ID using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier handed out by the backend registry.
///
/// Ids are allocated in increasing order, so comparing two ids also
/// compares their registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackendId(pub u64);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend-{}", self.0)
    }
}

/// Identifier of one accepted client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a backend's bridge channel.
///
/// ```text
/// Disconnected -> Handshaking -> Authenticated -> Draining -> Disconnected
///                      |
///                      +-> Disconnected (authentication failure)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    Disconnected,
    Handshaking,
    Authenticated,
    Draining,
}

impl ChannelState {
    /// Whether new sessions may be assigned to a backend in this state.
    pub fn accepts_sessions(&self) -> bool {
        matches!(self, ChannelState::Authenticated)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Disconnected, Handshaking)
                | (Handshaking, Authenticated)
                | (Handshaking, Disconnected)
                | (Authenticated, Draining)
                | (Draining, Disconnected)
        )
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Handshaking => "handshaking",
            ChannelState::Authenticated => "authenticated",
            ChannelState::Draining => "draining",
        };
        f.write_str(name)
    }
}

/// Identity a client presents in its handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerIdentity {
    pub uuid: Uuid,
    pub username: String,
}

/// Read-only view of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
    pub player: PlayerIdentity,
    pub remote_addr: SocketAddr,
    /// Backend currently serving the session
    pub backend: BackendId,
    /// Target of an in-flight transfer, if any
    pub pending_backend: Option<BackendId>,
    /// Unix timestamp in milliseconds
    pub created_at: u64,
    /// Unix timestamp in milliseconds
    pub last_activity: u64,
}

/// Read-only view of a registered backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSnapshot {
    pub id: BackendId,
    pub name: String,
    pub address: SocketAddr,
    pub state: ChannelState,
    pub session_count: usize,
    /// Unix timestamp in milliseconds of the last verified heartbeat
    pub last_heartbeat: Option<u64>,
    pub default_server: bool,
}

/// Returns the current unix time in milliseconds.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_state_transitions() {
        use ChannelState::*;
        assert!(Disconnected.can_transition_to(Handshaking));
        assert!(Handshaking.can_transition_to(Authenticated));
        assert!(Handshaking.can_transition_to(Disconnected));
        assert!(Authenticated.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Disconnected));

        assert!(!Disconnected.can_transition_to(Authenticated));
        assert!(!Authenticated.can_transition_to(Disconnected));
        assert!(!Draining.can_transition_to(Authenticated));
    }

    #[test]
    fn test_only_authenticated_accepts_sessions() {
        assert!(ChannelState::Authenticated.accepts_sessions());
        assert!(!ChannelState::Draining.accepts_sessions());
        assert!(!ChannelState::Handshaking.accepts_sessions());
        assert!(!ChannelState::Disconnected.accepts_sessions());
    }

    #[test]
    fn test_session_id_parse() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().expect("valid uuid");
        assert_eq!(id, parsed);
    }
}
