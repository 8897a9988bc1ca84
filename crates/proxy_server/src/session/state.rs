//! Session record and backend binding.

use crate::connection::ConnectionCommand;
use bifrost_event_system::{
    BackendId, ConnectionId, PlayerIdentity, SessionId, SessionSnapshot,
};
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Which backend a session lives on.
///
/// A session has exactly one backend at a time. While a transfer is in
/// flight it remembers both ends until the target acknowledges or the
/// transfer is rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendBinding {
    Stable(BackendId),
    Transferring {
        from: BackendId,
        to: BackendId,
        correlation_id: u64,
    },
}

impl BackendBinding {
    /// The backend currently holding the session's claim.
    pub fn current(&self) -> BackendId {
        match *self {
            BackendBinding::Stable(backend) => backend,
            BackendBinding::Transferring { from, .. } => from,
        }
    }

    pub fn pending(&self) -> Option<BackendId> {
        match *self {
            BackendBinding::Stable(_) => None,
            BackendBinding::Transferring { to, .. } => Some(to),
        }
    }

    /// Whether `backend` is either end of the binding.
    pub fn involves(&self, backend: BackendId) -> bool {
        self.current() == backend || self.pending() == Some(backend)
    }

    /// Whether the binding is the in-flight transfer `correlation_id`.
    pub fn is_transfer(&self, correlation_id: u64) -> bool {
        matches!(*self, BackendBinding::Transferring { correlation_id: c, .. } if c == correlation_id)
    }
}

/// A logical player session, owned by the session manager.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub connection_id: ConnectionId,
    pub player: PlayerIdentity,
    pub remote_addr: SocketAddr,
    pub binding: BackendBinding,
    /// Unix timestamp in milliseconds
    pub created_at: u64,
    /// Unix timestamp in milliseconds
    pub last_activity: u64,
    /// Weak handle to the connection task; never keeps a closed connection alive
    pub(crate) link: mpsc::WeakSender<ConnectionCommand>,
}

impl Session {
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            connection_id: self.connection_id,
            player: self.player.clone(),
            remote_addr: self.remote_addr,
            backend: self.binding.current(),
            pending_backend: self.binding.pending(),
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_accessors() {
        let stable = BackendBinding::Stable(BackendId(1));
        assert_eq!(stable.current(), BackendId(1));
        assert_eq!(stable.pending(), None);
        assert!(!stable.involves(BackendId(2)));

        let moving = BackendBinding::Transferring {
            from: BackendId(1),
            to: BackendId(2),
            correlation_id: 9,
        };
        assert_eq!(moving.current(), BackendId(1));
        assert_eq!(moving.pending(), Some(BackendId(2)));
        assert!(moving.involves(BackendId(2)));
        assert!(moving.is_transfer(9));
        assert!(!moving.is_transfer(10));
        assert!(!stable.is_transfer(9));
    }
}
