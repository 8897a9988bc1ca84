//! Test doubles for the bridge side of the proxy.
//!
//! [`MockAgent`] is a real TCP agent for end-to-end tests.
//! [`RecordingTransport`] replaces the bridge entirely so the session
//! manager can be driven without sockets.

pub mod mock_agent;

pub use mock_agent::{AckMode, HandshakeMode, MockAgent};

use crate::bridge::{BridgeTransport, MessageKind, OutboundMessage};
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use bifrost_event_system::BackendId;
use parking_lot::Mutex;
use std::collections::HashSet;

/// A [`BridgeTransport`] that records every message instead of sending it.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(BackendId, OutboundMessage)>>,
    offline: Mutex<HashSet<BackendId>>,
    drained: Mutex<Vec<BackendId>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes sends to `backend` fail with `ChannelUnavailable`.
    pub fn set_offline(&self, backend: BackendId, offline: bool) {
        let mut set = self.offline.lock();
        if offline {
            set.insert(backend);
        } else {
            set.remove(&backend);
        }
    }

    pub fn sent(&self) -> Vec<(BackendId, OutboundMessage)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, backend: BackendId, kind: MessageKind) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|(b, m)| *b == backend && m.kind == kind)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Most recent message of `kind` sent to `backend`.
    pub fn last_to(&self, backend: BackendId, kind: MessageKind) -> Option<OutboundMessage> {
        self.sent_to(backend, kind).pop()
    }

    /// Backends reported fully drained, in order.
    pub fn drained(&self) -> Vec<BackendId> {
        self.drained.lock().clone()
    }
}

#[async_trait]
impl BridgeTransport for RecordingTransport {
    async fn send(&self, backend: BackendId, message: OutboundMessage) -> Result<()> {
        if self.offline.lock().contains(&backend) {
            return Err(ProxyError::ChannelUnavailable(backend));
        }
        self.sent.lock().push((backend, message));
        Ok(())
    }

    fn notify_drained(&self, backend: BackendId) {
        self.drained.lock().push(backend);
    }
}
