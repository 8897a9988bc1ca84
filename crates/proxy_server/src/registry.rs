//! Backend routing table.
//!
//! The registry is the single owner of every backend's channel state and
//! session count. All mutations go through one short `parking_lot` critical
//! section; state-change events are collected under the lock and published
//! after it is released, so dispatcher handlers can call back into the
//! registry freely.

use crate::auth::SharedSecret;
use crate::error::{ProxyError, Result};
use bifrost_event_system::{
    current_timestamp, BackendId, BackendSnapshot, ChannelState, Dispatcher, ProxyEvent,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

struct BackendEntry {
    name: String,
    address: SocketAddr,
    state: ChannelState,
    secret: SharedSecret,
    last_heartbeat: Option<u64>,
    session_count: usize,
    default_server: bool,
    deregistered: bool,
}

impl BackendEntry {
    fn snapshot(&self, id: BackendId) -> BackendSnapshot {
        BackendSnapshot {
            id,
            name: self.name.clone(),
            address: self.address,
            state: self.state,
            session_count: self.session_count,
            last_heartbeat: self.last_heartbeat,
            default_server: self.default_server,
        }
    }

    fn retired(&self) -> bool {
        self.deregistered && self.state == ChannelState::Disconnected && self.session_count == 0
    }
}

#[derive(Default)]
struct RegistryInner {
    // BTreeMap keyed by monotonically increasing ids keeps registration order.
    entries: BTreeMap<BackendId, BackendEntry>,
    next_id: u64,
}

impl RegistryInner {
    fn entry_mut(&mut self, id: BackendId) -> Result<&mut BackendEntry> {
        self.entries.get_mut(&id).ok_or(ProxyError::UnknownBackend(id))
    }

    fn set_state(
        &mut self,
        id: BackendId,
        to: ChannelState,
        events: &mut Vec<ProxyEvent>,
    ) -> Result<ChannelState> {
        let entry = self.entry_mut(id)?;
        let from = entry.state;
        if from == to {
            return Ok(from);
        }
        if !from.can_transition_to(to) {
            return Err(ProxyError::InvalidTransition { backend: id, from, to });
        }
        if to == ChannelState::Disconnected && entry.session_count > 0 {
            // Draining -> Disconnected only once every session has left.
            return Err(ProxyError::InvalidTransition { backend: id, from, to });
        }
        entry.state = to;
        events.push(ProxyEvent::BackendStateChanged {
            backend: id,
            name: entry.name.clone(),
            from,
            to,
        });
        if entry.retired() {
            self.entries.remove(&id);
        }
        Ok(from)
    }
}

/// What `deregister` did with the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeregisterOutcome {
    /// The entry was removed immediately
    Removed,
    /// Sessions remain; the backend drains and is removed once empty
    Draining,
}

/// Result of giving back a session claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReleaseOutcome {
    /// The backend is Draining and just reached zero sessions
    pub drained: bool,
}

/// Thread-safe table of backends.
pub struct BackendRegistry {
    inner: Mutex<RegistryInner>,
    dispatcher: Arc<Dispatcher>,
}

impl BackendRegistry {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                entries: BTreeMap::new(),
                next_id: 1,
            }),
            dispatcher,
        }
    }

    fn publish_all(&self, events: Vec<ProxyEvent>) {
        for event in &events {
            self.dispatcher.publish(event);
        }
    }

    /// Adds a backend in the Disconnected state.
    ///
    /// # Arguments
    ///
    /// * `name` - Operator-facing name, unique case-insensitively
    /// * `address` - Where the backend agent listens for the bridge channel
    /// * `secret` - Shared secret for the bridge handshake
    /// * `default_server` - Whether new players should land here first
    ///
    /// # Returns
    ///
    /// The new backend's id, or `ProxyError::Config` for a duplicate name.
    pub fn register(
        &self,
        name: &str,
        address: SocketAddr,
        secret: SharedSecret,
        default_server: bool,
    ) -> Result<BackendId> {
        let mut inner = self.inner.lock();
        if inner
            .entries
            .values()
            .any(|e| e.name.eq_ignore_ascii_case(name))
        {
            return Err(ProxyError::Config(format!(
                "backend '{}' is already registered",
                name
            )));
        }

        let id = BackendId(inner.next_id);
        inner.next_id += 1;
        inner.entries.insert(
            id,
            BackendEntry {
                name: name.to_string(),
                address,
                state: ChannelState::Disconnected,
                secret,
                last_heartbeat: None,
                session_count: 0,
                default_server,
                deregistered: false,
            },
        );
        drop(inner);

        info!("🗂️ Registered backend '{}' ({}) at {}", name, id, address);
        Ok(id)
    }

    /// Starts removing a backend.
    ///
    /// A backend with sessions is marked Draining and removed once it reaches
    /// Disconnected with zero sessions; otherwise it is removed now.
    pub fn deregister(&self, id: BackendId) -> Result<DeregisterOutcome> {
        let mut events = Vec::new();
        let outcome = {
            let mut inner = self.inner.lock();
            let entry = inner.entry_mut(id)?;
            entry.deregistered = true;
            let state = entry.state;
            let sessions = entry.session_count;

            match state {
                ChannelState::Authenticated => {
                    inner.set_state(id, ChannelState::Draining, &mut events)?;
                    if sessions == 0 {
                        inner.set_state(id, ChannelState::Disconnected, &mut events)?;
                        DeregisterOutcome::Removed
                    } else {
                        DeregisterOutcome::Draining
                    }
                }
                ChannelState::Draining => {
                    if sessions == 0 {
                        inner.set_state(id, ChannelState::Disconnected, &mut events)?;
                        DeregisterOutcome::Removed
                    } else {
                        DeregisterOutcome::Draining
                    }
                }
                ChannelState::Handshaking => {
                    inner.set_state(id, ChannelState::Disconnected, &mut events)?;
                    DeregisterOutcome::Removed
                }
                ChannelState::Disconnected => {
                    inner.entries.remove(&id);
                    DeregisterOutcome::Removed
                }
            }
        };
        self.publish_all(events);

        info!("🗑️ Deregistering backend {}: {:?}", id, outcome);
        Ok(outcome)
    }

    /// Moves a backend's channel to a new state, validating the transition.
    ///
    /// Returns the previous state. A deregistered backend that reaches
    /// Disconnected with no sessions is removed as part of the transition.
    pub fn transition(&self, id: BackendId, to: ChannelState) -> Result<ChannelState> {
        let mut events = Vec::new();
        let from = self.inner.lock().set_state(id, to, &mut events)?;
        self.publish_all(events);
        if from != to {
            info!("🔀 Backend {} channel {} -> {}", id, from, to);
        }
        Ok(from)
    }

    /// Ids of every Authenticated backend in registration order.
    pub fn list_authenticated(&self) -> Vec<BackendId> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| e.state.accepts_sessions())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Chooses a backend for a new or moving session.
    ///
    /// The hint is honoured only if that backend is Authenticated. Otherwise
    /// the least-loaded Authenticated backend wins, ties going to the one
    /// registered first.
    pub fn pick(&self, hint: Option<BackendId>) -> Result<BackendId> {
        self.pick_excluding(hint, &[])
    }

    /// Like [`pick`](Self::pick) but never returns a backend in `exclude`.
    pub fn pick_excluding(&self, hint: Option<BackendId>, exclude: &[BackendId]) -> Result<BackendId> {
        let inner = self.inner.lock();
        if let Some(hint) = hint.filter(|h| !exclude.contains(h)) {
            if let Some(entry) = inner.entries.get(&hint) {
                if entry.state.accepts_sessions() {
                    return Ok(hint);
                }
            }
        }

        inner
            .entries
            .iter()
            .filter(|(id, e)| e.state.accepts_sessions() && !exclude.contains(*id))
            // min_by_key keeps the first minimum, i.e. the earliest registration.
            .min_by_key(|(_, e)| e.session_count)
            .map(|(id, _)| *id)
            .ok_or(ProxyError::NoBackendAvailable)
    }

    /// Counts one more session against an Authenticated backend.
    pub fn claim(&self, id: BackendId) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(id)?;
        if !entry.state.accepts_sessions() {
            return Err(ProxyError::ChannelUnavailable(id));
        }
        entry.session_count += 1;
        Ok(())
    }

    /// Gives back one session claim.
    pub fn release(&self, id: BackendId) -> ReleaseOutcome {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&id) else {
            warn!("⚠️ Released a session on unknown backend {}", id);
            return ReleaseOutcome::default();
        };
        if entry.session_count == 0 {
            error!("❌ Session count underflow on backend {}", id);
            return ReleaseOutcome::default();
        }
        entry.session_count -= 1;
        ReleaseOutcome {
            drained: entry.state == ChannelState::Draining && entry.session_count == 0,
        }
    }

    /// Moves one session claim from `from` to `to` atomically.
    ///
    /// Fails without changing anything if `to` is not Authenticated.
    pub fn move_claim(&self, from: BackendId, to: BackendId) -> Result<ReleaseOutcome> {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&from) {
            return Err(ProxyError::UnknownBackend(from));
        }
        let target = inner.entry_mut(to)?;
        if !target.state.accepts_sessions() {
            return Err(ProxyError::ChannelUnavailable(to));
        }
        target.session_count += 1;

        let source = inner.entry_mut(from)?;
        source.session_count = source.session_count.saturating_sub(1);
        Ok(ReleaseOutcome {
            drained: source.state == ChannelState::Draining && source.session_count == 0,
        })
    }

    pub fn record_heartbeat(&self, id: BackendId) {
        if let Some(entry) = self.inner.lock().entries.get_mut(&id) {
            entry.last_heartbeat = Some(current_timestamp());
        }
    }

    pub fn state(&self, id: BackendId) -> Option<ChannelState> {
        self.inner.lock().entries.get(&id).map(|e| e.state)
    }

    pub fn secret(&self, id: BackendId) -> Option<SharedSecret> {
        self.inner.lock().entries.get(&id).map(|e| e.secret.clone())
    }

    pub fn address(&self, id: BackendId) -> Option<SocketAddr> {
        self.inner.lock().entries.get(&id).map(|e| e.address)
    }

    pub fn name(&self, id: BackendId) -> Option<String> {
        self.inner.lock().entries.get(&id).map(|e| e.name.clone())
    }

    pub fn session_count(&self, id: BackendId) -> Option<usize> {
        self.inner.lock().entries.get(&id).map(|e| e.session_count)
    }

    /// Case-insensitive lookup by backend name.
    pub fn find_by_name(&self, name: &str) -> Option<BackendId> {
        self.inner
            .lock()
            .entries
            .iter()
            .find(|(_, e)| e.name.eq_ignore_ascii_case(name))
            .map(|(id, _)| *id)
    }

    /// First backend flagged as default, whatever its state.
    pub fn default_backend(&self) -> Option<BackendId> {
        self.inner
            .lock()
            .entries
            .iter()
            .find(|(_, e)| e.default_server)
            .map(|(id, _)| *id)
    }

    pub fn contains(&self, id: BackendId) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    pub fn is_deregistered(&self, id: BackendId) -> bool {
        self.inner
            .lock()
            .entries
            .get(&id)
            .map(|e| e.deregistered)
            .unwrap_or(true)
    }

    pub fn snapshot(&self, id: BackendId) -> Option<BackendSnapshot> {
        self.inner.lock().entries.get(&id).map(|e| e.snapshot(id))
    }

    pub fn snapshots(&self) -> Vec<BackendSnapshot> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(id, e)| e.snapshot(*id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
