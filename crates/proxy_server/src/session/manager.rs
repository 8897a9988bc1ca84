//! Session table and the handoff protocol.
//!
//! # Concurrency
//!
//! Sessions live in a `DashMap`. A shard guard is never held across an
//! `.await`, and the only lock taken while holding one is the registry's
//! (lock order: session shard, then registry). A backend's session count
//! therefore changes exactly once per event:
//!
//! * `destroy_session` removes the entry first; only the caller that
//!   actually removed it releases the claim.
//! * A handoff ack moves the claim while holding the session's shard guard,
//!   so it either sees the session (and moves the claim before any destroy
//!   can observe the binding) or sees nothing.
//! * A failed transfer puts the session back on its source. If the source
//!   started draining meanwhile the session is moved off again, so every
//!   claim on a draining backend is eventually moved or released.
//!
//! Nothing reached from the bridge router waits on a client's queue.

use super::state::{BackendBinding, Session};
use crate::bridge::{
    AckPayload, BridgeEvent, BridgeMessage, BridgeTransport, CommandPayload, EventPayload,
    ForwardFrame, HandoffPayload, HandoffReason, MessageKind, OutboundMessage, ReleasePayload,
};
use crate::codec::Packet;
use crate::connection::{CloseReason, ConnectionCommand};
use crate::error::{ProxyError, Result};
use crate::registry::BackendRegistry;
use bifrost_event_system::{
    current_timestamp, BackendId, ChannelState, CommandError, CommandSource, ConnectionId,
    Dispatcher, PlayerIdentity, ProxyEvent, SessionId, SessionSnapshot, Verdict,
};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Session manager tuning.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// How long a transfer waits for the target's ack before rolling back
    pub handoff_timeout: Duration,
    /// Backends tried when the picked one turns out to be unavailable
    pub max_pick_attempts: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handoff_timeout: Duration::from_secs(10),
            max_pick_attempts: 3,
        }
    }
}

/// Connection details needed to open a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub connection_id: ConnectionId,
    pub player: PlayerIdentity,
    pub remote_addr: SocketAddr,
    pub link: mpsc::WeakSender<ConnectionCommand>,
}

/// Final state of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { to: BackendId },
    RolledBack { reason: String },
}

/// Returned by `transfer_session`; the outcome arrives once the target acks
/// or the transfer rolls back.
#[derive(Debug)]
pub struct TransferHandle {
    pub correlation_id: u64,
    pub target: BackendId,
    outcome: oneshot::Receiver<TransferOutcome>,
}

impl TransferHandle {
    pub async fn outcome(self) -> TransferOutcome {
        self.outcome.await.unwrap_or(TransferOutcome::RolledBack {
            reason: "session closed".to_string(),
        })
    }
}

struct PendingTransfer {
    session_id: SessionId,
    from: BackendId,
    to: BackendId,
    /// Started by a drain; a failure disconnects instead of retrying
    evacuation: bool,
    outcome: oneshot::Sender<TransferOutcome>,
}

/// Owns every session and its backend binding.
pub struct SessionManager {
    sessions: DashMap<SessionId, Session>,
    by_connection: DashMap<ConnectionId, SessionId>,
    pending: DashMap<u64, PendingTransfer>,
    next_correlation: AtomicU64,
    registry: Arc<BackendRegistry>,
    transport: Arc<dyn BridgeTransport>,
    dispatcher: Arc<Dispatcher>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(
        registry: Arc<BackendRegistry>,
        transport: Arc<dyn BridgeTransport>,
        dispatcher: Arc<Dispatcher>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            by_connection: DashMap::new(),
            pending: DashMap::new(),
            next_correlation: AtomicU64::new(1),
            registry,
            transport,
            dispatcher,
            settings,
        }
    }

    fn next_correlation(&self) -> u64 {
        self.next_correlation.fetch_add(1, Ordering::Relaxed)
    }

    /// Opens a session for a freshly handshaked connection.
    ///
    /// Publishes `PreConnect` (interceptors may deny or redirect), picks a
    /// backend, claims it and sends the `handoff`. If the picked backend's
    /// channel turns out to be unavailable another backend is tried.
    ///
    /// # Returns
    ///
    /// A snapshot of the new session, or `ConnectDenied`,
    /// `NoBackendAvailable` or `ProtocolViolation` (the connection already
    /// owns a session).
    pub async fn create_session(&self, new: NewSession) -> Result<SessionSnapshot> {
        if self.by_connection.contains_key(&new.connection_id) {
            return Err(ProxyError::ProtocolViolation(format!(
                "connection {} already owns a session",
                new.connection_id
            )));
        }

        let proposed = self.registry.default_backend();
        let report = self.dispatcher.publish(&ProxyEvent::PreConnect {
            player: new.player.clone(),
            remote_addr: new.remote_addr,
            proposed,
        });
        let hint = match report.verdict {
            Verdict::Deny { reason } => return Err(ProxyError::ConnectDenied(reason)),
            Verdict::Redirect { backend } => Some(backend),
            Verdict::Continue => proposed,
        };

        let session_id = SessionId::new();
        let mut tried: Vec<BackendId> = Vec::new();
        let snapshot = loop {
            if tried.len() >= self.settings.max_pick_attempts {
                return Err(ProxyError::NoBackendAvailable);
            }

            let backend = self.registry.pick_excluding(hint, &tried)?;
            tried.push(backend);
            if let Err(e) = self.registry.claim(backend) {
                if e.is_retryable() {
                    continue;
                }
                return Err(e);
            }

            let now = current_timestamp();
            let session = Session {
                id: session_id,
                connection_id: new.connection_id,
                player: new.player.clone(),
                remote_addr: new.remote_addr,
                binding: BackendBinding::Stable(backend),
                created_at: now,
                last_activity: now,
                link: new.link.clone(),
            };
            let snapshot = session.snapshot();
            self.sessions.insert(session_id, session);
            self.by_connection.insert(new.connection_id, session_id);

            let handoff = HandoffPayload {
                session_id,
                player: new.player.clone(),
                remote_addr: new.remote_addr.to_string(),
                reason: HandoffReason::Connect,
                previous_backend: None,
            };
            let message = OutboundMessage::json(MessageKind::Handoff, self.next_correlation(), &handoff)?;

            match self.transport.send(backend, message).await {
                Ok(()) => break snapshot,
                Err(e) => {
                    self.by_connection
                        .remove_if(&new.connection_id, |_, id| *id == session_id);
                    if self.sessions.remove(&session_id).is_some() {
                        self.release_claim(backend);
                    }
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    debug!("Backend {} unavailable for handoff, re-picking", backend);
                }
            }
        };

        debug!(
            "Session {} for {} assigned to {}",
            session_id, new.player.username, snapshot.backend
        );
        self.dispatcher.publish(&ProxyEvent::SessionConnected {
            session: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// Starts moving a session to `target`.
    ///
    /// The session's backend only changes once the target acknowledges the
    /// handoff. If the target's channel goes away, rejects the handoff, or
    /// does not answer within the handoff timeout, the transfer is rolled
    /// back, `TransferFailed` is published and the client stays connected.
    /// A session rolled back onto a backend that started draining meanwhile
    /// is moved off it right away.
    pub async fn transfer_session(
        self: &Arc<Self>,
        session_id: SessionId,
        target: BackendId,
    ) -> Result<TransferHandle> {
        self.begin_transfer(session_id, target, false).await
    }

    async fn begin_transfer(
        self: &Arc<Self>,
        session_id: SessionId,
        target: BackendId,
        evacuation: bool,
    ) -> Result<TransferHandle> {
        let snapshot = {
            let session = self
                .sessions
                .get(&session_id)
                .ok_or(ProxyError::UnknownSession(session_id))?;
            if let BackendBinding::Transferring { .. } = session.binding {
                return Err(ProxyError::TransferInProgress(session_id));
            }
            session.snapshot()
        };
        let from = snapshot.backend;

        let report = self.dispatcher.publish(&ProxyEvent::PreTransfer {
            session: snapshot.clone(),
            target,
        });
        let target = match report.verdict {
            Verdict::Deny { reason } => return Err(ProxyError::TransferDenied(reason)),
            Verdict::Redirect { backend } => backend,
            Verdict::Continue => target,
        };
        if target == from {
            return Err(ProxyError::TransferDenied(format!(
                "session is already on {}",
                target
            )));
        }
        match self.registry.state(target) {
            None => return Err(ProxyError::UnknownBackend(target)),
            Some(state) if !state.accepts_sessions() => {
                return Err(ProxyError::ChannelUnavailable(target))
            }
            Some(_) => {}
        }

        let correlation_id = self.next_correlation();
        let handoff = HandoffPayload {
            session_id,
            player: snapshot.player.clone(),
            remote_addr: snapshot.remote_addr.to_string(),
            reason: HandoffReason::Transfer,
            previous_backend: self.registry.name(from),
        };
        let message = OutboundMessage::json(MessageKind::Handoff, correlation_id, &handoff)?;

        {
            let mut session = self
                .sessions
                .get_mut(&session_id)
                .ok_or(ProxyError::UnknownSession(session_id))?;
            if session.binding != BackendBinding::Stable(from) {
                return Err(ProxyError::TransferInProgress(session_id));
            }
            session.binding = BackendBinding::Transferring {
                from,
                to: target,
                correlation_id,
            };
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            correlation_id,
            PendingTransfer {
                session_id,
                from,
                to: target,
                evacuation,
                outcome: tx,
            },
        );

        if let Err(e) = self.transport.send(target, message).await {
            self.rollback(correlation_id, &format!("handoff could not be sent: {}", e))
                .await;
            return Err(e);
        }

        let manager = Arc::clone(self);
        let timeout = self.settings.handoff_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            manager
                .rollback(correlation_id, "handoff acknowledgment timed out")
                .await;
        });

        info!(
            "🔁 Transferring session {} from {} to {}",
            session_id, from, target
        );
        Ok(TransferHandle {
            correlation_id,
            target,
            outcome: rx,
        })
    }

    /// Rolls back an in-flight transfer. Returns false if it already finished.
    async fn rollback(self: &Arc<Self>, correlation_id: u64, reason: &str) -> bool {
        let Some((_, pending)) = self.pending.remove(&correlation_id) else {
            return false;
        };
        self.settle_failed(pending, correlation_id, reason).await;
        true
    }

    /// Puts the session back on its source and reports the failure.
    ///
    /// The source may have started draining while the handoff was in
    /// flight. A session landing on a draining backend is moved elsewhere,
    /// or disconnected when it was already being moved off it.
    async fn settle_failed(self: &Arc<Self>, pending: PendingTransfer, correlation_id: u64, reason: &str) {
        let restored = match self.sessions.get_mut(&pending.session_id) {
            Some(mut session) if session.binding.is_transfer(correlation_id) => {
                session.binding = BackendBinding::Stable(pending.from);
                true
            }
            _ => false,
        };
        let (session_id, from, evacuation) = (pending.session_id, pending.from, pending.evacuation);
        self.fail_transfer(pending, reason);

        if !restored || self.registry.state(from) != Some(ChannelState::Draining) {
            return;
        }
        if evacuation {
            self.disconnect_session(session_id, CloseReason::BackendUnavailable)
                .await;
        } else {
            Arc::clone(self).evacuate(session_id, from).await;
        }
    }

    fn fail_transfer(&self, pending: PendingTransfer, reason: &str) {
        warn!(
            "⚠️ Transfer of session {} to {} rolled back: {}",
            pending.session_id, pending.to, reason
        );
        self.dispatcher.publish(&ProxyEvent::TransferFailed {
            session_id: pending.session_id,
            from: pending.from,
            to: pending.to,
            reason: reason.to_string(),
        });
        let _ = pending.outcome.send(TransferOutcome::RolledBack {
            reason: reason.to_string(),
        });
    }

    /// Moves one session off a draining backend, disconnecting it when no
    /// other backend can take it.
    ///
    /// Boxed because a failed move settles back through `settle_failed`.
    fn evacuate(self: Arc<Self>, session_id: SessionId, backend: BackendId) -> BoxFuture<'static, ()> {
        async move {
            let target = match self.registry.pick_excluding(None, &[backend]) {
                Ok(target) => target,
                Err(_) => {
                    self.disconnect_session(session_id, CloseReason::BackendUnavailable)
                        .await;
                    return;
                }
            };
            match self.begin_transfer(session_id, target, true).await {
                Ok(_) => {}
                // Closed meanwhile, or already moving.
                Err(ProxyError::UnknownSession(_)) | Err(ProxyError::TransferInProgress(_)) => {}
                Err(e) => {
                    debug!("Drain transfer of {} failed: {}", session_id, e);
                    self.disconnect_session(session_id, CloseReason::BackendUnavailable)
                        .await;
                }
            }
        }
        .boxed()
    }

    /// Completes or rejects a transfer when the target answers the handoff.
    pub async fn handle_handoff_ack(
        self: &Arc<Self>,
        backend: BackendId,
        correlation_id: u64,
        ack: AckPayload,
    ) {
        let Some((_, pending)) = self
            .pending
            .remove_if(&correlation_id, |_, p| p.to == backend)
        else {
            debug!("Ignoring ack {} from {}: no matching transfer", correlation_id, backend);
            return;
        };

        if !ack.accepted {
            let reason = ack.message.unwrap_or_else(|| "rejected by target".to_string());
            self.settle_failed(pending, correlation_id, &reason).await;
            return;
        }

        let switched = {
            let Some(mut session) = self.sessions.get_mut(&pending.session_id) else {
                // Session closed meanwhile; its destroy released the old claim.
                return;
            };
            if !session.binding.is_transfer(correlation_id) {
                return;
            }
            // On failure the session stays Transferring until settled below.
            self.registry
                .move_claim(pending.from, pending.to)
                .map(|release| {
                    session.binding = BackendBinding::Stable(pending.to);
                    session.last_activity = current_timestamp();
                    (release, session.player.clone())
                })
        };

        match switched {
            Ok((release, player)) => {
                if release.drained {
                    self.transport.notify_drained(pending.from);
                }
                self.send_release(pending.from, pending.session_id, "transferred").await;
                info!(
                    "✅ Session {} ({}) switched {} -> {}",
                    pending.session_id, player.username, pending.from, pending.to
                );
                self.dispatcher.publish(&ProxyEvent::BackendSwitch {
                    session_id: pending.session_id,
                    player,
                    from: pending.from,
                    to: pending.to,
                });
                let _ = pending.outcome.send(TransferOutcome::Completed { to: pending.to });
            }
            Err(e) => {
                let reason = format!("claim could not move: {}", e);
                self.settle_failed(pending, correlation_id, &reason).await;
            }
        }
    }

    /// Removes a session. Safe to call any number of times, concurrently.
    ///
    /// Returns true only for the call that actually removed it.
    pub async fn destroy_session(&self, session_id: SessionId, reason: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(&session_id) else {
            return false;
        };
        self.by_connection
            .remove_if(&session.connection_id, |_, id| *id == session_id);

        let backend = match session.binding {
            BackendBinding::Stable(backend) => backend,
            BackendBinding::Transferring {
                from,
                correlation_id,
                ..
            } => {
                if let Some((_, pending)) = self.pending.remove(&correlation_id) {
                    let _ = pending.outcome.send(TransferOutcome::RolledBack {
                        reason: "session closed".to_string(),
                    });
                }
                from
            }
        };
        self.release_claim(backend);
        self.send_release(backend, session_id, reason).await;

        debug!(
            "Session {} ({}) closed: {}",
            session_id, session.player.username, reason
        );
        self.dispatcher.publish(&ProxyEvent::SessionDisconnected {
            session_id,
            player: session.player,
            backend,
            reason: reason.to_string(),
        });
        true
    }

    /// Destroys whatever session the connection owns.
    pub async fn destroy_for_connection(&self, connection_id: ConnectionId, reason: &str) -> bool {
        let session_id = self.by_connection.get(&connection_id).map(|entry| *entry.value());
        match session_id {
            Some(session_id) => self.destroy_session(session_id, reason).await,
            None => false,
        }
    }

    /// Asks the session's connection to close, then destroys the session.
    ///
    /// Never waits on the connection's queue.
    pub async fn disconnect_session(&self, session_id: SessionId, reason: CloseReason) -> bool {
        if let Some(link) = self.sessions.get(&session_id).map(|s| s.link.clone()) {
            request_close(&link, reason);
        }
        self.destroy_session(session_id, reason.message()).await
    }

    fn release_claim(&self, backend: BackendId) {
        if self.registry.release(backend).drained {
            self.transport.notify_drained(backend);
        }
    }

    async fn send_release(&self, backend: BackendId, session_id: SessionId, reason: &str) {
        let payload = ReleasePayload {
            session_id,
            reason: reason.to_string(),
        };
        let message = match OutboundMessage::json(MessageKind::Release, 0, &payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("⚠️ Could not encode release for {}: {}", session_id, e);
                return;
            }
        };
        if let Err(e) = self.transport.send(backend, message).await {
            debug!("Release for {} not delivered to {}: {}", session_id, backend, e);
        }
    }

    /// Relays a client packet to the session's current backend.
    pub async fn forward_to_backend(
        &self,
        session_id: SessionId,
        stream_id: u64,
        packet: Packet,
    ) -> Result<()> {
        let backend = {
            let mut session = self
                .sessions
                .get_mut(&session_id)
                .ok_or(ProxyError::UnknownSession(session_id))?;
            session.last_activity = current_timestamp();
            session.binding.current()
        };
        let frame = ForwardFrame {
            session_id,
            stream_id,
            packet,
        };
        self.transport.send(backend, frame.into_message()).await
    }

    /// Queues a backend packet on the client's connection.
    ///
    /// The bridge router calls this inline, so it never waits: a client
    /// whose queue is full is too slow to keep and gets disconnected.
    async fn forward_to_client(&self, backend: BackendId, frame: ForwardFrame) {
        let session_id = frame.session_id;
        let link = match self.sessions.get(&session_id) {
            Some(session) if session.binding.involves(backend) => session.link.clone(),
            Some(_) => {
                warn!(
                    "⚠️ Backend {} sent packets for session {} it does not serve",
                    backend, frame.session_id
                );
                return;
            }
            None => return,
        };
        let Some(sender) = link.upgrade() else {
            return;
        };
        let delivery = sender.try_send(ConnectionCommand::Deliver {
            stream_id: frame.stream_id,
            packet: frame.packet,
        });
        drop(sender);
        if let Err(TrySendError::Full(_)) = delivery {
            warn!(
                "⚠️ Session {} is not reading packets from {}, disconnecting",
                session_id, backend
            );
            self.disconnect_session(session_id, CloseReason::ResourceExhausted)
                .await;
        }
    }

    /// Moves every session off a backend that stopped accepting sessions.
    ///
    /// Transfers heading to the backend are rolled back. Sessions on it are
    /// transferred to another backend, or disconnected when none is left or
    /// the transfer does not complete. Sessions already moving away keep
    /// their claim here until their transfer settles.
    pub async fn on_backend_draining(self: &Arc<Self>, backend: BackendId) {
        let doomed: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.value().to == backend)
            .map(|entry| *entry.key())
            .collect();
        for correlation_id in doomed {
            self.rollback(correlation_id, "target backend is draining").await;
        }

        let mut affected = Vec::new();
        let mut leaving = 0usize;
        for entry in self.sessions.iter() {
            match entry.value().binding {
                BackendBinding::Stable(b) if b == backend => affected.push(*entry.key()),
                BackendBinding::Transferring { from, .. } if from == backend => leaving += 1,
                _ => {}
            }
        }
        if !affected.is_empty() || leaving > 0 {
            info!(
                "🚚 Moving {} session(s) off draining {} ({} already leaving)",
                affected.len(),
                backend,
                leaving
            );
        }

        for session_id in affected {
            Arc::clone(self).evacuate(session_id, backend).await;
        }

        if self.registry.session_count(backend) == Some(0) {
            self.transport.notify_drained(backend);
        }
    }

    /// Entry point for everything the bridge channels receive.
    pub async fn handle_bridge_event(self: &Arc<Self>, event: BridgeEvent) {
        match event {
            BridgeEvent::Draining { backend } => self.on_backend_draining(backend).await,
            BridgeEvent::Message { backend, message } => {
                if let Err(e) = self.handle_bridge_message(backend, message).await {
                    warn!("⚠️ Bad bridge message from {}: {}", backend, e);
                }
            }
        }
    }

    async fn handle_bridge_message(self: &Arc<Self>, backend: BackendId, message: BridgeMessage) -> Result<()> {
        match message.kind {
            MessageKind::Ack => {
                let ack: AckPayload = message.json()?;
                self.handle_handoff_ack(backend, message.correlation_id, ack).await;
            }
            MessageKind::Forward => {
                let frame = ForwardFrame::from_bytes(message.payload)?;
                self.forward_to_client(backend, frame).await;
            }
            MessageKind::Event => {
                let event: EventPayload = message.json()?;
                self.dispatcher.publish(&ProxyEvent::BackendMessage {
                    backend,
                    channel: event.channel,
                    data: event.data,
                });
            }
            MessageKind::Command => {
                let command: CommandPayload = message.json()?;
                let reply = match self
                    .dispatcher
                    .execute_command(&command.command_line, &CommandSource::Backend(backend))
                {
                    Ok(result) => AckPayload {
                        accepted: result.success,
                        message: result.message,
                    },
                    Err(CommandError::UnknownCommand(name)) => AckPayload {
                        accepted: false,
                        message: Some(ProxyError::UnknownCommand(name).to_string()),
                    },
                    Err(e) => AckPayload {
                        accepted: false,
                        message: Some(e.to_string()),
                    },
                };
                let ack = OutboundMessage::json(MessageKind::Ack, message.correlation_id, &reply)?;
                // The backend's queue may be full; never stall the router on it.
                let transport = Arc::clone(&self.transport);
                tokio::spawn(async move {
                    if let Err(e) = transport.send(backend, ack).await {
                        debug!("Command reply not delivered to {}: {}", backend, e);
                    }
                });
            }
            MessageKind::Release => {
                // The backend is done with the player: kick them.
                let release: ReleasePayload = message.json()?;
                let served = self
                    .sessions
                    .get(&release.session_id)
                    .map(|s| s.binding.current() == backend)
                    .unwrap_or(false);
                if served {
                    self.disconnect_session(release.session_id, CloseReason::Kicked).await;
                }
            }
            MessageKind::Handoff | MessageKind::Hello | MessageKind::Heartbeat => {
                debug!("Ignoring {:?} from {}", message.kind, backend);
            }
        }
        Ok(())
    }

    pub fn get(&self, session_id: SessionId) -> Option<SessionSnapshot> {
        self.sessions.get(&session_id).map(|s| s.snapshot())
    }

    pub fn session_for_connection(&self, connection_id: ConnectionId) -> Option<SessionId> {
        self.by_connection.get(&connection_id).map(|entry| *entry.value())
    }

    /// Case-insensitive lookup by player name.
    pub fn find_by_username(&self, username: &str) -> Option<SessionSnapshot> {
        self.sessions
            .iter()
            .find(|entry| entry.value().player.username.eq_ignore_ascii_case(username))
            .map(|entry| entry.value().snapshot())
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions.iter().map(|entry| entry.value().snapshot()).collect()
    }

    pub fn sessions_on(&self, backend: BackendId) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().binding.current() == backend)
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Asks a connection to close without waiting on its queue.
fn request_close(link: &mpsc::WeakSender<ConnectionCommand>, reason: CloseReason) {
    let Some(sender) = link.upgrade() else {
        return;
    };
    if let Err(TrySendError::Full(command)) = sender.try_send(ConnectionCommand::Close { reason }) {
        tokio::spawn(async move {
            let _ = sender.send(command).await;
        });
    }
}
