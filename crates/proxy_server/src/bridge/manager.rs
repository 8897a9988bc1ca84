//! Owns every bridge channel and its reconnecting supervisor.

use super::channel::{BridgeSettings, ChannelContext, ChannelExit};
use super::message::OutboundMessage;
use super::{BridgeEvent, BridgeTransport};
use crate::codec::PacketCodec;
use crate::error::{ProxyError, Result};
use crate::registry::{BackendRegistry, DeregisterOutcome};
use async_trait::async_trait;
use bifrost_event_system::{BackendId, ChannelState, Dispatcher, ViolationKind};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct SupervisorHandle {
    cancel: CancellationToken,
    drained: Arc<Notify>,
}

/// Manages outbound bridge connections to all registered backends.
///
/// Each backend gets one supervisor task that dials the agent, runs the
/// handshake and the message loop, and reconnects after the channel has
/// fully drained. A handshake authentication failure stops the supervisor
/// for good; the operator has to fix the secret and re-register.
pub struct BridgeManager {
    registry: Arc<BackendRegistry>,
    dispatcher: Arc<Dispatcher>,
    settings: BridgeSettings,
    codec: PacketCodec,
    /// Outbound queues of Authenticated channels
    channels: DashMap<BackendId, mpsc::Sender<OutboundMessage>>,
    supervisors: DashMap<BackendId, SupervisorHandle>,
    events: mpsc::UnboundedSender<BridgeEvent>,
}

impl BridgeManager {
    /// Creates the manager and the receiver for inbound bridge events.
    pub fn new(
        registry: Arc<BackendRegistry>,
        dispatcher: Arc<Dispatcher>,
        settings: BridgeSettings,
        codec: PacketCodec,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            registry,
            dispatcher,
            settings,
            codec,
            channels: DashMap::new(),
            supervisors: DashMap::new(),
            events,
        });
        (manager, receiver)
    }

    /// Starts a supervisor for every registered backend.
    pub fn start_all(self: &Arc<Self>) {
        for snapshot in self.registry.snapshots() {
            self.start(snapshot.id);
        }
    }

    /// Starts the supervisor for one backend unless it is already running.
    pub fn start(self: &Arc<Self>, backend: BackendId) {
        if self.supervisors.contains_key(&backend) {
            return;
        }
        let cancel = CancellationToken::new();
        let drained = Arc::new(Notify::new());
        self.supervisors.insert(
            backend,
            SupervisorHandle {
                cancel: cancel.clone(),
                drained: drained.clone(),
            },
        );

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.supervise(backend, drained, cancel).await;
            manager.supervisors.remove(&backend);
            manager.channels.remove(&backend);
        });
    }

    /// Deregisters a backend and stops or drains its channel.
    pub fn deregister(&self, backend: BackendId) -> Result<DeregisterOutcome> {
        let previous = self.registry.state(backend);
        let outcome = self.registry.deregister(backend)?;
        match outcome {
            DeregisterOutcome::Removed => {
                if let Some((_, handle)) = self.supervisors.remove(&backend) {
                    handle.cancel.cancel();
                }
                self.channels.remove(&backend);
            }
            DeregisterOutcome::Draining => {
                if previous == Some(ChannelState::Authenticated) {
                    let _ = self.events.send(BridgeEvent::Draining { backend });
                }
            }
        }
        Ok(outcome)
    }

    /// Whether the backend's channel is up and Authenticated.
    pub fn is_connected(&self, backend: BackendId) -> bool {
        self.channels.contains_key(&backend)
            && self.registry.state(backend) == Some(ChannelState::Authenticated)
    }

    /// Cancels every supervisor and channel.
    pub fn shutdown(&self) {
        for entry in self.supervisors.iter() {
            entry.value().cancel.cancel();
        }
        self.channels.clear();
        info!("🔌 Bridge channels shut down");
    }

    fn context(&self, backend: BackendId) -> Option<ChannelContext> {
        Some(ChannelContext {
            backend,
            name: self.registry.name(backend)?,
            secret: self.registry.secret(backend)?,
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            events: self.events.clone(),
            settings: self.settings.clone(),
        })
    }

    async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }

    async fn supervise(&self, backend: BackendId, drained: Arc<Notify>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let (Some(ctx), Some(address)) = (self.context(backend), self.registry.address(backend)) else {
                return;
            };

            let connect = timeout(self.settings.handshake_timeout, TcpStream::connect(address));
            let stream = tokio::select! {
                _ = cancel.cancelled() => return,
                result = connect => match result {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        warn!("⚠️ Cannot reach backend '{}' at {}: {}", ctx.name, address, e);
                        if !self.pause(self.settings.reconnect_interval, &cancel).await {
                            return;
                        }
                        continue;
                    }
                    Err(_) => {
                        warn!("⚠️ Connecting to backend '{}' at {} timed out", ctx.name, address);
                        if !self.pause(self.settings.reconnect_interval, &cancel).await {
                            return;
                        }
                        continue;
                    }
                },
            };
            let _ = stream.set_nodelay(true);

            if self.registry.transition(backend, ChannelState::Handshaking).is_err() {
                return;
            }
            let mut framed = Framed::new(stream, self.codec.clone());

            let keys = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = self.registry.transition(backend, ChannelState::Disconnected);
                    return;
                }
                result = ctx.handshake(&mut framed) => result,
            };
            let keys = match keys {
                Ok(keys) => keys,
                Err(ProxyError::HandshakeAuthFailure { reason, .. }) => {
                    error!("❌ Handshake with backend '{}' failed authentication: {}", ctx.name, reason);
                    let _ = self.registry.transition(backend, ChannelState::Disconnected);
                    ctx.publish_violation(ViolationKind::HandshakeAuthFailure, reason);
                    // Not retried: the same secret would fail the same way.
                    return;
                }
                Err(e) => {
                    warn!("⚠️ Handshake with backend '{}' did not complete: {}", ctx.name, e);
                    let _ = self.registry.transition(backend, ChannelState::Disconnected);
                    if !self.pause(self.settings.reconnect_interval, &cancel).await {
                        return;
                    }
                    continue;
                }
            };

            if self.registry.transition(backend, ChannelState::Authenticated).is_err() {
                return;
            }
            let (tx, rx) = mpsc::channel(self.settings.queue_capacity);
            self.channels.insert(backend, tx);
            info!("✅ Bridge channel to '{}' authenticated", ctx.name);

            let exit = ctx.run(framed, keys, rx, drained.clone(), cancel.clone()).await;
            self.channels.remove(&backend);

            match &exit {
                ChannelExit::Cancelled => return,
                ChannelExit::Drained => info!("🚰 Backend '{}' drained", ctx.name),
                ChannelExit::TransportLost(reason) => {
                    warn!("⚠️ Bridge channel to '{}' lost: {}", ctx.name, reason);
                    ctx.begin_draining(reason);
                }
            }

            // Sessions may still be moving off the backend; wait for zero.
            while self.registry.session_count(backend).unwrap_or(0) > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = drained.notified() => {}
                    _ = sleep(self.settings.heartbeat_interval) => {}
                }
            }
            let _ = self.registry.transition(backend, ChannelState::Disconnected);

            if !self.registry.contains(backend) {
                info!("🗑️ Backend {} retired", backend);
                return;
            }
            if !self.pause(self.settings.reconnect_interval, &cancel).await {
                return;
            }
        }
    }
}

#[async_trait]
impl BridgeTransport for BridgeManager {
    async fn send(&self, backend: BackendId, message: OutboundMessage) -> Result<()> {
        if self.registry.state(backend) != Some(ChannelState::Authenticated) {
            return Err(ProxyError::ChannelUnavailable(backend));
        }
        let sender = self
            .channels
            .get(&backend)
            .map(|entry| entry.value().clone())
            .ok_or(ProxyError::ChannelUnavailable(backend))?;
        sender
            .send(message)
            .await
            .map_err(|_| ProxyError::ChannelUnavailable(backend))
    }

    fn notify_drained(&self, backend: BackendId) {
        if let Some(handle) = self.supervisors.get(&backend) {
            handle.drained.notify_one();
        }
    }
}
