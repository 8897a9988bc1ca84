//! One bridge channel: handshake and the authenticated message loop.
//!
//! A channel task owns its TCP stream exclusively. Everyone else talks to
//! it through its outbound queue, so messages leave in the order they were
//! queued. Sequence numbers and tags are assigned here, at write time.

use super::message::{BridgeMessage, HelloPayload, MessageKind, OutboundMessage, BRIDGE_PROTOCOL_VERSION};
use super::BridgeEvent;
use crate::auth::{self, ReplayGuard, SharedSecret, MESSAGE_VALIDITY};
use crate::codec::{Packet, PacketCodec};
use crate::error::{ProxyError, Result};
use crate::registry::BackendRegistry;
use base64::Engine;
use bifrost_event_system::{
    current_timestamp, BackendId, ChannelState, Dispatcher, ProxyEvent, ViolationKind,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Timing and sizing knobs for bridge channels.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Identifier the proxy presents in its `hello`
    pub proxy_id: String,
    pub heartbeat_interval: Duration,
    /// Consecutive silent heartbeat intervals before the backend is drained
    pub heartbeat_miss_threshold: u32,
    pub handshake_timeout: Duration,
    pub reconnect_interval: Duration,
    /// Capacity of each channel's outbound queue
    pub queue_capacity: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            proxy_id: "bifrost".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_miss_threshold: 3,
            handshake_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(5),
            queue_capacity: 1024,
        }
    }
}

pub(crate) type BridgeFramed = Framed<TcpStream, PacketCodec>;

/// Everything a channel task needs besides its socket.
#[derive(Clone)]
pub(crate) struct ChannelContext {
    pub backend: BackendId,
    pub name: String,
    pub secret: SharedSecret,
    pub registry: Arc<BackendRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub events: mpsc::UnboundedSender<BridgeEvent>,
    pub settings: BridgeSettings,
}

/// Why a channel's message loop returned.
#[derive(Debug)]
pub(crate) enum ChannelExit {
    Cancelled,
    /// Draining finished: no sessions remain on the backend
    Drained,
    TransportLost(String),
}

/// Sequencing state carried from the handshake into the message loop.
pub(crate) struct SessionKeys {
    next_sequence: u64,
    inbound: ReplayGuard,
}

impl SessionKeys {
    fn seal(&mut self, message: OutboundMessage, secret: &SharedSecret) -> Packet {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        message.seal(sequence, current_timestamp(), secret).to_packet()
    }
}

impl ChannelContext {
    fn auth_failure(&self, reason: impl Into<String>) -> ProxyError {
        ProxyError::HandshakeAuthFailure {
            backend: self.backend,
            reason: reason.into(),
        }
    }

    pub(crate) fn publish_violation(&self, kind: ViolationKind, detail: String) {
        self.dispatcher.publish(&ProxyEvent::SecurityViolation {
            kind,
            peer: self.name.clone(),
            detail,
        });
    }

    /// Runs the proxy side of the secret handshake.
    ///
    /// The proxy sends a signed `hello` carrying a fresh random challenge.
    /// The agent must answer with a `hello` signed under the same secret that
    /// echoes the challenge. Any deviation is a `HandshakeAuthFailure`.
    pub(crate) async fn handshake(&self, framed: &mut BridgeFramed) -> Result<SessionKeys> {
        let engine = base64::engine::general_purpose::STANDARD;
        let challenge = engine.encode(auth::random_challenge(16));
        let hello = HelloPayload {
            protocol_version: BRIDGE_PROTOCOL_VERSION,
            peer: self.settings.proxy_id.clone(),
            challenge: challenge.clone(),
            echo: None,
        };

        let mut keys = SessionKeys {
            next_sequence: 1,
            inbound: ReplayGuard::new(MESSAGE_VALIDITY),
        };
        let packet = keys.seal(OutboundMessage::json(MessageKind::Hello, 0, &hello)?, &self.secret);
        framed.send(packet).await?;

        let reply = match timeout(self.settings.handshake_timeout, framed.next()).await {
            Err(_) => return Err(ProxyError::Network("handshake timed out".to_string())),
            Ok(None) => {
                return Err(ProxyError::Network(
                    "agent closed the connection during handshake".to_string(),
                ))
            }
            Ok(Some(Err(e))) => return Err(self.auth_failure(format!("unreadable reply: {}", e))),
            Ok(Some(Ok(packet))) => packet,
        };

        let message = BridgeMessage::from_packet(reply)
            .map_err(|e| self.auth_failure(format!("malformed reply: {}", e)))?;
        if message.kind != MessageKind::Hello {
            return Err(self.auth_failure(format!("expected hello, got {:?}", message.kind)));
        }
        if !message.verify(&self.secret) {
            return Err(self.auth_failure("reply tag does not verify"));
        }
        keys.inbound
            .check(message.sequence, message.timestamp, current_timestamp())
            .map_err(|e| self.auth_failure(e.to_string()))?;

        let payload: HelloPayload = message
            .json()
            .map_err(|e| self.auth_failure(format!("bad hello payload: {}", e)))?;
        if payload.echo.as_deref() != Some(challenge.as_str()) {
            return Err(self.auth_failure("challenge was not echoed"));
        }
        if payload.protocol_version != BRIDGE_PROTOCOL_VERSION {
            return Err(self.auth_failure(format!(
                "agent speaks bridge protocol {}, proxy speaks {}",
                payload.protocol_version, BRIDGE_PROTOCOL_VERSION
            )));
        }

        info!("🤝 Bridge handshake with '{}' ({}) verified", self.name, payload.peer);
        Ok(keys)
    }

    /// Authenticated message loop.
    ///
    /// Returns when cancelled, when the transport fails, or when the backend
    /// is Draining and its last session has gone.
    pub(crate) async fn run(
        &self,
        framed: BridgeFramed,
        mut keys: SessionKeys,
        mut outbound: mpsc::Receiver<OutboundMessage>,
        drained: Arc<Notify>,
        cancel: CancellationToken,
    ) -> ChannelExit {
        let (mut sink, mut stream): (SplitSink<BridgeFramed, Packet>, SplitStream<BridgeFramed>) =
            framed.split();

        let mut ticker = interval(self.settings.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        let mut missed: u32 = 0;
        let mut heard_since_tick = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return ChannelExit::Cancelled,

                _ = drained.notified() => {
                    if self.is_drained() {
                        return ChannelExit::Drained;
                    }
                }

                queued = outbound.recv() => {
                    let Some(message) = queued else {
                        return ChannelExit::Cancelled;
                    };
                    let packet = keys.seal(message, &self.secret);
                    if let Err(e) = sink.send(packet).await {
                        return ChannelExit::TransportLost(format!("write failed: {}", e));
                    }
                }

                inbound = stream.next() => {
                    match inbound {
                        None => return ChannelExit::TransportLost("agent closed the connection".to_string()),
                        Some(Err(e)) => return ChannelExit::TransportLost(format!("read failed: {}", e)),
                        Some(Ok(packet)) => {
                            if self.accept_inbound(packet, &mut keys.inbound) {
                                heard_since_tick = true;
                            }
                        }
                    }
                }

                _ = ticker.tick() => {
                    match self.registry.state(self.backend) {
                        Some(ChannelState::Draining) => {
                            if self.is_drained() {
                                return ChannelExit::Drained;
                            }
                        }
                        Some(ChannelState::Authenticated) => {
                            if heard_since_tick {
                                missed = 0;
                            } else {
                                missed += 1;
                                warn!(
                                    "⚠️ Backend '{}' missed heartbeat {}/{}",
                                    self.name, missed, self.settings.heartbeat_miss_threshold
                                );
                                if missed >= self.settings.heartbeat_miss_threshold {
                                    self.begin_draining("heartbeat timeout");
                                }
                            }
                        }
                        _ => return ChannelExit::Cancelled,
                    }
                    heard_since_tick = false;

                    let packet = keys.seal(OutboundMessage::heartbeat(), &self.secret);
                    if let Err(e) = sink.send(packet).await {
                        return ChannelExit::TransportLost(format!("heartbeat write failed: {}", e));
                    }
                }
            }
        }
    }

    fn is_drained(&self) -> bool {
        self.registry.state(self.backend) == Some(ChannelState::Draining)
            && self.registry.session_count(self.backend) == Some(0)
    }

    /// Moves an Authenticated backend to Draining and tells the session side.
    pub(crate) fn begin_draining(&self, reason: &str) {
        match self.registry.transition(self.backend, ChannelState::Draining) {
            Ok(ChannelState::Authenticated) => {
                warn!("🚰 Draining backend '{}': {}", self.name, reason);
                let _ = self.events.send(BridgeEvent::Draining {
                    backend: self.backend,
                });
            }
            Ok(_) => {}
            Err(e) => debug!("Backend '{}' not drained: {}", self.name, e),
        }
    }

    /// Verifies one inbound packet and routes it. Returns whether it counted
    /// as a sign of life.
    fn accept_inbound(&self, packet: Packet, guard: &mut ReplayGuard) -> bool {
        let message = match BridgeMessage::from_packet(packet) {
            Ok(message) => message,
            Err(e) => {
                warn!("⚠️ Dropping malformed bridge message from '{}': {}", self.name, e);
                self.publish_violation(ViolationKind::TamperedMessage, e.to_string());
                return false;
            }
        };

        if !message.verify(&self.secret) {
            error!(
                "❌ Dropping {:?} from '{}' with invalid authentication tag",
                message.kind, self.name
            );
            self.publish_violation(
                ViolationKind::TamperedMessage,
                format!("{:?} seq {} failed tag verification", message.kind, message.sequence),
            );
            return false;
        }

        if let Err(e) = guard.check(message.sequence, message.timestamp, current_timestamp()) {
            error!("❌ Dropping replayed message from '{}': {}", self.name, e);
            self.publish_violation(ViolationKind::ReplayedMessage, e.to_string());
            return false;
        }

        match message.kind {
            MessageKind::Heartbeat => self.registry.record_heartbeat(self.backend),
            MessageKind::Hello => debug!("Ignoring late hello from '{}'", self.name),
            _ => {
                let _ = self.events.send(BridgeEvent::Message {
                    backend: self.backend,
                    message,
                });
            }
        }
        true
    }
}
