//! In-process stand-in for a backend agent.
//!
//! Listens on a local TCP port and speaks the agent side of the bridge
//! protocol: answers the `hello` challenge, echoes heartbeats, acks
//! handoffs and records everything the proxy sends. Tests drive it to
//! misbehave on purpose (wrong secret, silence, tampering, replays).

use crate::auth::{ReplayGuard, SharedSecret, MESSAGE_VALIDITY};
use crate::bridge::{
    AckPayload, BridgeMessage, CommandPayload, EventPayload, ForwardFrame, HelloPayload,
    MessageKind, OutboundMessage, ReleasePayload, BRIDGE_PROTOCOL_VERSION,
};
use crate::codec::{Packet, PacketCodec};
use bifrost_event_system::{current_timestamp, SessionId};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::debug;

/// How the agent answers `handoff` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Accept,
    Reject,
    /// Never answer, so the proxy's handoff timeout fires
    Ignore,
}

/// How the agent answers the proxy's `hello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMode {
    Normal,
    /// Reply with a challenge that is not the proxy's
    WrongEcho,
    /// Reply with an unsupported bridge protocol version
    WrongVersion,
}

enum Outbound {
    Message(OutboundMessage),
    /// Sealed normally, then one payload byte flipped
    Tampered(OutboundMessage),
    /// Re-send the last test-originated packet verbatim
    Replay,
    Disconnect,
}

struct AgentState {
    secret: SharedSecret,
    received: Mutex<Vec<BridgeMessage>>,
    arrived: Notify,
    heartbeats: AtomicBool,
    ack_mode: Mutex<AckMode>,
    handshake_mode: Mutex<HandshakeMode>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    connections: AtomicUsize,
    authenticated: AtomicBool,
}

/// A scripted backend agent bound to `127.0.0.1`.
pub struct MockAgent {
    addr: SocketAddr,
    state: Arc<AgentState>,
    listener: JoinHandle<()>,
}

impl MockAgent {
    /// Binds an ephemeral port and starts accepting proxy connections.
    pub async fn start(secret: SharedSecret) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(AgentState {
            secret,
            received: Mutex::new(Vec::new()),
            arrived: Notify::new(),
            heartbeats: AtomicBool::new(true),
            ack_mode: Mutex::new(AckMode::Accept),
            handshake_mode: Mutex::new(HandshakeMode::Normal),
            outbound: Mutex::new(None),
            connections: AtomicUsize::new(0),
            authenticated: AtomicBool::new(false),
        });

        let accept_state = state.clone();
        let listener = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                debug!("Mock agent {} accepted proxy connection from {}", addr, peer);
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let state = accept_state.clone();
                tokio::spawn(async move {
                    serve(state.clone(), stream).await;
                    state.authenticated.store(false, Ordering::SeqCst);
                    state.arrived.notify_waiters();
                });
            }
        });

        Ok(Self { addr, state, listener })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn set_ack_mode(&self, mode: AckMode) {
        *self.state.ack_mode.lock() = mode;
    }

    pub fn set_handshake_mode(&self, mode: HandshakeMode) {
        *self.state.handshake_mode.lock() = mode;
    }

    /// Stops or resumes answering the proxy's heartbeats.
    pub fn set_heartbeats(&self, enabled: bool) {
        self.state.heartbeats.store(enabled, Ordering::SeqCst);
    }

    /// Number of TCP connections the proxy has opened so far.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.authenticated.load(Ordering::SeqCst)
    }

    /// Every verified message received from the proxy, in order.
    pub fn received(&self) -> Vec<BridgeMessage> {
        self.state.received.lock().clone()
    }

    pub fn received_of(&self, kind: MessageKind) -> Vec<BridgeMessage> {
        self.state
            .received
            .lock()
            .iter()
            .filter(|m| m.kind == kind)
            .cloned()
            .collect()
    }

    /// Waits until at least `count` messages of `kind` have arrived.
    pub async fn wait_for(&self, kind: MessageKind, count: usize, limit: Duration) -> bool {
        self.wait_until(limit, || self.received_of(kind).len() >= count).await
    }

    /// Waits until the handshake has completed.
    pub async fn wait_authenticated(&self, limit: Duration) -> bool {
        self.wait_until(limit, || self.is_authenticated()).await
    }

    async fn wait_until(&self, limit: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let notified = self.state.arrived.notified();
            if condition() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return condition();
            }
        }
    }

    fn push(&self, outbound: Outbound) -> bool {
        match self.state.outbound.lock().as_ref() {
            Some(sender) => sender.send(outbound).is_ok(),
            None => false,
        }
    }

    pub fn send(&self, message: OutboundMessage) -> bool {
        self.push(Outbound::Message(message))
    }

    pub fn send_event(&self, channel: &str, data: serde_json::Value) -> bool {
        let payload = EventPayload {
            channel: channel.to_string(),
            data,
        };
        match OutboundMessage::json(MessageKind::Event, 0, &payload) {
            Ok(message) => self.send(message),
            Err(_) => false,
        }
    }

    pub fn send_command(&self, correlation_id: u64, command_line: &str) -> bool {
        let payload = CommandPayload {
            command_line: command_line.to_string(),
        };
        match OutboundMessage::json(MessageKind::Command, correlation_id, &payload) {
            Ok(message) => self.send(message),
            Err(_) => false,
        }
    }

    pub fn send_forward(&self, session_id: SessionId, stream_id: u64, packet: Packet) -> bool {
        self.send(
            ForwardFrame {
                session_id,
                stream_id,
                packet,
            }
            .into_message(),
        )
    }

    /// Tells the proxy the backend is done with a player.
    pub fn send_release(&self, session_id: SessionId, reason: &str) -> bool {
        let payload = ReleasePayload {
            session_id,
            reason: reason.to_string(),
        };
        match OutboundMessage::json(MessageKind::Release, 0, &payload) {
            Ok(message) => self.send(message),
            Err(_) => false,
        }
    }

    /// Sends an `event` whose payload was altered after signing.
    pub fn send_tampered_event(&self, channel: &str) -> bool {
        let payload = EventPayload {
            channel: channel.to_string(),
            data: serde_json::Value::Null,
        };
        match OutboundMessage::json(MessageKind::Event, 0, &payload) {
            Ok(message) => self.push(Outbound::Tampered(message)),
            Err(_) => false,
        }
    }

    /// Re-sends the last message sent through [`send`](Self::send) byte for byte.
    pub fn replay_last(&self) -> bool {
        self.push(Outbound::Replay)
    }

    /// Closes the current proxy connection from the agent side.
    pub fn drop_connection(&self) -> bool {
        self.push(Outbound::Disconnect)
    }
}

impl Drop for MockAgent {
    fn drop(&mut self) {
        self.listener.abort();
        let _ = self.push(Outbound::Disconnect);
    }
}

struct AgentChannel {
    framed: Framed<TcpStream, PacketCodec>,
    next_sequence: u64,
    last_packet: Option<Packet>,
}

impl AgentChannel {
    fn seal(&mut self, message: OutboundMessage, secret: &SharedSecret) -> BridgeMessage {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        message.seal(sequence, current_timestamp(), secret)
    }

    async fn write(&mut self, packet: Packet) -> bool {
        self.framed.send(packet).await.is_ok()
    }
}

async fn serve(state: Arc<AgentState>, stream: TcpStream) {
    let mut channel = AgentChannel {
        framed: Framed::new(stream, PacketCodec::new()),
        next_sequence: 1,
        last_packet: None,
    };
    let mut inbound_guard = ReplayGuard::new(MESSAGE_VALIDITY);

    // Handshake: the proxy speaks first.
    let hello = match channel.framed.next().await {
        Some(Ok(packet)) => match BridgeMessage::from_packet(packet) {
            Ok(message) => message,
            Err(_) => return,
        },
        _ => return,
    };
    if hello.kind != MessageKind::Hello {
        return;
    }
    // A hello under the wrong secret is still answered, so the proxy sees
    // the mismatch in the reply's tag; the agent then hangs up.
    let trusted = hello.verify(&state.secret);
    let _ = inbound_guard.check(hello.sequence, hello.timestamp, current_timestamp());
    let Ok(proxy_hello) = hello.json::<HelloPayload>() else {
        return;
    };

    let mode = *state.handshake_mode.lock();
    let reply = HelloPayload {
        protocol_version: match mode {
            HandshakeMode::WrongVersion => BRIDGE_PROTOCOL_VERSION + 1,
            _ => BRIDGE_PROTOCOL_VERSION,
        },
        peer: "mock-agent".to_string(),
        challenge: "bW9jay1hZ2VudA==".to_string(),
        echo: Some(match mode {
            HandshakeMode::WrongEcho => "bm90LXRoZS1jaGFsbGVuZ2U=".to_string(),
            _ => proxy_hello.challenge.clone(),
        }),
    };
    let Ok(reply) = OutboundMessage::json(MessageKind::Hello, 0, &reply) else {
        return;
    };
    let reply = channel.seal(reply, &state.secret).to_packet();
    if !channel.write(reply).await || !trusted {
        debug!("Mock agent closing after handshake (proxy hello trusted: {})", trusted);
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    *state.outbound.lock() = Some(tx);
    state.authenticated.store(true, Ordering::SeqCst);
    state.arrived.notify_waiters();

    loop {
        tokio::select! {
            inbound = channel.framed.next() => {
                let Some(Ok(packet)) = inbound else {
                    break;
                };
                let Ok(message) = BridgeMessage::from_packet(packet) else {
                    continue;
                };
                if !message.verify(&state.secret)
                    || inbound_guard
                        .check(message.sequence, message.timestamp, current_timestamp())
                        .is_err()
                {
                    debug!("Mock agent dropped an unverifiable {:?}", message.kind);
                    continue;
                }

                let reply = match message.kind {
                    MessageKind::Heartbeat if state.heartbeats.load(Ordering::SeqCst) => {
                        Some(OutboundMessage::heartbeat())
                    }
                    MessageKind::Handoff => {
                        let accepted = match *state.ack_mode.lock() {
                            AckMode::Accept => Some(true),
                            AckMode::Reject => Some(false),
                            AckMode::Ignore => None,
                        };
                        accepted.and_then(|accepted| {
                            let ack = AckPayload {
                                accepted,
                                message: (!accepted).then(|| "mock agent rejected handoff".to_string()),
                            };
                            OutboundMessage::json(MessageKind::Ack, message.correlation_id, &ack).ok()
                        })
                    }
                    _ => None,
                };

                state.received.lock().push(message);
                state.arrived.notify_waiters();

                if let Some(reply) = reply {
                    let packet = channel.seal(reply, &state.secret).to_packet();
                    if !channel.write(packet).await {
                        break;
                    }
                }
            }

            outbound = rx.recv() => {
                let packet = match outbound {
                    None | Some(Outbound::Disconnect) => break,
                    Some(Outbound::Message(message)) => {
                        let packet = channel.seal(message, &state.secret).to_packet();
                        channel.last_packet = Some(packet.clone());
                        packet
                    }
                    Some(Outbound::Tampered(message)) => {
                        let mut sealed = channel.seal(message, &state.secret);
                        let mut payload = sealed.payload.to_vec();
                        if let Some(first) = payload.first_mut() {
                            *first ^= 0xFF;
                        }
                        sealed.payload = payload.into();
                        sealed.to_packet()
                    }
                    Some(Outbound::Replay) => match channel.last_packet.clone() {
                        Some(packet) => packet,
                        None => continue,
                    },
                };
                if !channel.write(packet).await {
                    break;
                }
            }
        }
    }

    state.outbound.lock().take();
    debug!("Mock agent connection closed");
}
