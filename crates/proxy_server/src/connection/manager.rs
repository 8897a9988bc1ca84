//! QUIC connection lifecycle.
//!
//! One task per accepted connection owns its [`ClientConnection`]. Stream
//! readers are small tasks that post raw chunks back to the connection task,
//! so all decoding and forwarding for a connection happens in one place.

use super::client::{ClientConnection, CloseReason, ConnectionCommand};
use super::handshake::{ClientHandshake, HandshakeAccepted, HandshakeRejected};
use crate::codec::{Packet, PacketCodec};
use crate::error::ProxyError;
use crate::registry::BackendRegistry;
use crate::session::{NewSession, SessionManager};
use bifrost_event_system::{ConnectionId, Dispatcher, ProxyEvent, SessionId, ViolationKind};
use bytes::Bytes;
use dashmap::DashMap;
use quinn::{Connection, Endpoint, Incoming, RecvStream, SendStream, StreamId, VarInt};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 64 * 1024;
const STREAM_INPUT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 256;
const REJECT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);
/// Peers with violation records kept before old ones are dropped early
const MAX_TRACKED_PEERS: usize = 4096;
const VIOLATION_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Limits and timeouts for client connections.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Client protocol version the proxy accepts
    pub protocol_version: u32,
    pub max_connections: usize,
    /// Time without traffic in either direction before a connection is
    /// closed; also bounds a single write to a client that stopped reading
    pub idle_timeout: Duration,
    /// Time allowed between accepting a connection and its handshake packet
    pub handshake_timeout: Duration,
    /// Protocol violations from one IP before a `SecurityViolation` is published
    pub violation_threshold: u32,
    /// Violations older than this are forgotten
    pub violation_window: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            max_connections: 10_000,
            idle_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            violation_threshold: 5,
            violation_window: Duration::from_secs(600),
        }
    }
}

enum StreamInput {
    Data { stream_id: u64, bytes: Bytes },
    Finished { stream_id: u64 },
    Failed { stream_id: u64, error: String },
}

/// Violations counted against one IP since `first_seen`.
#[derive(Debug, Clone, Copy)]
struct ViolationRecord {
    count: u32,
    first_seen: Instant,
}

/// Releases a connection slot when the connection task ends.
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Accepts QUIC connections and drives each one to completion.
pub struct ConnectionManager {
    sessions: Arc<SessionManager>,
    registry: Arc<BackendRegistry>,
    dispatcher: Arc<Dispatcher>,
    codec: PacketCodec,
    settings: ConnectionSettings,
    next_id: AtomicU64,
    slots: Arc<AtomicUsize>,
    active: DashMap<ConnectionId, mpsc::Sender<ConnectionCommand>>,
    violations: DashMap<IpAddr, ViolationRecord>,
}

impl ConnectionManager {
    pub fn new(
        sessions: Arc<SessionManager>,
        registry: Arc<BackendRegistry>,
        dispatcher: Arc<Dispatcher>,
        codec: PacketCodec,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            sessions,
            registry,
            dispatcher,
            codec,
            settings,
            next_id: AtomicU64::new(1),
            slots: Arc::new(AtomicUsize::new(0)),
            active: DashMap::new(),
            violations: DashMap::new(),
        }
    }

    /// Accepts connections until the endpoint is closed.
    pub async fn run(self: &Arc<Self>, endpoint: &Endpoint) {
        let mut prune = interval(VIOLATION_PRUNE_INTERVAL);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                incoming = endpoint.accept() => match incoming {
                    Some(incoming) => self.accept_connection(incoming),
                    None => break,
                },
                _ = prune.tick() => {
                    let pruned = self.prune_violations();
                    if pruned > 0 {
                        debug!("Forgot violation records of {} peer(s)", pruned);
                    }
                }
            }
        }
        debug!("QUIC endpoint closed, accept loop finished");
    }

    /// Takes one incoming connection, refusing it when the proxy is full.
    pub fn accept_connection(self: &Arc<Self>, incoming: Incoming) {
        let remote = incoming.remote_address();
        let taken = self.slots.fetch_add(1, Ordering::AcqRel);
        if taken >= self.settings.max_connections {
            self.slots.fetch_sub(1, Ordering::AcqRel);
            warn!(
                "🚫 Refusing connection from {}: limit of {} connections reached",
                remote, self.settings.max_connections
            );
            incoming.refuse();
            return;
        }
        let slot = ConnectionSlot(self.slots.clone());

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let _slot = slot;
            match incoming.await {
                Ok(connection) => {
                    let id = ConnectionId(manager.next_id.fetch_add(1, Ordering::Relaxed));
                    debug!("QUIC connection {} established with {}", id, remote);
                    manager.drive(id, connection).await;
                }
                Err(e) => debug!("QUIC handshake with {} failed: {}", remote, e),
            }
        });
    }

    /// Number of connections currently holding a slot.
    pub fn connection_count(&self) -> usize {
        self.slots.load(Ordering::Acquire)
    }

    /// Asks every live connection to close.
    pub fn close_all(&self, reason: CloseReason) {
        for entry in self.active.iter() {
            let _ = entry.value().try_send(ConnectionCommand::Close { reason });
        }
    }

    async fn drive(&self, id: ConnectionId, connection: Connection) {
        let remote = connection.remote_address();
        let mut client = ClientConnection::new(id, remote, self.codec.clone());
        let (commands_tx, mut commands) = mpsc::channel(COMMAND_CAPACITY);
        let (input_tx, mut inputs) = mpsc::channel(STREAM_INPUT_CAPACITY);
        let mut senders: HashMap<u64, SendStream> = HashMap::new();

        let session_id = match self
            .establish(&connection, &mut client, &commands_tx, &input_tx, &mut senders)
            .await
        {
            Ok(session_id) => session_id,
            Err(reason) => {
                self.close(&connection, &client, reason);
                return;
            }
        };
        self.active.insert(id, commands_tx.clone());

        let idle = sleep(self.settings.idle_timeout);
        tokio::pin!(idle);

        let reason = loop {
            tokio::select! {
                accepted = connection.accept_bi() => match accepted {
                    Ok((send, recv)) => {
                        senders.insert(stream_key(send.id()), send);
                        spawn_reader(recv, input_tx.clone());
                    }
                    Err(e) => {
                        debug!("Connection {} ended: {}", id, e);
                        break None;
                    }
                },

                accepted = connection.accept_uni() => match accepted {
                    Ok(recv) => spawn_reader(recv, input_tx.clone()),
                    Err(e) => {
                        debug!("Connection {} ended: {}", id, e);
                        break None;
                    }
                },

                Some(input) = inputs.recv() => {
                    idle.as_mut().reset(Instant::now() + self.settings.idle_timeout);
                    if let Err(reason) = self.on_stream_data(&mut client, session_id, input).await {
                        break Some(reason);
                    }
                }

                Some(command) = commands.recv() => match command {
                    ConnectionCommand::Deliver { stream_id, packet } => {
                        let delivery = self.deliver(&connection, &mut senders, stream_id, &packet);
                        if timeout(self.settings.idle_timeout, delivery).await.is_err() {
                            warn!("⚠️ Connection {} ({}) stopped reading, closing", id, remote);
                            break Some(CloseReason::ResourceExhausted);
                        }
                        idle.as_mut().reset(Instant::now() + self.settings.idle_timeout);
                    }
                    ConnectionCommand::Close { reason } => break Some(reason),
                },

                _ = &mut idle => break Some(CloseReason::IdleTimeout),
            }
        };

        if let Some(reason) = reason {
            self.close(&connection, &client, reason);
        }
        let message = reason.map(|r| r.message()).unwrap_or("client disconnected");
        self.on_connection_closed(id, message).await;
    }

    /// Reads the handshake, opens the session and answers the client.
    async fn establish(
        &self,
        connection: &Connection,
        client: &mut ClientConnection,
        commands_tx: &mpsc::Sender<ConnectionCommand>,
        input_tx: &mpsc::Sender<StreamInput>,
        senders: &mut HashMap<u64, SendStream>,
    ) -> Result<SessionId, CloseReason> {
        let (mut send, mut recv) = match timeout(self.settings.handshake_timeout, connection.accept_bi()).await {
            Ok(Ok(streams)) => streams,
            Ok(Err(e)) => {
                debug!("Connection {} closed before its handshake: {}", client.id, e);
                return Err(CloseReason::Normal);
            }
            Err(_) => return Err(CloseReason::IdleTimeout),
        };
        let stream_id = stream_key(recv.id());

        let (first, rest) = match timeout(
            self.settings.handshake_timeout,
            read_first_packet(client, stream_id, &mut recv),
        )
        .await
        {
            Ok(Ok(packets)) => packets,
            Ok(Err(reason)) => return Err(self.violation_or(client, reason, "unreadable handshake")),
            Err(_) => return Err(CloseReason::IdleTimeout),
        };

        let handshake = match ClientHandshake::from_packet(&first) {
            Ok(handshake) => handshake,
            Err(e) => {
                return Err(self.violation_or(client, CloseReason::ProtocolViolation, &e.to_string()))
            }
        };
        client.protocol_version = Some(handshake.protocol_version);

        if handshake.protocol_version != self.settings.protocol_version {
            let error = ProxyError::UnsupportedVersion {
                client: handshake.protocol_version,
                supported: self.settings.protocol_version,
            };
            info!("🚫 Rejecting {} from {}: {}", handshake.username, client.remote_addr, error);
            self.reject(&mut send, CloseReason::UnsupportedVersion, &error.to_string()).await;
            return Err(CloseReason::UnsupportedVersion);
        }

        let player = handshake.identity();
        let session = match self
            .sessions
            .create_session(NewSession {
                connection_id: client.id,
                player: player.clone(),
                remote_addr: client.remote_addr,
                link: commands_tx.downgrade(),
            })
            .await
        {
            Ok(session) => session,
            Err(e) => {
                let reason = match e {
                    ProxyError::ConnectDenied(_) => CloseReason::ConnectDenied,
                    ProxyError::ProtocolViolation(_) => CloseReason::ProtocolViolation,
                    _ => CloseReason::NoBackendAvailable,
                };
                warn!("⚠️ Refusing {} from {}: {}", player.username, client.remote_addr, e);
                self.reject(&mut send, reason, &e.to_string()).await;
                return Err(reason);
            }
        };
        client.session = Some(session.session_id);

        let accepted = HandshakeAccepted {
            session_id: session.session_id,
            backend: self.registry.name(session.backend).unwrap_or_default(),
            backend_id: session.backend,
        };
        let written = match accepted.to_packet() {
            Ok(packet) => write_packet(&self.codec, &mut send, &packet).await,
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = written {
            warn!("⚠️ Could not confirm handshake to {}: {}", client.remote_addr, e);
            self.sessions.destroy_session(session.session_id, "handshake reply failed").await;
            return Err(CloseReason::Normal);
        }

        debug!(
            "{} connected from {} as session {}",
            player.username, client.remote_addr, session.session_id
        );

        senders.insert(stream_id, send);
        spawn_reader(recv, input_tx.clone());
        for packet in rest {
            self.forward(session.session_id, stream_id, packet).await;
        }
        Ok(session.session_id)
    }

    /// Handles one chunk (or the end) of a client stream.
    async fn on_stream_data(
        &self,
        client: &mut ClientConnection,
        session_id: SessionId,
        input: StreamInput,
    ) -> Result<(), CloseReason> {
        match input {
            StreamInput::Data { stream_id, bytes } => {
                let packets = client.on_stream_data(stream_id, &bytes).map_err(|e| {
                    self.violation_or(client, CloseReason::ProtocolViolation, &e.to_string())
                })?;
                for packet in packets {
                    self.forward(session_id, stream_id, packet).await;
                }
            }
            StreamInput::Finished { stream_id } => {
                client.on_stream_finished(stream_id).map_err(|e| {
                    self.violation_or(client, CloseReason::ProtocolViolation, &e.to_string())
                })?;
            }
            StreamInput::Failed { stream_id, error } => {
                debug!("Stream {} on connection {} failed: {}", stream_id, client.id, error);
                // The stream is gone; a partial frame on it no longer matters.
                let _ = client.on_stream_finished(stream_id);
            }
        }
        Ok(())
    }

    async fn forward(&self, session_id: SessionId, stream_id: u64, packet: Packet) {
        if let Err(e) = self.sessions.forward_to_backend(session_id, stream_id, packet).await {
            debug!("Dropped packet for session {}: {}", session_id, e);
        }
    }

    async fn deliver(
        &self,
        connection: &Connection,
        senders: &mut HashMap<u64, SendStream>,
        stream_id: u64,
        packet: &Packet,
    ) {
        if !senders.contains_key(&stream_id) {
            match connection.open_uni().await {
                Ok(send) => {
                    senders.insert(stream_id, send);
                }
                Err(e) => {
                    debug!("Could not open stream for backend packet: {}", e);
                    return;
                }
            }
        }
        let Some(send) = senders.get_mut(&stream_id) else {
            return;
        };
        if let Err(e) = write_packet(&self.codec, send, packet).await {
            debug!("Write to stream {} failed: {}", stream_id, e);
            senders.remove(&stream_id);
        }
    }

    async fn reject(&self, send: &mut SendStream, reason: CloseReason, detail: &str) {
        let rejected = HandshakeRejected::new(reason, detail, self.settings.protocol_version);
        let written = match rejected.to_packet() {
            Ok(packet) => write_packet(&self.codec, send, &packet).await,
            Err(e) => Err(e.to_string()),
        };
        if written.is_ok() && send.finish().is_ok() {
            // Give the client a moment to read the rejection before the close.
            let _ = timeout(REJECT_FLUSH_TIMEOUT, send.stopped()).await;
        }
    }

    fn close(&self, connection: &Connection, client: &ClientConnection, reason: CloseReason) {
        debug!("Closing connection {} ({}): {}", client.id, client.remote_addr, reason.message());
        connection.close(VarInt::from_u32(reason.code()), reason.message().as_bytes());
    }

    /// Counts a protocol violation against the peer's IP and returns `reason`.
    fn violation_or(&self, client: &ClientConnection, reason: CloseReason, detail: &str) -> CloseReason {
        if reason != CloseReason::ProtocolViolation {
            return reason;
        }
        let ip = client.remote_addr.ip();
        let count = self.record_violation(ip);
        warn!("⚠️ Protocol violation from {} ({}): {}", client.remote_addr, count, detail);
        if count >= self.settings.violation_threshold {
            error!("❌ {} has committed {} protocol violations", ip, count);
            self.dispatcher.publish(&ProxyEvent::SecurityViolation {
                kind: ViolationKind::RepeatedProtocolViolation,
                peer: ip.to_string(),
                detail: format!("{} violations, latest: {}", count, detail),
            });
        }
        reason
    }

    /// Cleans up after a connection: destroys its session if it had one.
    pub async fn on_connection_closed(&self, id: ConnectionId, reason: &str) {
        self.active.remove(&id);
        self.sessions.destroy_for_connection(id, reason).await;
    }

    /// Adds a violation to the IP's record and returns the count inside
    /// the current window.
    fn record_violation(&self, ip: IpAddr) -> u32 {
        let window = self.settings.violation_window;
        let count = {
            let mut record = self.violations.entry(ip).or_insert(ViolationRecord {
                count: 0,
                first_seen: Instant::now(),
            });
            if record.first_seen.elapsed() >= window {
                *record = ViolationRecord {
                    count: 0,
                    first_seen: Instant::now(),
                };
            }
            record.count += 1;
            record.count
        };
        if self.violations.len() > MAX_TRACKED_PEERS {
            self.prune_violations();
        }
        count
    }

    /// Drops expired violation records, then the oldest ones while more than
    /// `MAX_TRACKED_PEERS` remain. Returns how many were dropped.
    pub fn prune_violations(&self) -> usize {
        let before = self.violations.len();
        let window = self.settings.violation_window;
        self.violations
            .retain(|_, record| record.first_seen.elapsed() < window);

        let excess = self.violations.len().saturating_sub(MAX_TRACKED_PEERS);
        if excess > 0 {
            let mut oldest: Vec<(Instant, IpAddr)> = self
                .violations
                .iter()
                .map(|entry| (entry.value().first_seen, *entry.key()))
                .collect();
            oldest.sort_unstable();
            for (_, ip) in oldest.into_iter().take(excess) {
                self.violations.remove(&ip);
            }
        }
        before.saturating_sub(self.violations.len())
    }

    /// Protocol violations recorded for an IP within the window.
    pub fn violations_from(&self, ip: IpAddr) -> u32 {
        self.violations
            .get(&ip)
            .filter(|record| record.first_seen.elapsed() < self.settings.violation_window)
            .map(|record| record.count)
            .unwrap_or(0)
    }

    /// Number of IPs with a violation record.
    pub fn tracked_peers(&self) -> usize {
        self.violations.len()
    }
}

async fn read_first_packet(
    client: &mut ClientConnection,
    stream_id: u64,
    recv: &mut RecvStream,
) -> Result<(Packet, Vec<Packet>), CloseReason> {
    loop {
        match recv.read_chunk(READ_CHUNK, true).await {
            Ok(Some(chunk)) => {
                let mut packets = client
                    .on_stream_data(stream_id, &chunk.bytes)
                    .map_err(|_| CloseReason::ProtocolViolation)?;
                if !packets.is_empty() {
                    let first = packets.remove(0);
                    return Ok((first, packets));
                }
            }
            Ok(None) => return Err(CloseReason::ProtocolViolation),
            Err(_) => return Err(CloseReason::Normal),
        }
    }
}

fn stream_key(id: StreamId) -> u64 {
    VarInt::from(id).into_inner()
}

async fn write_packet(codec: &PacketCodec, send: &mut SendStream, packet: &Packet) -> Result<(), String> {
    let frame = codec.encode(packet).map_err(|e| e.to_string())?;
    send.write_all(&frame).await.map_err(|e| e.to_string())
}

fn spawn_reader(mut recv: RecvStream, inputs: mpsc::Sender<StreamInput>) {
    tokio::spawn(async move {
        let stream_id = stream_key(recv.id());
        loop {
            let input = match recv.read_chunk(READ_CHUNK, true).await {
                Ok(Some(chunk)) => StreamInput::Data {
                    stream_id,
                    bytes: chunk.bytes,
                },
                Ok(None) => StreamInput::Finished { stream_id },
                Err(e) => StreamInput::Failed {
                    stream_id,
                    error: e.to_string(),
                },
            };
            let last = !matches!(input, StreamInput::Data { .. });
            if inputs.send(input).await.is_err() || last {
                return;
            }
        }
    });
}
