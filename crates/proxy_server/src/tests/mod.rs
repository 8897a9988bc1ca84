//! Cross-module scenarios.
//!
//! `sessions` drives the session manager against a recording transport,
//! `bridge` runs real channels against [`MockAgent`](crate::testing::MockAgent)s
//! and `quic` goes through a full proxy with a QUIC client.

mod sessions;

use crate::auth::SharedSecret;
use crate::connection::ConnectionCommand;
use crate::registry::BackendRegistry;
use crate::session::{NewSession, SessionManager, SessionSettings};
use crate::testing::RecordingTransport;
use bifrost_event_system::{
    BackendId, ChannelState, ConnectionId, Dispatcher, EventKind, PlayerIdentity, ProxyEvent,
    SessionSnapshot,
};
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub(crate) fn secret(seed: u8) -> SharedSecret {
    SharedSecret::new(&[seed; 32]).expect("valid secret")
}

pub(crate) fn player(name: &str) -> PlayerIdentity {
    PlayerIdentity {
        uuid: Uuid::new_v4(),
        username: name.to_string(),
    }
}

/// Walks a registered backend through the handshake states.
pub(crate) fn authenticate(registry: &BackendRegistry, id: BackendId) {
    registry.transition(id, ChannelState::Handshaking).expect("handshaking");
    registry.transition(id, ChannelState::Authenticated).expect("authenticated");
}

/// Collects every event of the given kinds.
pub(crate) fn record(dispatcher: &Dispatcher, kinds: &[EventKind]) -> Arc<Mutex<Vec<ProxyEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    for kind in kinds {
        let sink = events.clone();
        dispatcher.subscribe(*kind, "test:recorder", move |event| {
            sink.lock().push(event.clone());
            Ok(())
        });
    }
    events
}

/// Polls `condition` every 10ms until it holds or `limit` passes.
pub(crate) async fn eventually<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Awaits `future` or panics after `limit`.
pub(crate) async fn within<T>(limit: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(limit, future).await.expect("timed out")
}

/// A connected client as the session manager sees it.
pub(crate) struct TestClient {
    pub session: SessionSnapshot,
    pub commands: mpsc::Receiver<ConnectionCommand>,
    // Keeps the session's weak link upgradable.
    _link: mpsc::Sender<ConnectionCommand>,
}

/// Session manager wired to a [`RecordingTransport`] instead of sockets.
pub(crate) struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<BackendRegistry>,
    pub transport: Arc<RecordingTransport>,
    pub sessions: Arc<SessionManager>,
    next_connection: AtomicU64,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(SessionSettings::default())
    }

    pub fn with_settings(settings: SessionSettings) -> Self {
        let dispatcher = Arc::new(Dispatcher::new());
        let registry = Arc::new(BackendRegistry::new(dispatcher.clone()));
        let transport = Arc::new(RecordingTransport::new());
        let sessions = Arc::new(SessionManager::new(
            registry.clone(),
            transport.clone(),
            dispatcher.clone(),
            settings,
        ));
        Self {
            dispatcher,
            registry,
            transport,
            sessions,
            next_connection: AtomicU64::new(1),
        }
    }

    /// Registers an Authenticated backend.
    pub fn backend(&self, name: &str) -> BackendId {
        let id = self.registered(name);
        authenticate(&self.registry, id);
        id
    }

    /// Registers a backend left Disconnected.
    pub fn registered(&self, name: &str) -> BackendId {
        let address: SocketAddr = "127.0.0.1:1".parse().expect("address");
        self.registry
            .register(name, address, secret(9), false)
            .expect("register backend")
    }

    pub fn count(&self, id: BackendId) -> usize {
        self.registry.session_count(id).unwrap_or(0)
    }

    pub async fn try_connect(&self, name: &str) -> crate::Result<TestClient> {
        let (link, commands) = mpsc::channel(16);
        let session = self
            .sessions
            .create_session(NewSession {
                connection_id: ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed)),
                player: player(name),
                remote_addr: "127.0.0.1:50000".parse().expect("address"),
                link: link.downgrade(),
            })
            .await?;
        Ok(TestClient {
            session,
            commands,
            _link: link,
        })
    }

    pub async fn connect(&self, name: &str) -> TestClient {
        self.try_connect(name).await.expect("session created")
    }
}
