//! Core proxy server implementation.
//!
//! `ProxyServer` wires the components together: dispatcher, backend
//! registry, bridge channels, session manager and the QUIC connection
//! manager. It owns no protocol logic of its own.

use super::commands::register_builtin_commands;
use crate::auth::SharedSecret;
use crate::bridge::{BridgeEvent, BridgeManager, BridgeTransport};
use crate::config::ProxyConfig;
use crate::connection::{CloseReason, ConnectionManager};
use crate::error::{ProxyError, Result};
use crate::registry::{BackendRegistry, DeregisterOutcome};
use crate::session::SessionManager;
use crate::tls::TlsIdentity;
use bifrost_event_system::{BackendId, Dispatcher, EventKind, ProxyEvent};
use parking_lot::Mutex;
use quinn::{Endpoint, VarInt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

const ENDPOINT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The proxy server.
///
/// # Lifecycle
///
/// 1. [`ProxyServer::new`] builds every component and registers the
///    configured backends. Plugins can subscribe to the dispatcher now.
/// 2. [`ProxyServer::start`] dials the backends, binds the QUIC endpoint and
///    serves until [`ProxyServer::shutdown`] is called.
pub struct ProxyServer {
    config: ProxyConfig,
    tls: TlsIdentity,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<BackendRegistry>,
    bridge: Arc<BridgeManager>,
    sessions: Arc<SessionManager>,
    connections: Arc<ConnectionManager>,
    bridge_events: Mutex<Option<mpsc::UnboundedReceiver<BridgeEvent>>>,
    shutdown_sender: broadcast::Sender<()>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ProxyServer {
    /// Creates a proxy server from a validated configuration.
    ///
    /// # Arguments
    ///
    /// * `config` - Runtime settings and the backends to register
    /// * `tls` - Certificate chain and key for the QUIC endpoint
    ///
    /// # Returns
    ///
    /// The server, ready to start, or `ProxyError::Config` if the
    /// configuration is invalid.
    pub fn new(config: ProxyConfig, tls: TlsIdentity) -> Result<Self> {
        config.validate()?;

        let dispatcher = Arc::new(Dispatcher::new());
        let registry = Arc::new(BackendRegistry::new(dispatcher.clone()));
        for backend in &config.backends {
            registry.register(
                &backend.name,
                backend.address,
                backend.secret.clone(),
                backend.default_server,
            )?;
        }

        let codec = config.codec();
        let (bridge, bridge_events) = BridgeManager::new(
            registry.clone(),
            dispatcher.clone(),
            config.bridge_settings(),
            codec.clone(),
        );
        let transport: Arc<dyn BridgeTransport> = bridge.clone();
        let sessions = Arc::new(SessionManager::new(
            registry.clone(),
            transport,
            dispatcher.clone(),
            config.session_settings(),
        ));
        let connections = Arc::new(ConnectionManager::new(
            sessions.clone(),
            registry.clone(),
            dispatcher.clone(),
            codec,
            config.connection_settings(),
        ));

        register_builtin_commands(&dispatcher, &registry, &sessions, &bridge)?;

        let (shutdown_sender, _) = broadcast::channel(1);
        Ok(Self {
            config,
            tls,
            dispatcher,
            registry,
            bridge,
            sessions,
            connections,
            bridge_events: Mutex::new(Some(bridge_events)),
            shutdown_sender,
            local_addr: Mutex::new(None),
        })
    }

    /// Starts the proxy and serves until shutdown is requested.
    ///
    /// # Startup Sequence
    ///
    /// 1. Register core logging handlers on the dispatcher
    /// 2. Start the router that feeds bridge traffic to the session manager
    /// 3. Start a bridge supervisor per registered backend
    /// 4. Bind the QUIC endpoint and accept connections
    /// 5. On shutdown, close connections, the endpoint and the bridges
    pub async fn start(&self) -> Result<()> {
        info!("🚀 Starting proxy on {}", self.config.bind_address);
        let mut shutdown_receiver = self.shutdown_sender.subscribe();
        self.register_core_handlers();

        let events = self
            .bridge_events
            .lock()
            .take()
            .ok_or_else(|| ProxyError::Config("proxy server was already started".to_string()))?;
        let router = tokio::spawn(route_bridge_events(self.sessions.clone(), events));

        self.bridge.start_all();
        info!("🔗 Dialing {} backend(s)", self.registry.len());

        let server_config = self.tls.server_config(self.config.idle_timeout)?;
        let endpoint = Endpoint::server(server_config, self.config.bind_address)
            .map_err(|e| ProxyError::Network(format!("cannot bind {}: {}", self.config.bind_address, e)))?;
        let local_addr = endpoint.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);
        info!("✅ QUIC endpoint listening on {}", local_addr);

        tokio::select! {
            _ = self.connections.run(&endpoint) => {
                warn!("QUIC endpoint stopped accepting connections");
            }
            _ = shutdown_receiver.recv() => {
                info!("Shutdown signal received");
            }
        }

        info!("🧹 Performing proxy cleanup...");
        self.connections.close_all(CloseReason::ServerShutdown);
        endpoint.close(
            VarInt::from_u32(CloseReason::ServerShutdown.code()),
            CloseReason::ServerShutdown.message().as_bytes(),
        );
        if tokio::time::timeout(ENDPOINT_DRAIN_TIMEOUT, endpoint.wait_idle()).await.is_err() {
            warn!("⚠️ Some connections did not close in time");
        }
        self.bridge.shutdown();
        router.abort();
        *self.local_addr.lock() = None;

        info!("✅ Proxy stopped");
        Ok(())
    }

    /// Logs lifecycle and security events. No routing decisions happen here.
    fn register_core_handlers(&self) {
        self.dispatcher.subscribe(EventKind::SessionConnected, "core:connect-log", |event| {
            if let ProxyEvent::SessionConnected { session } = event {
                info!(
                    "🎮 {} joined via {} (backend {})",
                    session.player.username, session.remote_addr, session.backend
                );
            }
            Ok(())
        });

        self.dispatcher.subscribe(EventKind::SessionDisconnected, "core:disconnect-log", |event| {
            if let ProxyEvent::SessionDisconnected { player, reason, .. } = event {
                info!("👋 {} left: {}", player.username, reason);
            }
            Ok(())
        });

        self.dispatcher.subscribe(EventKind::SecurityViolation, "core:security-log", |event| {
            if let ProxyEvent::SecurityViolation { kind, peer, detail } = event {
                error!("🛡️ Security violation {:?} from {}: {}", kind, peer, detail);
            }
            Ok(())
        });
    }

    /// Registers and dials a backend while the proxy is running.
    pub fn register_backend(
        &self,
        name: &str,
        address: SocketAddr,
        secret: SharedSecret,
        default_server: bool,
    ) -> Result<BackendId> {
        let id = self.registry.register(name, address, secret, default_server)?;
        self.bridge.start(id);
        Ok(id)
    }

    /// Drains and removes a backend.
    pub fn deregister_backend(&self, id: BackendId) -> Result<DeregisterOutcome> {
        self.bridge.deregister(id)
    }

    /// Initiates server shutdown.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the shutdown signal was sent.
    pub async fn shutdown(&self) -> Result<()> {
        info!("🛑 Shutting down proxy...");
        let _ = self.shutdown_sender.send(());
        Ok(())
    }

    /// Address the QUIC endpoint is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Gets the dispatcher, for plugins to subscribe and register commands.
    pub fn get_dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn get_registry(&self) -> Arc<BackendRegistry> {
        self.registry.clone()
    }

    pub fn get_session_manager(&self) -> Arc<SessionManager> {
        self.sessions.clone()
    }

    pub fn get_connection_manager(&self) -> Arc<ConnectionManager> {
        self.connections.clone()
    }

    pub fn get_bridge(&self) -> Arc<BridgeManager> {
        self.bridge.clone()
    }
}

/// Feeds inbound bridge traffic to the session manager in arrival order.
///
/// Drain handling can wait on several transfers, so it runs on its own task
/// and never stalls message delivery. Messages are handled inline; none of
/// them waits on a client's queue.
pub(crate) async fn route_bridge_events(
    sessions: Arc<SessionManager>,
    mut events: mpsc::UnboundedReceiver<BridgeEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            BridgeEvent::Draining { .. } => {
                let sessions = sessions.clone();
                tokio::spawn(async move { sessions.handle_bridge_event(event).await });
            }
            BridgeEvent::Message { .. } => sessions.handle_bridge_event(event).await,
        }
    }
}
