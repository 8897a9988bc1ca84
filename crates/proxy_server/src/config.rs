//! Runtime configuration consumed by [`ProxyServer`](crate::ProxyServer).
//!
//! File formats and command-line parsing live in the binary; this struct is
//! what they produce.

use crate::auth::SharedSecret;
use crate::bridge::BridgeSettings;
use crate::codec::{PacketCodec, DEFAULT_COMPRESSION_THRESHOLD};
use crate::connection::ConnectionSettings;
use crate::error::{ProxyError, Result};
use crate::session::SessionSettings;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

/// One backend the proxy should register at startup.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    /// Address of the backend's agent
    pub address: SocketAddr,
    pub secret: SharedSecret,
    /// Preferred backend for new sessions
    pub default_server: bool,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// UDP address the QUIC endpoint binds to
    pub bind_address: SocketAddr,
    /// Identifier presented to backend agents
    pub proxy_id: String,
    /// Client protocol version accepted in handshakes
    pub protocol_version: u32,
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before a backend is drained
    pub heartbeat_miss_threshold: u32,
    /// How long a transfer waits for the target's acknowledgment
    pub handoff_timeout: Duration,
    pub reconnect_interval: Duration,
    pub compression_threshold: usize,
    /// Protocol violations from one IP before a security event is raised
    pub violation_threshold: u32,
    /// How long a peer's violations count against it
    pub violation_window: Duration,
    /// Backends tried before a new session is refused
    pub max_pick_attempts: usize,
    /// Outbound queue size of each bridge channel
    pub queue_capacity: usize,
    pub backends: Vec<BackendConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 25577)),
            proxy_id: "bifrost".to_string(),
            protocol_version: 1,
            max_connections: 10_000,
            idle_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_miss_threshold: 3,
            handoff_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(5),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            violation_threshold: 5,
            violation_window: Duration::from_secs(600),
            max_pick_attempts: 3,
            queue_capacity: 1024,
            backends: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Checks values that would make the proxy misbehave rather than fail fast.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(ProxyError::Config("max_connections must be greater than 0".into()));
        }
        if self.heartbeat_miss_threshold == 0 {
            return Err(ProxyError::Config(
                "heartbeat_miss_threshold must be greater than 0".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ProxyError::Config("queue_capacity must be greater than 0".into()));
        }
        if self.max_pick_attempts == 0 {
            return Err(ProxyError::Config("max_pick_attempts must be greater than 0".into()));
        }
        for (name, value) in [
            ("idle_timeout", self.idle_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("handoff_timeout", self.handoff_timeout),
            ("violation_window", self.violation_window),
        ] {
            if value.is_zero() {
                return Err(ProxyError::Config(format!("{} must be greater than 0", name)));
            }
        }

        let mut names = HashSet::new();
        for backend in &self.backends {
            if !names.insert(backend.name.to_lowercase()) {
                return Err(ProxyError::Config(format!(
                    "backend '{}' is configured twice",
                    backend.name
                )));
            }
        }
        if self.backends.iter().filter(|b| b.default_server).count() > 1 {
            return Err(ProxyError::Config("only one backend may be the default".into()));
        }
        Ok(())
    }

    pub fn codec(&self) -> PacketCodec {
        PacketCodec::new().with_compression_threshold(self.compression_threshold)
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            proxy_id: self.proxy_id.clone(),
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_miss_threshold: self.heartbeat_miss_threshold,
            handshake_timeout: self.handshake_timeout,
            reconnect_interval: self.reconnect_interval,
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            handoff_timeout: self.handoff_timeout,
            max_pick_attempts: self.max_pick_attempts,
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            protocol_version: self.protocol_version,
            max_connections: self.max_connections,
            idle_timeout: self.idle_timeout,
            handshake_timeout: self.handshake_timeout,
            violation_threshold: self.violation_threshold,
            violation_window: self.violation_window,
        }
    }
}
