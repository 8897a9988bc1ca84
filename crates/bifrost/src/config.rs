//! Configuration file handling for the proxy binary.
//!
//! The TOML file is loaded into [`AppConfig`], merged with command-line
//! overrides, validated and then converted into the
//! [`ProxyConfig`](proxy_server::ProxyConfig) the core consumes.

use crate::cli::Args;
use anyhow::{anyhow, bail, Context, Result};
use proxy_server::auth::SharedSecret;
use proxy_server::codec::DEFAULT_COMPRESSION_THRESHOLD;
use proxy_server::{BackendConfig, ProxyConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    /// `[[backend]]` tables
    #[serde(default, rename = "backend")]
    pub backends: Vec<BackendEntry>,
}

/// Client-facing QUIC settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// UDP address to bind, e.g. "0.0.0.0:25577"
    pub bind_address: String,
    /// Identifier presented to backend agents
    #[serde(default = "default_proxy_id")]
    pub proxy_id: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Client handshake timeout in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    /// Frames larger than this many bytes are compressed (0 disables)
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    /// Protocol violations from one address before a security event
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u32,
    /// Seconds a protocol violation counts against its address
    #[serde(default = "default_violation_window")]
    pub violation_window: u64,
    /// Backends tried before a joining player is refused
    #[serde(default = "default_max_pick_attempts")]
    pub max_pick_attempts: usize,
}

/// Certificate files for the QUIC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    pub certificate_path: String,
    pub private_key_path: String,
    /// Write a self-signed certificate when both files are missing
    #[serde(default = "default_true")]
    pub generate_self_signed: bool,
}

/// Backend control channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Base64 secret used for backends without their own
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_miss_threshold")]
    pub heartbeat_miss_threshold: u32,
    /// How long a transfer waits for the target to acknowledge
    #[serde(default = "default_handoff_timeout")]
    pub handoff_timeout_ms: u64,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    #[serde(default)]
    pub json_format: bool,
}

/// One `[[backend]]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendEntry {
    pub name: String,
    /// Address of the backend's agent
    pub address: String,
    /// Base64 secret; falls back to `bridge.secret`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default)]
    pub default_server: bool,
}

fn default_proxy_id() -> String {
    "bifrost".to_string()
}

fn default_protocol_version() -> u32 {
    1
}

fn default_max_connections() -> usize {
    10_000
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_compression_threshold() -> usize {
    DEFAULT_COMPRESSION_THRESHOLD
}

fn default_violation_threshold() -> u32 {
    5
}

fn default_violation_window() -> u64 {
    600
}

fn default_max_pick_attempts() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval() -> u64 {
    5_000
}

fn default_heartbeat_miss_threshold() -> u32 {
    3
}

fn default_handoff_timeout() -> u64 {
    10_000
}

fn default_reconnect_interval() -> u64 {
    5_000
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:25577".to_string(),
            proxy_id: default_proxy_id(),
            protocol_version: default_protocol_version(),
            max_connections: default_max_connections(),
            idle_timeout: default_idle_timeout(),
            handshake_timeout: default_handshake_timeout(),
            compression_threshold: default_compression_threshold(),
            violation_threshold: default_violation_threshold(),
            violation_window: default_violation_window(),
            max_pick_attempts: default_max_pick_attempts(),
        }
    }
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            certificate_path: "certs/proxy.crt".to_string(),
            private_key_path: "certs/proxy.key".to_string(),
            generate_self_signed: true,
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            secret: None,
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_miss_threshold: default_heartbeat_miss_threshold(),
            handoff_timeout_ms: default_handoff_timeout(),
            reconnect_interval_ms: default_reconnect_interval(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            tls: TlsSettings::default(),
            bridge: BridgeSettings::default(),
            logging: LoggingSettings::default(),
            backends: vec![BackendEntry {
                name: "lobby".to_string(),
                address: "127.0.0.1:5520".to_string(),
                secret: None,
                default_server: true,
            }],
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, a default configuration with a freshly
    /// generated bridge secret is written there and returned.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("cannot read {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("cannot parse {}", path.display()))?;
            return Ok(config);
        }

        let mut config = AppConfig::default();
        let (_, encoded) = SharedSecret::generate().context("cannot generate bridge secret")?;
        config.bridge.secret = Some(encoded);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        let toml_content = toml::to_string_pretty(&config)?;
        tokio::fs::write(path, toml_content)
            .await
            .with_context(|| format!("cannot write {}", path.display()))?;
        info!("📝 Created default configuration file: {}", path.display());
        warn!("🔑 Generated a new bridge secret; copy it into every backend agent's configuration");
        Ok(config)
    }

    /// Applies command-line overrides on top of the file values.
    pub fn apply_overrides(&mut self, args: &Args) {
        if let Some(bind) = &args.bind {
            self.server.bind_address = bind.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
    }

    /// Checks the values a typo would most likely break.
    ///
    /// Secrets and numeric ranges are checked again by
    /// [`to_proxy_config`](Self::to_proxy_config) and the core.
    pub fn validate(&self) -> Result<()> {
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            bail!("Invalid bind address: {}", self.server.bind_address);
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                self.logging.level
            );
        }

        let mut names = HashSet::new();
        for backend in &self.backends {
            if backend.name.trim().is_empty() {
                bail!("Backend names cannot be empty");
            }
            if !names.insert(backend.name.to_lowercase()) {
                bail!("Backend '{}' is configured twice", backend.name);
            }
            if backend.address.parse::<SocketAddr>().is_err() {
                bail!("Invalid address for backend '{}': {}", backend.name, backend.address);
            }
            if backend.secret.is_none() && self.bridge.secret.is_none() {
                bail!(
                    "Backend '{}' has no secret and bridge.secret is not set",
                    backend.name
                );
            }
        }
        if self.backends.iter().filter(|b| b.default_server).count() > 1 {
            bail!("Only one backend may be the default server");
        }
        if self.server.max_pick_attempts == 0 {
            bail!("server.max_pick_attempts must be at least 1");
        }

        Ok(())
    }

    /// Converts the file configuration into the core's configuration.
    pub fn to_proxy_config(&self) -> Result<ProxyConfig> {
        let bind_address = self
            .server
            .bind_address
            .parse()
            .with_context(|| format!("invalid bind address {}", self.server.bind_address))?;

        let mut backends = Vec::with_capacity(self.backends.len());
        for entry in &self.backends {
            backends.push(self.backend_config(entry)?);
        }

        Ok(ProxyConfig {
            bind_address,
            proxy_id: self.server.proxy_id.clone(),
            protocol_version: self.server.protocol_version,
            max_connections: self.server.max_connections,
            idle_timeout: Duration::from_secs(self.server.idle_timeout),
            handshake_timeout: Duration::from_secs(self.server.handshake_timeout),
            heartbeat_interval: Duration::from_millis(self.bridge.heartbeat_interval_ms),
            heartbeat_miss_threshold: self.bridge.heartbeat_miss_threshold,
            handoff_timeout: Duration::from_millis(self.bridge.handoff_timeout_ms),
            reconnect_interval: Duration::from_millis(self.bridge.reconnect_interval_ms),
            compression_threshold: self.server.compression_threshold,
            violation_threshold: self.server.violation_threshold,
            violation_window: Duration::from_secs(self.server.violation_window),
            max_pick_attempts: self.server.max_pick_attempts,
            queue_capacity: self.bridge.queue_capacity,
            backends,
        })
    }

    fn backend_config(&self, entry: &BackendEntry) -> Result<BackendConfig> {
        let encoded = entry
            .secret
            .as_deref()
            .or(self.bridge.secret.as_deref())
            .ok_or_else(|| anyhow!("backend '{}' has no secret", entry.name))?;
        let secret = SharedSecret::from_base64(encoded)
            .with_context(|| format!("invalid secret for backend '{}'", entry.name))?;
        let address = entry
            .address
            .parse()
            .with_context(|| format!("invalid address for backend '{}'", entry.name))?;

        Ok(BackendConfig {
            name: entry.name.clone(),
            address,
            secret,
            default_server: entry.default_server,
        })
    }
}
