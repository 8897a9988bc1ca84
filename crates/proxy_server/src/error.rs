//! Error types for the proxy core.

use crate::codec::{DecodeError, EncodeError};
use bifrost_event_system::{BackendId, ChannelState, SessionId};

/// Errors that can occur while running the proxy.
///
/// Per-connection and per-channel errors are handled by the task that owns
/// the connection or channel; they only surface here so that task can
/// decide how to close it.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Client or agent sent something the protocol does not allow
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),
    /// The backend's bridge channel is not authenticated; re-pick and retry
    #[error("Bridge channel to {0} is unavailable")]
    ChannelUnavailable(BackendId),
    #[error("No backend available")]
    NoBackendAvailable,
    #[error("Handshake authentication failed for {backend}: {reason}")]
    HandshakeAuthFailure { backend: BackendId, reason: String },
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Unsupported protocol version {client} (proxy speaks {supported})")]
    UnsupportedVersion { client: u32, supported: u32 },
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("Unknown backend: {0}")]
    UnknownBackend(BackendId),
    #[error("Session {0} already has a transfer in flight")]
    TransferInProgress(SessionId),
    #[error("Transfer denied: {0}")]
    TransferDenied(String),
    #[error("Connection denied: {0}")]
    ConnectDenied(String),
    #[error("Invalid channel transition for {backend}: {from} -> {to}")]
    InvalidTransition {
        backend: BackendId,
        from: ChannelState,
        to: ChannelState,
    },
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Whether the caller may retry the same operation with a fresh pick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProxyError::ChannelUnavailable(_))
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        ProxyError::ProtocolViolation(format!("invalid JSON payload: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
