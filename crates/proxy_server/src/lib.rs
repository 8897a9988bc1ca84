//! # Proxy Server
//!
//! The session engine of the Bifrost reverse proxy. Players connect over
//! QUIC; the proxy authenticates a control channel to every backend, routes
//! each player to a backend and can move them between backends without
//! dropping the client connection.
//!
//! ## Architecture Overview
//!
//! * **Packet Codec** ([`codec`]) - Length-prefixed frames with optional
//!   zstd compression, shared by client streams and bridge channels
//! * **Authenticator** ([`auth`]) - Shared secrets, HMAC-SHA256 tags and
//!   replay protection
//! * **Bridge** ([`bridge`]) - One authenticated TCP channel per backend
//!   agent, with heartbeats and a reconnecting supervisor
//! * **Backend Registry** ([`registry`]) - Channel states, session counts
//!   and backend selection
//! * **Session Manager** ([`session`]) - Session table, handoffs, transfers
//!   and their rollback
//! * **Connection Manager** ([`connection`]) - QUIC accept loop, client
//!   handshake and per-connection stream relay
//! * **Dispatcher** - Events and commands for plugins, provided by
//!   `bifrost_event_system`
//!
//! ## Message Flow
//!
//! 1. A client opens a QUIC connection and sends its handshake
//! 2. The session manager publishes `PreConnect`, picks a backend and sends
//!    it a signed `handoff`
//! 3. Client packets travel to the backend as `forward` messages and back
//! 4. A transfer sends a `handoff` to the target and only switches the
//!    session once the target acknowledges it
//!
//! ## Thread Safety
//!
//! The registry and dispatcher are single structures behind short
//! `parking_lot` critical sections. The session table is a `DashMap` whose
//! guards never live across an `.await`. Each connection and each bridge
//! channel is owned by one task.

pub use config::{BackendConfig, ProxyConfig};
pub use error::{ProxyError, Result};
pub use server::ProxyServer;
pub use tls::TlsIdentity;

pub mod auth;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod server;
pub mod session;
pub mod tls;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod tests;
