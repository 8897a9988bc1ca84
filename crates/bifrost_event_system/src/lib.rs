//! # Bifrost Event System
//!
//! The boundary between the proxy core and everything that wants to observe
//! or steer it. The core publishes [`ProxyEvent`]s at session and backend
//! lifecycle transitions; plugins subscribe to them, register commands, and
//! see proxy state only through read-only snapshots.
//!
//! ## Delivery model
//!
//! * Handlers run synchronously on the publishing call, ordered by
//!   [`HandlerPriority`] and then by subscription order.
//! * A failing or panicking handler is isolated; delivery continues.
//! * `PreConnect` and `PreTransfer` interceptors return a [`Verdict`] that
//!   can deny the action or redirect the player.
//!
//! ## Example
//!
//! ```rust
//! use bifrost_event_system::{Dispatcher, EventKind, ProxyEvent};
//!
//! let dispatcher = Dispatcher::new();
//! dispatcher.subscribe(EventKind::SessionConnected, "greeter", |event| {
//!     if let ProxyEvent::SessionConnected { session } = event {
//!         println!("{} joined", session.player.username);
//!     }
//!     Ok(())
//! });
//! ```

pub mod commands;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod types;

pub use commands::{
    CommandHandler, CommandInfo, CommandInvocation, CommandRegistry, CommandResult, CommandSource,
};
pub use dispatcher::{
    Dispatcher, DispatcherStats, HandlerFailure, HandlerId, HandlerPriority, PublishReport,
};
pub use error::{CommandError, EventError};
pub use events::{EventKind, ProxyEvent, Verdict, ViolationKind};
pub use types::{
    current_timestamp, BackendId, BackendSnapshot, ChannelState, ConnectionId, PlayerIdentity,
    SessionId, SessionSnapshot,
};
