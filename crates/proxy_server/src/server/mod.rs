//! Server orchestration and built-in commands.

mod commands;
pub mod core;

pub use self::core::ProxyServer;
