//! Process bootstrap for the Bifrost proxy: command line, configuration
//! file, TLS identity, logging, signals and the operator console.
//!
//! The proxy itself lives in `proxy_server`; this crate only turns files and
//! flags into a running [`ProxyServer`](proxy_server::ProxyServer).

pub mod cli;
pub mod config;
pub mod console;
pub mod identity;
pub mod logging;
pub mod signals;
