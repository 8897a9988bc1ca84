//! Player sessions and their backend bindings.

pub mod manager;
pub mod state;

pub use manager::{NewSession, SessionManager, SessionSettings, TransferHandle, TransferOutcome};
pub use state::{BackendBinding, Session};
