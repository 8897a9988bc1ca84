//! Error types for event delivery and command dispatch.

/// Errors raised by event handlers.
///
/// A handler error never stops delivery; the dispatcher records it in the
/// publish report and moves on to the next handler.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// Serialization failed when converting event data
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Handler execution failed during event processing
    #[error("Handler execution error: {0}")]
    HandlerExecution(String),
    /// Handler panicked while processing the event
    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),
}

/// Errors raised by the command registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Command already registered: {0}")]
    AlreadyRegistered(String),
    #[error("Empty command line")]
    EmptyCommandLine,
}
