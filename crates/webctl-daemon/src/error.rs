//! Controller error types.

/// Errors surfaced by the request controller.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Controller is shutting down")]
    ShuttingDown,

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Session id already in use: {session_id}")]
    SessionExists { session_id: String },

    #[error("Invalid session id: {session_id:?}")]
    InvalidSessionId { session_id: String },

    #[error("Single-session mode needs at least one entry point")]
    NoEntryPoint,

    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
