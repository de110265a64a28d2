//! Error types for `webctl` core library.

use thiserror::Error;

/// Result type alias using `webctl` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `webctl` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}
