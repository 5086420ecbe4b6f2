//! Error types for the core message model.

use thiserror::Error;

/// Main error type for core model operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Invalid message format or content
    #[error("invalid message: {message}")]
    InvalidMessage { message: String },
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
