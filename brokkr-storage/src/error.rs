//! Error types for the persistent message store.

use thiserror::Error;

/// Main error type for store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying filesystem failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A chunk or oplog record failed to (de)serialize
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Corrupt data encountered while scanning a segment
    #[error("corrupt segment {segment} at offset {offset}: {details}")]
    Corruption {
        segment: String,
        offset: u64,
        details: String,
    },

    /// No segment covers the requested chunk id
    #[error("no segment for chunk {0}")]
    NoSegment(i64),

    /// The owning segment exists but holds no chunk with the requested id
    #[error("no chunk {chunk} in segment {segment}")]
    NoChunk { segment: String, chunk: i64 },

    /// No live index entry for the requested message id
    #[error("message {0} not found")]
    NotFound(String),

    /// The bounded flush queue is full; the caller must apply backpressure
    #[error("flush queue is full")]
    QueueFull,

    /// The store is stopped or was never started
    #[error("store is closed")]
    Closed,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
