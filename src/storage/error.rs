//! Storage error types
//!
//! Defines all errors that can occur in the storage layer.

use thiserror::Error;

/// Errors that can occur in the feed storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (checksum mismatch, truncated record)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Index or chunk file has a bad magic number or an unknown version
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Vector dimension differs from the index's established dimension
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Query parameters rejected by validation
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Feed rejected by validation
    #[error("Invalid feed: {0}")]
    InvalidFeed(String),

    /// Invalid time range (start >= end)
    #[error("Invalid time range: start must be less than end")]
    InvalidTimeRange,

    /// Append attempted on a block that no longer accepts writes
    #[error("Block not writable: {0}")]
    BlockNotWritable(String),

    /// A block's time range intersects an existing block
    #[error("Block overlaps existing block: {0}")]
    BlockOverlap(String),

    /// No block currently contains "now"
    #[error("No head block available")]
    NoHeadBlock,

    /// Embedding provider failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Rewrite collaborator failed
    #[error("Rewrite error: {0}")]
    Rewrite(String),

    /// Every item of a batch failed
    #[error("All items failed: {0}")]
    AllFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),

    /// Background task failed to complete
    #[error("Task error: {0}")]
    Task(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        StorageError::Task(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
