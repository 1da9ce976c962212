//! Error types for batch-uploader
//!
//! This module provides the error taxonomy for the library:
//! - Setup errors rejected synchronously before any job runs
//! - Batch/file state errors (`BatchError`)
//! - Subscription errors (`SubscriptionError`)
//! - Collaborator errors surfaced from the storage backend, transport,
//!   and persistence layer

use thiserror::Error;

use crate::types::{BatchId, FileId};

/// Result type alias for batch-uploader operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for batch-uploader
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "throttle_interval")
        key: Option<String>,
    },

    /// Batch or file state error
    #[error("batch error: {0}")]
    Batch(#[from] BatchError),

    /// Subscription management error
    #[error("subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    /// Storage backend error
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Transport delivery error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Persistence mirror error
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Shutdown in progress - not accepting new batches
    #[error("shutdown in progress: not accepting new batches")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Batch and file state errors
#[derive(Debug, Error)]
pub enum BatchError {
    /// A batch with this id is already tracked
    #[error("batch {id} already exists")]
    DuplicateBatchId {
        /// The duplicate batch id
        id: BatchId,
    },

    /// Batch not found
    #[error("batch {id} not found")]
    NotFound {
        /// The batch id that was not found
        id: BatchId,
    },

    /// File not found within a batch
    #[error("file {file_id} not found in batch {batch_id}")]
    FileNotFound {
        /// The batch that was searched
        batch_id: BatchId,
        /// The file id that was not found
        file_id: FileId,
    },

    /// Batch already reached a terminal state
    #[error("batch {id} is already {state}")]
    AlreadyCompleted {
        /// The batch id
        id: BatchId,
        /// The terminal state the batch is in (e.g., "completed", "cancelled")
        state: String,
    },

    /// A batch must contain at least one file
    #[error("batch contains no files")]
    EmptyBatch,

    /// Concurrency must be at least one
    #[error("invalid concurrency {value}: must be >= 1")]
    InvalidConcurrency {
        /// The rejected concurrency value
        value: usize,
    },

    /// Every file must have a positive size
    #[error("file {name} has invalid size {size}: must be > 0")]
    InvalidFileSize {
        /// The offending file name
        name: String,
        /// The rejected size
        size: u64,
    },
}

/// Subscription management errors
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The configured subscriber cap for a batch has been reached
    #[error("subscriber limit reached for batch {batch_id}: max {limit}")]
    LimitReached {
        /// The batch that hit the cap
        batch_id: BatchId,
        /// The configured maximum
        limit: usize,
    },

    /// The transport could not register the membership
    #[error("transport unavailable: cannot register subscription")]
    TransportUnavailable,
}

/// Errors reported by the storage backend
///
/// Variants are split along the retryability boundary: `Unavailable`,
/// `Timeout`, and `Io` are transient; `UnsupportedType`, `TooLarge`, and
/// `Validation` are permanent.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend is down or unreachable (transient)
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    /// Operation timed out (transient)
    #[error("storage operation timed out: {0}")]
    Timeout(String),

    /// Underlying I/O failure (transient)
    #[error("storage I/O error: {0}")]
    Io(String),

    /// File type rejected by the backend (permanent)
    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    /// File exceeds the backend's size limit (permanent)
    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        /// Actual file size
        size: u64,
        /// Backend limit
        limit: u64,
    },

    /// Validation failure (permanent)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unclassified backend error; retryability decided by message patterns
    #[error("{0}")]
    Other(String),
}

/// Errors reported by the transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// Transport is down; events should be queued for later delivery
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// A send was attempted and rejected
    #[error("send to topic {topic} failed: {reason}")]
    SendFailed {
        /// Target topic
        topic: String,
        /// Failure description
        reason: String,
    },

    /// Membership registration failed
    #[error("topic membership change failed: {0}")]
    Membership(String),
}

/// Errors reported by the persistence layer
///
/// These are never propagated to callers of mutating operations; the
/// in-memory update stands and the failure is logged.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Durable write failed
    #[error("persistence write failed: {0}")]
    WriteFailed(String),

    /// Durable read failed
    #[error("persistence read failed: {0}")]
    ReadFailed(String),
}
