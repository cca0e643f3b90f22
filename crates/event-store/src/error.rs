use common::StreamId;
use thiserror::Error;

use crate::{ExpectedStreamVersion, StreamPosition};

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The expected stream version did not match the current one at append time.
    /// No messages were written.
    #[error(
        "Concurrency conflict for stream {stream_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        stream_id: StreamId,
        expected: ExpectedStreamVersion,
        actual: StreamPosition,
    },

    /// A read asserted a stream version the stream is not at.
    #[error("Precondition failed for stream {stream_id}: expected version {expected}, found {actual}")]
    PreconditionFailed {
        stream_id: StreamId,
        expected: ExpectedStreamVersion,
        actual: StreamPosition,
    },

    /// The append request itself is malformed.
    #[error("Invalid append: {0}")]
    InvalidAppend(String),

    /// A document was written with a stale version.
    #[error(
        "Document version conflict for {collection}/{document_id}: expected {expected}, found {actual}"
    )]
    DocumentVersionConflict {
        collection: String,
        document_id: String,
        expected: i64,
        actual: i64,
    },

    /// An inline projection rejected a message; the append was rolled back.
    #[error("Projection {projection} failed: {reason}")]
    Projection { projection: String, reason: String },

    /// Partition names are restricted to `[A-Za-z0-9_-]`.
    #[error("Invalid partition name: {0}")]
    InvalidPartition(String),

    /// The store was closed before the call.
    #[error("Event store is closed")]
    Closed,

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// Returns true for the expected-version mismatch raised by appends.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, EventStoreError::ConcurrencyConflict { .. })
    }

    /// Returns true for failures a surrounding retry policy may reasonably retry:
    /// pool timeouts, I/O errors, lost connections, serialization failures and deadlocks.
    pub fn is_transient(&self) -> bool {
        match self {
            EventStoreError::Database(sqlx::Error::PoolTimedOut)
            | EventStoreError::Database(sqlx::Error::Io(_))
            | EventStoreError::Database(sqlx::Error::WorkerCrashed) => true,
            EventStoreError::Database(sqlx::Error::Database(db_err)) => db_err
                .code()
                .is_some_and(|code| code.starts_with("08") || code == "40001" || code == "40P01"),
            _ => false,
        }
    }
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
