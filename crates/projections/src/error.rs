//! Projection error types.

use thiserror::Error;

/// Errors that can occur during projection processing.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] event_store::EventStoreError),

    /// Failed to deserialize a message payload or a document.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// A document kept changing underneath the projection.
    #[error("Document {document_id} in {collection} kept changing concurrently")]
    DocumentContention {
        collection: String,
        document_id: String,
    },

    /// A projection-specific error.
    #[error("Projection error: {0}")]
    Projection(String),
}

impl ProjectionError {
    /// Failures worth polling again for rather than stopping the processor.
    pub fn is_transient(&self) -> bool {
        match self {
            ProjectionError::EventStore(e) => e.is_transient(),
            ProjectionError::DocumentContention { .. } => true,
            _ => false,
        }
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
