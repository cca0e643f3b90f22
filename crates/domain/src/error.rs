//! Domain error types.

use event_store::EventStoreError;
use thiserror::Error;

/// Errors that can occur during command handling.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// The command is not allowed in the current state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    /// True when the append lost an optimistic concurrency race.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, DomainError::EventStore(e) if e.is_concurrency_conflict())
    }
}
