//! Worker error types.

use event_store::EventStoreError;
use projections::ProjectionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("missing required setting {0}")]
    MissingSetting(&'static str),

    #[error("invalid value {value:?} for {name}")]
    InvalidSetting { name: &'static str, value: String },

    #[error("event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("projection error: {0}")]
    Projection(#[from] ProjectionError),

    #[error("failed to install metrics exporter: {0}")]
    Metrics(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
