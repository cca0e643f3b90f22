//! Expected stream version: the optimistic concurrency precondition.

use common::StreamId;
use serde::{Deserialize, Serialize};

use crate::{EventStoreError, Result, StreamPosition};

/// Precondition on a stream's current position, checked atomically on append
/// and asserted on reads that carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExpectedStreamVersion {
    /// Always matches.
    #[default]
    NoConcurrencyCheck,
    /// Matches only if the stream has at least one message.
    StreamExists,
    /// Matches only if the stream has no messages.
    StreamDoesNotExist,
    /// Matches only if the stream is exactly at this position.
    Exact(StreamPosition),
}

pub const NO_CONCURRENCY_CHECK: ExpectedStreamVersion = ExpectedStreamVersion::NoConcurrencyCheck;
pub const STREAM_EXISTS: ExpectedStreamVersion = ExpectedStreamVersion::StreamExists;
pub const STREAM_DOES_NOT_EXIST: ExpectedStreamVersion = ExpectedStreamVersion::StreamDoesNotExist;

impl ExpectedStreamVersion {
    pub fn exact(position: i64) -> Self {
        ExpectedStreamVersion::Exact(StreamPosition::new(position))
    }

    /// Returns whether a stream currently at `current` satisfies the precondition.
    pub fn matches(&self, current: StreamPosition) -> bool {
        match self {
            ExpectedStreamVersion::NoConcurrencyCheck => true,
            ExpectedStreamVersion::StreamExists => !current.is_initial(),
            ExpectedStreamVersion::StreamDoesNotExist => current.is_initial(),
            ExpectedStreamVersion::Exact(expected) => *expected == current,
        }
    }

    /// Fails with a concurrency conflict unless `current` matches.
    pub fn assert_for_append(&self, stream_id: &StreamId, current: StreamPosition) -> Result<()> {
        if self.matches(current) {
            return Ok(());
        }
        Err(self.conflict(stream_id, current))
    }

    /// Builds the conflict raised when an append finds the stream at `actual`.
    pub(crate) fn conflict(&self, stream_id: &StreamId, actual: StreamPosition) -> EventStoreError {
        metrics::counter!("event_store_concurrency_conflicts_total").increment(1);
        EventStoreError::ConcurrencyConflict {
            stream_id: stream_id.clone(),
            expected: *self,
            actual,
        }
    }

    /// Fails with a precondition violation unless `current` matches.
    pub fn assert_for_read(&self, stream_id: &StreamId, current: StreamPosition) -> Result<()> {
        if self.matches(current) {
            return Ok(());
        }
        Err(EventStoreError::PreconditionFailed {
            stream_id: stream_id.clone(),
            expected: *self,
            actual: current,
        })
    }
}

impl std::fmt::Display for ExpectedStreamVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpectedStreamVersion::NoConcurrencyCheck => f.write_str("NO_CONCURRENCY_CHECK"),
            ExpectedStreamVersion::StreamExists => f.write_str("STREAM_EXISTS"),
            ExpectedStreamVersion::StreamDoesNotExist => f.write_str("STREAM_DOES_NOT_EXIST"),
            ExpectedStreamVersion::Exact(position) => write!(f, "{position}"),
        }
    }
}

impl From<StreamPosition> for ExpectedStreamVersion {
    fn from(position: StreamPosition) -> Self {
        ExpectedStreamVersion::Exact(position)
    }
}
