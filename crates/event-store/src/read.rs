use common::PartitionKey;

use crate::{ExpectedStreamVersion, GlobalPosition, RecordedMessage, StreamPosition};

/// Options for reading a slice of a single stream.
///
/// `from` and `to` are inclusive stream positions. `max_count` bounds the
/// slice starting at `from`; combined with `to` the tighter bound wins.
#[derive(Debug, Clone, Default)]
pub struct ReadStreamOptions {
    pub from: Option<StreamPosition>,
    pub to: Option<StreamPosition>,
    pub max_count: Option<u64>,
    /// Asserted against the current stream version before reading.
    pub expected_stream_version: Option<ExpectedStreamVersion>,
    pub partition: PartitionKey,
}

impl ReadStreamOptions {
    /// Reads the whole stream in the default partition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts reading at this position (inclusive).
    pub fn from(mut self, position: StreamPosition) -> Self {
        self.from = Some(position);
        self
    }

    /// Stops reading at this position (inclusive); used for time travel.
    pub fn to(mut self, position: StreamPosition) -> Self {
        self.to = Some(position);
        self
    }

    pub fn max_count(mut self, max_count: u64) -> Self {
        self.max_count = Some(max_count);
        self
    }

    pub fn expected_stream_version(mut self, expected: ExpectedStreamVersion) -> Self {
        self.expected_stream_version = Some(expected);
        self
    }

    pub fn partition(mut self, partition: PartitionKey) -> Self {
        self.partition = partition;
        self
    }

    /// Inclusive position range to read, as `(from, to)`.
    pub fn bounds(&self) -> (StreamPosition, Option<StreamPosition>) {
        let from = self.from.unwrap_or(StreamPosition::first());
        let by_count = self.max_count.map(|count| {
            let count = i64::try_from(count).unwrap_or(i64::MAX);
            StreamPosition::new(from.as_i64().saturating_add(count).saturating_sub(1))
        });
        let to = match (self.to, by_count) {
            (Some(to), Some(by_count)) => Some(to.min(by_count)),
            (to, by_count) => to.or(by_count),
        };
        (from, to)
    }

    /// Returns whether `position` falls within the requested slice.
    pub fn contains(&self, position: StreamPosition) -> bool {
        let (from, to) = self.bounds();
        position >= from && to.is_none_or(|to| position <= to)
    }
}

/// A slice of a stream together with the stream's current version.
#[derive(Debug, Clone)]
pub struct ReadStreamResult {
    pub messages: Vec<RecordedMessage>,
    /// The stream's actual current version, independent of the slice read.
    pub current_stream_version: StreamPosition,
}

/// Options for reading across all streams of a partition by global position.
#[derive(Debug, Clone)]
pub struct ReadAllOptions {
    /// Reads messages strictly after this position.
    pub after: GlobalPosition,
    pub batch_size: usize,
    pub partition: PartitionKey,
}

impl ReadAllOptions {
    pub const DEFAULT_BATCH_SIZE: usize = 100;

    pub fn after(position: GlobalPosition) -> Self {
        Self {
            after: position,
            ..Self::default()
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn partition(mut self, partition: PartitionKey) -> Self {
        self.partition = partition;
        self
    }
}

impl Default for ReadAllOptions {
    fn default() -> Self {
        Self {
            after: GlobalPosition::start(),
            batch_size: Self::DEFAULT_BATCH_SIZE,
            partition: PartitionKey::default(),
        }
    }
}

/// A batch of messages ordered by global position.
#[derive(Debug, Clone)]
pub struct ReadAllResult {
    pub messages: Vec<RecordedMessage>,
    /// Position of the last returned message, or the requested `after` when empty.
    pub last_global_position: GlobalPosition,
}
