use std::pin::Pin;

use async_trait::async_trait;
use common::{PartitionKey, StreamId};
use futures_core::Stream;

use crate::{
    DomainEvent, EventStoreError, ExpectedStreamVersion, GlobalPosition, MessageEnvelope,
    ReadAllOptions, ReadAllResult, ReadStreamOptions, ReadStreamResult, RecordedMessage, Result,
    StreamPosition, TransactionId,
};

/// Stream type recorded when the caller does not provide one.
pub const DEFAULT_STREAM_TYPE: &str = "unknown";

/// Options for appending messages to a stream.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Precondition on the stream's current version. Defaults to no check.
    pub expected_stream_version: ExpectedStreamVersion,

    pub partition: PartitionKey,

    /// Discriminator stored on the stream row when it is created.
    pub stream_type: Option<String>,
}

impl AppendOptions {
    /// Creates options with no version check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options with the given precondition.
    pub fn expect(expected: ExpectedStreamVersion) -> Self {
        Self {
            expected_stream_version: expected,
            ..Self::default()
        }
    }

    /// Creates options expecting the stream to be at a specific version.
    pub fn expect_version(version: StreamPosition) -> Self {
        Self::expect(ExpectedStreamVersion::Exact(version))
    }

    /// Creates options expecting the stream to not exist (new stream).
    pub fn expect_new() -> Self {
        Self::expect(ExpectedStreamVersion::StreamDoesNotExist)
    }

    /// Creates options expecting the stream to already exist.
    pub fn expect_exists() -> Self {
        Self::expect(ExpectedStreamVersion::StreamExists)
    }

    pub fn partition(mut self, partition: PartitionKey) -> Self {
        self.partition = partition;
        self
    }

    pub fn stream_type(mut self, stream_type: impl Into<String>) -> Self {
        self.stream_type = Some(stream_type.into());
        self
    }

    pub(crate) fn stream_type_or_default(&self) -> &str {
        self.stream_type.as_deref().unwrap_or(DEFAULT_STREAM_TYPE)
    }
}

/// Outcome of a successful append.
#[derive(Debug, Clone)]
pub struct AppendResult {
    /// The stream's version after the append; pass it as the next expected version.
    pub next_expected_stream_version: StreamPosition,

    /// Global positions assigned to the appended messages, in order.
    pub global_positions: Vec<GlobalPosition>,

    /// Transaction that committed every message of this append.
    pub transaction_id: TransactionId,

    pub created_new_stream: bool,
}

/// Result of folding a stream into state.
#[derive(Debug, Clone)]
pub struct AggregateStreamResult<State> {
    pub state: State,
    pub current_stream_version: StreamPosition,
}

/// A stream of recorded messages.
pub type MessageStream<'a> = Pin<Box<dyn Stream<Item = Result<RecordedMessage>> + Send + 'a>>;

/// Core trait for event store implementations.
///
/// An event store is a partitioned, append-only log of messages grouped into
/// streams. All implementations must be thread-safe (Send + Sync) and must
/// normalize backend failures into [`EventStoreError`].
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Prepares the store for use (schema creation, registrations). Idempotent.
    async fn init(&self) -> Result<()>;

    /// Appends messages to a stream.
    ///
    /// The append is atomic: the stream version check, the stream position
    /// update, the message inserts and any inline projections either all
    /// happen or none do. A version mismatch fails with `ConcurrencyConflict`
    /// and writes nothing.
    async fn append_to_stream(
        &self,
        stream_id: &StreamId,
        messages: Vec<MessageEnvelope>,
        options: AppendOptions,
    ) -> Result<AppendResult>;

    /// Reads a slice of a stream.
    ///
    /// Messages are returned in stream position order. Returns `None` when the
    /// stream does not exist and the precondition (if any) holds.
    async fn read_stream(
        &self,
        stream_id: &StreamId,
        options: ReadStreamOptions,
    ) -> Result<Option<ReadStreamResult>>;

    /// Gets the current version of a stream.
    ///
    /// Returns None if the stream doesn't exist.
    async fn stream_version(
        &self,
        stream_id: &StreamId,
        partition: &PartitionKey,
    ) -> Result<Option<StreamPosition>>;

    /// Reads messages from all streams of a partition in global position order.
    ///
    /// Only messages whose transaction is visible and older than every
    /// in-flight transaction are returned, so a reader never moves its cursor
    /// past a gap that may still fill in.
    async fn read_all(&self, options: ReadAllOptions) -> Result<ReadAllResult>;

    /// Closes the store. Closing twice is a no-op; every other call made
    /// after closing fails with [`EventStoreError::Closed`].
    async fn close(&self) -> Result<()>;
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Serializes and appends domain events.
    async fn append_events<E: DomainEvent>(
        &self,
        stream_id: &StreamId,
        events: &[E],
        options: AppendOptions,
    ) -> Result<AppendResult> {
        let messages = events
            .iter()
            .map(MessageEnvelope::from_event)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.append_to_stream(stream_id, messages, options).await
    }

    /// Checks if a stream exists (has any messages).
    async fn stream_exists(&self, stream_id: &StreamId, partition: &PartitionKey) -> Result<bool> {
        Ok(self.stream_version(stream_id, partition).await?.is_some())
    }

    /// Reads a stream and folds it into state with `evolve`, starting from
    /// `initial_state()`.
    ///
    /// With `read.to` set, only messages up to that position are folded,
    /// reconstructing the state as it was at that version.
    async fn aggregate_stream<State, E>(
        &self,
        stream_id: &StreamId,
        evolve: for<'e> fn(State, &'e E) -> State,
        initial_state: fn() -> State,
        read: ReadStreamOptions,
    ) -> Result<Option<AggregateStreamResult<State>>>
    where
        State: Send,
        E: DomainEvent,
    {
        let Some(result) = self.read_stream(stream_id, read).await? else {
            return Ok(None);
        };

        let mut state = initial_state();
        for message in &result.messages {
            let event: E = message.decode()?;
            state = evolve(state, &event);
        }

        Ok(Some(AggregateStreamResult {
            state,
            current_stream_version: result.current_stream_version,
        }))
    }

    /// Streams every message of a partition after `options.after`, fetching
    /// `options.batch_size` messages at a time.
    fn stream_messages(&self, options: ReadAllOptions) -> MessageStream<'_>
    where
        Self: Sized,
    {
        use futures_util::{StreamExt, TryStreamExt, stream};

        let pages = stream::try_unfold(Some(options), move |options| async move {
            let Some(options) = options else {
                return Ok(None);
            };
            let batch = self.read_all(options.clone()).await?;
            let next = if batch.messages.len() < options.batch_size || batch.messages.is_empty() {
                None
            } else {
                Some(ReadAllOptions {
                    after: batch.last_global_position,
                    ..options
                })
            };
            Ok::<_, EventStoreError>(Some((batch.messages, next)))
        });

        pages
            .map_ok(|messages| stream::iter(messages.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }
}

// Blanket implementation for all EventStore implementations
impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Validates messages before appending.
pub fn validate_messages_for_append(messages: &[MessageEnvelope]) -> Result<()> {
    if messages.is_empty() {
        return Err(EventStoreError::InvalidAppend(
            "Cannot append empty message list".to_string(),
        ));
    }

    if let Some(message) = messages.iter().find(|m| m.message_type.is_empty()) {
        return Err(EventStoreError::InvalidAppend(format!(
            "Message {} has an empty type",
            message.message_id
        )));
    }

    Ok(())
}
