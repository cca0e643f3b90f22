//! Command handling infrastructure.

use common::{PartitionKey, StreamId};
use event_store::{
    AppendOptions, DomainEvent, EventStore, EventStoreExt, ExpectedStreamVersion,
    ReadStreamOptions, STREAM_DOES_NOT_EXIST, StreamPosition,
};

use crate::error::DomainError;
use crate::retry::RetryPolicy;

/// Per-call options for [`CommandHandler::handle`].
#[derive(Debug, Clone, Default)]
pub struct HandleOptions {
    /// Overrides the version the append is checked against. When unset, the
    /// version the state was rebuilt at is used, or "does not exist" for new streams.
    pub expected_stream_version: Option<ExpectedStreamVersion>,
    pub partition: PartitionKey,
}

impl HandleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(mut self, expected: ExpectedStreamVersion) -> Self {
        self.expected_stream_version = Some(expected);
        self
    }

    pub fn partition(mut self, partition: PartitionKey) -> Self {
        self.partition = partition;
        self
    }
}

/// Result of command execution.
#[derive(Debug)]
pub struct CommandHandlerResult<State, E> {
    /// Stream version after the append; the current version when nothing was appended.
    pub next_expected_stream_version: StreamPosition,

    /// The state after applying the new events.
    pub new_state: State,

    /// The events that were decided and persisted.
    pub new_events: Vec<E>,

    pub created_new_stream: bool,
}

/// Runs the read, decide, append cycle for one stream.
///
/// State is rebuilt with `evolve` from `initial_state()`, the caller's decision
/// runs against it, and the resulting events are appended with the version the
/// state was read at as the expected version. A writer that appended in
/// between makes the append fail with a concurrency conflict; nothing is
/// written in that case.
pub struct CommandHandler<S, State, E> {
    store: S,
    evolve: fn(State, &E) -> State,
    initial_state: fn() -> State,
    stream_type: Option<String>,
}

impl<S, State, E> CommandHandler<S, State, E>
where
    S: EventStore,
    State: Send + 'static,
    E: DomainEvent + 'static,
{
    /// Creates a new command handler with the given event store.
    pub fn new(store: S, evolve: fn(State, &E) -> State, initial_state: fn() -> State) -> Self {
        Self {
            store,
            evolve,
            initial_state,
            stream_type: None,
        }
    }

    /// Records `stream_type` on streams this handler creates.
    pub fn with_stream_type(mut self, stream_type: impl Into<String>) -> Self {
        self.stream_type = Some(stream_type.into());
        self
    }

    /// Returns a reference to the underlying event store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Rebuilds the current state of a stream; `None` if it does not exist.
    pub async fn load(
        &self,
        stream_id: &StreamId,
        partition: &PartitionKey,
    ) -> Result<Option<(State, StreamPosition)>, DomainError> {
        let aggregated = self
            .store
            .aggregate_stream(
                stream_id,
                self.evolve,
                self.initial_state,
                ReadStreamOptions::new().partition(partition.clone()),
            )
            .await?;

        Ok(aggregated.map(|result| (result.state, result.current_stream_version)))
    }

    /// Executes a decision against the current state and persists the resulting events.
    ///
    /// Never retries: a lost race surfaces as
    /// [`DomainError::is_concurrency_conflict`]. An empty decision appends
    /// nothing and reports the current version.
    #[tracing::instrument(skip(self, decide, options), fields(stream_id = %stream_id))]
    pub async fn handle<F, Rejection>(
        &self,
        stream_id: &StreamId,
        decide: F,
        options: HandleOptions,
    ) -> Result<CommandHandlerResult<State, E>, DomainError>
    where
        F: FnOnce(&State) -> Result<Vec<E>, Rejection>,
        DomainError: From<Rejection>,
    {
        let (state, current_version) = match self.load(stream_id, &options.partition).await? {
            Some((state, version)) => (state, Some(version)),
            None => ((self.initial_state)(), None),
        };

        let events = decide(&state)?;

        if events.is_empty() {
            return Ok(CommandHandlerResult {
                next_expected_stream_version: current_version
                    .unwrap_or_else(StreamPosition::initial),
                new_state: state,
                new_events: events,
                created_new_stream: false,
            });
        }

        let expected = options
            .expected_stream_version
            .unwrap_or(match current_version {
                Some(version) => ExpectedStreamVersion::Exact(version),
                None => STREAM_DOES_NOT_EXIST,
            });

        let mut append = AppendOptions::expect(expected).partition(options.partition);
        if let Some(stream_type) = &self.stream_type {
            append = append.stream_type(stream_type.clone());
        }

        let appended = self.store.append_events(stream_id, &events, append).await?;

        tracing::debug!(
            events = events.len(),
            version = %appended.next_expected_stream_version,
            "command handled"
        );

        let new_state = events.iter().fold(state, self.evolve);

        Ok(CommandHandlerResult {
            next_expected_stream_version: appended.next_expected_stream_version,
            new_state,
            new_events: events,
            created_new_stream: appended.created_new_stream,
        })
    }

    /// Like [`handle`](Self::handle), but re-runs the whole cycle on a
    /// concurrency conflict, waiting `policy.delay(attempt)` between attempts.
    /// Any other error is returned immediately.
    pub async fn handle_with_retry<F, Rejection>(
        &self,
        stream_id: &StreamId,
        decide: F,
        options: HandleOptions,
        policy: RetryPolicy,
    ) -> Result<CommandHandlerResult<State, E>, DomainError>
    where
        F: Fn(&State) -> Result<Vec<E>, Rejection>,
        DomainError: From<Rejection>,
    {
        let mut attempt = 0;
        loop {
            match self.handle(stream_id, &decide, options.clone()).await {
                Err(e) if e.is_concurrency_conflict() && attempt < policy.retries => {
                    let delay = policy.delay(attempt);
                    attempt += 1;
                    metrics::counter!("command_handler_retries_total").increment(1);
                    tracing::debug!(%stream_id, attempt, ?delay, "retrying after concurrency conflict");
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}
