use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use common::{InstanceId, PartitionKey, StreamId};
use tokio::sync::{Mutex, RwLock};

use crate::{
    AppendOptions, AppendResult, Checkpoint, CheckpointStore, Clock, DocumentChange,
    DocumentStore, EventStore, EventStoreError, GlobalPosition, InlineProjection, LockAcquisition,
    MessageEnvelope, OwnershipRecord, ProcessorKey, ProcessorLock, ProcessorStatus,
    ProjectionDocument, ReadAllOptions, ReadAllResult, ReadStreamOptions, ReadStreamResult,
    RecordedMessage, Result, StoreCheckpoint, StoreCheckpointResult, StreamPosition, SystemClock,
    TransactionId, TryAcquireLock,
    checkpoint::compare_checkpoint,
    projection::{check_document_version, fold_inline_projection},
    store::validate_messages_for_append,
};

type StreamKey = (PartitionKey, StreamId);
type DocumentKey = (String, PartitionKey, String);

#[derive(Debug, Default)]
struct LogState {
    /// Current position of every stream.
    streams: HashMap<StreamKey, StreamPosition>,
    /// Ordered by global position.
    messages: Vec<RecordedMessage>,
    documents: HashMap<DocumentKey, ProjectionDocument>,
    last_global_position: i64,
    last_transaction_id: i64,
}

impl LogState {
    fn current_position(&self, stream_id: &StreamId, partition: &PartitionKey) -> StreamPosition {
        self.streams
            .get(&(partition.clone(), stream_id.clone()))
            .copied()
            .unwrap_or(StreamPosition::initial())
    }
}

#[derive(Debug, Default)]
struct ProcessorRow {
    owner: Option<OwnershipRecord>,
    checkpoint: Option<Checkpoint>,
}

/// In-memory event store implementation for testing.
///
/// Every store owns its data; clones share it. It runs the same append
/// algorithm, inline projections, checkpoints and leases as the PostgreSQL
/// implementation, with a single write lock standing in for the transaction.
#[derive(Clone)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<LogState>>,
    processors: Arc<Mutex<HashMap<ProcessorKey, ProcessorRow>>>,
    projections: Arc<Vec<Arc<dyn InlineProjection>>>,
    clock: Arc<dyn Clock>,
    closed: Arc<AtomicBool>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self {
            log: Arc::default(),
            processors: Arc::default(),
            projections: Arc::default(),
            clock: Arc::new(SystemClock),
            closed: Arc::default(),
        }
    }
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a projection run inside every append it can handle.
    pub fn with_inline_projection(mut self, projection: Arc<dyn InlineProjection>) -> Self {
        Arc::make_mut(&mut self.projections).push(projection);
        self
    }

    /// Replaces the clock used for lease expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the total number of messages stored.
    pub async fn message_count(&self) -> usize {
        self.log.read().await.messages.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventStoreError::Closed);
        }
        Ok(())
    }

    fn run_inline_projections(
        &self,
        state: &LogState,
        stream_id: &StreamId,
        partition: &PartitionKey,
        recorded: &[RecordedMessage],
    ) -> Result<Vec<(DocumentKey, DocumentChange)>> {
        let mut changes = Vec::new();
        for projection in self.projections.iter() {
            if !recorded.iter().any(|m| projection.handles(&m.message_type)) {
                continue;
            }
            let key = (
                projection.name().to_string(),
                partition.clone(),
                stream_id.to_string(),
            );
            let current = state.documents.get(&key).cloned();
            let change = fold_inline_projection(projection.as_ref(), stream_id, current, recorded)?;
            changes.push((key, change));
        }
        Ok(changes)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn init(&self) -> Result<()> {
        self.ensure_open()
    }

    #[tracing::instrument(skip(self, messages), fields(messages = messages.len()))]
    async fn append_to_stream(
        &self,
        stream_id: &StreamId,
        messages: Vec<MessageEnvelope>,
        options: AppendOptions,
    ) -> Result<AppendResult> {
        self.ensure_open()?;
        validate_messages_for_append(&messages)?;
        let started = Instant::now();

        let mut state = self.log.write().await;
        let partition = &options.partition;

        // Resolve the expected position; the write lock makes check and update one unit.
        let current = state.current_position(stream_id, partition);
        options
            .expected_stream_version
            .assert_for_append(stream_id, current)?;
        let expected = current;
        let next = expected.advance(messages.len());

        let transaction_id = TransactionId::new(state.last_transaction_id + 1);
        let created_at = Utc::now();
        let first_global = state.last_global_position + 1;
        let recorded: Vec<RecordedMessage> = messages
            .into_iter()
            .enumerate()
            .map(|(i, message)| {
                message.record(
                    stream_id,
                    partition,
                    expected.advance(i + 1),
                    GlobalPosition::new(first_global + i as i64),
                    transaction_id,
                    created_at,
                )
            })
            .collect();

        // A failing projection aborts before anything is mutated.
        let changes = self.run_inline_projections(&state, stream_id, partition, &recorded)?;

        let created_new_stream = expected.is_initial();
        state
            .streams
            .insert((partition.clone(), stream_id.clone()), next);
        state.last_transaction_id = transaction_id.as_i64();
        state.last_global_position += recorded.len() as i64;
        let global_positions = recorded.iter().map(|m| m.global_position).collect();
        state.messages.extend(recorded);

        for (key, change) in changes {
            match change {
                DocumentChange::Unchanged => {}
                DocumentChange::Upsert(document) => {
                    state.documents.insert(key, document);
                }
                DocumentChange::Delete => {
                    state.documents.remove(&key);
                }
            }
        }

        metrics::counter!("event_store_appends_total").increment(1);
        metrics::histogram!("event_store_append_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        Ok(AppendResult {
            next_expected_stream_version: next,
            global_positions,
            transaction_id,
            created_new_stream,
        })
    }

    async fn read_stream(
        &self,
        stream_id: &StreamId,
        options: ReadStreamOptions,
    ) -> Result<Option<ReadStreamResult>> {
        self.ensure_open()?;
        let state = self.log.read().await;

        let current = state.current_position(stream_id, &options.partition);
        if let Some(expected) = options.expected_stream_version {
            expected.assert_for_read(stream_id, current)?;
        }
        if current.is_initial() {
            return Ok(None);
        }

        let messages = state
            .messages
            .iter()
            .filter(|m| {
                m.stream_id == *stream_id
                    && m.partition == options.partition
                    && options.contains(m.stream_position)
            })
            .cloned()
            .collect();

        Ok(Some(ReadStreamResult {
            messages,
            current_stream_version: current,
        }))
    }

    async fn stream_version(
        &self,
        stream_id: &StreamId,
        partition: &PartitionKey,
    ) -> Result<Option<StreamPosition>> {
        self.ensure_open()?;
        let state = self.log.read().await;
        let current = state.current_position(stream_id, partition);
        Ok((!current.is_initial()).then_some(current))
    }

    async fn read_all(&self, options: ReadAllOptions) -> Result<ReadAllResult> {
        self.ensure_open()?;
        let state = self.log.read().await;

        // Appends commit under the write lock, so every stored message is visible.
        let messages: Vec<RecordedMessage> = state
            .messages
            .iter()
            .filter(|m| m.partition == options.partition && m.global_position > options.after)
            .take(options.batch_size)
            .cloned()
            .collect();
        let last_global_position = messages
            .last()
            .map(|m| m.global_position)
            .unwrap_or(options.after);

        Ok(ReadAllResult {
            messages,
            last_global_position,
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryEventStore {
    async fn find_document(
        &self,
        collection: &str,
        partition: &PartitionKey,
        document_id: &str,
    ) -> Result<Option<ProjectionDocument>> {
        self.ensure_open()?;
        let key = (
            collection.to_string(),
            partition.clone(),
            document_id.to_string(),
        );
        Ok(self.log.read().await.documents.get(&key).cloned())
    }

    async fn upsert_document(
        &self,
        collection: &str,
        partition: &PartitionKey,
        document_id: &str,
        data: serde_json::Value,
        expected_version: Option<i64>,
    ) -> Result<ProjectionDocument> {
        self.ensure_open()?;
        let mut state = self.log.write().await;
        let key = (
            collection.to_string(),
            partition.clone(),
            document_id.to_string(),
        );
        let current = state.documents.get(&key);
        let current_version = current.map(|d| d.version).unwrap_or(0);
        check_document_version(collection, document_id, expected_version, current_version)?;

        let document = ProjectionDocument {
            id: document_id.to_string(),
            data,
            version: current_version + 1,
            last_stream_position: current.and_then(|d| d.last_stream_position),
        };
        state.documents.insert(key, document.clone());
        Ok(document)
    }

    async fn delete_document(
        &self,
        collection: &str,
        partition: &PartitionKey,
        document_id: &str,
    ) -> Result<bool> {
        self.ensure_open()?;
        let key = (
            collection.to_string(),
            partition.clone(),
            document_id.to_string(),
        );
        Ok(self.log.write().await.documents.remove(&key).is_some())
    }

    async fn clear_collection(&self, collection: &str, partition: &PartitionKey) -> Result<u64> {
        self.ensure_open()?;
        let mut state = self.log.write().await;
        let before = state.documents.len();
        state
            .documents
            .retain(|(c, p, _), _| !(c == collection && p == partition));
        Ok((before - state.documents.len()) as u64)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryEventStore {
    async fn read_checkpoint(&self, key: &ProcessorKey) -> Result<Option<Checkpoint>> {
        self.ensure_open()?;
        Ok(self
            .processors
            .lock()
            .await
            .get(key)
            .and_then(|row| row.checkpoint))
    }

    async fn store_checkpoint(
        &self,
        key: &ProcessorKey,
        request: StoreCheckpoint,
    ) -> Result<StoreCheckpointResult> {
        self.ensure_open()?;
        let mut processors = self.processors.lock().await;
        let row = processors.entry(key.clone()).or_default();

        let current = row.checkpoint.map(|c| c.position);
        let result = compare_checkpoint(current, &request);
        if result == StoreCheckpointResult::Updated {
            row.checkpoint = Some(Checkpoint {
                position: request.position,
                transaction_id: request.transaction_id,
            });
        }
        Ok(result)
    }

    async fn reset_checkpoint(&self, key: &ProcessorKey) -> Result<()> {
        self.ensure_open()?;
        if let Some(row) = self.processors.lock().await.get_mut(key) {
            row.checkpoint = None;
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessorLock for InMemoryEventStore {
    async fn try_acquire(&self, request: TryAcquireLock) -> Result<LockAcquisition> {
        self.ensure_open()?;
        let now = self.clock.now();
        let mut processors = self.processors.lock().await;
        let row = processors.entry(request.key.clone()).or_default();

        let free = row.owner.as_ref().is_none_or(|owner| {
            owner.can_be_taken_by(request.instance_id, now, request.lease_timeout)
        });
        if !free {
            return Ok(LockAcquisition::not_acquired());
        }

        row.owner = Some(OwnershipRecord {
            instance_id: request.instance_id,
            status: ProcessorStatus::Running,
            last_updated: now,
        });
        Ok(LockAcquisition::acquired(row.checkpoint))
    }

    async fn release(
        &self,
        key: &ProcessorKey,
        _lock_key: &str,
        instance_id: InstanceId,
    ) -> Result<bool> {
        self.ensure_open()?;
        let now = self.clock.now();
        let mut processors = self.processors.lock().await;
        match processors.get_mut(key).and_then(|row| row.owner.as_mut()) {
            Some(owner)
                if owner.instance_id == instance_id && owner.status == ProcessorStatus::Running =>
            {
                owner.status = ProcessorStatus::Stopped;
                owner.last_updated = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        EventStoreExt, ExpectedStreamVersion, ManualClock, STREAM_DOES_NOT_EXIST, STREAM_EXISTS,
    };

    fn create_test_message(message_type: &str) -> MessageEnvelope {
        MessageEnvelope::event(message_type, serde_json::json!({"test": true}))
    }

    fn stream() -> StreamId {
        StreamId::for_entity("test", uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn append_single_message() {
        let store = InMemoryEventStore::new();
        let stream_id = stream();

        let result = store
            .append_to_stream(
                &stream_id,
                vec![create_test_message("TestEvent")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();
        assert_eq!(result.next_expected_stream_version, StreamPosition::first());
        assert!(result.created_new_stream);
        assert_eq!(result.global_positions, vec![GlobalPosition::new(1)]);

        let read = store
            .read_stream(&stream_id, ReadStreamOptions::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.messages.len(), 1);
        assert_eq!(read.messages[0].stream_position, StreamPosition::first());
    }

    #[tokio::test]
    async fn append_multiple_messages_shares_transaction() {
        let store = InMemoryEventStore::new();
        let stream_id = stream();

        let result = store
            .append_to_stream(
                &stream_id,
                vec![
                    create_test_message("Event1"),
                    create_test_message("Event2"),
                    create_test_message("Event3"),
                ],
                AppendOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.next_expected_stream_version, StreamPosition::new(3));
        assert_eq!(
            result.global_positions,
            vec![
                GlobalPosition::new(1),
                GlobalPosition::new(2),
                GlobalPosition::new(3)
            ]
        );

        let read = store
            .read_stream(&stream_id, ReadStreamOptions::new())
            .await
            .unwrap()
            .unwrap();
        assert!(
            read.messages
                .iter()
                .all(|m| m.transaction_id == result.transaction_id)
        );
        let positions: Vec<i64> = read
            .messages
            .iter()
            .map(|m| m.stream_position.as_i64())
            .collect();
        assert_eq!(positions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn concurrency_conflict_on_wrong_version() {
        let store = InMemoryEventStore::new();
        let stream_id = stream();

        store
            .append_to_stream(
                &stream_id,
                vec![create_test_message("Event1")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();

        let result = store
            .append_to_stream(
                &stream_id,
                vec![create_test_message("Event2")],
                AppendOptions::expect_version(StreamPosition::new(5)),
            )
            .await;

        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { actual, .. }) if actual == StreamPosition::first()
        ));
        assert_eq!(store.message_count().await, 1);
    }

    #[tokio::test]
    async fn stream_does_not_exist_sentinel() {
        let store = InMemoryEventStore::new();
        let stream_id = stream();

        store
            .append_to_stream(
                &stream_id,
                vec![create_test_message("Event1")],
                AppendOptions::expect(STREAM_DOES_NOT_EXIST),
            )
            .await
            .unwrap();

        let second = store
            .append_to_stream(
                &stream_id,
                vec![create_test_message("Event2")],
                AppendOptions::expect(STREAM_DOES_NOT_EXIST),
            )
            .await;
        assert!(second.unwrap_err().is_concurrency_conflict());
    }

    #[tokio::test]
    async fn stream_exists_sentinel_on_absent_stream() {
        let store = InMemoryEventStore::new();

        let result = store
            .append_to_stream(
                &stream(),
                vec![create_test_message("Event1")],
                AppendOptions::expect(STREAM_EXISTS),
            )
            .await;

        assert!(result.unwrap_err().is_concurrency_conflict());
        assert_eq!(store.message_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_duplicate_appends_have_one_winner() {
        let store = InMemoryEventStore::new();
        let stream_id = stream();
        store
            .append_to_stream(
                &stream_id,
                vec![create_test_message("Event1")],
                AppendOptions::new(),
            )
            .await
            .unwrap();

        let attempt = |store: InMemoryEventStore, stream_id: StreamId| async move {
            store
                .append_to_stream(
                    &stream_id,
                    vec![create_test_message("Event2")],
                    AppendOptions::expect_version(StreamPosition::first()),
                )
                .await
        };
        let (a, b) = tokio::join!(
            tokio::spawn(attempt(store.clone(), stream_id.clone())),
            tokio::spawn(attempt(store.clone(), stream_id.clone())),
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|r| matches!(r, Err(e) if e.is_concurrency_conflict()))
                .count(),
            1
        );
        assert_eq!(store.message_count().await, 2);
    }

    #[tokio::test]
    async fn read_absent_stream_returns_none() {
        let store = InMemoryEventStore::new();
        let result = store
            .read_stream(&stream(), ReadStreamOptions::new())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn read_with_failing_precondition() {
        let store = InMemoryEventStore::new();
        let result = store
            .read_stream(
                &stream(),
                ReadStreamOptions::new().expected_stream_version(STREAM_EXISTS),
            )
            .await;
        assert!(matches!(
            result,
            Err(EventStoreError::PreconditionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn read_slice_reports_current_version() {
        let store = InMemoryEventStore::new();
        let stream_id = stream();
        let messages = (1..=5)
            .map(|i| create_test_message(&format!("Event{i}")))
            .collect();
        store
            .append_to_stream(&stream_id, messages, AppendOptions::new())
            .await
            .unwrap();

        let read = store
            .read_stream(
                &stream_id,
                ReadStreamOptions::new()
                    .from(StreamPosition::new(2))
                    .max_count(2)
                    .expected_stream_version(ExpectedStreamVersion::exact(5)),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(read.current_stream_version, StreamPosition::new(5));
        let types: Vec<&str> = read
            .messages
            .iter()
            .map(|m| m.message_type.as_str())
            .collect();
        assert_eq!(types, vec!["Event2", "Event3"]);
    }

    #[tokio::test]
    async fn unbounded_max_count_reads_every_message() {
        let store = InMemoryEventStore::new();
        let stream_id = stream();
        let messages = (1..=3)
            .map(|i| create_test_message(&format!("Event{i}")))
            .collect();
        store
            .append_to_stream(&stream_id, messages, AppendOptions::new())
            .await
            .unwrap();

        for options in [
            ReadStreamOptions::new().max_count(u64::MAX),
            ReadStreamOptions::new()
                .from(StreamPosition::new(2))
                .max_count(i64::MAX as u64),
        ] {
            let from = options.bounds().0.as_i64();
            let read = store
                .read_stream(&stream_id, options)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(read.messages.len() as i64, 4 - from);
        }
    }

    #[tokio::test]
    async fn partitions_are_independent() {
        let store = InMemoryEventStore::new();
        let stream_id = stream();
        let tenant = PartitionKey::new("tenant-a");

        store
            .append_to_stream(
                &stream_id,
                vec![create_test_message("Event1")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();
        let result = store
            .append_to_stream(
                &stream_id,
                vec![create_test_message("Event1")],
                AppendOptions::expect_new().partition(tenant.clone()),
            )
            .await
            .unwrap();

        assert_eq!(result.next_expected_stream_version, StreamPosition::first());
        assert!(store.stream_exists(&stream_id, &tenant).await.unwrap());
        let all = store
            .read_all(ReadAllOptions::default().partition(tenant))
            .await
            .unwrap();
        assert_eq!(all.messages.len(), 1);
    }

    #[tokio::test]
    async fn read_all_pages_by_global_position() {
        let store = InMemoryEventStore::new();
        for _ in 0..3 {
            store
                .append_to_stream(
                    &stream(),
                    vec![create_test_message("A"), create_test_message("B")],
                    AppendOptions::new(),
                )
                .await
                .unwrap();
        }

        let first = store
            .read_all(ReadAllOptions::default().batch_size(4))
            .await
            .unwrap();
        assert_eq!(first.messages.len(), 4);
        assert_eq!(first.last_global_position, GlobalPosition::new(4));

        let rest = store
            .read_all(ReadAllOptions::after(first.last_global_position).batch_size(4))
            .await
            .unwrap();
        assert_eq!(rest.messages.len(), 2);

        let empty = store
            .read_all(ReadAllOptions::after(GlobalPosition::new(6)))
            .await
            .unwrap();
        assert!(empty.messages.is_empty());
        assert_eq!(empty.last_global_position, GlobalPosition::new(6));
    }

    #[tokio::test]
    async fn stream_messages_walks_every_page() {
        use futures_util::TryStreamExt;

        let store = InMemoryEventStore::new();
        for _ in 0..5 {
            store
                .append_to_stream(&stream(), vec![create_test_message("A")], AppendOptions::new())
                .await
                .unwrap();
        }

        let all: Vec<RecordedMessage> = store
            .stream_messages(ReadAllOptions::default().batch_size(2))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn closed_store_rejects_calls_and_close_is_idempotent() {
        let store = InMemoryEventStore::new();
        store.close().await.unwrap();
        store.close().await.unwrap();

        let result = store
            .append_to_stream(&stream(), vec![create_test_message("A")], AppendOptions::new())
            .await;
        assert!(matches!(result, Err(EventStoreError::Closed)));
        assert!(matches!(
            store.read_all(ReadAllOptions::default()).await,
            Err(EventStoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn document_upsert_checks_version() {
        let store = InMemoryEventStore::new();
        let partition = PartitionKey::default();

        let doc = store
            .upsert_document("carts", &partition, "c1", serde_json::json!({"n": 1}), Some(0))
            .await
            .unwrap();
        assert_eq!(doc.version, 1);

        let stale = store
            .upsert_document("carts", &partition, "c1", serde_json::json!({"n": 2}), Some(0))
            .await;
        assert!(matches!(
            stale,
            Err(EventStoreError::DocumentVersionConflict { actual: 1, .. })
        ));

        assert_eq!(store.clear_collection("carts", &partition).await.unwrap(), 1);
        assert!(
            store
                .find_document("carts", &partition, "c1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn checkpoint_compare_and_swap() {
        let store = InMemoryEventStore::new();
        let key = ProcessorKey::new("summary");
        let request = StoreCheckpoint {
            position: GlobalPosition::new(5),
            expected_position: None,
            transaction_id: Some(TransactionId::new(3)),
        };

        assert_eq!(
            store.store_checkpoint(&key, request).await.unwrap(),
            StoreCheckpointResult::Updated
        );
        assert_eq!(
            store.store_checkpoint(&key, request).await.unwrap(),
            StoreCheckpointResult::AlreadyAtPosition
        );

        let behind = StoreCheckpoint {
            position: GlobalPosition::new(4),
            expected_position: Some(GlobalPosition::new(2)),
            transaction_id: None,
        };
        assert_eq!(
            store.store_checkpoint(&key, behind).await.unwrap(),
            StoreCheckpointResult::Conflict {
                current: Some(GlobalPosition::new(5))
            }
        );

        let checkpoint = store.read_checkpoint(&key).await.unwrap().unwrap();
        assert_eq!(checkpoint.position, GlobalPosition::new(5));
        assert_eq!(checkpoint.transaction_id, Some(TransactionId::new(3)));

        store.reset_checkpoint(&key).await.unwrap();
        assert!(store.read_checkpoint(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_lease_is_reclaimed_with_checkpoint() {
        let clock = ManualClock::default();
        let store = InMemoryEventStore::new().with_clock(Arc::new(clock.clone()));
        let key = ProcessorKey::new("summary");
        let (a, b) = (InstanceId::new(), InstanceId::new());
        let lease = Duration::from_secs(300);

        let first = store
            .try_acquire(TryAcquireLock::new(key.clone(), a).lease_timeout(lease))
            .await
            .unwrap();
        assert!(first.acquired);
        store
            .store_checkpoint(
                &key,
                StoreCheckpoint {
                    position: GlobalPosition::new(42),
                    expected_position: None,
                    transaction_id: None,
                },
            )
            .await
            .unwrap();

        clock.advance(Duration::from_secs(299));
        let early = store
            .try_acquire(TryAcquireLock::new(key.clone(), b).lease_timeout(lease))
            .await
            .unwrap();
        assert!(!early.acquired);

        clock.advance(Duration::from_secs(2));
        let late = store
            .try_acquire(TryAcquireLock::new(key.clone(), b).lease_timeout(lease))
            .await
            .unwrap();
        assert!(late.acquired);
        assert_eq!(
            late.checkpoint.map(|c| c.position),
            Some(GlobalPosition::new(42))
        );

        // A lost its ownership and cannot release B's lock.
        assert!(!store.release(&key, "", a).await.unwrap());
        assert!(store.release(&key, "", b).await.unwrap());
    }

    #[tokio::test]
    async fn owner_refreshes_lease_by_reacquiring() {
        let clock = ManualClock::default();
        let store = InMemoryEventStore::new().with_clock(Arc::new(clock.clone()));
        let key = ProcessorKey::new("summary");
        let (a, b) = (InstanceId::new(), InstanceId::new());

        assert!(store.try_acquire(TryAcquireLock::new(key.clone(), a)).await.unwrap().acquired);
        clock.advance(Duration::from_secs(200));
        assert!(store.try_acquire(TryAcquireLock::new(key.clone(), a)).await.unwrap().acquired);
        clock.advance(Duration::from_secs(200));

        assert!(!store.try_acquire(TryAcquireLock::new(key.clone(), b)).await.unwrap().acquired);
    }

    #[tokio::test]
    async fn released_lock_is_free_immediately() {
        let store = InMemoryEventStore::new();
        let key = ProcessorKey::new("summary");
        let (a, b) = (InstanceId::new(), InstanceId::new());

        assert!(store.try_acquire(TryAcquireLock::new(key.clone(), a)).await.unwrap().acquired);
        assert!(store.release(&key, "", a).await.unwrap());
        assert!(store.try_acquire(TryAcquireLock::new(key.clone(), b)).await.unwrap().acquired);
    }
}
