//! Checkpointed processor feeding the log to projections.

use std::future::Future;
use std::time::Duration;

use common::{InstanceId, PartitionKey};
use event_store::{
    CheckpointStore, DEFAULT_LEASE_TIMEOUT, EventStore, GlobalPosition, ProcessorKey,
    ProcessorLock, ReadAllOptions, StoreCheckpoint, StoreCheckpointResult, TryAcquireLock,
};

use crate::Result;
use crate::projection::Projection;

/// Identity and pacing of a processor.
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub processor_id: String,
    pub partition: PartitionKey,
    /// Bumping the version starts a fresh checkpoint, e.g. after a projection changed shape.
    pub version: i32,
    pub instance_id: InstanceId,
    pub lease_timeout: Duration,
    pub batch_size: usize,
    pub poll_interval: Duration,
}

impl ProcessorOptions {
    pub fn new(processor_id: impl Into<String>) -> Self {
        Self {
            processor_id: processor_id.into(),
            partition: PartitionKey::default(),
            version: 1,
            instance_id: InstanceId::new(),
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            batch_size: ReadAllOptions::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn partition(mut self, partition: PartitionKey) -> Self {
        self.partition = partition;
        self
    }

    pub fn version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn instance_id(mut self, instance_id: InstanceId) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn key(&self) -> ProcessorKey {
        ProcessorKey::new(self.processor_id.clone())
            .partition(self.partition.clone())
            .version(self.version)
    }
}

/// Outcome of a single [`ProjectionProcessor::run_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorTick {
    /// Another instance holds the lease, or advanced the checkpoint first.
    NotOwner,
    /// `messages` were delivered; `position` is the stored checkpoint.
    Processed {
        messages: usize,
        position: Option<GlobalPosition>,
    },
}

/// Delivers messages from the log to projections, one batch at a time.
///
/// Each tick acquires (or refreshes) the processor's lease, reads the next
/// batch after the stored checkpoint, hands every message to the projections
/// that handle its type and then advances the checkpoint with a
/// compare-and-swap on the position it started from. Only one instance per
/// [`ProcessorKey`] makes progress at a time; the others see
/// [`ProcessorTick::NotOwner`] until the owner releases the lease or stops
/// refreshing it for longer than `lease_timeout`.
pub struct ProjectionProcessor<S> {
    store: S,
    projections: Vec<Box<dyn Projection>>,
    options: ProcessorOptions,
    key: ProcessorKey,
}

impl<S> ProjectionProcessor<S>
where
    S: EventStore + CheckpointStore + ProcessorLock,
{
    /// Creates a new processor with the given event store.
    pub fn new(store: S, options: ProcessorOptions) -> Self {
        Self {
            store,
            projections: Vec::new(),
            key: options.key(),
            options,
        }
    }

    /// Registers a projection with this processor.
    pub fn register(&mut self, projection: Box<dyn Projection>) {
        self.projections.push(projection);
    }

    /// Returns the number of registered projections.
    pub fn projection_count(&self) -> usize {
        self.projections.len()
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    pub fn key(&self) -> &ProcessorKey {
        &self.key
    }

    fn lock_request(&self) -> TryAcquireLock {
        TryAcquireLock::new(self.key.clone(), self.options.instance_id)
            .lease_timeout(self.options.lease_timeout)
    }

    /// Processes at most one batch.
    #[tracing::instrument(skip(self), fields(processor = %self.key))]
    pub async fn run_once(&self) -> Result<ProcessorTick> {
        let acquisition = self.store.try_acquire(self.lock_request()).await?;
        if !acquisition.acquired {
            return Ok(ProcessorTick::NotOwner);
        }
        metrics::counter!(
            "processor_lock_acquired_total",
            "processor" => self.options.processor_id.clone()
        )
        .increment(1);

        let checkpoint = acquisition.checkpoint.map(|c| c.position);
        let batch = self
            .store
            .read_all(
                ReadAllOptions::after(checkpoint.unwrap_or_else(GlobalPosition::start))
                    .batch_size(self.options.batch_size)
                    .partition(self.options.partition.clone()),
            )
            .await?;

        let Some(last) = batch.messages.last() else {
            return Ok(ProcessorTick::Processed {
                messages: 0,
                position: checkpoint,
            });
        };

        for message in &batch.messages {
            for projection in &self.projections {
                if projection.handles(&message.message_type) {
                    projection.handle(message).await?;
                }
            }
            metrics::counter!("projections_messages_processed").increment(1);
        }

        let stored = self
            .store
            .store_checkpoint(
                &self.key,
                StoreCheckpoint {
                    position: last.global_position,
                    expected_position: checkpoint,
                    transaction_id: Some(last.transaction_id),
                },
            )
            .await?;

        match stored {
            StoreCheckpointResult::Updated | StoreCheckpointResult::AlreadyAtPosition => {
                tracing::debug!(
                    messages = batch.messages.len(),
                    position = %last.global_position,
                    "batch processed"
                );
                Ok(ProcessorTick::Processed {
                    messages: batch.messages.len(),
                    position: Some(last.global_position),
                })
            }
            StoreCheckpointResult::Conflict { current } => {
                tracing::warn!(
                    expected = ?checkpoint,
                    current = ?current,
                    "checkpoint advanced by another instance"
                );
                Ok(ProcessorTick::NotOwner)
            }
        }
    }

    /// Polls until `shutdown` resolves, then releases the lease.
    ///
    /// Full batches are followed immediately by the next one; otherwise the
    /// processor waits `poll_interval`. Transient failures are logged and
    /// retried on the next poll; any other failure releases the lease and is
    /// returned.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tracing::info!(processor = %self.key, instance = %self.options.instance_id, "processor started");

        let outcome = loop {
            let wait = match self.run_once().await {
                Ok(ProcessorTick::Processed { messages, .. })
                    if messages >= self.options.batch_size =>
                {
                    Duration::ZERO
                }
                Ok(_) => self.options.poll_interval,
                Err(e) if e.is_transient() => {
                    tracing::warn!(processor = %self.key, error = %e, "processing failed, will retry");
                    self.options.poll_interval
                }
                Err(e) => break Err(e),
            };

            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
        };

        let released = self
            .store
            .release(
                &self.key,
                &self.lock_request().lock_key,
                self.options.instance_id,
            )
            .await;

        match (&outcome, released) {
            (Err(e), _) => tracing::error!(processor = %self.key, error = %e, "processor stopped"),
            (Ok(()), Err(e)) => return Err(e.into()),
            (Ok(()), Ok(_)) => tracing::info!(processor = %self.key, "processor stopped"),
        }
        outcome
    }

    /// Resets every projection and the checkpoint, then replays the log.
    ///
    /// Returns [`ProcessorTick::NotOwner`] without touching anything when
    /// another instance holds the lease.
    #[tracing::instrument(skip(self), fields(processor = %self.key))]
    pub async fn rebuild(&self) -> Result<ProcessorTick> {
        if !self.store.try_acquire(self.lock_request()).await?.acquired {
            return Ok(ProcessorTick::NotOwner);
        }

        for projection in &self.projections {
            projection.reset().await?;
        }
        self.store.reset_checkpoint(&self.key).await?;

        let mut total = 0;
        loop {
            match self.run_once().await? {
                ProcessorTick::NotOwner => return Ok(ProcessorTick::NotOwner),
                ProcessorTick::Processed { messages, position } => {
                    total += messages;
                    if messages < self.options.batch_size {
                        tracing::info!(messages = total, "rebuild complete");
                        return Ok(ProcessorTick::Processed {
                            messages: total,
                            position,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use event_store::{
        AppendOptions, InMemoryEventStore, ManualClock, MessageEnvelope, RecordedMessage, StreamId,
    };
    use std::sync::Arc;
    use tokio::sync::RwLock;

    /// Records the global positions it was handed.
    struct RecordingProjection {
        seen: Arc<RwLock<Vec<GlobalPosition>>>,
    }

    impl RecordingProjection {
        fn new() -> (Self, Arc<RwLock<Vec<GlobalPosition>>>) {
            let seen = Arc::new(RwLock::new(Vec::new()));
            (Self { seen: seen.clone() }, seen)
        }
    }

    #[async_trait]
    impl Projection for RecordingProjection {
        fn name(&self) -> &str {
            "recording"
        }

        fn can_handle(&self) -> &[&'static str] {
            &["Counted"]
        }

        async fn handle(&self, message: &RecordedMessage) -> Result<()> {
            self.seen.write().await.push(message.global_position);
            Ok(())
        }

        async fn reset(&self) -> Result<()> {
            self.seen.write().await.clear();
            Ok(())
        }
    }

    async fn append(store: &InMemoryEventStore, message_type: &str, count: usize) {
        let messages = (0..count)
            .map(|i| MessageEnvelope::event(message_type, serde_json::json!({ "i": i })))
            .collect();
        store
            .append_to_stream(&StreamId::new("counter-1"), messages, AppendOptions::new())
            .await
            .unwrap();
    }

    fn processor(
        store: &InMemoryEventStore,
        options: ProcessorOptions,
    ) -> (
        ProjectionProcessor<InMemoryEventStore>,
        Arc<RwLock<Vec<GlobalPosition>>>,
    ) {
        let (projection, seen) = RecordingProjection::new();
        let mut processor = ProjectionProcessor::new(store.clone(), options);
        processor.register(Box::new(projection));
        (processor, seen)
    }

    #[tokio::test]
    async fn processes_new_messages_and_stores_checkpoint() {
        let store = InMemoryEventStore::new();
        append(&store, "Counted", 3).await;
        let (processor, seen) = processor(&store, ProcessorOptions::new("counter"));

        let tick = processor.run_once().await.unwrap();
        assert_eq!(
            tick,
            ProcessorTick::Processed {
                messages: 3,
                position: Some(GlobalPosition::new(3)),
            }
        );
        assert_eq!(seen.read().await.len(), 3);

        let checkpoint = store.read_checkpoint(processor.key()).await.unwrap().unwrap();
        assert_eq!(checkpoint.position, GlobalPosition::new(3));

        let tick = processor.run_once().await.unwrap();
        assert_eq!(
            tick,
            ProcessorTick::Processed {
                messages: 0,
                position: Some(GlobalPosition::new(3)),
            }
        );
        assert_eq!(seen.read().await.len(), 3);
    }

    #[tokio::test]
    async fn reads_in_batches() {
        let store = InMemoryEventStore::new();
        append(&store, "Counted", 5).await;
        let (processor, seen) = processor(&store, ProcessorOptions::new("counter").batch_size(2));

        let mut ticks = Vec::new();
        for _ in 0..4 {
            ticks.push(processor.run_once().await.unwrap());
        }

        let sizes: Vec<_> = ticks
            .iter()
            .map(|tick| match tick {
                ProcessorTick::Processed { messages, .. } => *messages,
                ProcessorTick::NotOwner => usize::MAX,
            })
            .collect();
        assert_eq!(sizes, vec![2, 2, 1, 0]);
        assert_eq!(
            *seen.read().await,
            (1..=5).map(GlobalPosition::new).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn skips_message_types_it_does_not_handle() {
        let store = InMemoryEventStore::new();
        append(&store, "Ignored", 2).await;
        append(&store, "Counted", 1).await;
        let (processor, seen) = processor(&store, ProcessorOptions::new("counter"));

        processor.run_once().await.unwrap();

        assert_eq!(*seen.read().await, vec![GlobalPosition::new(3)]);
    }

    #[tokio::test]
    async fn second_instance_takes_over_after_lease_expires() {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryEventStore::new().with_clock(clock.clone());
        append(&store, "Counted", 2).await;

        let options = ProcessorOptions::new("counter").lease_timeout(Duration::from_secs(300));
        let (first, first_seen) = processor(&store, options.clone().instance_id(InstanceId::new()));
        let (second, second_seen) =
            processor(&store, options.clone().instance_id(InstanceId::new()));

        assert!(matches!(
            first.run_once().await.unwrap(),
            ProcessorTick::Processed { messages: 2, .. }
        ));
        append(&store, "Counted", 1).await;

        clock.advance(Duration::from_secs(299));
        assert_eq!(second.run_once().await.unwrap(), ProcessorTick::NotOwner);

        clock.advance(Duration::from_secs(2));
        let tick = second.run_once().await.unwrap();

        assert_eq!(
            tick,
            ProcessorTick::Processed {
                messages: 1,
                position: Some(GlobalPosition::new(3)),
            }
        );
        assert_eq!(first_seen.read().await.len(), 2);
        assert_eq!(*second_seen.read().await, vec![GlobalPosition::new(3)]);
        assert_eq!(first.run_once().await.unwrap(), ProcessorTick::NotOwner);
    }

    /// Moves the checkpoint far ahead while handling, like a rival instance would.
    struct RivalProjection {
        store: InMemoryEventStore,
        key: ProcessorKey,
    }

    #[async_trait]
    impl Projection for RivalProjection {
        fn name(&self) -> &str {
            "rival"
        }

        fn can_handle(&self) -> &[&'static str] {
            &["Counted"]
        }

        async fn handle(&self, message: &RecordedMessage) -> Result<()> {
            let current = self.store.read_checkpoint(&self.key).await?;
            self.store
                .store_checkpoint(
                    &self.key,
                    StoreCheckpoint {
                        position: GlobalPosition::new(message.global_position.as_i64() + 100),
                        expected_position: current.map(|c| c.position),
                        transaction_id: None,
                    },
                )
                .await?;
            Ok(())
        }

        async fn reset(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn checkpoint_conflict_stops_the_batch() {
        let store = InMemoryEventStore::new();
        append(&store, "Counted", 2).await;
        let options = ProcessorOptions::new("counter");
        let mut processor = ProjectionProcessor::new(store.clone(), options.clone());
        processor.register(Box::new(RivalProjection {
            store: store.clone(),
            key: options.key(),
        }));

        assert_eq!(processor.run_once().await.unwrap(), ProcessorTick::NotOwner);

        let checkpoint = store.read_checkpoint(&options.key()).await.unwrap().unwrap();
        assert_eq!(checkpoint.position, GlobalPosition::new(102));
    }

    #[tokio::test]
    async fn rebuild_resets_and_replays() {
        let store = InMemoryEventStore::new();
        append(&store, "Counted", 5).await;
        let (processor, seen) = processor(&store, ProcessorOptions::new("counter").batch_size(2));

        while let ProcessorTick::Processed { messages, .. } = processor.run_once().await.unwrap() {
            if messages == 0 {
                break;
            }
        }
        assert_eq!(seen.read().await.len(), 5);

        let tick = processor.rebuild().await.unwrap();

        assert_eq!(
            tick,
            ProcessorTick::Processed {
                messages: 5,
                position: Some(GlobalPosition::new(5)),
            }
        );
        assert_eq!(seen.read().await.len(), 5);
    }

    #[tokio::test]
    async fn rebuild_refuses_without_the_lease() {
        let store = InMemoryEventStore::new();
        append(&store, "Counted", 1).await;
        let (owner, _) = processor(&store, ProcessorOptions::new("counter"));
        let (other, other_seen) = processor(&store, ProcessorOptions::new("counter"));

        owner.run_once().await.unwrap();

        assert_eq!(other.rebuild().await.unwrap(), ProcessorTick::NotOwner);
        assert!(other_seen.read().await.is_empty());
    }

    #[tokio::test]
    async fn run_releases_the_lease_on_shutdown() {
        let store = InMemoryEventStore::new();
        append(&store, "Counted", 3).await;
        let (first, seen) = processor(
            &store,
            ProcessorOptions::new("counter").poll_interval(Duration::from_millis(5)),
        );
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

        let running = async {
            first
                .run(async {
                    let _ = stopped.await;
                })
                .await
        };
        let stopping = async {
            while seen.read().await.len() < 3 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            stop.send(()).unwrap();
        };
        let (result, ()) = tokio::join!(running, stopping);
        result.unwrap();

        let (next, _) = processor(&store, ProcessorOptions::new("counter"));
        assert!(matches!(
            next.run_once().await.unwrap(),
            ProcessorTick::Processed { messages: 0, .. }
        ));
    }
}
