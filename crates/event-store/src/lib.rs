//! Partitioned, append-only message log with optimistic concurrency.
//!
//! Messages are grouped into streams and appended with an expected stream
//! version; a mismatch fails the append without writing anything. Streams are
//! read back as slices or folded into state, the whole log is read in global
//! position order for subscriptions, and processors coordinate through
//! checkpoints and leases.

pub mod checkpoint;
pub mod error;
pub mod lock;
pub mod memory;
pub mod message;
pub mod postgres;
pub mod projection;
pub mod read;
pub mod store;
pub mod version;

pub use checkpoint::{
    Checkpoint, CheckpointStore, ProcessorKey, StoreCheckpoint, StoreCheckpointResult,
};
pub use common::{InstanceId, PartitionKey, StreamId};
pub use error::{EventStoreError, Result};
pub use lock::{
    Clock, DEFAULT_LEASE_TIMEOUT, LockAcquisition, ManualClock, OwnershipRecord, ProcessorLock,
    ProcessorStatus, SystemClock, TryAcquireLock,
};
pub use memory::InMemoryEventStore;
pub use message::{
    DomainEvent, GlobalPosition, MessageEnvelope, MessageId, MessageKind, RecordedMessage,
    StreamPosition, TransactionId,
};
pub use postgres::PostgresEventStore;
pub use projection::{
    DocumentChange, DocumentStore, InlineProjection, ProjectionDocument, SingleStreamProjection,
};
pub use read::{ReadAllOptions, ReadAllResult, ReadStreamOptions, ReadStreamResult};
pub use store::{
    AggregateStreamResult, AppendOptions, AppendResult, DEFAULT_STREAM_TYPE, EventStore,
    EventStoreExt, MessageStream,
};
pub use version::{
    ExpectedStreamVersion, NO_CONCURRENCY_CHECK, STREAM_DOES_NOT_EXIST, STREAM_EXISTS,
};
