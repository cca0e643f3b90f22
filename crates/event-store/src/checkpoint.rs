//! Resumable reader positions, persisted with compare-and-swap.

use async_trait::async_trait;
use common::PartitionKey;
use serde::{Deserialize, Serialize};

use crate::{GlobalPosition, Result, TransactionId};

/// Identity of a processor: its checkpoint and its ownership record share it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessorKey {
    pub processor_id: String,
    pub partition: PartitionKey,
    pub version: i32,
}

impl ProcessorKey {
    /// Version 1 of a processor in the default partition.
    pub fn new(processor_id: impl Into<String>) -> Self {
        Self {
            processor_id: processor_id.into(),
            partition: PartitionKey::default(),
            version: 1,
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
}

impl std::fmt::Display for ProcessorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:v{}", self.partition, self.processor_id, self.version)
    }
}

/// Last processed position of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub position: GlobalPosition,
    /// Transaction observed at that position.
    pub transaction_id: Option<TransactionId>,
}

/// Compare-and-swap request for a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCheckpoint {
    pub position: GlobalPosition,
    /// Position the caller last observed; `None` when it has never stored one.
    pub expected_position: Option<GlobalPosition>,
    pub transaction_id: Option<TransactionId>,
}

/// Three-way outcome of a checkpoint compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreCheckpointResult {
    /// The stored position matched the expected one and was replaced.
    Updated,
    /// The stored position already equals the requested one; nothing written.
    AlreadyAtPosition,
    /// The stored position moved on since the caller read it.
    Conflict { current: Option<GlobalPosition> },
}

impl StoreCheckpointResult {
    /// `Updated` and `AlreadyAtPosition` both leave the checkpoint where the caller wants it.
    pub fn is_success(&self) -> bool {
        !matches!(self, StoreCheckpointResult::Conflict { .. })
    }
}

/// Decides the compare-and-swap outcome against the currently stored position.
pub(crate) fn compare_checkpoint(
    current: Option<GlobalPosition>,
    request: &StoreCheckpoint,
) -> StoreCheckpointResult {
    if current == Some(request.position) {
        StoreCheckpointResult::AlreadyAtPosition
    } else if current == request.expected_position {
        StoreCheckpointResult::Updated
    } else {
        StoreCheckpointResult::Conflict { current }
    }
}

/// Durable checkpoints for resumable readers.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn read_checkpoint(&self, key: &ProcessorKey) -> Result<Option<Checkpoint>>;

    async fn store_checkpoint(
        &self,
        key: &ProcessorKey,
        request: StoreCheckpoint,
    ) -> Result<StoreCheckpointResult>;

    /// Forgets the checkpoint so the processor starts from the beginning.
    async fn reset_checkpoint(&self, key: &ProcessorKey) -> Result<()>;
}
