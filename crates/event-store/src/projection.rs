//! Inline projections and the document storage they write to.
//!
//! An inline projection runs inside the append that produced its messages, so
//! the document it maintains is never stale with respect to its stream. Each
//! document remembers the last stream position folded into it, which turns
//! re-delivery of an already applied message into a no-op.

use std::marker::PhantomData;

use async_trait::async_trait;
use common::{PartitionKey, StreamId};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{DomainEvent, EventStoreError, RecordedMessage, Result, StreamPosition};

/// A read-model document maintained by a projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionDocument {
    pub id: String,
    pub data: serde_json::Value,
    /// Incremented on every write.
    pub version: i64,
    /// Last stream position folded in by an inline projection.
    pub last_stream_position: Option<StreamPosition>,
}

impl ProjectionDocument {
    /// Deserializes the document body.
    pub fn decode<D: DeserializeOwned>(&self) -> std::result::Result<D, serde_json::Error> {
        D::deserialize(&self.data)
    }
}

/// A projection folded synchronously within the append transaction.
///
/// The document is keyed by the stream id of the appended messages.
pub trait InlineProjection: Send + Sync {
    /// Name of the projection; also the document collection it writes to.
    fn name(&self) -> &str;

    /// Message types this projection folds. Other messages are ignored.
    fn can_handle(&self) -> &[&'static str];

    /// Folds one message into the current document body.
    ///
    /// Returning `None` deletes the document.
    fn evolve(
        &self,
        document: Option<serde_json::Value>,
        message: &RecordedMessage,
    ) -> Result<Option<serde_json::Value>>;

    fn handles(&self, message_type: &str) -> bool {
        self.can_handle().contains(&message_type)
    }
}

/// What an inline projection run decided to do with its document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentChange {
    Unchanged,
    Upsert(ProjectionDocument),
    Delete,
}

/// Folds `messages` into `current`, skipping anything at or before the
/// document's last folded stream position.
pub fn fold_inline_projection(
    projection: &dyn InlineProjection,
    stream_id: &StreamId,
    current: Option<ProjectionDocument>,
    messages: &[RecordedMessage],
) -> Result<DocumentChange> {
    let existed = current.is_some();
    let (mut data, mut version, mut last_position) = match current {
        Some(document) => (
            Some(document.data),
            document.version,
            document.last_stream_position,
        ),
        None => (None, 0, None),
    };

    let mut applied = 0usize;
    for message in messages {
        if !projection.handles(&message.message_type) {
            continue;
        }
        if last_position.is_some_and(|last| message.stream_position <= last) {
            tracing::debug!(
                projection = projection.name(),
                stream_id = %stream_id,
                position = %message.stream_position,
                "skipping already projected message"
            );
            continue;
        }
        data = projection.evolve(data, message)?;
        version += 1;
        last_position = Some(message.stream_position);
        applied += 1;
    }

    if applied == 0 {
        return Ok(DocumentChange::Unchanged);
    }

    Ok(match data {
        Some(data) => DocumentChange::Upsert(ProjectionDocument {
            id: stream_id.to_string(),
            data,
            version,
            last_stream_position: last_position,
        }),
        None if existed => DocumentChange::Delete,
        None => DocumentChange::Unchanged,
    })
}

/// Typed single-stream projection built from an `evolve` function.
///
/// The document is deserialized into `D`, the message into `E`, and the
/// result serialized back.
pub struct SingleStreamProjection<D, E> {
    name: &'static str,
    can_handle: &'static [&'static str],
    evolve: fn(D, &E) -> D,
    initial_state: fn() -> D,
    _phantom: PhantomData<fn() -> (D, E)>,
}

impl<D, E> SingleStreamProjection<D, E> {
    pub fn new(
        name: &'static str,
        can_handle: &'static [&'static str],
        evolve: fn(D, &E) -> D,
        initial_state: fn() -> D,
    ) -> Self {
        Self {
            name,
            can_handle,
            evolve,
            initial_state,
            _phantom: PhantomData,
        }
    }
}

impl<D, E> InlineProjection for SingleStreamProjection<D, E>
where
    D: Serialize + DeserializeOwned,
    E: DomainEvent,
{
    fn name(&self) -> &str {
        self.name
    }

    fn can_handle(&self) -> &[&'static str] {
        self.can_handle
    }

    fn evolve(
        &self,
        document: Option<serde_json::Value>,
        message: &RecordedMessage,
    ) -> Result<Option<serde_json::Value>> {
        let state = match document {
            Some(value) => serde_json::from_value(value)?,
            None => (self.initial_state)(),
        };
        let event: E = message.decode().map_err(|e| EventStoreError::Projection {
            projection: self.name.to_string(),
            reason: format!("cannot decode {}: {e}", message.message_type),
        })?;
        let state = (self.evolve)(state, &event);
        Ok(Some(serde_json::to_value(state)?))
    }
}

/// Storage for projection documents, grouped in named collections per partition.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_document(
        &self,
        collection: &str,
        partition: &PartitionKey,
        document_id: &str,
    ) -> Result<Option<ProjectionDocument>>;

    /// Inserts or replaces a document.
    ///
    /// With `expected_version` set, the write fails with
    /// `DocumentVersionConflict` unless the stored version matches (0 = absent).
    async fn upsert_document(
        &self,
        collection: &str,
        partition: &PartitionKey,
        document_id: &str,
        data: serde_json::Value,
        expected_version: Option<i64>,
    ) -> Result<ProjectionDocument>;

    /// Returns whether a document was deleted.
    async fn delete_document(
        &self,
        collection: &str,
        partition: &PartitionKey,
        document_id: &str,
    ) -> Result<bool>;

    /// Deletes every document of a collection, returning how many were removed.
    async fn clear_collection(&self, collection: &str, partition: &PartitionKey) -> Result<u64>;
}

pub(crate) fn check_document_version(
    collection: &str,
    document_id: &str,
    expected: Option<i64>,
    actual: i64,
) -> Result<()> {
    match expected {
        Some(expected) if expected != actual => Err(EventStoreError::DocumentVersionConflict {
            collection: collection.to_string(),
            document_id: document_id.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}
