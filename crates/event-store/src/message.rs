use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{PartitionKey, StreamId};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and should be named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the event type name.
    ///
    /// Stored as the message type and used by projections to filter messages.
    fn event_type(&self) -> &'static str;
}

/// Caller-assigned identifier of a message, used to detect re-delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a message ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a message within its stream.
///
/// Positions start at 1 for the first message; 0 means the stream does not
/// exist yet. After N appended messages the stream is at position N.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StreamPosition(i64);

impl StreamPosition {
    /// Creates a new position from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the position of a stream that does not exist (0).
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the position of the first message (1).
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next position.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the position `count` messages further.
    pub fn advance(&self, count: usize) -> Self {
        Self(self.0 + count as i64)
    }

    /// Returns true when no message was ever appended.
    pub fn is_initial(&self) -> bool {
        self.0 == 0
    }

    /// Returns the raw position value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for StreamPosition {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<StreamPosition> for i64 {
    fn from(position: StreamPosition) -> Self {
        position.0
    }
}

/// Log-wide ordinal assigned by the store.
///
/// Monotonic but not gapless: aborted transactions leave holes, so it is
/// ordering information, never a count.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GlobalPosition(i64);

impl GlobalPosition {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Position before the first message of the log.
    pub fn start() -> Self {
        Self(0)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for GlobalPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for GlobalPosition {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Identifier of the atomic unit that committed a batch of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(i64);

impl TransactionId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MessageKind {
    #[default]
    Event,
}

impl MessageKind {
    /// Single-letter code persisted in the `message_kind` column.
    pub fn as_code(&self) -> &'static str {
        match self {
            MessageKind::Event => "E",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "E" => Some(MessageKind::Event),
            _ => None,
        }
    }
}

/// A message to be appended to a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Caller-assigned id; defaults to a random one.
    pub message_id: MessageId,

    pub kind: MessageKind,

    /// The type of the message (e.g., "ProductItemAdded").
    pub message_type: String,

    pub schema_version: i32,

    /// The message payload as JSON.
    pub data: serde_json::Value,

    /// Additional metadata about the message.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MessageEnvelope {
    /// Creates an event message with a random id and schema version 1.
    pub fn event(message_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            message_id: MessageId::new(),
            kind: MessageKind::Event,
            message_type: message_type.into(),
            schema_version: 1,
            data,
            metadata: HashMap::new(),
        }
    }

    /// Serializes a domain event into an event message.
    pub fn from_event<E: DomainEvent>(event: &E) -> Result<Self, serde_json::Error> {
        Ok(Self::event(event.event_type(), serde_json::to_value(event)?))
    }

    /// Sets the message id, e.g. to make re-delivery detectable.
    pub fn with_message_id(mut self, id: MessageId) -> Self {
        self.message_id = id;
        self
    }

    pub fn with_schema_version(mut self, schema_version: i32) -> Self {
        self.schema_version = schema_version;
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub(crate) fn record(
        self,
        stream_id: &StreamId,
        partition: &PartitionKey,
        stream_position: StreamPosition,
        global_position: GlobalPosition,
        transaction_id: TransactionId,
        created_at: DateTime<Utc>,
    ) -> RecordedMessage {
        RecordedMessage {
            stream_id: stream_id.clone(),
            partition: partition.clone(),
            stream_position,
            global_position,
            transaction_id,
            created_at,
            message_id: self.message_id,
            kind: self.kind,
            message_type: self.message_type,
            schema_version: self.schema_version,
            data: self.data,
            metadata: self.metadata,
        }
    }
}

/// A message as stored in the log, with the positions the store assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedMessage {
    pub stream_id: StreamId,
    pub partition: PartitionKey,
    pub stream_position: StreamPosition,
    pub global_position: GlobalPosition,
    pub transaction_id: TransactionId,
    pub created_at: DateTime<Utc>,
    pub message_id: MessageId,
    pub kind: MessageKind,
    pub message_type: String,
    pub schema_version: i32,
    pub data: serde_json::Value,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RecordedMessage {
    /// Deserializes the payload into a concrete event type.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        E::deserialize(&self.data)
    }
}
