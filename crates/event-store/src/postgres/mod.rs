//! PostgreSQL realization of the message log.
//!
//! Streams and messages live in list-partitioned tables keyed by tenant
//! partition. An append is one database transaction: the stream row is
//! claimed with a conditional write, the messages are inserted with the id of
//! that transaction, inline projections update their documents, and the
//! whole unit commits or rolls back together.

mod append;
mod documents;
mod processors;
pub mod schema;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::{PartitionKey, StreamId};
use sqlx::{PgConnection, PgPool, Row, postgres::PgPoolOptions, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AppendOptions, AppendResult, EventStore, EventStoreError, GlobalPosition, InlineProjection,
    MessageEnvelope, MessageId, MessageKind, ReadAllOptions, ReadAllResult, ReadStreamOptions,
    ReadStreamResult, RecordedMessage, Result, StreamPosition, TransactionId,
    store::validate_messages_for_append,
};

const MESSAGE_COLUMNS: &str = "stream_id, stream_position, partition, message_kind, message_data, \
     message_metadata, message_schema_version, message_type, message_id, global_position, \
     transaction_id, created_at";

/// PostgreSQL-backed event store implementation.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    projections: Arc<Vec<Arc<dyn InlineProjection>>>,
    closed: Arc<AtomicBool>,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL event store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            projections: Arc::default(),
            closed: Arc::default(),
        }
    }

    /// Opens a connection pool and creates a store on top of it.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Registers a projection run inside every append it can handle.
    pub fn with_inline_projection(mut self, projection: Arc<dyn InlineProjection>) -> Self {
        Arc::make_mut(&mut self.projections).push(projection);
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates dedicated `streams`/`messages` partitions for a tenant.
    ///
    /// Must run before the partition's first append: rows already routed to
    /// the default partition would clash with the new one.
    pub async fn create_partition(&self, partition: &PartitionKey) -> Result<()> {
        self.ensure_open()?;
        schema::validate_partition_name(partition.as_str())?;
        let sql = schema::create_partition_sql(partition.as_str());
        sqlx::Executor::execute(&self.pool, sql.as_str()).await?;
        tracing::info!(%partition, "created partition");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventStoreError::Closed);
        }
        Ok(())
    }

    async fn current_position(
        conn: &mut PgConnection,
        stream_id: &StreamId,
        partition: &PartitionKey,
    ) -> Result<StreamPosition> {
        let position: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT stream_position FROM streams
            WHERE stream_id = $1 AND partition = $2 AND is_archived = FALSE
            "#,
        )
        .bind(stream_id.as_str())
        .bind(partition.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        Ok(position.map(StreamPosition::new).unwrap_or_default())
    }

    fn row_to_message(row: PgRow) -> Result<RecordedMessage> {
        let metadata_json: serde_json::Value = row.try_get("message_metadata")?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;
        let kind: String = row.try_get("message_kind")?;

        Ok(RecordedMessage {
            stream_id: StreamId::new(row.try_get::<String, _>("stream_id")?),
            partition: PartitionKey::new(row.try_get::<String, _>("partition")?),
            stream_position: StreamPosition::new(row.try_get("stream_position")?),
            global_position: GlobalPosition::new(row.try_get("global_position")?),
            transaction_id: TransactionId::new(row.try_get("transaction_id")?),
            created_at: row.try_get("created_at")?,
            message_id: MessageId::from_uuid(row.try_get::<Uuid, _>("message_id")?),
            kind: MessageKind::from_code(&kind).unwrap_or_default(),
            message_type: row.try_get("message_type")?,
            schema_version: row.try_get("message_schema_version")?,
            data: row.try_get("message_data")?,
            metadata,
        })
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[tracing::instrument(skip(self))]
    async fn init(&self) -> Result<()> {
        self.ensure_open()?;
        let applied = schema::migrate(&self.pool).await?;
        if !applied.is_empty() {
            tracing::info!(?applied, "schema migrated");
        }

        for projection in self.projections.iter() {
            sqlx::query(
                r#"
                INSERT INTO projections (name, kind, status)
                VALUES ($1, 'inline', 'active')
                ON CONFLICT (name, partition, version) DO NOTHING
                "#,
            )
            .bind(projection.name())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, messages, options), fields(messages = messages.len(), partition = %options.partition))]
    async fn append_to_stream(
        &self,
        stream_id: &StreamId,
        messages: Vec<MessageEnvelope>,
        options: AppendOptions,
    ) -> Result<AppendResult> {
        self.ensure_open()?;
        validate_messages_for_append(&messages)?;
        append::append(self, stream_id, messages, &options).await
    }

    async fn read_stream(
        &self,
        stream_id: &StreamId,
        options: ReadStreamOptions,
    ) -> Result<Option<ReadStreamResult>> {
        self.ensure_open()?;

        // Version and messages come from one snapshot.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let current = Self::current_position(&mut tx, stream_id, &options.partition).await?;
        if let Some(expected) = options.expected_stream_version {
            expected.assert_for_read(stream_id, current)?;
        }
        if current.is_initial() {
            return Ok(None);
        }

        let (from, to) = options.bounds();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE stream_id = $1 AND partition = $2 AND is_archived = FALSE
              AND stream_position >= $3
              AND ($4::BIGINT IS NULL OR stream_position <= $4)
            ORDER BY stream_position ASC
            "#
        ))
        .bind(stream_id.as_str())
        .bind(options.partition.as_str())
        .bind(from.as_i64())
        .bind(to.map(|to| to.as_i64()))
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let messages = rows
            .into_iter()
            .map(Self::row_to_message)
            .collect::<Result<Vec<_>>>()?;

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
        let mut conn = self.pool.acquire().await?;
        let current = Self::current_position(&mut conn, stream_id, partition).await?;
        Ok((!current.is_initial()).then_some(current))
    }

    async fn read_all(&self, options: ReadAllOptions) -> Result<ReadAllResult> {
        self.ensure_open()?;

        // Messages of transactions still in flight (or younger than one that
        // is) stay hidden until everything before them has committed.
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE partition = $1 AND is_archived = FALSE
              AND global_position > $2
              AND transaction_id < txid_snapshot_xmin(txid_current_snapshot())
            ORDER BY global_position ASC
            LIMIT $3
            "#
        ))
        .bind(options.partition.as_str())
        .bind(options.after.as_i64())
        .bind(options.batch_size as i64)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .into_iter()
            .map(Self::row_to_message)
            .collect::<Result<Vec<_>>>()?;
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
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pool.close().await;
        }
        Ok(())
    }
}
