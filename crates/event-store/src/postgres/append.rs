use std::time::Instant;

use chrono::Utc;
use common::{PartitionKey, StreamId};
use sqlx::PgConnection;

use super::{PostgresEventStore, documents};
use crate::{
    AppendOptions, AppendResult, DocumentChange, ExpectedStreamVersion, GlobalPosition,
    MessageEnvelope, RecordedMessage, Result, StreamPosition, TransactionId,
    projection::fold_inline_projection,
};

/// Outcome of claiming the stream row for an append.
enum Claim {
    /// The row now holds the new position; carries the position it was at before.
    Claimed(StreamPosition),
    /// Another writer got there first, or the precondition does not hold.
    Lost,
}

pub(super) async fn append(
    store: &PostgresEventStore,
    stream_id: &StreamId,
    messages: Vec<MessageEnvelope>,
    options: &AppendOptions,
) -> Result<AppendResult> {
    let started = Instant::now();
    let partition = &options.partition;
    let count = messages.len();

    let mut tx = store.pool.begin().await?;

    let expected = match claim_stream(&mut tx, stream_id, options, count).await? {
        Claim::Claimed(expected) => expected,
        Claim::Lost => {
            tx.rollback().await?;
            let mut conn = store.pool.acquire().await?;
            let actual =
                PostgresEventStore::current_position(&mut conn, stream_id, partition).await?;
            tracing::debug!(%stream_id, expected = %options.expected_stream_version, %actual, "append lost the stream claim");
            return Err(options.expected_stream_version.conflict(stream_id, actual));
        }
    };

    let transaction_id: i64 = sqlx::query_scalar("SELECT txid_current()")
        .fetch_one(&mut *tx)
        .await?;
    let transaction_id = TransactionId::new(transaction_id);
    let created_at = Utc::now();

    let mut recorded = Vec::with_capacity(count);
    for (i, message) in messages.into_iter().enumerate() {
        let stream_position = expected.advance(i + 1);
        let metadata_json = serde_json::to_value(&message.metadata)?;

        let global_position: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO messages (
                stream_id, stream_position, partition, message_kind, message_data,
                message_metadata, message_schema_version, message_type, message_id,
                transaction_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING global_position
            "#,
        )
        .bind(stream_id.as_str())
        .bind(stream_position.as_i64())
        .bind(partition.as_str())
        .bind(message.kind.as_code())
        .bind(&message.data)
        .bind(metadata_json)
        .bind(message.schema_version)
        .bind(&message.message_type)
        .bind(message.message_id.as_uuid())
        .bind(transaction_id.as_i64())
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?;

        recorded.push(message.record(
            stream_id,
            partition,
            stream_position,
            GlobalPosition::new(global_position),
            transaction_id,
            created_at,
        ));
    }

    apply_inline_projections(store, &mut tx, stream_id, partition, &recorded).await?;

    tx.commit().await?;

    metrics::counter!("event_store_appends_total").increment(1);
    metrics::histogram!("event_store_append_duration_seconds")
        .record(started.elapsed().as_secs_f64());

    Ok(AppendResult {
        next_expected_stream_version: expected.advance(count),
        global_positions: recorded.iter().map(|m| m.global_position).collect(),
        transaction_id,
        created_new_stream: expected.is_initial(),
    })
}

/// Moves the stream row to its new position, conditionally on the expected one.
async fn claim_stream(
    conn: &mut PgConnection,
    stream_id: &StreamId,
    options: &AppendOptions,
    count: usize,
) -> Result<Claim> {
    let partition = &options.partition;

    match options.expected_stream_version {
        ExpectedStreamVersion::NoConcurrencyCheck => {
            let next: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO streams (stream_id, stream_position, partition, stream_type)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (stream_id, partition, is_archived) DO UPDATE
                SET stream_position = streams.stream_position + EXCLUDED.stream_position
                RETURNING stream_position
                "#,
            )
            .bind(stream_id.as_str())
            .bind(count as i64)
            .bind(partition.as_str())
            .bind(options.stream_type_or_default())
            .fetch_one(&mut *conn)
            .await?;
            Ok(Claim::Claimed(StreamPosition::new(next - count as i64)))
        }
        ExpectedStreamVersion::StreamExists => {
            let current: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT stream_position FROM streams
                WHERE stream_id = $1 AND partition = $2 AND is_archived = FALSE
                FOR UPDATE
                "#,
            )
            .bind(stream_id.as_str())
            .bind(partition.as_str())
            .fetch_optional(&mut *conn)
            .await?;
            match current {
                Some(current) => {
                    advance_stream(conn, stream_id, partition, StreamPosition::new(current), count)
                        .await
                }
                None => Ok(Claim::Lost),
            }
        }
        ExpectedStreamVersion::StreamDoesNotExist => {
            insert_stream(conn, stream_id, options, count).await
        }
        ExpectedStreamVersion::Exact(expected) if expected.is_initial() => {
            insert_stream(conn, stream_id, options, count).await
        }
        ExpectedStreamVersion::Exact(expected) => {
            advance_stream(conn, stream_id, partition, expected, count).await
        }
    }
}

async fn insert_stream(
    conn: &mut PgConnection,
    stream_id: &StreamId,
    options: &AppendOptions,
    count: usize,
) -> Result<Claim> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO streams (stream_id, stream_position, partition, stream_type)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(stream_id.as_str())
    .bind(count as i64)
    .bind(options.partition.as_str())
    .bind(options.stream_type_or_default())
    .execute(&mut *conn)
    .await;

    match inserted {
        Ok(_) => Ok(Claim::Claimed(StreamPosition::initial())),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(Claim::Lost),
        Err(e) => Err(e.into()),
    }
}

async fn advance_stream(
    conn: &mut PgConnection,
    stream_id: &StreamId,
    partition: &PartitionKey,
    expected: StreamPosition,
    count: usize,
) -> Result<Claim> {
    let updated = sqlx::query(
        r#"
        UPDATE streams SET stream_position = $4
        WHERE stream_id = $1 AND partition = $2 AND stream_position = $3 AND is_archived = FALSE
        "#,
    )
    .bind(stream_id.as_str())
    .bind(partition.as_str())
    .bind(expected.as_i64())
    .bind(expected.advance(count).as_i64())
    .execute(&mut *conn)
    .await?;

    if updated.rows_affected() == 0 {
        Ok(Claim::Lost)
    } else {
        Ok(Claim::Claimed(expected))
    }
}

async fn apply_inline_projections(
    store: &PostgresEventStore,
    conn: &mut PgConnection,
    stream_id: &StreamId,
    partition: &PartitionKey,
    recorded: &[RecordedMessage],
) -> Result<()> {
    for projection in store.projections.iter() {
        if !recorded.iter().any(|m| projection.handles(&m.message_type)) {
            continue;
        }
        let collection = projection.name();
        let current =
            documents::find_for_update(conn, collection, partition, stream_id.as_str()).await?;

        match fold_inline_projection(projection.as_ref(), stream_id, current, recorded)? {
            DocumentChange::Unchanged => {}
            DocumentChange::Upsert(document) => {
                documents::write(conn, collection, partition, &document).await?;
            }
            DocumentChange::Delete => {
                documents::delete(conn, collection, partition, stream_id.as_str()).await?;
            }
        }
    }
    Ok(())
}
