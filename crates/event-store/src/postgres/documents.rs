use async_trait::async_trait;
use common::PartitionKey;
use sqlx::{PgConnection, Row, postgres::PgRow};

use super::PostgresEventStore;
use crate::{
    DocumentStore, EventStoreError, ProjectionDocument, Result, StreamPosition,
    projection::check_document_version,
};

fn row_to_document(document_id: &str, row: PgRow) -> Result<ProjectionDocument> {
    Ok(ProjectionDocument {
        id: document_id.to_string(),
        data: row.try_get("data")?,
        version: row.try_get("version")?,
        last_stream_position: row
            .try_get::<Option<i64>, _>("last_stream_position")?
            .map(StreamPosition::new),
    })
}

/// Loads a document and locks it for the rest of the transaction.
pub(super) async fn find_for_update(
    conn: &mut PgConnection,
    collection: &str,
    partition: &PartitionKey,
    document_id: &str,
) -> Result<Option<ProjectionDocument>> {
    let row = sqlx::query(
        r#"
        SELECT data, version, last_stream_position
        FROM projection_documents
        WHERE collection = $1 AND partition = $2 AND document_id = $3
        FOR UPDATE
        "#,
    )
    .bind(collection)
    .bind(partition.as_str())
    .bind(document_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(|row| row_to_document(document_id, row)).transpose()
}

/// Writes a document folded by an inline projection, as is.
pub(super) async fn write(
    conn: &mut PgConnection,
    collection: &str,
    partition: &PartitionKey,
    document: &ProjectionDocument,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO projection_documents
            (collection, partition, document_id, data, version, last_stream_position)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (collection, partition, document_id) DO UPDATE SET
            data = EXCLUDED.data,
            version = EXCLUDED.version,
            last_stream_position = EXCLUDED.last_stream_position,
            updated_at = now()
        "#,
    )
    .bind(collection)
    .bind(partition.as_str())
    .bind(&document.id)
    .bind(&document.data)
    .bind(document.version)
    .bind(document.last_stream_position.map(|p| p.as_i64()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(super) async fn delete(
    conn: &mut PgConnection,
    collection: &str,
    partition: &PartitionKey,
    document_id: &str,
) -> Result<bool> {
    let deleted = sqlx::query(
        "DELETE FROM projection_documents WHERE collection = $1 AND partition = $2 AND document_id = $3",
    )
    .bind(collection)
    .bind(partition.as_str())
    .bind(document_id)
    .execute(&mut *conn)
    .await?;
    Ok(deleted.rows_affected() > 0)
}

async fn stored_version(
    conn: &mut PgConnection,
    collection: &str,
    partition: &PartitionKey,
    document_id: &str,
) -> Result<i64> {
    let version: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT version FROM projection_documents
        WHERE collection = $1 AND partition = $2 AND document_id = $3
        "#,
    )
    .bind(collection)
    .bind(partition.as_str())
    .bind(document_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(version.unwrap_or(0))
}

#[async_trait]
impl DocumentStore for PostgresEventStore {
    async fn find_document(
        &self,
        collection: &str,
        partition: &PartitionKey,
        document_id: &str,
    ) -> Result<Option<ProjectionDocument>> {
        self.ensure_open()?;
        let row = sqlx::query(
            r#"
            SELECT data, version, last_stream_position
            FROM projection_documents
            WHERE collection = $1 AND partition = $2 AND document_id = $3
            "#,
        )
        .bind(collection)
        .bind(partition.as_str())
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row_to_document(document_id, row)).transpose()
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
        let mut conn = self.pool.acquire().await?;

        let current = stored_version(&mut conn, collection, partition, document_id).await?;
        check_document_version(collection, document_id, expected_version, current)?;

        // The write only lands if nobody moved the document since it was read.
        let row = sqlx::query(
            r#"
            INSERT INTO projection_documents (collection, partition, document_id, data, version)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (collection, partition, document_id) DO UPDATE SET
                data = EXCLUDED.data,
                version = EXCLUDED.version,
                updated_at = now()
            WHERE projection_documents.version = $6
            RETURNING data, version, last_stream_position
            "#,
        )
        .bind(collection)
        .bind(partition.as_str())
        .bind(document_id)
        .bind(&data)
        .bind(current + 1)
        .bind(current)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => row_to_document(document_id, row),
            None => {
                let actual = stored_version(&mut conn, collection, partition, document_id).await?;
                Err(EventStoreError::DocumentVersionConflict {
                    collection: collection.to_string(),
                    document_id: document_id.to_string(),
                    expected: expected_version.unwrap_or(current),
                    actual,
                })
            }
        }
    }

    async fn delete_document(
        &self,
        collection: &str,
        partition: &PartitionKey,
        document_id: &str,
    ) -> Result<bool> {
        self.ensure_open()?;
        let mut conn = self.pool.acquire().await?;
        delete(&mut conn, collection, partition, document_id).await
    }

    async fn clear_collection(&self, collection: &str, partition: &PartitionKey) -> Result<u64> {
        self.ensure_open()?;
        let deleted =
            sqlx::query("DELETE FROM projection_documents WHERE collection = $1 AND partition = $2")
                .bind(collection)
                .bind(partition.as_str())
                .execute(&self.pool)
                .await?;
        Ok(deleted.rows_affected())
    }
}
