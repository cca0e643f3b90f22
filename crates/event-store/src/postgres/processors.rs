use async_trait::async_trait;
use common::InstanceId;
use sqlx::{PgConnection, Row};

use super::PostgresEventStore;
use crate::{
    Checkpoint, CheckpointStore, GlobalPosition, LockAcquisition, ProcessorKey, ProcessorLock,
    ProcessorStatus, Result, StoreCheckpoint, StoreCheckpointResult, TransactionId,
    TryAcquireLock, checkpoint::compare_checkpoint,
};

fn to_checkpoint(position: Option<i64>, transaction_id: Option<i64>) -> Option<Checkpoint> {
    position.map(|position| Checkpoint {
        position: GlobalPosition::new(position),
        transaction_id: transaction_id.map(TransactionId::new),
    })
}

/// Current checkpoint position, `None` for a missing row as well as an unset position.
async fn stored_position(conn: &mut PgConnection, key: &ProcessorKey) -> Result<Option<i64>> {
    let position: Option<Option<i64>> = sqlx::query_scalar(
        r#"
        SELECT last_processed_position FROM processors
        WHERE processor_id = $1 AND partition = $2 AND version = $3
        "#,
    )
    .bind(&key.processor_id)
    .bind(key.partition.as_str())
    .bind(key.version)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(position.flatten())
}

#[async_trait]
impl CheckpointStore for PostgresEventStore {
    async fn read_checkpoint(&self, key: &ProcessorKey) -> Result<Option<Checkpoint>> {
        self.ensure_open()?;
        let row = sqlx::query(
            r#"
            SELECT last_processed_position, last_processed_transaction_id
            FROM processors
            WHERE processor_id = $1 AND partition = $2 AND version = $3
            "#,
        )
        .bind(&key.processor_id)
        .bind(key.partition.as_str())
        .bind(key.version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(to_checkpoint(
                row.try_get("last_processed_position")?,
                row.try_get("last_processed_transaction_id")?,
            )),
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self, request), fields(position = %request.position))]
    async fn store_checkpoint(
        &self,
        key: &ProcessorKey,
        request: StoreCheckpoint,
    ) -> Result<StoreCheckpointResult> {
        self.ensure_open()?;
        let mut tx = self.pool.begin().await?;

        let existing: Option<Option<i64>> = sqlx::query_scalar(
            r#"
            SELECT last_processed_position FROM processors
            WHERE processor_id = $1 AND partition = $2 AND version = $3
            FOR UPDATE
            "#,
        )
        .bind(&key.processor_id)
        .bind(key.partition.as_str())
        .bind(key.version)
        .fetch_optional(&mut *tx)
        .await?;

        let current = existing.flatten().map(GlobalPosition::new);
        let result = compare_checkpoint(current, &request);
        if result != StoreCheckpointResult::Updated {
            return Ok(result);
        }

        let written = if existing.is_some() {
            sqlx::query(
                r#"
                UPDATE processors
                SET last_processed_position = $4, last_processed_transaction_id = $5
                WHERE processor_id = $1 AND partition = $2 AND version = $3
                "#,
            )
            .bind(&key.processor_id)
            .bind(key.partition.as_str())
            .bind(key.version)
            .bind(request.position.as_i64())
            .bind(request.transaction_id.map(|t| t.as_i64()))
            .execute(&mut *tx)
            .await?
        } else {
            sqlx::query(
                r#"
                INSERT INTO processors (
                    processor_id, partition, version,
                    last_processed_position, last_processed_transaction_id
                )
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (processor_id, partition, version) DO NOTHING
                "#,
            )
            .bind(&key.processor_id)
            .bind(key.partition.as_str())
            .bind(key.version)
            .bind(request.position.as_i64())
            .bind(request.transaction_id.map(|t| t.as_i64()))
            .execute(&mut *tx)
            .await?
        };

        if written.rows_affected() == 0 {
            // A concurrent first write created the row in the meantime.
            tx.rollback().await?;
            let current = {
                let mut conn = self.pool.acquire().await?;
                stored_position(&mut conn, key).await?.map(GlobalPosition::new)
            };
            return match compare_checkpoint(current, &request) {
                // The row exists now, so the retry takes the locked update path.
                StoreCheckpointResult::Updated => self.store_checkpoint(key, request).await,
                outcome => Ok(outcome),
            };
        }

        tx.commit().await?;
        Ok(StoreCheckpointResult::Updated)
    }

    async fn reset_checkpoint(&self, key: &ProcessorKey) -> Result<()> {
        self.ensure_open()?;
        sqlx::query(
            r#"
            UPDATE processors
            SET last_processed_position = NULL, last_processed_transaction_id = NULL
            WHERE processor_id = $1 AND partition = $2 AND version = $3
            "#,
        )
        .bind(&key.processor_id)
        .bind(key.partition.as_str())
        .bind(key.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessorLock for PostgresEventStore {
    #[tracing::instrument(skip(self, request), fields(key = %request.key, instance_id = %request.instance_id))]
    async fn try_acquire(&self, request: TryAcquireLock) -> Result<LockAcquisition> {
        self.ensure_open()?;
        let mut tx = self.pool.begin().await?;

        let locked: bool =
            sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(&request.lock_key)
                .fetch_one(&mut *tx)
                .await?;
        if !locked {
            return Ok(LockAcquisition::not_acquired());
        }

        // Take the row if it is free, ours, or its owner stopped heartbeating.
        let row = sqlx::query(
            r#"
            INSERT INTO processors (processor_id, partition, version, instance_id, status, last_updated)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (processor_id, partition, version) DO UPDATE SET
                instance_id = EXCLUDED.instance_id,
                status = EXCLUDED.status,
                last_updated = now()
            WHERE processors.instance_id = EXCLUDED.instance_id
               OR processors.instance_id IS NULL
               OR processors.status = $6
               OR processors.last_updated < now() - make_interval(secs => $7)
            RETURNING last_processed_position, last_processed_transaction_id
            "#,
        )
        .bind(&request.key.processor_id)
        .bind(request.key.partition.as_str())
        .bind(request.key.version)
        .bind(request.instance_id.as_uuid())
        .bind(ProcessorStatus::Running.as_str())
        .bind(ProcessorStatus::Stopped.as_str())
        .bind(request.lease_timeout.as_secs_f64())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(LockAcquisition::not_acquired());
        };
        let checkpoint = to_checkpoint(
            row.try_get("last_processed_position")?,
            row.try_get("last_processed_transaction_id")?,
        );
        tx.commit().await?;

        Ok(LockAcquisition::acquired(checkpoint))
    }

    async fn release(
        &self,
        key: &ProcessorKey,
        lock_key: &str,
        instance_id: InstanceId,
    ) -> Result<bool> {
        self.ensure_open()?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(lock_key)
            .execute(&mut *tx)
            .await?;

        let released = sqlx::query(
            r#"
            UPDATE processors SET status = $5, last_updated = now()
            WHERE processor_id = $1 AND partition = $2 AND version = $3
              AND instance_id = $4 AND status = $6
            "#,
        )
        .bind(&key.processor_id)
        .bind(key.partition.as_str())
        .bind(key.version)
        .bind(instance_id.as_uuid())
        .bind(ProcessorStatus::Stopped.as_str())
        .bind(ProcessorStatus::Running.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(released.rows_affected() > 0)
    }
}
