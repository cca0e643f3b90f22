//! Versioned, additive schema for the PostgreSQL message log.
//!
//! Migrations only ever add tables, columns and indexes, and every statement
//! is guarded with `IF NOT EXISTS`, so instances still running an older
//! build keep working against a newer schema.

use sqlx::{Executor, PgPool};

use crate::{EventStoreError, Result};

/// Advisory lock id serializing concurrent `init()` calls.
const SCHEMA_LOCK_ID: i64 = 0x6d65_7373_6167_6573;

pub(crate) struct Migration {
    pub version: i32,
    pub name: &'static str,
    pub sql: &'static str,
}

/// SQL for the migration bookkeeping table.
pub const CREATE_SCHEMA_MIGRATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INT PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

/// SQL for the streams and messages tables, list-partitioned by tenant.
pub const CREATE_MESSAGE_LOG: &str = r#"
CREATE SEQUENCE IF NOT EXISTS global_message_position;

CREATE TABLE IF NOT EXISTS streams (
    stream_id TEXT NOT NULL,
    stream_position BIGINT NOT NULL,
    partition TEXT NOT NULL DEFAULT 'global',
    stream_type TEXT NOT NULL,
    stream_metadata JSONB NOT NULL DEFAULT '{}',
    is_archived BOOLEAN NOT NULL DEFAULT FALSE,
    PRIMARY KEY (stream_id, partition, is_archived)
) PARTITION BY LIST (partition);

CREATE TABLE IF NOT EXISTS streams_default PARTITION OF streams DEFAULT;

CREATE TABLE IF NOT EXISTS messages (
    stream_id TEXT NOT NULL,
    stream_position BIGINT NOT NULL,
    partition TEXT NOT NULL DEFAULT 'global',
    message_kind TEXT NOT NULL DEFAULT 'E',
    message_data JSONB NOT NULL,
    message_metadata JSONB NOT NULL,
    message_schema_version INT NOT NULL DEFAULT 1,
    message_type TEXT NOT NULL,
    message_id UUID NOT NULL,
    is_archived BOOLEAN NOT NULL DEFAULT FALSE,
    global_position BIGINT NOT NULL DEFAULT nextval('global_message_position'),
    transaction_id BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (stream_id, stream_position, partition, is_archived)
) PARTITION BY LIST (partition);

CREATE TABLE IF NOT EXISTS messages_default PARTITION OF messages DEFAULT;

CREATE INDEX IF NOT EXISTS idx_messages_partition_global_position
    ON messages (partition, global_position);
"#;

/// SQL for processor ownership/checkpoints and projection state.
pub const CREATE_PROCESSING_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS processors (
    processor_id TEXT NOT NULL,
    partition TEXT NOT NULL DEFAULT 'global',
    version INT NOT NULL DEFAULT 1,
    instance_id UUID,
    status TEXT NOT NULL DEFAULT 'stopped',
    last_processed_position BIGINT,
    last_processed_transaction_id BIGINT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_updated TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (processor_id, partition, version)
);

CREATE TABLE IF NOT EXISTS projections (
    name TEXT NOT NULL,
    partition TEXT NOT NULL DEFAULT 'global',
    version INT NOT NULL DEFAULT 1,
    kind TEXT NOT NULL DEFAULT 'inline',
    status TEXT NOT NULL DEFAULT 'active',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_updated TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (name, partition, version)
);

CREATE TABLE IF NOT EXISTS projection_documents (
    collection TEXT NOT NULL,
    partition TEXT NOT NULL DEFAULT 'global',
    document_id TEXT NOT NULL,
    data JSONB NOT NULL,
    version BIGINT NOT NULL,
    last_stream_position BIGINT,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (collection, partition, document_id)
);
"#;

/// SQL adding the stream type lookup used to target projections by type.
pub const ADD_STREAM_TYPE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_streams_stream_type ON streams (partition, stream_type);
"#;

pub(crate) const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_message_log",
        sql: CREATE_MESSAGE_LOG,
    },
    Migration {
        version: 2,
        name: "create_processing_tables",
        sql: CREATE_PROCESSING_TABLES,
    },
    Migration {
        version: 3,
        name: "add_stream_type_index",
        sql: ADD_STREAM_TYPE_INDEX,
    },
];

/// Applies every migration not yet recorded in `schema_migrations`.
///
/// Runs in one transaction holding an advisory lock, so concurrent callers
/// apply each migration exactly once. Returns the versions applied.
pub(crate) async fn migrate(pool: &PgPool) -> Result<Vec<i32>> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(SCHEMA_LOCK_ID)
        .execute(&mut *tx)
        .await?;
    // Plain `&str` runs over the simple protocol, which accepts several statements.
    Executor::execute(&mut *tx, CREATE_SCHEMA_MIGRATIONS_TABLE).await?;

    let applied: Vec<i32> = sqlx::query_scalar("SELECT version FROM schema_migrations")
        .fetch_all(&mut *tx)
        .await?;

    let pending: Vec<&'static Migration> = MIGRATIONS
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect();

    let mut newly_applied = Vec::new();
    for migration in pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "applying schema migration"
        );
        Executor::execute(&mut *tx, migration.sql).await?;
        sqlx::query("INSERT INTO schema_migrations (version, name) VALUES ($1, $2)")
            .bind(migration.version)
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;
        newly_applied.push(migration.version);
    }

    tx.commit().await?;
    Ok(newly_applied)
}

/// Validates a partition name for use in table identifiers.
pub(crate) fn validate_partition_name(partition: &str) -> Result<()> {
    let valid = !partition.is_empty()
        && partition.len() <= 48
        && partition
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(EventStoreError::InvalidPartition(partition.to_string()))
    }
}

/// Statements creating the dedicated list partitions for `partition`.
///
/// The name must have passed [`validate_partition_name`]. It is used verbatim
/// inside quoted identifiers, so distinct partitions always get distinct
/// tables; the `p_` prefix keeps them apart from the default partitions.
pub(crate) fn create_partition_sql(partition: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS "streams_p_{partition}" PARTITION OF streams FOR VALUES IN ('{partition}');
CREATE TABLE IF NOT EXISTS "messages_p_{partition}" PARTITION OF messages FOR VALUES IN ('{partition}');
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_versions_are_increasing() {
        let versions: Vec<i32> = MIGRATIONS.iter().map(|m| m.version).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted);
    }

    #[test]
    fn partition_names_are_restricted() {
        assert!(validate_partition_name("tenant-42").is_ok());
        assert!(validate_partition_name("tenant_a").is_ok());
        assert!(validate_partition_name("").is_err());
        assert!(validate_partition_name("x'); DROP TABLE messages; --").is_err());
    }

    #[test]
    fn partition_tables_keep_names_apart() {
        let sql = create_partition_sql("Tenant-A");
        assert!(sql.contains(r#""streams_p_Tenant-A""#));
        assert!(sql.contains(r#""messages_p_Tenant-A""#));
        assert!(sql.contains("FOR VALUES IN ('Tenant-A')"));

        let tables = |p: &str| {
            create_partition_sql(p)
                .lines()
                .filter_map(|line| line.split('"').nth(1).map(str::to_string))
                .collect::<Vec<_>>()
        };
        let names = ["tenant-a", "tenant_a", "Tenant-A", "default"];
        for (i, a) in names.iter().enumerate() {
            assert!(!tables(a).iter().any(|t| t == "streams_default"));
            for b in &names[i + 1..] {
                assert_ne!(tables(a), tables(b));
            }
        }
    }
}
