//! Change DB schema and migrations (§6).
//!
//! Migrations are linear, numbered, and each applied inside its own
//! transaction — the same structural shape as the teacher's
//! `storage::migration` module (sequential, idempotent steps), repurposed
//! here to drive `CREATE TABLE IF NOT EXISTS` against Postgres instead of
//! copying a sled tree into redb. Only the namespaced `cdc.*` tables are
//! created; the spec's Open Question about a legacy unprefixed variant is
//! resolved by not implementing it at all.

use tokio_postgres::Client;

use crate::error::{Result, StoreError};

/// One migration: a name (for logging) and the SQL to run inside a single
/// transaction. Migrations never run twice against a database that has
/// already applied the `schema_migrations` bookkeeping table.
struct Migration {
    id: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        name: "create schema",
        sql: "CREATE SCHEMA IF NOT EXISTS cdc",
    },
    Migration {
        id: 2,
        name: "create changeLog",
        sql: r#"
            CREATE TABLE IF NOT EXISTS cdc."changeLog" (
                watermark TEXT NOT NULL,
                pos BIGINT NOT NULL,
                change JSONB NOT NULL,
                precommit TEXT,
                PRIMARY KEY (watermark, pos)
            )
        "#,
    },
    Migration {
        id: 3,
        name: "create replicationState",
        sql: r#"
            CREATE TABLE IF NOT EXISTS cdc."replicationState" (
                lock INT PRIMARY KEY DEFAULT 1 CHECK (lock = 1),
                "lastWatermark" TEXT NOT NULL,
                owner TEXT NOT NULL,
                "ownerAddress" TEXT
            )
        "#,
    },
    Migration {
        id: 4,
        name: "create replicationConfig",
        sql: r#"
            CREATE TABLE IF NOT EXISTS cdc."replicationConfig" (
                lock INT PRIMARY KEY DEFAULT 1 CHECK (lock = 1),
                "replicaVersion" TEXT NOT NULL,
                publications TEXT[] NOT NULL,
                "resetRequired" BOOLEAN NOT NULL DEFAULT FALSE
            )
        "#,
    },
];

const BOOTSTRAP_SQL: &str = r#"
    CREATE SCHEMA IF NOT EXISTS cdc;
    CREATE TABLE IF NOT EXISTS cdc.schema_migrations (
        id INT PRIMARY KEY,
        name TEXT NOT NULL,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
"#;

/// Apply every migration that hasn't already run, in ascending `id` order,
/// each inside its own transaction. Safe to call on every process start.
pub async fn run_migrations(client: &mut Client) -> Result<()> {
    client
        .batch_execute(BOOTSTRAP_SQL)
        .await
        .map_err(|e| StoreError::Migration(0, e))?;

    let applied: Vec<i32> = client
        .query("SELECT id FROM cdc.schema_migrations", &[])
        .await
        .map_err(|e| StoreError::Migration(0, e))?
        .into_iter()
        .map(|row| row.get(0))
        .collect();

    for migration in MIGRATIONS {
        if applied.contains(&(migration.id as i32)) {
            continue;
        }
        apply_idempotent(client, migration).await?;
    }

    Ok(())
}

async fn apply_idempotent(client: &mut Client, migration: &Migration) -> Result<()> {
    let txn = client
        .transaction()
        .await
        .map_err(|e| StoreError::Migration(migration.id, e))?;
    txn.batch_execute(migration.sql)
        .await
        .map_err(|e| StoreError::Migration(migration.id, e))?;
    txn.execute(
        "INSERT INTO cdc.schema_migrations (id, name) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
        &[&(migration.id as i32), &migration.name],
    )
    .await
    .map_err(|e| StoreError::Migration(migration.id, e))?;
    txn.commit().await.map_err(|e| StoreError::Migration(migration.id, e))?;
    tracing::info!(migration.id, migration.name, "applied migration");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_have_unique_ascending_ids() {
        let ids: Vec<u32> = MIGRATIONS.iter().map(|m| m.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        let mut dedup = sorted.clone();
        dedup.dedup();
        assert_eq!(sorted, dedup);
    }
}
