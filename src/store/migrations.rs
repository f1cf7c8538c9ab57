//! Schema for the conversation store and the knowledge collection.
//!
//! Applied versions are tracked in `_migrations`; `run_migrations()` applies
//! whatever is newer than the highest recorded version, in order.

use libsql::Connection;

use crate::error::StoreError;

/// One schema version.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "conversations",
        sql: r#"
            CREATE TABLE IF NOT EXISTS conversations (
                email_id TEXT PRIMARY KEY,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                email TEXT NOT NULL,
                classification TEXT,
                context TEXT,
                draft TEXT,
                decision TEXT,
                status TEXT NOT NULL,
                failed_stage TEXT,
                failure_message TEXT,
                attempts INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_status ON conversations(status);
            CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(updated_at);

            CREATE TABLE IF NOT EXISTS conversation_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                email_id TEXT NOT NULL REFERENCES conversations(email_id),
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversation_events_email
                ON conversation_events(email_id);
        "#,
    },
    Migration {
        version: 2,
        name: "knowledge_chunks",
        sql: r#"
            CREATE TABLE IF NOT EXISTS knowledge_chunks (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                text TEXT NOT NULL,
                source TEXT,
                embedding TEXT NOT NULL,
                dims INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );
        "#,
    },
];

/// Bring the schema up to the latest version. Safe to call on every open.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = schema_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        conn.execute_batch(migration.sql).await.map_err(|e| {
            StoreError::Migration(format!(
                "{} (v{}) failed: {e}",
                migration.name, migration.version
            ))
        })?;
        record_applied(conn, migration.version, migration.name).await?;
    }

    tracing::debug!(version = schema_version(conn).await?, "Database migrations complete");
    Ok(())
}

async fn schema_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| StoreError::Migration(format!("Failed to parse migration version: {e}"))),
        None => Ok(0),
    }
}

async fn record_applied(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
