//! libSQL backend: async `ConversationStore` implementation.
//!
//! Supports local file and in-memory databases. All writes go through one
//! transaction per call. Every statement shares one connection, so reads and
//! writes both hold `conn_lock`: an open transaction is visible to any other
//! statement on the same handle.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::pipeline::types::Stage;
use crate::store::migrations;
use crate::store::traits::{ConversationEvent, ConversationRecord, ConversationStore, RecordStatus};

/// libSQL conversation store.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    conn_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        let (db, conn) = open_local(path).await?;
        let backend = Self::from_parts(db, conn);
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "Conversation store opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let (db, conn) = open_memory().await?;
        let backend = Self::from_parts(db, conn);
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    fn from_parts(db: LibSqlDatabase, conn: Connection) -> Self {
        Self {
            db: Arc::new(db),
            conn,
            conn_lock: Mutex::new(()),
        }
    }

    async fn load_events(&self, email_id: &str) -> Result<Vec<ConversationEvent>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, at, payload FROM conversation_events WHERE email_id = ?1 ORDER BY seq ASC",
                params![email_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("load_events: {e}")))?;

        let mut events = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("load_events: {e}")))?
        {
            let id: String = row.get(0).map_err(|e| StoreError::Query(format!("event id: {e}")))?;
            let at: String = row.get(1).map_err(|e| StoreError::Query(format!("event at: {e}")))?;
            let payload: String = row.get(2).map_err(|e| StoreError::Query(format!("event payload: {e}")))?;
            events.push(ConversationEvent {
                id: id
                    .parse()
                    .map_err(|e| StoreError::Serialization(format!("event id {id}: {e}")))?,
                at: parse_datetime(&at),
                kind: serde_json::from_str(&payload)?,
            });
        }
        Ok(events)
    }
}

// ── Helper functions ────────────────────────────────────────────────

pub(crate) async fn open_local(path: &Path) -> Result<(LibSqlDatabase, Connection), StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::Pool(format!("Failed to create database directory: {e}")))?;
    }

    let db = libsql::Builder::new_local(path)
        .build()
        .await
        .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;
    let conn = db
        .connect()
        .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;
    Ok((db, conn))
}

pub(crate) async fn open_memory() -> Result<(LibSqlDatabase, Connection), StoreError> {
    let db = libsql::Builder::new_local(":memory:")
        .build()
        .await
        .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;
    let conn = db
        .connect()
        .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;
    Ok((db, conn))
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_json<T: Serialize>(value: Option<&T>) -> Result<libsql::Value, StoreError> {
    Ok(match value {
        Some(v) => libsql::Value::Text(serde_json::to_string(v)?),
        None => libsql::Value::Null,
    })
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_opt_json<T: DeserializeOwned>(raw: Option<String>) -> Result<Option<T>, StoreError> {
    raw.map(|s| serde_json::from_str(&s)).transpose().map_err(StoreError::from)
}

fn stage_from_str(s: &str) -> Result<Stage, StoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| StoreError::Serialization(format!("unknown stage {s:?}: {e}")))
}

const RECORD_COLUMNS: &str = "email_id, email, classification, context, draft, decision, status, failed_stage, failure_message, attempts, created_at, updated_at";

/// Map a row (without events) to a record.
fn row_to_record(row: &libsql::Row) -> Result<ConversationRecord, StoreError> {
    let col = |e: libsql::Error| StoreError::Query(format!("record row parse: {e}"));
    let email_json: String = row.get(1).map_err(col)?;
    let status: String = row.get(6).map_err(col)?;
    let failed_stage: Option<String> = row.get(7).ok();
    let failure_message: Option<String> = row.get(8).ok();
    let attempts: i64 = row.get(9).map_err(col)?;
    let created_at: String = row.get(10).map_err(col)?;
    let updated_at: String = row.get(11).map_err(col)?;

    let status = match (status.as_str(), failed_stage) {
        ("failed", Some(stage)) => RecordStatus::Failed {
            stage: stage_from_str(&stage)?,
            message: failure_message.unwrap_or_default(),
        },
        _ => RecordStatus::Completed,
    };

    Ok(ConversationRecord {
        email_id: row.get(0).map_err(col)?,
        email: serde_json::from_str(&email_json)?,
        classification: parse_opt_json(row.get(2).ok())?,
        context: parse_opt_json(row.get(3).ok())?,
        draft: parse_opt_json(row.get(4).ok())?,
        decision: parse_opt_json(row.get(5).ok())?,
        status,
        events: Vec::new(),
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

async fn insert_event(
    conn: &Connection,
    email_id: &str,
    event: &ConversationEvent,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO conversation_events (id, email_id, kind, payload, at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            event.id.to_string(),
            email_id,
            event.kind.label(),
            serde_json::to_string(&event.kind)?,
            event.at.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| StoreError::Query(format!("insert_event: {e}")))?;
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl ConversationStore for LibSqlBackend {
    async fn upsert(&self, record: &ConversationRecord) -> Result<(), StoreError> {
        let (failed_stage, failure_message) = match &record.status {
            RecordStatus::Completed => (None, None),
            RecordStatus::Failed { stage, message } => (Some(stage.as_str()), Some(message.as_str())),
        };
        let values = params![
            record.email_id.as_str(),
            record.email.sender.as_str(),
            record.email.subject.as_str(),
            serde_json::to_string(&record.email)?,
            opt_json(record.classification.as_ref())?,
            opt_json(record.context.as_ref())?,
            opt_json(record.draft.as_ref())?,
            opt_json(record.decision.as_ref())?,
            record.status.as_str(),
            opt_text(failed_stage),
            opt_text(failure_message),
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
        ];

        let _guard = self.conn_lock.lock().await;
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| StoreError::Query(format!("upsert begin: {e}")))?;

        // created_at keeps its first value; stage columns keep their stored
        // value when this run did not reach them.
        tx.execute(
            "INSERT INTO conversations (email_id, sender, subject, email, classification, context, draft, decision, status, failed_stage, failure_message, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, ?12, ?13)
             ON CONFLICT(email_id) DO UPDATE SET
                sender = excluded.sender,
                subject = excluded.subject,
                email = excluded.email,
                classification = COALESCE(excluded.classification, conversations.classification),
                context = COALESCE(excluded.context, conversations.context),
                draft = COALESCE(excluded.draft, conversations.draft),
                decision = COALESCE(excluded.decision, conversations.decision),
                status = excluded.status,
                failed_stage = excluded.failed_stage,
                failure_message = excluded.failure_message,
                attempts = conversations.attempts + 1,
                updated_at = excluded.updated_at",
            values,
        )
        .await
        .map_err(|e| StoreError::Query(format!("upsert: {e}")))?;

        for event in &record.events {
            insert_event(&tx, &record.email_id, event).await?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(format!("upsert commit: {e}")))?;

        debug!(
            email_id = %record.email_id,
            status = record.status.as_str(),
            events = record.events.len(),
            "Conversation record upserted"
        );
        Ok(())
    }

    async fn append_event(&self, email_id: &str, event: ConversationEvent) -> Result<(), StoreError> {
        let _guard = self.conn_lock.lock().await;
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| StoreError::Query(format!("append_event begin: {e}")))?;

        let mut rows = tx
            .query("SELECT 1 FROM conversations WHERE email_id = ?1", params![email_id])
            .await
            .map_err(|e| StoreError::Query(format!("append_event: {e}")))?;
        let exists = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("append_event: {e}")))?
            .is_some();
        drop(rows);
        if !exists {
            return Err(StoreError::NotFound {
                entity: "conversation".into(),
                id: email_id.into(),
            });
        }

        insert_event(&tx, email_id, &event).await?;
        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE email_id = ?2",
            params![event.at.to_rfc3339(), email_id],
        )
        .await
        .map_err(|e| StoreError::Query(format!("append_event touch: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(format!("append_event commit: {e}")))?;
        Ok(())
    }

    async fn get(&self, email_id: &str) -> Result<Option<ConversationRecord>, StoreError> {
        let _guard = self.conn_lock.lock().await;
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM conversations WHERE email_id = ?1"),
                params![email_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get: {e}")))?;
        drop(rows);
        match row {
            Some(row) => {
                let mut record = row_to_record(&row)?;
                record.events = self.load_events(email_id).await?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, limit: usize) -> Result<Vec<ConversationRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let _guard = self.conn_lock.lock().await;
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM conversations ORDER BY updated_at DESC LIMIT ?1"),
                params![limit],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("list: {e}")))?
        {
            records.push(row_to_record(&row)?);
        }
        drop(rows);
        for record in &mut records {
            record.events = self.load_events(&record.email_id).await?;
        }
        Ok(records)
    }
}
