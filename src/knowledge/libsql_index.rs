//! Persistent vector collection stored in libSQL.
//!
//! Embeddings are kept as JSON arrays next to their text; search loads the
//! collection and ranks it in process.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{RetrievalError, StoreError};
use crate::knowledge::index::{IndexedDocument, ScoredDocument, VectorBackend, VectorIndex, rank};
use crate::store::libsql_backend::{open_local, open_memory};
use crate::store::migrations;

pub struct LibSqlIndex {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    collection: String,
    write_lock: Mutex<()>,
}

fn unavailable(e: impl std::fmt::Display) -> RetrievalError {
    RetrievalError::IndexUnavailable {
        reason: e.to_string(),
    }
}

impl From<StoreError> for RetrievalError {
    fn from(e: StoreError) -> Self {
        unavailable(e)
    }
}

impl LibSqlIndex {
    pub async fn new_local(path: &Path, collection: &str) -> Result<Self, RetrievalError> {
        let (db, conn) = open_local(path).await?;
        let index = Self::from_parts(db, conn, collection).await?;
        info!(path = %path.display(), collection, "Vector collection opened");
        Ok(index)
    }

    pub async fn new_memory(collection: &str) -> Result<Self, RetrievalError> {
        let (db, conn) = open_memory().await?;
        Self::from_parts(db, conn, collection).await
    }

    async fn from_parts(db: LibSqlDatabase, conn: Connection, collection: &str) -> Result<Self, RetrievalError> {
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            collection: collection.to_string(),
            write_lock: Mutex::new(()),
        })
    }

    /// Dimension of vectors already stored under another id, if any.
    async fn existing_dims(&self, except_id: &str) -> Result<Option<usize>, RetrievalError> {
        let mut rows = self
            .conn
            .query(
                "SELECT dims FROM knowledge_chunks WHERE collection = ?1 AND id != ?2 LIMIT 1",
                params![self.collection.as_str(), except_id],
            )
            .await
            .map_err(unavailable)?;
        match rows.next().await.map_err(unavailable)? {
            Some(row) => {
                let dims: i64 = row.get(0).map_err(unavailable)?;
                Ok(usize::try_from(dims).ok())
            }
            None => Ok(None),
        }
    }

    async fn load_documents(&self) -> Result<Vec<IndexedDocument>, RetrievalError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, text, source, embedding FROM knowledge_chunks WHERE collection = ?1",
                params![self.collection.as_str()],
            )
            .await
            .map_err(unavailable)?;

        let mut documents = Vec::new();
        while let Some(row) = rows.next().await.map_err(unavailable)? {
            let embedding: String = row.get(3).map_err(unavailable)?;
            documents.push(IndexedDocument {
                id: row.get(0).map_err(unavailable)?,
                text: row.get(1).map_err(unavailable)?,
                source: row.get::<String>(2).ok(),
                embedding: serde_json::from_str(&embedding).map_err(unavailable)?,
            });
        }
        Ok(documents)
    }
}

#[async_trait]
impl VectorIndex for LibSqlIndex {
    fn backend(&self) -> VectorBackend {
        VectorBackend::ChromaLike
    }

    async fn upsert(&self, document: IndexedDocument) -> Result<(), RetrievalError> {
        let _guard = self.write_lock.lock().await;
        if let Some(expected) = self.existing_dims(&document.id).await?
            && expected != document.embedding.len()
        {
            return Err(RetrievalError::DimensionMismatch {
                expected,
                actual: document.embedding.len(),
            });
        }

        let embedding = serde_json::to_string(&document.embedding).map_err(unavailable)?;
        let source = match &document.source {
            Some(s) => libsql::Value::Text(s.clone()),
            None => libsql::Value::Null,
        };
        self.conn
            .execute(
                "INSERT INTO knowledge_chunks (collection, id, text, source, embedding, dims, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(collection, id) DO UPDATE SET
                    text = excluded.text,
                    source = excluded.source,
                    embedding = excluded.embedding,
                    dims = excluded.dims,
                    updated_at = excluded.updated_at",
                params![
                    self.collection.as_str(),
                    document.id.as_str(),
                    document.text.as_str(),
                    source,
                    embedding,
                    i64::try_from(document.embedding.len()).unwrap_or(i64::MAX),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(unavailable)?;
        debug!(id = %document.id, collection = %self.collection, "Vector collection upsert");
        Ok(())
    }

    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<ScoredDocument>, RetrievalError> {
        let documents = self.load_documents().await?;
        rank(query, &documents, top_k)
    }

    async fn count(&self) -> Result<usize, RetrievalError> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM knowledge_chunks WHERE collection = ?1",
                params![self.collection.as_str()],
            )
            .await
            .map_err(unavailable)?;
        match rows.next().await.map_err(unavailable)? {
            Some(row) => {
                let n: i64 = row.get(0).map_err(unavailable)?;
                Ok(usize::try_from(n).unwrap_or(0))
            }
            None => Ok(0),
        }
    }
}
