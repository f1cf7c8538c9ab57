//! In-memory flat vector index with an optional JSON snapshot on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::RetrievalError;
use crate::knowledge::index::{IndexedDocument, ScoredDocument, VectorBackend, VectorIndex, rank};

pub struct FlatIndex {
    documents: RwLock<BTreeMap<String, IndexedDocument>>,
    snapshot: Option<PathBuf>,
}

impl FlatIndex {
    /// Index that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            documents: RwLock::new(BTreeMap::new()),
            snapshot: None,
        }
    }

    /// Load the snapshot at `path` if it exists; later writes rewrite it.
    pub async fn open(path: &Path) -> Result<Self, RetrievalError> {
        let documents = match tokio::fs::read(path).await {
            Ok(bytes) => {
                let docs: Vec<IndexedDocument> =
                    serde_json::from_slice(&bytes).map_err(|e| RetrievalError::IndexUnavailable {
                        reason: format!("corrupt snapshot {}: {e}", path.display()),
                    })?;
                docs.into_iter().map(|d| (d.id.clone(), d)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(RetrievalError::IndexUnavailable {
                    reason: format!("read {}: {e}", path.display()),
                });
            }
        };
        info!(path = %path.display(), documents = documents.len(), "Flat index loaded");
        Ok(Self {
            documents: RwLock::new(documents),
            snapshot: Some(path.to_path_buf()),
        })
    }

    /// Write all documents to a temp file, then rename over the snapshot.
    async fn persist(&self, documents: &BTreeMap<String, IndexedDocument>) -> Result<(), RetrievalError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let unavailable = |e: std::io::Error| RetrievalError::IndexUnavailable {
            reason: format!("write {}: {e}", path.display()),
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(unavailable)?;
        }
        let docs: Vec<&IndexedDocument> = documents.values().collect();
        let bytes = serde_json::to_vec(&docs).map_err(|e| RetrievalError::IndexUnavailable {
            reason: format!("serialize snapshot: {e}"),
        })?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(unavailable)?;
        tokio::fs::rename(&tmp, path).await.map_err(unavailable)?;
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for FlatIndex {
    fn backend(&self) -> VectorBackend {
        VectorBackend::FaissLike
    }

    async fn upsert(&self, document: IndexedDocument) -> Result<(), RetrievalError> {
        // Held across the snapshot write so concurrent upserts persist in order.
        let mut documents = self.documents.write().await;
        if let Some(existing) = documents.values().find(|d| d.id != document.id)
            && existing.embedding.len() != document.embedding.len()
        {
            return Err(RetrievalError::DimensionMismatch {
                expected: existing.embedding.len(),
                actual: document.embedding.len(),
            });
        }
        debug!(id = %document.id, "Flat index upsert");
        documents.insert(document.id.clone(), document);
        self.persist(&documents).await
    }

    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<ScoredDocument>, RetrievalError> {
        let documents = self.documents.read().await;
        rank(query, documents.values(), top_k)
    }

    async fn count(&self) -> Result<usize, RetrievalError> {
        Ok(self.documents.read().await.len())
    }
}
