//! Vector index capability and backend selection.
//!
//! Backends are picked once at construction from `VectorConfig`; callers
//! only ever see `Arc<dyn VectorIndex>`.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::parse_value;
use crate::error::{ConfigError, RetrievalError};
use crate::knowledge::flat::FlatIndex;
use crate::knowledge::libsql_index::LibSqlIndex;
use crate::knowledge::similarity;

/// One pre-chunked document with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub source: Option<String>,
    pub embedding: Vec<f32>,
}

/// Search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDocument {
    pub id: String,
    pub text: String,
    pub source: Option<String>,
    pub score: f32,
}

/// Nearest-neighbour store over document embeddings.
///
/// Reads may run concurrently; writes to the same document id are serialized.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn backend(&self) -> VectorBackend;

    /// Insert or replace a document by id.
    async fn upsert(&self, document: IndexedDocument) -> Result<(), RetrievalError>;

    /// Top `top_k` documents by cosine similarity, best first.
    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<ScoredDocument>, RetrievalError>;

    async fn count(&self) -> Result<usize, RetrievalError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorBackend {
    /// Persistent collection in a libSQL database.
    ChromaLike,
    /// In-memory flat index, snapshotted to a JSON file.
    FaissLike,
}

impl VectorBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChromaLike => "chroma",
            Self::FaissLike => "faiss",
        }
    }

    fn default_path(&self) -> PathBuf {
        match self {
            Self::ChromaLike => PathBuf::from("./data/knowledge.db"),
            Self::FaissLike => PathBuf::from("./data/knowledge.json"),
        }
    }
}

impl FromStr for VectorBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chroma" | "chromadb" | "chroma_like" => Ok(Self::ChromaLike),
            "faiss" | "faiss_like" | "flat" => Ok(Self::FaissLike),
            other => Err(format!("unknown vector backend '{other}' (expected chroma or faiss)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorConfig {
    pub backend: VectorBackend,
    pub path: PathBuf,
    /// Collection name inside a ChromaLike database.
    pub collection: String,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::ChromaLike,
            path: VectorBackend::ChromaLike.default_path(),
            collection: "support_knowledge".into(),
        }
    }
}

impl VectorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("SUPPORT_AGENT_VECTOR_BACKEND") {
            Ok(raw) => parse_value("SUPPORT_AGENT_VECTOR_BACKEND", &raw)?,
            Err(_) => VectorBackend::ChromaLike,
        };
        Ok(Self {
            backend,
            path: std::env::var("SUPPORT_AGENT_VECTOR_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| backend.default_path()),
            collection: std::env::var("SUPPORT_AGENT_COLLECTION")
                .unwrap_or_else(|_| Self::default().collection),
        })
    }
}

/// Open the configured backend.
pub async fn open_index(config: &VectorConfig) -> Result<Arc<dyn VectorIndex>, RetrievalError> {
    match config.backend {
        VectorBackend::ChromaLike => Ok(Arc::new(
            LibSqlIndex::new_local(&config.path, &config.collection).await?,
        )),
        VectorBackend::FaissLike => Ok(Arc::new(FlatIndex::open(&config.path).await?)),
    }
}

/// Score every document against `query` and keep the best `top_k`.
///
/// Zero-norm vectors are skipped; a document whose dimension differs from the
/// query is an error.
pub(crate) fn rank<'a, I>(query: &[f32], documents: I, top_k: usize) -> Result<Vec<ScoredDocument>, RetrievalError>
where
    I: IntoIterator<Item = &'a IndexedDocument>,
{
    let query_norm = similarity::l2_norm(query);
    if query_norm == 0.0 {
        return Ok(Vec::new());
    }

    let mut hits = Vec::new();
    for doc in documents {
        if doc.embedding.len() != query.len() {
            return Err(RetrievalError::DimensionMismatch {
                expected: doc.embedding.len(),
                actual: query.len(),
            });
        }
        let norm = similarity::l2_norm(&doc.embedding);
        if norm == 0.0 {
            continue;
        }
        hits.push(ScoredDocument {
            id: doc.id.clone(),
            text: doc.text.clone(),
            source: doc.source.clone(),
            score: similarity::cosine_similarity(query, &doc.embedding, query_norm, norm),
        });
    }

    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    hits.truncate(top_k);
    Ok(hits)
}
