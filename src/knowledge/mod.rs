//! Knowledge base: embeddings, vector index backends and the retriever.

pub mod embeddings;
pub mod flat;
pub mod index;
pub mod libsql_index;
pub mod retriever;
mod similarity;

pub use embeddings::{EmbeddingConfig, EmbeddingProvider, create_embedder};
pub use flat::FlatIndex;
pub use index::{IndexedDocument, ScoredDocument, VectorBackend, VectorConfig, VectorIndex, open_index};
pub use libsql_index::LibSqlIndex;
pub use retriever::KnowledgeRetriever;
