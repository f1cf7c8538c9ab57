//! Knowledge retriever: embed the query, search the index.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::RetrieverConfig;
use crate::error::RetrievalError;
use crate::knowledge::embeddings::EmbeddingProvider;
use crate::knowledge::index::{IndexedDocument, VectorIndex};
use crate::pipeline::types::{RetrievedChunk, RetrievedContext};

pub struct KnowledgeRetriever {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    config: RetrieverConfig,
}

impl KnowledgeRetriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        config: RetrieverConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            config,
        }
    }

    pub fn top_k(&self) -> usize {
        self.config.top_k
    }

    /// Top `top_k` chunks for `query`.
    ///
    /// An empty result is a valid answer. An index with no documents at all
    /// is `EmptyIndex`, which is not the same as "nothing matched".
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<RetrievedContext, RetrievalError> {
        if top_k == 0 {
            return Err(RetrievalError::InvalidTopK);
        }
        let timeout = self.config.timeout;

        let count = tokio::time::timeout(timeout, self.index.count())
            .await
            .map_err(|_| RetrievalError::Timeout(timeout))??;
        if count == 0 {
            warn!(backend = self.index.backend().as_str(), "Knowledge index is empty");
            return Err(RetrievalError::EmptyIndex);
        }

        let query = query.trim();
        if query.is_empty() {
            return Ok(RetrievedContext::empty());
        }

        let embedding = tokio::time::timeout(timeout, self.embedder.embed(query))
            .await
            .map_err(|_| RetrievalError::Timeout(timeout))??;

        let hits = tokio::time::timeout(timeout, self.index.search(&embedding, top_k))
            .await
            .map_err(|_| RetrievalError::Timeout(timeout))??;

        let min_score = self.config.min_score;
        let chunks: Vec<RetrievedChunk> = hits
            .into_iter()
            .filter(|hit| min_score.is_none_or(|min| hit.score >= min))
            .map(|hit| RetrievedChunk {
                text: hit.text,
                score: hit.score,
                source: hit.source,
            })
            .collect();

        let context = RetrievedContext::from_chunks(chunks, top_k);
        debug!(
            chunks = context.len(),
            best_score = context.chunks().first().map(|c| c.score),
            "Knowledge retrieved"
        );
        Ok(context)
    }

    /// Embed one pre-chunked document and upsert it into the index.
    pub async fn upsert_document(
        &self,
        id: &str,
        text: &str,
        source: Option<&str>,
    ) -> Result<(), RetrievalError> {
        let timeout = self.config.timeout;
        let embedding = tokio::time::timeout(timeout, self.embedder.embed(text))
            .await
            .map_err(|_| RetrievalError::Timeout(timeout))??;

        let document = IndexedDocument {
            id: id.to_string(),
            text: text.to_string(),
            source: source.map(str::to_string),
            embedding,
        };
        tokio::time::timeout(timeout, self.index.upsert(document))
            .await
            .map_err(|_| RetrievalError::Timeout(timeout))??;
        info!(id, model = self.embedder.model(), "Document indexed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::EmbeddingError;
    use crate::knowledge::flat::FlatIndex;

    /// Embeds by keyword presence: [refund, shipping, hours].
    struct KeywordEmbedder;

    #[async_trait]
    impl EmbeddingProvider for KeywordEmbedder {
        fn model(&self) -> &str {
            "keyword"
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            let t = text.to_lowercase();
            Ok(vec![
                if t.contains("refund") { 1.0 } else { 0.0 },
                if t.contains("shipping") { 1.0 } else { 0.0 },
                if t.contains("hours") { 1.0 } else { 0.0 },
            ])
        }
    }

    struct SlowEmbedder;

    #[async_trait]
    impl EmbeddingProvider for SlowEmbedder {
        fn model(&self) -> &str {
            "slow"
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![1.0])
        }
    }

    async fn seeded(config: RetrieverConfig) -> KnowledgeRetriever {
        let retriever = KnowledgeRetriever::new(
            Arc::new(KeywordEmbedder),
            Arc::new(FlatIndex::in_memory()),
            config,
        );
        retriever
            .upsert_document("refunds", "Refunds are issued within 5 days.", Some("policy.md"))
            .await
            .unwrap();
        retriever
            .upsert_document("shipping", "Standard shipping takes 3 days.", None)
            .await
            .unwrap();
        retriever
            .upsert_document("hours", "Support hours are 9 to 5.", None)
            .await
            .unwrap();
        retriever
    }

    #[tokio::test]
    async fn retrieves_best_match_first() {
        let retriever = seeded(RetrieverConfig::default()).await;
        let ctx = retriever.retrieve("Where is my refund?", 2).await.unwrap();
        assert!(!ctx.is_empty());
        assert!(ctx.len() <= 2);
        assert_eq!(ctx.chunks()[0].text, "Refunds are issued within 5 days.");
        assert_eq!(ctx.chunks()[0].source.as_deref(), Some("policy.md"));
    }

    #[tokio::test]
    async fn no_match_is_empty_not_error() {
        let retriever = seeded(RetrieverConfig::default()).await;
        let ctx = retriever.retrieve("completely unrelated", 3).await.unwrap();
        assert!(ctx.is_empty());
    }

    #[tokio::test]
    async fn min_score_filters_weak_hits() {
        let retriever = seeded(RetrieverConfig {
            min_score: Some(0.9),
            ..RetrieverConfig::default()
        })
        .await;
        let ctx = retriever.retrieve("refund and shipping", 3).await.unwrap();
        assert!(ctx.is_empty());
    }

    #[tokio::test]
    async fn empty_index_is_distinct_error() {
        let retriever = KnowledgeRetriever::new(
            Arc::new(KeywordEmbedder),
            Arc::new(FlatIndex::in_memory()),
            RetrieverConfig::default(),
        );
        let err = retriever.retrieve("refund", 3).await.unwrap_err();
        assert!(matches!(err, RetrievalError::EmptyIndex));
    }

    #[tokio::test]
    async fn zero_top_k_is_rejected() {
        let retriever = seeded(RetrieverConfig::default()).await;
        let err = retriever.retrieve("refund", 0).await.unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidTopK));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn slow_embedding_times_out() {
        let index = Arc::new(FlatIndex::in_memory());
        index
            .upsert(IndexedDocument {
                id: "a".into(),
                text: "a".into(),
                source: None,
                embedding: vec![1.0],
            })
            .await
            .unwrap();
        let retriever = KnowledgeRetriever::new(
            Arc::new(SlowEmbedder),
            index,
            RetrieverConfig {
                timeout: Duration::from_millis(20),
                ..RetrieverConfig::default()
            },
        );
        let err = retriever.retrieve("anything", 3).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Timeout(_)));
        assert!(err.is_retryable());
    }
}
