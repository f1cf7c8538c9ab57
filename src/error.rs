//! Error types for the support agent.
//!
//! Every pipeline stage has its own error enum. Each one can tell an
//! external-dependency failure (retryable) apart from a validation error
//! (abort, no side effects) through `is_retryable()`.

use std::time::Duration;

use crate::pipeline::types::Stage;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} timed out after {after:?}")]
    Timeout { provider: String, after: Duration },
}

impl LlmError {
    /// Auth failures won't fix themselves; everything else might.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthFailed { .. })
    }
}

/// Malformed input email. Never retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("email id is empty")]
    EmptyId,

    #[error("sender has no usable address: {0:?}")]
    InvalidSender(String),

    #[error("email has neither subject nor body")]
    EmptyContent,
}

/// Classifier failures.
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("LLM call failed: {0}")]
    Provider(#[from] LlmError),

    #[error("classification timed out after {0:?}")]
    Timeout(Duration),

    #[error("unparseable classification: {0}")]
    Unparseable(String),
}

impl ClassificationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::Timeout(_) | Self::Unparseable(_) => true,
        }
    }
}

/// Embedding provider failures.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding server unreachable: {0}")]
    ConnectionFailed(String),

    #[error("embedding server error: {0}")]
    ServerError(String),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
}

/// Knowledge retrieval failures.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("vector index unavailable: {reason}")]
    IndexUnavailable { reason: String },

    #[error("vector index has no indexed documents")]
    EmptyIndex,

    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("retrieval timed out after {0:?}")]
    Timeout(Duration),

    #[error("top_k must be positive")]
    InvalidTopK,

    #[error("embedding dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl RetrievalError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::IndexUnavailable { .. } | Self::EmptyIndex | Self::Embedding(_) | Self::Timeout(_)
        )
    }
}

/// Response drafting failures.
#[derive(Debug, thiserror::Error)]
pub enum DraftingError {
    #[error("LLM call failed: {0}")]
    Provider(#[from] LlmError),

    #[error("drafting timed out after {0:?}")]
    Timeout(Duration),

    #[error("model returned an empty draft")]
    EmptyDraft,
}

impl DraftingError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::Timeout(_) | Self::EmptyDraft => true,
        }
    }
}

/// Mail transport failures.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{provider} transport failed: {reason}")]
    Transport { provider: String, reason: String },

    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("mail transport timed out after {0:?}")]
    Timeout(Duration),

    #[error("{provider} does not support {operation}")]
    Unsupported { provider: String, operation: String },
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout(_))
    }
}

/// Conversation store / vector collection persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Pool(_) | Self::Query(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Failure of one `process()` run, tagged with the email and stage.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("email rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error("email {email_id}: classification failed: {source}")]
    Classification {
        email_id: String,
        #[source]
        source: ClassificationError,
    },

    #[error("email {email_id}: retrieval failed: {source}")]
    Retrieval {
        email_id: String,
        #[source]
        source: RetrievalError,
    },

    #[error("email {email_id}: drafting failed: {source}")]
    Drafting {
        email_id: String,
        #[source]
        source: DraftingError,
    },

    #[error("email {email_id}: dispatch failed after {delivered} sent message(s): {source}")]
    Dispatch {
        email_id: String,
        /// Messages of this run that were already sent.
        delivered: usize,
        #[source]
        source: DispatchError,
    },

    #[error("email {email_id}: store failed after {delivered} sent message(s): {source}")]
    Store {
        email_id: String,
        delivered: usize,
        #[source]
        source: StoreError,
    },
}

impl PipelineError {
    /// Stage that failed. `None` for validation errors (nothing ran).
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Validation(_) => None,
            Self::Classification { .. } => Some(Stage::Classify),
            Self::Retrieval { .. } => Some(Stage::Retrieve),
            Self::Drafting { .. } => Some(Stage::Draft),
            Self::Dispatch { .. } => Some(Stage::Dispatch),
            Self::Store { .. } => Some(Stage::Persist),
        }
    }

    pub fn email_id(&self) -> Option<&str> {
        match self {
            Self::Validation(_) => None,
            Self::Classification { email_id, .. }
            | Self::Retrieval { email_id, .. }
            | Self::Drafting { email_id, .. }
            | Self::Dispatch { email_id, .. }
            | Self::Store { email_id, .. } => Some(email_id),
        }
    }

    /// Whether re-running the whole pipeline is safe and may succeed.
    ///
    /// Once a message has gone out, a re-run would send it again, so any
    /// later failure in that run is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Classification { source, .. } => source.is_retryable(),
            Self::Retrieval { source, .. } => source.is_retryable(),
            Self::Drafting { source, .. } => source.is_retryable(),
            Self::Dispatch { source, delivered, .. } => *delivered == 0 && source.is_retryable(),
            Self::Store { source, delivered, .. } => *delivered == 0 && source.is_retryable(),
        }
    }
}
