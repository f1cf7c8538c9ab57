//! Text embedding providers.
//!
//! Two HTTP clients behind one trait: an OpenAI-compatible `/v1/embeddings`
//! endpoint and an Ollama-compatible `/api/embed` endpoint.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::{env_secs, parse_value};
use crate::error::{ConfigError, EmbeddingError};

/// Turns text into a dense vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    OpenAi,
    Ollama,
}

impl FromStr for EmbeddingBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(format!("unknown embedding backend '{other}' (expected openai or ollama)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    pub base_url: String,
    pub model: String,
    /// Required for the OpenAI backend.
    pub api_key: Option<SecretString>,
    pub timeout: Duration,
}

impl EmbeddingConfig {
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            backend: EmbeddingBackend::OpenAi,
            base_url: "https://api.openai.com".into(),
            model: "text-embedding-3-small".into(),
            api_key: Some(SecretString::from(api_key.into())),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn ollama() -> Self {
        Self {
            backend: EmbeddingBackend::Ollama,
            base_url: "http://localhost:11434".into(),
            model: "nomic-embed-text".into(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("SUPPORT_AGENT_EMBEDDING_BACKEND") {
            Ok(raw) => parse_value("SUPPORT_AGENT_EMBEDDING_BACKEND", &raw)?,
            Err(_) => EmbeddingBackend::OpenAi,
        };
        let mut config = match backend {
            EmbeddingBackend::OpenAi => {
                let key = std::env::var("OPENAI_API_KEY").map_err(|_| ConfigError::MissingRequired {
                    key: "OPENAI_API_KEY".into(),
                    hint: "OpenAI embeddings need an API key; set SUPPORT_AGENT_EMBEDDING_BACKEND=ollama for a local server.".into(),
                })?;
                Self::openai(key)
            }
            EmbeddingBackend::Ollama => Self::ollama(),
        };
        if let Ok(url) = std::env::var("SUPPORT_AGENT_EMBEDDING_URL") {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(model) = std::env::var("SUPPORT_AGENT_EMBEDDING_MODEL") {
            config.model = model;
        }
        config.timeout = env_secs("SUPPORT_AGENT_EMBEDDING_TIMEOUT_SECS", config.timeout)?;
        Ok(config)
    }
}

/// Build the configured embedding client.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    match config.backend {
        EmbeddingBackend::OpenAi => Ok(Arc::new(OpenAiEmbeddings::new(config.clone())?)),
        EmbeddingBackend::Ollama => Ok(Arc::new(OllamaEmbeddings::new(config.clone())?)),
    }
}

fn http_client(timeout: Duration) -> Result<Client, EmbeddingError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| EmbeddingError::ConnectionFailed(e.to_string()))
}

async fn check_status(response: reqwest::Response, backend: &str) -> Result<reqwest::Response, EmbeddingError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error_text = response.text().await.unwrap_or_default();
    warn!(status = %status, error = %error_text, backend, "Embedding request failed");
    Err(EmbeddingError::ServerError(format!("{backend} returned {status}: {error_text}")))
}

// ── OpenAI-compatible ───────────────────────────────────────────────

#[derive(Serialize)]
struct OpenAiEmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct OpenAiEmbedResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
}

#[derive(Debug)]
pub struct OpenAiEmbeddings {
    client: Client,
    config: EmbeddingConfig,
}

impl OpenAiEmbeddings {
    pub fn new(config: EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let client = http_client(config.timeout)?;
        info!(base_url = %config.base_url, model = %config.model, "Initialized OpenAI embeddings");
        Ok(Self { client, config })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, text), fields(model = %self.config.model, text_len = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut request = self
            .client
            .post(format!("{}/v1/embeddings", self.config.base_url))
            .json(&OpenAiEmbedRequest {
                model: &self.config.model,
                input: text,
            });
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| EmbeddingError::ConnectionFailed(e.to_string()))?;
        let result: OpenAiEmbedResponse = check_status(response, "openai")
            .await?
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        let embedding = result
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| EmbeddingError::InvalidResponse("No embedding in response".into()))?;
        debug!(dimensions = embedding.len(), "Received embedding");
        Ok(embedding)
    }
}

// ── Ollama-compatible ───────────────────────────────────────────────

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

/// `/api/embed` returns `embeddings`; older servers return `embedding`.
#[derive(Deserialize)]
struct OllamaEmbedResponse {
    #[serde(default)]
    embeddings: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

#[derive(Debug)]
pub struct OllamaEmbeddings {
    client: Client,
    config: EmbeddingConfig,
}

impl OllamaEmbeddings {
    pub fn new(config: EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let client = http_client(config.timeout)?;
        info!(base_url = %config.base_url, model = %config.model, "Initialized Ollama embeddings");
        Ok(Self { client, config })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddings {
    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, text), fields(model = %self.config.model, text_len = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .client
            .post(format!("{}/api/embed", self.config.base_url))
            .json(&OllamaEmbedRequest {
                model: &self.config.model,
                input: text,
            })
            .send()
            .await
            .map_err(|e| EmbeddingError::ConnectionFailed(e.to_string()))?;
        let result: OllamaEmbedResponse = check_status(response, "ollama")
            .await?
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        let embedding = match result.embeddings {
            Some(mut embeddings) if !embeddings.is_empty() => embeddings.swap_remove(0),
            _ => result
                .embedding
                .ok_or_else(|| EmbeddingError::InvalidResponse("No embedding in response".into()))?,
        };
        debug!(dimensions = embedding.len(), "Received embedding");
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn openai_client_sends_bearer_and_parses_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.1, 0.2, 0.3], "index": 0}],
                "model": "text-embedding-3-small"
            })))
            .mount(&server)
            .await;

        let embedder = OpenAiEmbeddings::new(EmbeddingConfig::openai("sk-test").with_base_url(server.uri())).unwrap();
        let v = embedder.embed("refund policy").await.unwrap();
        assert_eq!(v, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn openai_client_maps_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let embedder = OpenAiEmbeddings::new(EmbeddingConfig::openai("k").with_base_url(server.uri())).unwrap();
        let err = embedder.embed("x").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::ServerError(msg) if msg.contains("overloaded")));
    }

    #[tokio::test]
    async fn openai_client_rejects_empty_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .mount(&server)
            .await;

        let embedder = OpenAiEmbeddings::new(EmbeddingConfig::openai("k").with_base_url(server.uri())).unwrap();
        assert!(matches!(
            embedder.embed("x").await,
            Err(EmbeddingError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn ollama_client_reads_embeddings_array() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[1.0, 0.0]]
            })))
            .mount(&server)
            .await;

        let embedder = OllamaEmbeddings::new(EmbeddingConfig::ollama().with_base_url(server.uri())).unwrap();
        assert_eq!(embedder.embed("hello").await.unwrap(), vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn ollama_client_accepts_legacy_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embedding": [0.5, 0.5]
            })))
            .mount(&server)
            .await;

        let embedder = OllamaEmbeddings::new(EmbeddingConfig::ollama().with_base_url(server.uri())).unwrap();
        assert_eq!(embedder.embed("hello").await.unwrap(), vec![0.5, 0.5]);
    }

    #[tokio::test]
    async fn unreachable_server_is_connection_failure() {
        let config = EmbeddingConfig::ollama().with_base_url("http://127.0.0.1:9");
        let embedder = OllamaEmbeddings::new(config).unwrap();
        assert!(matches!(
            embedder.embed("x").await,
            Err(EmbeddingError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn backend_parses() {
        assert_eq!("Ollama".parse::<EmbeddingBackend>().unwrap(), EmbeddingBackend::Ollama);
        assert!("cohere".parse::<EmbeddingBackend>().is_err());
    }
}
