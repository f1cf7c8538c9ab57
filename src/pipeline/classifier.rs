//! LLM email classifier.
//!
//! One completion call per email. The model is asked for a JSON object with
//! category, urgency, complexity score, sensitive topics and reasoning; the
//! object is extracted even when wrapped in markdown or prose.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::ClassifierConfig;
use crate::error::{ClassificationError, LlmError};
use crate::llm::provider::{
    ChatMessage, CompletionRequest, LlmProvider, complete_with_timeout, extract_json_object,
};
use crate::pipeline::types::{Classification, Email, Urgency, normalize_category};

/// Body text sent to the model is capped at this many characters.
const MAX_BODY_CHARS: usize = 4000;

pub struct Classifier {
    llm: Arc<dyn LlmProvider>,
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(llm: Arc<dyn LlmProvider>, config: ClassifierConfig) -> Self {
        Self { llm, config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify one email. Any failure is retryable by the caller; drafting
    /// must not run on error.
    pub async fn classify(&self, email: &Email) -> Result<Classification, ClassificationError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt(&self.config)),
            ChatMessage::user(build_user_prompt(email)),
        ])
        .with_temperature(self.config.temperature)
        .with_max_tokens(self.config.max_tokens);

        let response = complete_with_timeout(self.llm.as_ref(), request, self.config.timeout)
            .await
            .map_err(|e| match e {
                LlmError::Timeout { after, .. } => ClassificationError::Timeout(after),
                other => ClassificationError::Provider(other),
            })?;

        let classification = parse_classification(&response.content, &self.config).map_err(|e| {
            warn!(
                email_id = %email.id,
                raw_response = %response.content,
                error = %e,
                "Failed to parse classification"
            );
            e
        })?;

        info!(
            email_id = %email.id,
            category = classification.category(),
            urgency = %classification.urgency(),
            complexity = classification.complexity_score(),
            topics = ?classification.sensitive_topics(),
            "Email classified"
        );
        Ok(classification)
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt(config: &ClassifierConfig) -> String {
    let urgency_levels: Vec<&str> = Urgency::ALL.iter().map(|u| u.as_str()).collect();
    format!(
        "You are an email classifier for a customer support inbox. Analyze the email and classify it.\n\n\
         1. category: one of {categories}\n\
         2. urgency: one of {urgency}\n\
         3. complexity_score: number between 0 and 1, how hard the query is to resolve without a human\n\
         4. sensitive_topics: list of sensitive subjects the email touches, such as {topics}. Empty list if none.\n\
         5. reasoning: one sentence explaining the classification\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"category\": \"...\", \"urgency\": \"...\", \"complexity_score\": 0.0, \"sensitive_topics\": [], \"reasoning\": \"...\"}}",
        categories = config.categories.join(", "),
        urgency = urgency_levels.join(", "),
        topics = config.sensitive_topics.join(", "),
    )
}

fn build_user_prompt(email: &Email) -> String {
    let body: String = email.body.chars().take(MAX_BODY_CHARS).collect();
    format!("From: {}\nSubject: {}\n\nBody:\n{}", email.sender, email.subject, body)
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawClassification {
    #[serde(default)]
    category: String,
    urgency: Option<String>,
    complexity_score: Option<serde_json::Value>,
    #[serde(default)]
    sensitive_topics: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

/// Parse model output into a `Classification`.
///
/// Unknown categories fall back to the configured default; an unknown or
/// missing urgency, or a missing complexity score, is unparseable.
fn parse_classification(
    raw: &str,
    config: &ClassifierConfig,
) -> Result<Classification, ClassificationError> {
    let json_str = extract_json_object(raw);
    let parsed: RawClassification = serde_json::from_str(&json_str)
        .map_err(|e| ClassificationError::Unparseable(format!("JSON parse error: {e}")))?;

    let urgency = parsed
        .urgency
        .as_deref()
        .ok_or_else(|| ClassificationError::Unparseable("missing urgency".into()))?
        .parse::<Urgency>()
        .map_err(ClassificationError::Unparseable)?;

    let complexity = match parsed.complexity_score {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| ClassificationError::Unparseable("missing or non-numeric complexity_score".into()))?;

    let category = normalize_category(&parsed.category);
    let category = if config.categories.iter().any(|c| normalize_category(c) == category) {
        category
    } else {
        debug!(
            category = %parsed.category,
            fallback = config.fallback_category(),
            "Unknown category, using fallback"
        );
        config.fallback_category().to_string()
    };

    #[allow(clippy::cast_possible_truncation)]
    Ok(
        Classification::new(category, urgency, complexity as f32, parsed.sensitive_topics)
            .with_reasoning(parsed.reasoning),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use super::*;
    use crate::llm::provider::{CompletionResponse, FinishReason};

    /// Mock LLM that returns a canned response and records the prompt.
    struct MockLlm {
        response: Result<String, ()>,
        last_request: Mutex<Option<CompletionRequest>>,
    }

    impl MockLlm {
        fn answering(content: &str) -> Self {
            Self {
                response: Ok(content.to_string()),
                last_request: Mutex::new(None),
            }
        }

        fn failing() -> Self {
            Self {
                response: Err(()),
                last_request: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlm {
        fn model_name(&self) -> &str {
            "mock"
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            *self.last_request.lock().unwrap() = Some(request);
            match &self.response {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 10,
                    output_tokens: 10,
                    finish_reason: FinishReason::Stop,
                    response_id: None,
                }),
                Err(()) => Err(LlmError::RequestFailed {
                    provider: "mock".into(),
                    reason: "boom".into(),
                }),
            }
        }
    }

    fn email() -> Email {
        Email::new(
            "msg-1",
            "Jane Doe <jane@example.com>",
            "Refund request",
            "I was charged twice, please refund.",
        )
    }

    #[tokio::test]
    async fn classify_parses_well_formed_output() {
        let llm = Arc::new(MockLlm::answering(
            r#"{"category": "billing", "urgency": "medium", "complexity_score": 0.3,
                "sensitive_topics": ["Refund"], "reasoning": "double charge"}"#,
        ));
        let classifier = Classifier::new(llm.clone(), ClassifierConfig::default());

        let c = classifier.classify(&email()).await.unwrap();
        assert_eq!(c.category(), "billing");
        assert_eq!(c.urgency(), Urgency::Medium);
        assert!((c.complexity_score() - 0.3).abs() < 1e-6);
        assert!(c.sensitive_topics().contains("refund"));
        assert_eq!(c.reasoning(), "double charge");

        let request = llm.last_request.lock().unwrap().take().unwrap();
        assert!(request.messages[0].content.contains("technical_support"));
        assert!(request.messages[1].content.contains("Refund request"));
        assert!(request.messages[1].content.contains("charged twice"));
    }

    #[tokio::test]
    async fn classify_maps_provider_failure() {
        let classifier = Classifier::new(Arc::new(MockLlm::failing()), ClassifierConfig::default());
        let err = classifier.classify(&email()).await.unwrap_err();
        assert!(matches!(err, ClassificationError::Provider(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn classify_rejects_prose_without_json() {
        let classifier = Classifier::new(
            Arc::new(MockLlm::answering("I think this is a billing question.")),
            ClassifierConfig::default(),
        );
        let err = classifier.classify(&email()).await.unwrap_err();
        assert!(matches!(err, ClassificationError::Unparseable(_)));
    }

    #[test]
    fn parse_handles_markdown_wrapping() {
        let raw = "Sure:\n```json\n{\"category\": \"account\", \"urgency\": \"high\", \"complexity_score\": 0.9}\n```";
        let c = parse_classification(raw, &ClassifierConfig::default()).unwrap();
        assert_eq!(c.category(), "account");
        assert_eq!(c.urgency(), Urgency::High);
        assert!(c.sensitive_topics().is_empty());
    }

    #[test]
    fn parse_unknown_category_uses_fallback() {
        let raw = r#"{"category": "weather", "urgency": "low", "complexity_score": 0.1}"#;
        let c = parse_classification(raw, &ClassifierConfig::default()).unwrap();
        assert_eq!(c.category(), "general");
    }

    #[test]
    fn parse_normalizes_category_spelling() {
        let raw = r#"{"category": "Technical Support", "urgency": "low", "complexity_score": 0.1}"#;
        let c = parse_classification(raw, &ClassifierConfig::default()).unwrap();
        assert_eq!(c.category(), "technical_support");
    }

    #[test]
    fn configured_category_matches_regardless_of_spelling() {
        let config = ClassifierConfig {
            categories: vec!["Other".into(), "Technical Support".into()],
            ..ClassifierConfig::default()
        };
        let raw = r#"{"category": "technical-support", "urgency": "low", "complexity_score": 0.1}"#;
        let c = parse_classification(raw, &config).unwrap();
        assert_eq!(c.category(), "technical_support");
    }

    #[test]
    fn parse_clamps_complexity() {
        let raw = r#"{"category": "general", "urgency": "low", "complexity_score": 3.5}"#;
        let c = parse_classification(raw, &ClassifierConfig::default()).unwrap();
        assert!((c.complexity_score() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn parse_accepts_string_complexity() {
        let raw = r#"{"category": "general", "urgency": "low", "complexity_score": "0.4"}"#;
        let c = parse_classification(raw, &ClassifierConfig::default()).unwrap();
        assert!((c.complexity_score() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn parse_rejects_unknown_urgency() {
        let raw = r#"{"category": "general", "urgency": "whenever", "complexity_score": 0.1}"#;
        assert!(matches!(
            parse_classification(raw, &ClassifierConfig::default()),
            Err(ClassificationError::Unparseable(_))
        ));
    }

    #[test]
    fn parse_rejects_missing_complexity() {
        let raw = r#"{"category": "general", "urgency": "low"}"#;
        assert!(matches!(
            parse_classification(raw, &ClassifierConfig::default()),
            Err(ClassificationError::Unparseable(_))
        ));
    }

    #[test]
    fn user_prompt_truncates_long_bodies() {
        let long = Email::new("id", "a@b.com", "s", "x".repeat(10_000));
        assert!(build_user_prompt(&long).len() < MAX_BODY_CHARS + 100);
    }

    #[test]
    fn timeout_is_reported_distinctly() {
        let err = ClassificationError::Timeout(Duration::from_secs(1));
        assert!(err.is_retryable());
    }
}
