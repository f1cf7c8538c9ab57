//! Configuration types.
//!
//! Everything is read once from the environment into immutable structs and
//! passed explicitly to the components that need it.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::knowledge::embeddings::EmbeddingConfig;
use crate::knowledge::index::VectorConfig;
use crate::llm::LlmConfig;
use crate::llm::retry::RetryConfig;
use crate::mail::MailConfig;
use crate::pipeline::types::{Trigger, normalize_category, normalize_topics};

/// Default complexity score at or above which an email is escalated.
pub const DEFAULT_COMPLEXITY_THRESHOLD: f32 = 0.7;

pub const DEFAULT_DB_PATH: &str = "./data/support-agent.db";

/// Default per-call timeout for external services.
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_CATEGORIES: &[&str] = &[
    "general",
    "technical_support",
    "billing",
    "account",
    "feedback",
    "complaint",
    "sales",
];

pub const DEFAULT_SENSITIVE_TOPICS: &[&str] = &[
    "legal",
    "lawsuit",
    "refund",
    "chargeback",
    "data_breach",
    "privacy",
    "security",
];

// ── Router ──────────────────────────────────────────────────────────

/// Escalation rules.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterConfig {
    /// When false every email is auto-sent.
    pub enabled: bool,
    pub complexity_threshold: f32,
    /// Lowercased topic tags that force escalation.
    pub sensitive_topics: BTreeSet<String>,
    /// Trigger evaluation order; first match wins. Triggers left out are disabled.
    pub precedence: Vec<Trigger>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            complexity_threshold: DEFAULT_COMPLEXITY_THRESHOLD,
            sensitive_topics: normalize_topics(DEFAULT_SENSITIVE_TOPICS),
            precedence: vec![Trigger::Urgency, Trigger::Complexity, Trigger::SensitiveTopic],
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let complexity_threshold: f32 =
            env_parse("SUPPORT_AGENT_COMPLEXITY_THRESHOLD", defaults.complexity_threshold)?;
        if !(0.0..=1.0).contains(&complexity_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "SUPPORT_AGENT_COMPLEXITY_THRESHOLD".into(),
                message: format!("{complexity_threshold} is outside [0, 1]"),
            });
        }

        let precedence = match env_list("SUPPORT_AGENT_ESCALATION_PRECEDENCE") {
            Some(items) => items
                .iter()
                .map(|s| {
                    s.parse::<Trigger>().map_err(|message| ConfigError::InvalidValue {
                        key: "SUPPORT_AGENT_ESCALATION_PRECEDENCE".into(),
                        message,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => defaults.precedence,
        };

        Ok(Self {
            enabled: env_parse("SUPPORT_AGENT_ESCALATION_ENABLED", defaults.enabled)?,
            complexity_threshold,
            sensitive_topics: env_list("SUPPORT_AGENT_SENSITIVE_TOPICS")
                .map(normalize_topics)
                .unwrap_or(defaults.sensitive_topics),
            precedence,
        })
    }
}

// ── Classifier ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierConfig {
    /// Allowed category values; the first is the fallback for unknown output.
    pub categories: Vec<String>,
    /// Topics listed in the prompt as examples of sensitive subjects.
    pub sensitive_topics: Vec<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            categories: DEFAULT_CATEGORIES.iter().map(|s| s.to_string()).collect(),
            sensitive_topics: DEFAULT_SENSITIVE_TOPICS.iter().map(|s| s.to_string()).collect(),
            temperature: 0.1,
            max_tokens: 512,
            timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        }
    }
}

impl ClassifierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let categories = std::env::var("SUPPORT_AGENT_CATEGORIES")
            .map(|raw| category_list(&raw))
            .unwrap_or(defaults.categories);
        if categories.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "SUPPORT_AGENT_CATEGORIES".into(),
                message: "at least one category is required".into(),
            });
        }
        Ok(Self {
            categories,
            sensitive_topics: env_list("SUPPORT_AGENT_SENSITIVE_TOPICS")
                .unwrap_or(defaults.sensitive_topics),
            temperature: env_parse("SUPPORT_AGENT_CLASSIFY_TEMPERATURE", defaults.temperature)?,
            max_tokens: env_parse("SUPPORT_AGENT_CLASSIFY_MAX_TOKENS", defaults.max_tokens)?,
            timeout: env_secs("SUPPORT_AGENT_LLM_TIMEOUT_SECS", defaults.timeout)?,
        })
    }

    /// Category used when the model answers with something not in the list.
    pub fn fallback_category(&self) -> &str {
        self.categories.first().map(String::as_str).unwrap_or("general")
    }
}

// ── Retriever ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RetrieverConfig {
    pub top_k: usize,
    /// Chunks scoring below this are dropped.
    pub min_score: Option<f32>,
    pub timeout: Duration,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            min_score: None,
            timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        }
    }
}

impl RetrieverConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let top_k: usize = env_parse("SUPPORT_AGENT_TOP_K", defaults.top_k)?;
        if top_k == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SUPPORT_AGENT_TOP_K".into(),
                message: "must be positive".into(),
            });
        }
        let min_score = match std::env::var("SUPPORT_AGENT_MIN_SCORE") {
            Ok(raw) => Some(parse_value("SUPPORT_AGENT_MIN_SCORE", &raw)?),
            Err(_) => None,
        };
        Ok(Self {
            top_k,
            min_score,
            timeout: env_secs("SUPPORT_AGENT_RETRIEVAL_TIMEOUT_SECS", defaults.timeout)?,
        })
    }
}

// ── Drafter ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct DrafterConfig {
    /// Name the assistant signs with and introduces itself as.
    pub assistant_name: String,
    /// Appended to every outgoing draft.
    pub signature: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for DrafterConfig {
    fn default() -> Self {
        Self {
            assistant_name: "Support Assistant".into(),
            signature: "Best regards,\n\nSupport Assistant".into(),
            temperature: 0.3,
            max_tokens: 1024,
            timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        }
    }
}

impl DrafterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let assistant_name =
            std::env::var("SUPPORT_AGENT_ASSISTANT_NAME").unwrap_or(defaults.assistant_name);
        let signature = std::env::var("SUPPORT_AGENT_SIGNATURE")
            .map(|s| s.replace("\\n", "\n"))
            .unwrap_or_else(|_| format!("Best regards,\n\n{assistant_name}"));
        Ok(Self {
            assistant_name,
            signature,
            temperature: env_parse("SUPPORT_AGENT_DRAFT_TEMPERATURE", defaults.temperature)?,
            max_tokens: env_parse("SUPPORT_AGENT_DRAFT_MAX_TOKENS", defaults.max_tokens)?,
            timeout: env_secs("SUPPORT_AGENT_LLM_TIMEOUT_SECS", defaults.timeout)?,
        })
    }
}

// ── Dispatch ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Human reviewer who receives escalations.
    pub admin_address: String,
    /// Address replies are sent from.
    pub from_address: String,
    pub timeout: Duration,
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let admin_address = std::env::var("SUPPORT_AGENT_ADMIN_EMAIL")
            .or_else(|_| std::env::var("APPROVER_EMAIL"))
            .map_err(|_| ConfigError::MissingRequired {
                key: "SUPPORT_AGENT_ADMIN_EMAIL".into(),
                hint: "Escalated emails are forwarded to this address.".into(),
            })?;
        let from_address = std::env::var("SUPPORT_AGENT_FROM_EMAIL").map_err(|_| {
            ConfigError::MissingRequired {
                key: "SUPPORT_AGENT_FROM_EMAIL".into(),
                hint: "Replies are sent from this address.".into(),
            }
        })?;
        Ok(Self {
            admin_address,
            from_address,
            timeout: env_secs(
                "SUPPORT_AGENT_MAIL_TIMEOUT_SECS",
                Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            )?,
        })
    }
}

// ── Pipeline / batch ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Emails processed concurrently in one batch.
    pub max_concurrency: usize,
    /// Retry policy the inbox worker applies to retryable failures.
    pub retry: RetryConfig,
    /// Unread emails fetched per poll.
    pub fetch_limit: usize,
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry: RetryConfig::default(),
            fetch_limit: 10,
            poll_interval: Duration::from_secs(60),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let max_concurrency: usize =
            env_parse("SUPPORT_AGENT_MAX_CONCURRENCY", defaults.max_concurrency)?;
        Ok(Self {
            max_concurrency: max_concurrency.max(1),
            retry: RetryConfig {
                max_retries: env_parse("SUPPORT_AGENT_MAX_RETRIES", defaults.retry.max_retries)?,
                ..defaults.retry
            },
            fetch_limit: env_parse("SUPPORT_AGENT_FETCH_LIMIT", defaults.fetch_limit)?,
            poll_interval: env_secs("SUPPORT_AGENT_POLL_INTERVAL_SECS", defaults.poll_interval)?,
        })
    }
}

// ── Application ─────────────────────────────────────────────────────

/// Complete application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub embeddings: EmbeddingConfig,
    pub vector: VectorConfig,
    pub mail: MailConfig,
    pub router: RouterConfig,
    pub classifier: ClassifierConfig,
    pub retriever: RetrieverConfig,
    pub drafter: DrafterConfig,
    pub dispatch: DispatchConfig,
    pub pipeline: PipelineConfig,
    pub db_path: PathBuf,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            llm: LlmConfig::from_env()?,
            embeddings: EmbeddingConfig::from_env()?,
            vector: VectorConfig::from_env()?,
            mail: MailConfig::from_env()?,
            router: RouterConfig::from_env()?,
            classifier: ClassifierConfig::from_env()?,
            retriever: RetrieverConfig::from_env()?,
            drafter: DrafterConfig::from_env()?,
            dispatch: DispatchConfig::from_env()?,
            pipeline: PipelineConfig::from_env()?,
            db_path: std::env::var("SUPPORT_AGENT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH)),
        })
    }
}

// ── Env helpers ─────────────────────────────────────────────────────

pub(crate) fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parse `key` if set, otherwise return `default`.
pub(crate) fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

pub(crate) fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse_value::<u64>(key, &raw).map(Duration::from_secs),
        Err(_) => Ok(default),
    }
}

/// Comma-separated list; `None` if unset.
pub(crate) fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|raw| split_list(&raw))
}

/// Comma-separated categories in the form the classifier compares against.
fn category_list(raw: &str) -> Vec<String> {
    split_list(raw).iter().map(|c| normalize_category(c)).collect()
}

pub(crate) fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
