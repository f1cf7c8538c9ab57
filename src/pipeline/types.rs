//! Shared types for the support email pipeline.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// ── Inbound email ───────────────────────────────────────────────────

/// A customer email entering the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    /// Unique identifier (Message-ID or a generated UUID).
    pub id: String,
    /// Sender, either a bare address or `"Name <addr>"`.
    pub sender: String,
    /// Mailbox(es) the email was delivered to.
    #[serde(default)]
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl Email {
    pub fn new(
        id: impl Into<String>,
        sender: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            sender: sender.into(),
            to: Vec::new(),
            subject: subject.into(),
            body: body.into(),
            received_at: Utc::now(),
        }
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to.push(to.into());
        self
    }

    pub fn with_received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    /// Bare address of the sender (`"Jane <j@x.com>"` → `j@x.com`).
    pub fn sender_address(&self) -> &str {
        sender_address(&self.sender)
    }

    /// Reject malformed emails before any stage runs.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        let addr = self.sender_address();
        if !addr.contains('@') || addr.starts_with('@') || addr.ends_with('@') {
            return Err(ValidationError::InvalidSender(self.sender.clone()));
        }
        if self.subject.trim().is_empty() && self.body.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        Ok(())
    }

    /// Text used for similarity search.
    pub fn retrieval_query(&self) -> String {
        format!("{} {}", self.subject, self.body).trim().to_string()
    }
}

/// Extract the bare address from `"Name <addr>"` or return the trimmed input.
pub fn sender_address(sender: &str) -> &str {
    match (sender.find('<'), sender.rfind('>')) {
        (Some(start), Some(end)) if end > start => sender[start + 1..end].trim(),
        _ => sender.trim(),
    }
}

// ── Classification ──────────────────────────────────────────────────

/// How time-sensitive an email is. Ordered low → critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub const ALL: [Urgency; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn is_pressing(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Urgency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" | "normal" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" | "urgent" => Ok(Self::Critical),
            other => Err(format!("unknown urgency '{other}'")),
        }
    }
}

/// Result of classifying one email. Built once, never mutated.
///
/// Deserialization goes through [`Classification::new`], so stored records
/// get the same clamping and topic normalization as fresh ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredClassification")]
pub struct Classification {
    category: String,
    urgency: Urgency,
    complexity_score: f32,
    sensitive_topics: BTreeSet<String>,
    reasoning: String,
}

#[derive(Deserialize)]
struct StoredClassification {
    category: String,
    urgency: Urgency,
    complexity_score: f32,
    #[serde(default)]
    sensitive_topics: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

impl From<StoredClassification> for Classification {
    fn from(raw: StoredClassification) -> Self {
        Classification::new(raw.category, raw.urgency, raw.complexity_score, raw.sensitive_topics)
            .with_reasoning(raw.reasoning)
    }
}

impl Classification {
    /// Complexity is clamped to [0, 1]; topics are trimmed and lowercased.
    pub fn new<I, S>(category: impl Into<String>, urgency: Urgency, complexity_score: f32, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let complexity_score = if complexity_score.is_nan() {
            0.0
        } else {
            complexity_score.clamp(0.0, 1.0)
        };
        Self {
            category: category.into(),
            urgency,
            complexity_score,
            sensitive_topics: normalize_topics(topics),
            reasoning: String::new(),
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn urgency(&self) -> Urgency {
        self.urgency
    }

    pub fn complexity_score(&self) -> f32 {
        self.complexity_score
    }

    pub fn sensitive_topics(&self) -> &BTreeSet<String> {
        &self.sensitive_topics
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }
}

/// Canonical category name: trimmed, lowercased, spaces and hyphens as `_`.
pub fn normalize_category(category: &str) -> String {
    category.trim().to_lowercase().replace([' ', '-'], "_")
}

/// Trim, lowercase and drop empty topic tags.
pub fn normalize_topics<I, S>(topics: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    topics
        .into_iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

// ── Retrieval ───────────────────────────────────────────────────────

/// One knowledge chunk returned by similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub text: String,
    pub score: f32,
    /// Document the chunk came from (file name, URL, ...), if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Ordered (best first) chunks for one query. May be empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    chunks: Vec<RetrievedChunk>,
}

impl RetrievedContext {
    /// Sorts by descending score and keeps at most `top_k` chunks.
    pub fn from_chunks(mut chunks: Vec<RetrievedChunk>, top_k: usize) -> Self {
        chunks.sort_by(|a, b| b.score.total_cmp(&a.score));
        chunks.truncate(top_k);
        Self { chunks }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> &[RetrievedChunk] {
        &self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }
}

// ── Draft ───────────────────────────────────────────────────────────

/// Generated reply for one email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub email_id: String,
    pub text: String,
    /// Knowledge chunks were available to the model.
    pub used_context: bool,
    /// Templated acknowledgement used because the model call failed.
    pub fallback: bool,
}

// ── Routing ─────────────────────────────────────────────────────────

/// Escalation trigger that can fire in the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Urgency,
    Complexity,
    SensitiveTopic,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgency => "urgency",
            Self::Complexity => "complexity",
            Self::SensitiveTopic => "sensitive_topic",
        }
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "urgency" => Ok(Self::Urgency),
            "complexity" => Ok(Self::Complexity),
            "sensitive_topic" | "sensitive" => Ok(Self::SensitiveTopic),
            other => Err(format!("unknown trigger '{other}'")),
        }
    }
}

/// Outcome of the escalation router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RoutingDecision {
    AutoSend,
    Escalate { reason: Trigger },
}

impl RoutingDecision {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::AutoSend => "auto_send",
            Self::Escalate { .. } => "escalate",
        }
    }

    /// Trigger name that caused escalation, if any.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::AutoSend => None,
            Self::Escalate { reason } => Some(reason.as_str()),
        }
    }

    pub fn is_escalation(&self) -> bool {
        matches!(self, Self::Escalate { .. })
    }
}

// ── Stages ──────────────────────────────────────────────────────────

/// Pipeline stage names, used in errors and failure records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classify,
    Retrieve,
    Draft,
    Route,
    Dispatch,
    Persist,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::Retrieve => "retrieve",
            Self::Draft => "draft",
            Self::Route => "route",
            Self::Dispatch => "dispatch",
            Self::Persist => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
