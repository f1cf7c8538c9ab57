//! `ConversationStore` trait and the records it persists.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::pipeline::types::{
    Classification, Draft, Email, RetrievedContext, RoutingDecision, Stage, Urgency,
};

/// Outcome of the latest pipeline run for an email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordStatus {
    Completed,
    Failed { stage: Stage, message: String },
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Something that happened to an email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Received,
    Classified { category: String, urgency: Urgency },
    ContextRetrieved { chunks: usize },
    Drafted { fallback: bool },
    Routed { decision: RoutingDecision },
    ReplySent { to: String },
    HoldingReplySent { to: String },
    AdminNotified { to: String },
    Failed { stage: Stage, message: String },
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Classified { .. } => "classified",
            Self::ContextRetrieved { .. } => "context_retrieved",
            Self::Drafted { .. } => "drafted",
            Self::Routed { .. } => "routed",
            Self::ReplySent { .. } => "reply_sent",
            Self::HoldingReplySent { .. } => "holding_reply_sent",
            Self::AdminNotified { .. } => "admin_notified",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

impl ConversationEvent {
    pub fn now(kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: Utc::now(),
            kind,
        }
    }
}

/// Everything known about one email, keyed by its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub email_id: String,
    pub email: Email,
    pub classification: Option<Classification>,
    pub context: Option<RetrievedContext>,
    pub draft: Option<Draft>,
    pub decision: Option<RoutingDecision>,
    pub status: RecordStatus,
    pub events: Vec<ConversationEvent>,
    /// Number of pipeline runs recorded for this email.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationRecord {
    /// Fresh record for a run that has only just received the email.
    pub fn new(email: Email) -> Self {
        let now = Utc::now();
        Self {
            email_id: email.id.clone(),
            email,
            classification: None,
            context: None,
            draft: None,
            decision: None,
            status: RecordStatus::Completed,
            events: vec![ConversationEvent::now(EventKind::Received)],
            attempts: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push_event(&mut self, kind: EventKind) {
        self.events.push(ConversationEvent::now(kind));
        self.updated_at = Utc::now();
    }

    /// Mark the run failed at `stage` and log a `Failed` event.
    pub fn fail(&mut self, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        self.push_event(EventKind::Failed {
            stage,
            message: message.clone(),
        });
        self.status = RecordStatus::Failed { stage, message };
    }
}

/// Persistence for conversation records.
///
/// Writes are atomic per record: readers see either no record or a fully
/// written one. Writers to the same email id are serialized.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Insert or update by email id.
    ///
    /// Stage fields left `None` keep their stored value. The record's events
    /// are appended to the stored history; events already stored (same id)
    /// are not duplicated.
    async fn upsert(&self, record: &ConversationRecord) -> Result<(), StoreError>;

    /// Append one event to an existing record.
    async fn append_event(&self, email_id: &str, event: ConversationEvent) -> Result<(), StoreError>;

    /// Full record with every stored event, oldest first.
    async fn get(&self, email_id: &str) -> Result<Option<ConversationRecord>, StoreError>;

    /// Most recently updated records first.
    async fn list(&self, limit: usize) -> Result<Vec<ConversationRecord>, StoreError>;

    /// Record that processing `email` failed at `stage`.
    async fn record_failure(&self, email: &Email, stage: Stage, message: &str) -> Result<(), StoreError> {
        let mut record = ConversationRecord::new(email.clone());
        record.fail(stage, message);
        self.upsert(&record).await
    }
}
