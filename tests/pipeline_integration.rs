//! End-to-end pipeline tests.
//!
//! Real classifier, retriever, drafter, router, dispatcher and libSQL store;
//! stubbed LLM, embeddings and mail transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use support_agent::config::{
    ClassifierConfig, DispatchConfig, DrafterConfig, PipelineConfig, RetrieverConfig, RouterConfig,
};
use support_agent::error::{DispatchError, EmbeddingError, LlmError, PipelineError, StoreError};
use support_agent::knowledge::{EmbeddingProvider, FlatIndex, KnowledgeRetriever, LibSqlIndex, VectorIndex};
use support_agent::llm::retry::RetryConfig;
use support_agent::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use support_agent::mail::{Dispatcher, IncomingMail, MailProvider, MailTransport, OutgoingEmail};
use support_agent::pipeline::types::{Email, RoutingDecision, Stage, Trigger};
use support_agent::pipeline::{Classifier, Drafter, EmailPipeline, InboxWorker, PollSummary};
use support_agent::store::{ConversationEvent, ConversationRecord, ConversationStore, LibSqlBackend, RecordStatus};

const SUPPORT: &str = "support@shop.test";
const ADMIN: &str = "admin@shop.test";

// ── Stubs ───────────────────────────────────────────────────────────

/// Classifier stub: picks a classification from markers in the subject.
struct MarkerClassifierLlm;

#[async_trait]
impl LlmProvider for MarkerClassifierLlm {
    fn model_name(&self) -> &str {
        "marker-classifier"
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::ZERO, Decimal::ZERO)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let prompt = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let json = if prompt.contains("[urgent]") {
            r#"{"category": "technical_support", "urgency": "critical", "complexity_score": 0.2, "sensitive_topics": []}"#
        } else if prompt.contains("[refund]") {
            r#"Here you go: {"category": "billing", "urgency": "medium", "complexity_score": 0.2, "sensitive_topics": ["Refund"]}"#
        } else if prompt.contains("[garbage]") {
            "I could not decide."
        } else {
            r#"{"category": "general", "urgency": "low", "complexity_score": 0.1, "sensitive_topics": []}"#
        };
        Ok(CompletionResponse {
            content: json.to_string(),
            input_tokens: 50,
            output_tokens: 20,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

/// Drafter stub: fixed text, or always failing.
struct DraftLlm {
    fail: bool,
}

#[async_trait]
impl LlmProvider for DraftLlm {
    fn model_name(&self) -> &str {
        "draft"
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::ZERO, Decimal::ZERO)
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        if self.fail {
            return Err(LlmError::RequestFailed {
                provider: "draft".into(),
                reason: "service unavailable".into(),
            });
        }
        Ok(CompletionResponse {
            content: "Dear Customer,\n\nOur store is open from 9 to 5 on weekdays.\n\nBest regards,\nBot".into(),
            input_tokens: 100,
            output_tokens: 30,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

/// Embeds by keyword presence: [hours, refund, password].
struct KeywordEmbedder;

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn model(&self) -> &str {
        "keywords"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let t = text.to_lowercase();
        Ok(["open", "refund", "password"]
            .iter()
            .map(|k| if t.contains(k) { 1.0 } else { 0.0 })
            .collect())
    }
}

/// In-memory mailbox: unread inbox plus everything sent.
#[derive(Default)]
struct MemoryMailbox {
    inbox: Mutex<Vec<IncomingMail>>,
    read: Mutex<Vec<String>>,
    sent: Mutex<Vec<OutgoingEmail>>,
    fail_sends: bool,
    /// Sends to this address fail; others go through.
    unreachable: Option<&'static str>,
}

impl MemoryMailbox {
    fn failing() -> Self {
        Self {
            fail_sends: true,
            ..Self::default()
        }
    }

    fn unreachable(address: &'static str) -> Self {
        Self {
            unreachable: Some(address),
            ..Self::default()
        }
    }

    fn deliver(&self, mailbox_id: &str, email: Email) {
        self.inbox.lock().unwrap().push(IncomingMail {
            mailbox_id: mailbox_id.to_string(),
            email,
        });
    }

    fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for MemoryMailbox {
    fn provider(&self) -> MailProvider {
        MailProvider::Smtp
    }

    async fn send(&self, message: &OutgoingEmail) -> Result<(), DispatchError> {
        let blocked = self
            .unreachable
            .is_some_and(|addr| message.to.iter().any(|to| to == addr));
        if self.fail_sends || blocked {
            return Err(DispatchError::Transport {
                provider: "memory".into(),
                reason: "connection refused".into(),
            });
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn fetch_unread(&self, limit: usize) -> Result<Vec<IncomingMail>, DispatchError> {
        let read = self.read.lock().unwrap().clone();
        Ok(self
            .inbox
            .lock()
            .unwrap()
            .iter()
            .filter(|m| !read.contains(&m.mailbox_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_read(&self, mailbox_id: &str) -> Result<(), DispatchError> {
        self.read.lock().unwrap().push(mailbox_id.to_string());
        Ok(())
    }
}

/// libSQL store with injectable failures.
struct FlakyStore {
    inner: LibSqlBackend,
    /// Writes of completed records that fail before one succeeds.
    completed_failures: AtomicUsize,
    lookups_fail: bool,
}

impl FlakyStore {
    async fn failing_once() -> Self {
        Self {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            completed_failures: AtomicUsize::new(1),
            lookups_fail: false,
        }
    }

    async fn unreadable() -> Self {
        Self {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            completed_failures: AtomicUsize::new(0),
            lookups_fail: true,
        }
    }
}

#[async_trait]
impl ConversationStore for FlakyStore {
    async fn upsert(&self, record: &ConversationRecord) -> Result<(), StoreError> {
        if record.status == RecordStatus::Completed
            && self
                .completed_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::Query("database is locked".into()));
        }
        self.inner.upsert(record).await
    }

    async fn append_event(&self, email_id: &str, event: ConversationEvent) -> Result<(), StoreError> {
        self.inner.append_event(email_id, event).await
    }

    async fn get(&self, email_id: &str) -> Result<Option<ConversationRecord>, StoreError> {
        if self.lookups_fail {
            return Err(StoreError::Pool("connection closed".into()));
        }
        self.inner.get(email_id).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<ConversationRecord>, StoreError> {
        self.inner.list(limit).await
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    pipeline: Arc<EmailPipeline>,
    mailbox: Arc<MemoryMailbox>,
    store: Arc<dyn ConversationStore>,
}

async fn seeded_index() -> Arc<dyn VectorIndex> {
    let index = Arc::new(LibSqlIndex::new_memory("kb").await.unwrap());
    let retriever = KnowledgeRetriever::new(
        Arc::new(KeywordEmbedder),
        index.clone(),
        RetrieverConfig::default(),
    );
    retriever
        .upsert_document("hours", "The store is open from 9 to 5 on weekdays.", Some("faq.md"))
        .await
        .unwrap();
    retriever
        .upsert_document("refunds", "Refunds are issued within 5 business days.", Some("policy.md"))
        .await
        .unwrap();
    index
}

async fn harness_with(mailbox: MemoryMailbox, draft_fails: bool, index: Arc<dyn VectorIndex>) -> Harness {
    let store: Arc<dyn ConversationStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    build_harness(mailbox, draft_fails, index, store, 0).await
}

async fn build_harness(
    mailbox: MemoryMailbox,
    draft_fails: bool,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn ConversationStore>,
    max_retries: u32,
) -> Harness {
    let mailbox = Arc::new(mailbox);
    let pipeline = EmailPipeline::new(
        Classifier::new(Arc::new(MarkerClassifierLlm), ClassifierConfig::default()),
        KnowledgeRetriever::new(Arc::new(KeywordEmbedder), index, RetrieverConfig::default()),
        Drafter::new(Arc::new(DraftLlm { fail: draft_fails }), DrafterConfig::default()),
        RouterConfig::default(),
        Dispatcher::new(
            mailbox.clone(),
            DispatchConfig {
                admin_address: ADMIN.into(),
                from_address: SUPPORT.into(),
                timeout: Duration::from_secs(5),
            },
        ),
        store.clone(),
        PipelineConfig {
            max_concurrency: 4,
            retry: RetryConfig {
                max_retries,
                initial_delay_ms: 1,
                ..RetryConfig::default()
            }
            .without_jitter(),
            ..PipelineConfig::default()
        },
    );
    Harness {
        pipeline: Arc::new(pipeline),
        mailbox,
        store,
    }
}

async fn harness() -> Harness {
    harness_with(MemoryMailbox::default(), false, seeded_index().await).await
}

fn labels(record: &ConversationRecord) -> Vec<&'static str> {
    record.events.iter().map(|e| e.kind.label()).collect()
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn simple_question_is_answered_automatically() {
    let h = harness().await;
    let email = Email::new("q-1", "John Smith <john.smith@example.com>", "Opening hours", "When are you open?");

    let record = h.pipeline.process(email).await.unwrap();

    assert_eq!(record.decision, Some(RoutingDecision::AutoSend));
    assert!(record.context.as_ref().is_some_and(|c| !c.is_empty()));
    let draft = record.draft.as_ref().unwrap();
    assert!(draft.used_context);
    assert!(!draft.fallback);

    let sent = h.mailbox.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["john.smith@example.com"]);
    assert_eq!(sent[0].subject, "Re: Opening hours");
    assert!(sent[0].body.contains("9 to 5"));
}

#[tokio::test]
async fn critical_email_is_escalated_with_short_holding_promise() {
    let h = harness().await;
    let email = Email::new("q-2", "ops@example.com", "[urgent] Site is down", "Nothing loads since 10am.");

    let record = h.pipeline.process(email).await.unwrap();

    assert_eq!(
        record.decision,
        Some(RoutingDecision::Escalate {
            reason: Trigger::Urgency
        })
    );
    let sent = h.mailbox.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].to, vec!["ops@example.com"]);
    assert!(sent[0].body.contains("2 hours"));
    assert_eq!(sent[1].to, vec![ADMIN]);
    assert_eq!(sent[1].subject, "[ESCALATED] [urgent] Site is down");
    assert!(sent[1].body.contains("q-2"));
    assert!(sent[1].body.contains("Nothing loads since 10am."));

    let stored = h.store.get("q-2").await.unwrap().unwrap();
    assert_eq!(
        labels(&stored),
        vec![
            "received",
            "classified",
            "context_retrieved",
            "drafted",
            "routed",
            "holding_reply_sent",
            "admin_notified"
        ]
    );
}

#[tokio::test]
async fn sensitive_topic_is_escalated_case_insensitively() {
    let h = harness().await;
    let email = Email::new("q-3", "jane@example.com", "[refund] Double charge", "I want a refund.");

    let record = h.pipeline.process(email).await.unwrap();

    assert_eq!(
        record.decision,
        Some(RoutingDecision::Escalate {
            reason: Trigger::SensitiveTopic
        })
    );
    assert!(h.mailbox.sent()[0].body.contains("24 hours"));
}

#[tokio::test]
async fn empty_context_and_failing_model_still_reply() {
    let h = harness_with(MemoryMailbox::default(), true, seeded_index().await).await;
    let email = Email::new("q-4", "jane@example.com", "Hello", "Just saying hi.");

    let record = h.pipeline.process(email).await.unwrap();

    assert!(record.context.as_ref().is_some_and(|c| c.is_empty()));
    let draft = record.draft.as_ref().unwrap();
    assert!(draft.fallback);
    assert!(!draft.used_context);
    assert_eq!(h.mailbox.sent().len(), 1);
    assert_eq!(record.status, RecordStatus::Completed);
}

#[tokio::test]
async fn model_failure_with_context_is_a_drafting_error() {
    let h = harness_with(MemoryMailbox::default(), true, seeded_index().await).await;
    let email = Email::new("q-5", "jane@example.com", "Opening hours", "When are you open?");

    let err = h.pipeline.process(email).await.unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Draft));
    assert!(err.is_retryable());
    assert!(h.mailbox.sent().is_empty());
    let stored = h.store.get("q-5").await.unwrap().unwrap();
    assert!(matches!(stored.status, RecordStatus::Failed { stage: Stage::Draft, .. }));
    assert!(stored.classification.is_some());
    assert!(stored.draft.is_none());
}

#[tokio::test]
async fn empty_index_fails_retrieval_stage() {
    let h = harness_with(MemoryMailbox::default(), false, Arc::new(FlatIndex::in_memory())).await;
    let err = h
        .pipeline
        .process(Email::new("q-6", "jane@example.com", "Opening hours", "When are you open?"))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Retrieval { .. }));
    let stored = h.store.get("q-6").await.unwrap().unwrap();
    assert!(matches!(stored.status, RecordStatus::Failed { stage: Stage::Retrieve, .. }));
}

#[tokio::test]
async fn unparseable_classification_stops_before_drafting() {
    let h = harness().await;
    let err = h
        .pipeline
        .process(Email::new("q-7", "jane@example.com", "[garbage]", "?"))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Classify));
    let stored = h.store.get("q-7").await.unwrap().unwrap();
    assert!(stored.classification.is_none());
    assert_eq!(labels(&stored), vec!["received", "failed"]);
}

#[tokio::test]
async fn dispatch_failure_is_recorded_with_earlier_results() {
    let h = harness_with(MemoryMailbox::failing(), false, seeded_index().await).await;
    let err = h
        .pipeline
        .process(Email::new("q-8", "jane@example.com", "Opening hours", "When are you open?"))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Dispatch));
    assert_eq!(err.email_id(), Some("q-8"));
    let stored = h.store.get("q-8").await.unwrap().unwrap();
    assert!(matches!(stored.status, RecordStatus::Failed { stage: Stage::Dispatch, .. }));
    assert!(stored.draft.is_some());
    assert_eq!(stored.decision, Some(RoutingDecision::AutoSend));
}

#[tokio::test]
async fn reprocessing_keeps_one_record_with_all_events() {
    let h = harness().await;
    let email = Email::new("q-9", "jane@example.com", "Opening hours", "When are you open?");

    h.pipeline.process(email.clone()).await.unwrap();
    h.pipeline.process(email).await.unwrap();

    let all = h.store.list(10).await.unwrap();
    assert_eq!(all.len(), 1);
    let stored = &all[0];
    assert_eq!(stored.attempts, 2);
    assert_eq!(stored.events.len(), 12);
    assert_eq!(
        stored.events.iter().filter(|e| e.kind.label() == "reply_sent").count(),
        2
    );
}

#[tokio::test]
async fn batch_runs_concurrently_and_isolates_failures() {
    let h = harness().await;
    let mut emails: Vec<Email> = (0..10)
        .map(|i| Email::new(format!("b-{i}"), format!("user{i}@example.com"), "Opening hours", "When open?"))
        .collect();
    emails.push(Email::new("b-bad", "no-address", "Opening hours", "When open?"));

    let outcomes = h.pipeline.process_batch(emails).await;

    assert_eq!(outcomes.len(), 11);
    assert_eq!(outcomes.iter().filter(|o| o.result.is_ok()).count(), 10);
    assert_eq!(h.store.list(100).await.unwrap().len(), 10);
    assert!(h.store.get("b-bad").await.unwrap().is_none());
}

#[tokio::test]
async fn inbox_cycle_marks_finished_mail_read() {
    let h = harness().await;
    h.mailbox
        .deliver("1", Email::new("m-1", "jane@example.com", "Opening hours", "When are you open?"));
    h.mailbox
        .deliver("2", Email::new("m-2", SUPPORT, "Re: Opening hours", "our own reply"));
    h.mailbox
        .deliver("3", Email::new("m-3", "broken sender", "Hi", "no address"));

    let worker = InboxWorker::new(h.pipeline.clone());
    let summary = worker.run_once().await.unwrap();

    assert_eq!(
        summary,
        PollSummary {
            fetched: 3,
            skipped: 1,
            processed: 1,
            failed: 1,
        }
    );
    let mut read = h.mailbox.read.lock().unwrap().clone();
    read.sort();
    assert_eq!(read, vec!["1", "2", "3"]);

    let second = worker.run_once().await.unwrap();
    assert_eq!(second.fetched, 0);
}

#[tokio::test]
async fn retryable_failures_stay_unread() {
    let h = harness_with(MemoryMailbox::failing(), false, seeded_index().await).await;
    h.mailbox
        .deliver("7", Email::new("m-7", "jane@example.com", "Opening hours", "When are you open?"));

    let worker = InboxWorker::new(h.pipeline.clone());
    let summary = worker.run_once().await.unwrap();

    assert_eq!(summary.failed, 1);
    assert!(h.mailbox.read.lock().unwrap().is_empty());
    assert_eq!(worker.run_once().await.unwrap().fetched, 1);
}

#[tokio::test]
async fn answered_mail_is_not_answered_twice() {
    let h = harness().await;
    let email = Email::new("m-8", "jane@example.com", "Opening hours", "When are you open?");
    h.pipeline.process(email.clone()).await.unwrap();
    h.mailbox.deliver("8", email);

    let summary = InboxWorker::new(h.pipeline.clone()).run_once().await.unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.processed, 0);
    assert_eq!(h.mailbox.sent().len(), 1);
}

#[tokio::test]
async fn failed_save_after_reply_is_not_retried() {
    let store: Arc<dyn ConversationStore> = Arc::new(FlakyStore::failing_once().await);
    let h = build_harness(MemoryMailbox::default(), false, seeded_index().await, store, 2).await;
    let email = Email::new("r-1", "jane@example.com", "Opening hours", "When are you open?");

    let (result, attempts) = h.pipeline.process_with_retry(email).await;

    let err = result.unwrap_err();
    assert!(matches!(err, PipelineError::Store { delivered: 1, .. }));
    assert!(!err.is_retryable());
    assert_eq!(attempts, 1);
    assert_eq!(h.mailbox.sent().len(), 1);
}

#[tokio::test]
async fn failed_admin_notice_does_not_repeat_holding_reply() {
    let store: Arc<dyn ConversationStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let h = build_harness(MemoryMailbox::unreachable(ADMIN), false, seeded_index().await, store, 2).await;
    let email = Email::new("r-2", "ops@example.com", "[urgent] Site is down", "Nothing loads.");

    let (result, attempts) = h.pipeline.process_with_retry(email).await;

    assert!(matches!(result, Err(PipelineError::Dispatch { delivered: 1, .. })));
    assert_eq!(attempts, 1);
    let sent = h.mailbox.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].body.contains("2 hours"));

    let stored = h.store.get("r-2").await.unwrap().unwrap();
    assert!(matches!(stored.status, RecordStatus::Failed { stage: Stage::Dispatch, .. }));
    assert!(labels(&stored).contains(&"holding_reply_sent"));
}

#[tokio::test]
async fn unsent_failures_are_still_retried() {
    let store: Arc<dyn ConversationStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let h = build_harness(MemoryMailbox::failing(), false, seeded_index().await, store, 2).await;
    let email = Email::new("r-3", "jane@example.com", "Opening hours", "When are you open?");

    let (result, attempts) = h.pipeline.process_with_retry(email).await;

    assert!(matches!(result, Err(PipelineError::Dispatch { delivered: 0, .. })));
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn unreadable_store_leaves_mail_unread() {
    let store: Arc<dyn ConversationStore> = Arc::new(FlakyStore::unreadable().await);
    let h = build_harness(MemoryMailbox::default(), false, seeded_index().await, store, 0).await;
    h.mailbox
        .deliver("9", Email::new("m-9", "jane@example.com", "Opening hours", "When are you open?"));

    let summary = InboxWorker::new(h.pipeline.clone()).run_once().await.unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.processed, 0);
    assert!(h.mailbox.sent().is_empty());
    assert!(h.mailbox.read.lock().unwrap().is_empty());
}
