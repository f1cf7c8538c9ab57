//! Email pipeline: validate → classify → retrieve → draft → route →
//! dispatch → persist.
//!
//! One email runs strictly in sequence. A failure after validation is
//! written to the store with its stage before the error is returned;
//! validation failures touch nothing.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::config::{PipelineConfig, RouterConfig};
use crate::error::PipelineError;
use crate::knowledge::KnowledgeRetriever;
use crate::llm::retry::with_retry;
use crate::mail::Dispatcher;
use crate::pipeline::classifier::Classifier;
use crate::pipeline::drafter::Drafter;
use crate::pipeline::router::route;
use crate::pipeline::types::{Email, Stage};
use crate::store::{ConversationRecord, ConversationStore, EventKind, RecordStatus};

/// Result of one email in a batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub email_id: String,
    pub attempts: u32,
    pub result: Result<ConversationRecord, PipelineError>,
}

pub struct EmailPipeline {
    classifier: Classifier,
    retriever: KnowledgeRetriever,
    drafter: Drafter,
    router: RouterConfig,
    dispatcher: Dispatcher,
    store: Arc<dyn ConversationStore>,
    config: PipelineConfig,
}

impl EmailPipeline {
    pub fn new(
        classifier: Classifier,
        retriever: KnowledgeRetriever,
        drafter: Drafter,
        router: RouterConfig,
        dispatcher: Dispatcher,
        store: Arc<dyn ConversationStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            classifier,
            retriever,
            drafter,
            router,
            dispatcher,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one email through every stage and persist the result.
    pub async fn process(&self, email: Email) -> Result<ConversationRecord, PipelineError> {
        email.validate()?;
        let started = Instant::now();
        let email_id = email.id.clone();
        info!(email_id = %email_id, sender = %email.sender_address(), "Processing email");

        let mut record = ConversationRecord::new(email);

        // Classify
        let classification = match self.classifier.classify(&record.email).await {
            Ok(c) => c,
            Err(source) => {
                self.record_failure(&mut record, Stage::Classify, &source).await;
                return Err(PipelineError::Classification { email_id, source });
            }
        };
        debug!(
            email_id = %email_id,
            category = classification.category(),
            urgency = classification.urgency().as_str(),
            complexity = classification.complexity_score(),
            "Classified"
        );
        record.push_event(EventKind::Classified {
            category: classification.category().to_string(),
            urgency: classification.urgency(),
        });
        record.classification = Some(classification.clone());

        // Retrieve
        let query = record.email.retrieval_query();
        let context = match self.retriever.retrieve(&query, self.retriever.top_k()).await {
            Ok(ctx) => ctx,
            Err(source) => {
                self.record_failure(&mut record, Stage::Retrieve, &source).await;
                return Err(PipelineError::Retrieval { email_id, source });
            }
        };
        record.push_event(EventKind::ContextRetrieved {
            chunks: context.len(),
        });
        record.context = Some(context.clone());

        // Draft
        let draft = match self.drafter.draft(&record.email, &classification, &context).await {
            Ok(d) => d,
            Err(source) => {
                self.record_failure(&mut record, Stage::Draft, &source).await;
                return Err(PipelineError::Drafting { email_id, source });
            }
        };
        record.push_event(EventKind::Drafted {
            fallback: draft.fallback,
        });
        record.draft = Some(draft.clone());

        // Route
        let decision = route(&classification, &self.router);
        info!(
            email_id = %email_id,
            decision = decision.label(),
            reason = decision.reason().unwrap_or("-"),
            "Routed"
        );
        record.push_event(EventKind::Routed {
            decision: decision.clone(),
        });
        record.decision = Some(decision.clone());

        // Dispatch
        let mut delivered = 0;
        for outgoing in self
            .dispatcher
            .compose(&record.email, &classification, &draft, &decision)
        {
            match self.dispatcher.send(&outgoing).await {
                Ok(event) => {
                    delivered += 1;
                    record.push_event(event);
                }
                Err(source) => {
                    self.record_failure(&mut record, Stage::Dispatch, &source).await;
                    return Err(PipelineError::Dispatch {
                        email_id,
                        delivered,
                        source,
                    });
                }
            }
        }

        // Persist
        record.status = RecordStatus::Completed;
        if let Err(source) = self.store.upsert(&record).await {
            error!(email_id = %email_id, delivered, error = %source, "Failed to persist conversation");
            return Err(PipelineError::Store {
                email_id,
                delivered,
                source,
            });
        }

        info!(
            email_id = %email_id,
            decision = decision.label(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Email processed"
        );
        Ok(record)
    }

    /// `process` with the configured retry policy for retryable failures.
    pub async fn process_with_retry(&self, email: Email) -> (Result<ConversationRecord, PipelineError>, u32) {
        with_retry(&self.config.retry, || self.process(email.clone())).await
    }

    /// Process emails concurrently, at most `max_concurrency` at a time.
    ///
    /// One failure never stops the rest. Outcomes are in completion order.
    pub async fn process_batch(&self, emails: Vec<Email>) -> Vec<BatchOutcome> {
        let total = emails.len();
        info!(count = total, max_concurrency = self.config.max_concurrency, "Processing batch");

        let outcomes: Vec<BatchOutcome> = futures::stream::iter(emails)
            .map(|email| async move {
                let email_id = email.id.clone();
                let (result, attempts) = self.process_with_retry(email).await;
                if let Err(e) = &result {
                    warn!(email_id = %email_id, attempts, error = %e, "Email failed");
                }
                BatchOutcome {
                    email_id,
                    attempts,
                    result,
                }
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        info!(total, failed, "Batch complete");
        outcomes
    }

    /// Mark the run failed and persist it. A store error here is logged; the
    /// stage error is what the caller sees.
    async fn record_failure(
        &self,
        record: &mut ConversationRecord,
        stage: Stage,
        source: &(dyn std::fmt::Display + Sync),
    ) {
        warn!(email_id = %record.email_id, stage = stage.as_str(), error = %source, "Stage failed");
        record.fail(stage, source.to_string());
        if let Err(e) = self.store.upsert(record).await {
            error!(
                email_id = %record.email_id,
                stage = stage.as_str(),
                error = %e,
                "Failed to record stage failure"
            );
        }
    }
}
