//! Inbox worker: fetch unread mail, run it through the pipeline, mark it read.
//!
//! Emails whose run failed with a retryable error stay unread so the next
//! poll picks them up again, as do emails whose stored state could not be
//! read. Emails that can never succeed (validation) are marked read.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;
use crate::llm::retry::with_retry;
use crate::mail::MailTransport;
use crate::pipeline::processor::EmailPipeline;
use crate::store::RecordStatus;

/// Counts for one poll cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub fetched: usize,
    pub skipped: usize,
    pub processed: usize,
    pub failed: usize,
}

pub struct InboxWorker {
    pipeline: Arc<EmailPipeline>,
    transport: Arc<dyn MailTransport>,
}

impl InboxWorker {
    pub fn new(pipeline: Arc<EmailPipeline>) -> Self {
        let transport = Arc::clone(pipeline.dispatcher().transport());
        Self { pipeline, transport }
    }

    /// One fetch → process → mark-read cycle.
    pub async fn run_once(&self) -> Result<PollSummary, DispatchError> {
        let config = self.pipeline.config();
        let (fetched, _) = with_retry(&config.retry, || self.transport.fetch_unread(config.fetch_limit)).await;
        let fetched = fetched?;

        let mut summary = PollSummary {
            fetched: fetched.len(),
            ..PollSummary::default()
        };
        if fetched.is_empty() {
            debug!("No unread email");
            return Ok(summary);
        }

        let own_address = self.pipeline.dispatcher().from_address().to_lowercase();
        let mut mailbox_ids: HashMap<String, Vec<String>> = HashMap::new();
        let mut batch = Vec::with_capacity(fetched.len());

        for mail in fetched {
            let sender = mail.email.sender_address().to_lowercase();
            if sender == own_address {
                debug!(email_id = %mail.email.id, "Skipping self-sent email");
                summary.skipped += 1;
                self.mark_read(&mail.mailbox_id).await;
                continue;
            }
            match self.pipeline.store().get(&mail.email.id).await {
                Ok(Some(record)) if record.status == RecordStatus::Completed => {
                    debug!(email_id = %mail.email.id, "Already answered, marking read");
                    summary.skipped += 1;
                    self.mark_read(&mail.mailbox_id).await;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(email_id = %mail.email.id, error = %e, "Store lookup failed, leaving unread");
                    summary.skipped += 1;
                    continue;
                }
            }
            mailbox_ids
                .entry(mail.email.id.clone())
                .or_default()
                .push(mail.mailbox_id);
            batch.push(mail.email);
        }

        for outcome in self.pipeline.process_batch(batch).await {
            let done = match &outcome.result {
                Ok(_) => {
                    summary.processed += 1;
                    true
                }
                Err(e) => {
                    summary.failed += 1;
                    !e.is_retryable()
                }
            };
            if done {
                for id in mailbox_ids.get(&outcome.email_id).into_iter().flatten() {
                    self.mark_read(id).await;
                }
            }
        }

        info!(
            fetched = summary.fetched,
            skipped = summary.skipped,
            processed = summary.processed,
            failed = summary.failed,
            "Poll cycle complete"
        );
        Ok(summary)
    }

    /// Poll every `poll_interval` until `shutdown` is set.
    pub fn spawn(self: Arc<Self>) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            let interval = self.pipeline.config().poll_interval;
            info!(
                interval_secs = interval.as_secs(),
                provider = %self.transport.provider(),
                "Inbox worker started"
            );
            let mut tick = tokio::time::interval(interval);

            loop {
                tick.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    info!("Inbox worker shutting down");
                    return;
                }
                if let Err(e) = self.run_once().await {
                    error!(error = %e, "Inbox poll failed");
                }
            }
        });

        (handle, shutdown_flag)
    }

    async fn mark_read(&self, mailbox_id: &str) {
        if let Err(e) = self.transport.mark_read(mailbox_id).await {
            warn!(mailbox_id, error = %e, "Failed to mark email read");
        }
    }
}
