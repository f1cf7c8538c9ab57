//! Turns a routing decision into outgoing mail.
//!
//! Auto-send replies to the customer with the draft. Escalation sends the
//! customer a holding reply and forwards everything, draft included, to the
//! admin address.

use std::sync::Arc;

use tracing::info;

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::mail::{MailTransport, OutgoingEmail};
use crate::pipeline::drafter::extract_customer_name;
use crate::pipeline::types::{Classification, Draft, Email, RoutingDecision, Urgency};
use crate::store::EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingKind {
    Reply,
    HoldingReply,
    AdminNotification,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub kind: OutgoingKind,
    pub message: OutgoingEmail,
}

impl Outgoing {
    /// Event recorded once this message has been sent.
    pub fn sent_event(&self) -> EventKind {
        let to = self.message.to.join(", ");
        match self.kind {
            OutgoingKind::Reply => EventKind::ReplySent { to },
            OutgoingKind::HoldingReply => EventKind::HoldingReplySent { to },
            OutgoingKind::AdminNotification => EventKind::AdminNotified { to },
        }
    }
}

pub struct Dispatcher {
    transport: Arc<dyn MailTransport>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn MailTransport>, config: DispatchConfig) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> &Arc<dyn MailTransport> {
        &self.transport
    }

    pub fn from_address(&self) -> &str {
        &self.config.from_address
    }

    /// Messages to send for `decision`, in send order.
    pub fn compose(
        &self,
        email: &Email,
        classification: &Classification,
        draft: &Draft,
        decision: &RoutingDecision,
    ) -> Vec<Outgoing> {
        let customer = email.sender_address().to_string();
        let subject = reply_subject(&email.subject);

        match decision {
            RoutingDecision::AutoSend => vec![Outgoing {
                kind: OutgoingKind::Reply,
                message: OutgoingEmail::new(&self.config.from_address, customer, subject, &draft.text),
            }],
            RoutingDecision::Escalate { reason } => {
                let holding = holding_reply(email, classification.urgency());
                let notification = format!(
                    "Escalation reason: {reason}\n\n\
                     Email ID: {id}\n\
                     From: {sender}\n\
                     Subject: {subj}\n\
                     Received: {received}\n\n\
                     Classification:\n\
                     - Category: {category}\n\
                     - Urgency: {urgency}\n\
                     - Complexity: {complexity:.2}\n\
                     - Sensitive topics: {topics}\n\
                     - Reasoning: {reasoning}\n\n\
                     Original message:\n{body}\n\n\
                     AI draft (not sent):\n{draft}\n",
                    reason = reason.as_str(),
                    id = email.id,
                    sender = email.sender,
                    subj = email.subject,
                    received = email.received_at.to_rfc3339(),
                    category = classification.category(),
                    urgency = classification.urgency().as_str(),
                    complexity = classification.complexity_score(),
                    topics = join_or_none(classification.sensitive_topics().iter()),
                    reasoning = if classification.reasoning().is_empty() {
                        "-"
                    } else {
                        classification.reasoning()
                    },
                    body = email.body,
                    draft = draft.text,
                );
                vec![
                    Outgoing {
                        kind: OutgoingKind::HoldingReply,
                        message: OutgoingEmail::new(&self.config.from_address, customer, subject, holding),
                    },
                    Outgoing {
                        kind: OutgoingKind::AdminNotification,
                        message: OutgoingEmail::new(
                            &self.config.from_address,
                            &self.config.admin_address,
                            format!("[ESCALATED] {}", email.subject),
                            notification,
                        )
                        .with_reply_to(email.sender_address()),
                    },
                ]
            }
        }
    }

    /// Send one composed message under the configured timeout.
    pub async fn send(&self, outgoing: &Outgoing) -> Result<EventKind, DispatchError> {
        let timeout = self.config.timeout;
        tokio::time::timeout(timeout, self.transport.send(&outgoing.message))
            .await
            .map_err(|_| DispatchError::Timeout(timeout))??;
        info!(
            kind = ?outgoing.kind,
            provider = %self.transport.provider(),
            to = %outgoing.message.to.join(", "),
            "Dispatched"
        );
        Ok(outgoing.sent_event())
    }
}

fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.to_lowercase().starts_with("re:") {
        trimmed.to_string()
    } else {
        format!("Re: {trimmed}")
    }
}

fn join_or_none<'a>(items: impl Iterator<Item = &'a String>) -> String {
    let joined = items.map(String::as_str).collect::<Vec<_>>().join(", ");
    if joined.is_empty() { "none".into() } else { joined }
}

fn holding_reply(email: &Email, urgency: Urgency) -> String {
    let timeframe = if urgency == Urgency::Critical {
        "2 hours"
    } else {
        "24 hours"
    };
    format!(
        "Dear {name},\n\n\
         Thank you for contacting us. Your message has been forwarded to a member \
         of our support team, who will get back to you within {timeframe}.\n\n\
         Best regards,\nCustomer Support",
        name = extract_customer_name(&email.sender),
    )
}
