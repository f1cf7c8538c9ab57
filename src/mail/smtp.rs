//! SMTP (lettre) for sending, IMAP for the inbox. Also used for Gmail.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, Transport};
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::mail::imap::{ImapError, ImapSession};
use crate::mail::parse::parse_message;
use crate::mail::{IncomingMail, MailProvider, MailTransport, MailboxConfig, OutgoingEmail};

const IO_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SmtpTransport {
    provider: MailProvider,
    config: MailboxConfig,
}

impl SmtpTransport {
    pub fn new(provider: MailProvider, config: MailboxConfig) -> Self {
        Self { provider, config }
    }

    fn transport_error(&self, reason: impl std::fmt::Display) -> DispatchError {
        DispatchError::Transport {
            provider: self.provider.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Run blocking IMAP work off the async runtime.
    async fn with_imap<T, F>(&self, op: F) -> Result<T, DispatchError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> Result<T, ImapError> + Send + 'static,
    {
        let config = self.config.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::open(&config, IO_TIMEOUT)?;
            let out = op(&mut session);
            session.logout();
            out
        })
        .await
        .map_err(|e| self.transport_error(format!("IMAP task panicked: {e}")))?;
        result.map_err(|e| self.transport_error(e))
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, DispatchError> {
    address.parse().map_err(|e: lettre::address::AddressError| DispatchError::InvalidAddress {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

/// Build the lettre message. Address problems surface as `InvalidAddress`.
pub(crate) fn build_message(message: &OutgoingEmail) -> Result<Message, DispatchError> {
    let mut builder = Message::builder()
        .from(parse_mailbox(&message.from)?)
        .subject(message.subject.as_str());
    for to in &message.to {
        builder = builder.to(parse_mailbox(to)?);
    }
    if let Some(reply_to) = &message.reply_to {
        builder = builder.reply_to(parse_mailbox(reply_to)?);
    }
    builder
        .body(message.body.clone())
        .map_err(|e| DispatchError::InvalidAddress {
            address: message.to.join(", "),
            reason: e.to_string(),
        })
}

#[async_trait]
impl MailTransport for SmtpTransport {
    fn provider(&self) -> MailProvider {
        self.provider
    }

    async fn send(&self, message: &OutgoingEmail) -> Result<(), DispatchError> {
        let email = build_message(message)?;
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );
        let transport = lettre::SmtpTransport::starttls_relay(&self.config.smtp_host)
            .map_err(|e| self.transport_error(format!("SMTP relay error: {e}")))?
            .port(self.config.smtp_port)
            .credentials(creds)
            .timeout(Some(IO_TIMEOUT))
            .build();

        tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| self.transport_error(format!("SMTP task panicked: {e}")))?
            .map_err(|e| self.transport_error(format!("SMTP send failed: {e}")))?;

        info!(to = %message.to.join(", "), subject = %message.subject, "Email sent");
        Ok(())
    }

    async fn fetch_unread(&self, limit: usize) -> Result<Vec<IncomingMail>, DispatchError> {
        let raw = self
            .with_imap(move |session| {
                let uids = session.search_unseen()?;
                let mut out = Vec::new();
                for uid in uids.into_iter().take(limit) {
                    if let Some(body) = session.fetch(&uid)? {
                        out.push((uid, body));
                    }
                }
                Ok(out)
            })
            .await?;

        let mut mails = Vec::with_capacity(raw.len());
        for (uid, body) in raw {
            match parse_message(&body) {
                Some(email) => mails.push(IncomingMail {
                    mailbox_id: uid,
                    email,
                }),
                None => warn!(uid = %uid, "Skipping unparseable message"),
            }
        }
        debug!(count = mails.len(), host = %self.config.imap_host, "Fetched unread emails");
        Ok(mails)
    }

    async fn mark_read(&self, mailbox_id: &str) -> Result<(), DispatchError> {
        let uid = mailbox_id.to_string();
        self.with_imap(move |session| session.mark_seen(&uid)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing() -> OutgoingEmail {
        OutgoingEmail::new(
            "Support <support@shop.test>",
            "jane@example.com",
            "Re: Refund",
            "Hello Jane",
        )
    }

    #[test]
    fn builds_message_with_headers() {
        let msg = build_message(&outgoing().with_reply_to("help@shop.test")).unwrap();
        let raw = String::from_utf8(msg.formatted()).unwrap();
        assert!(raw.contains("To: jane@example.com"));
        assert!(raw.contains("Subject: Re: Refund"));
        assert!(raw.contains("Reply-To: help@shop.test"));
        assert!(raw.contains("Hello Jane"));
    }

    #[test]
    fn bad_recipient_is_invalid_address() {
        let mut msg = outgoing();
        msg.to = vec!["not an address".into()];
        let err = build_message(&msg).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidAddress { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unreachable_imap_is_transport_error() {
        let transport = SmtpTransport::new(
            MailProvider::Smtp,
            MailboxConfig {
                smtp_host: "127.0.0.1".into(),
                smtp_port: 1,
                imap_host: "127.0.0.1".into(),
                imap_port: 1,
                username: "u".into(),
                password: secrecy::SecretString::from("p".to_string()),
            },
        );
        let err = transport.fetch_unread(5).await.unwrap_err();
        assert!(matches!(err, DispatchError::Transport { .. }));
        assert!(err.is_retryable());
    }
}
