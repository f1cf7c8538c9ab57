//! SendGrid v3 HTTP transport. Send only: SendGrid has no inbox to poll.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::json;
use tracing::info;

use crate::error::DispatchError;
use crate::mail::{IncomingMail, MailProvider, MailTransport, OutgoingEmail, SendGridConfig};
use crate::pipeline::types::sender_address;

pub const DEFAULT_BASE_URL: &str = "https://api.sendgrid.com";

pub struct SendGridTransport {
    client: reqwest::Client,
    config: SendGridConfig,
}

impl SendGridTransport {
    pub fn new(config: SendGridConfig) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| transport_error(format!("HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn unsupported(operation: &str) -> DispatchError {
        DispatchError::Unsupported {
            provider: MailProvider::SendGrid.to_string(),
            operation: operation.to_string(),
        }
    }
}

fn transport_error(reason: impl Into<String>) -> DispatchError {
    DispatchError::Transport {
        provider: MailProvider::SendGrid.to_string(),
        reason: reason.into(),
    }
}

fn check_address(address: &str) -> Result<&str, DispatchError> {
    let bare = sender_address(address);
    if bare.contains('@') && !bare.starts_with('@') && !bare.ends_with('@') {
        Ok(bare)
    } else {
        Err(DispatchError::InvalidAddress {
            address: address.to_string(),
            reason: "missing @".into(),
        })
    }
}

/// JSON body for `POST /v3/mail/send`.
fn request_body(message: &OutgoingEmail) -> Result<serde_json::Value, DispatchError> {
    let to = message
        .to
        .iter()
        .map(|addr| check_address(addr).map(|a| json!({ "email": a })))
        .collect::<Result<Vec<_>, _>>()?;

    let mut body = json!({
        "personalizations": [{ "to": to }],
        "from": { "email": check_address(&message.from)? },
        "subject": message.subject,
        "content": [{ "type": "text/plain", "value": message.body }],
    });
    if let Some(reply_to) = &message.reply_to {
        body["reply_to"] = json!({ "email": check_address(reply_to)? });
    }
    Ok(body)
}

#[async_trait]
impl MailTransport for SendGridTransport {
    fn provider(&self) -> MailProvider {
        MailProvider::SendGrid
    }

    async fn send(&self, message: &OutgoingEmail) -> Result<(), DispatchError> {
        let body = request_body(message)?;
        let url = format!("{}/v3/mail/send", self.config.base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(transport_error(format!("HTTP {status}: {text}")));
        }

        info!(to = %message.to.join(", "), subject = %message.subject, "Email sent via SendGrid");
        Ok(())
    }

    async fn fetch_unread(&self, _limit: usize) -> Result<Vec<IncomingMail>, DispatchError> {
        Err(Self::unsupported("fetch_unread"))
    }

    async fn mark_read(&self, _mailbox_id: &str) -> Result<(), DispatchError> {
        Err(Self::unsupported("mark_read"))
    }
}
