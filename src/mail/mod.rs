//! Mail transports and the dispatcher that uses them.
//!
//! `MailTransport` is the capability seam: SMTP/Gmail (lettre + IMAP) and
//! SendGrid (HTTP, send only) are picked by `MailProvider` at startup.

pub mod dispatcher;
mod imap;
pub mod parse;
pub mod sendgrid;
pub mod smtp;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::config::{env_parse, parse_value};
use crate::error::{ConfigError, DispatchError};
use crate::pipeline::types::Email;

pub use dispatcher::{Dispatcher, Outgoing, OutgoingKind};
pub use sendgrid::SendGridTransport;
pub use smtp::SmtpTransport;

/// A message ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub reply_to: Option<String>,
}

impl OutgoingEmail {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: vec![to.into()],
            subject: subject.into(),
            body: body.into(),
            reply_to: None,
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// An unread email plus the mailbox handle needed to mark it read.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMail {
    pub mailbox_id: String,
    pub email: Email,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    fn provider(&self) -> MailProvider;

    async fn send(&self, message: &OutgoingEmail) -> Result<(), DispatchError>;

    /// Up to `limit` unread emails, oldest first. Does not mark them read.
    async fn fetch_unread(&self, limit: usize) -> Result<Vec<IncomingMail>, DispatchError>;

    async fn mark_read(&self, mailbox_id: &str) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailProvider {
    Smtp,
    Gmail,
    SendGrid,
}

impl MailProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Smtp => "smtp",
            Self::Gmail => "gmail",
            Self::SendGrid => "sendgrid",
        }
    }
}

impl fmt::Display for MailProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MailProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "smtp" | "imap" => Ok(Self::Smtp),
            "gmail" => Ok(Self::Gmail),
            "sendgrid" => Ok(Self::SendGrid),
            other => Err(format!("unknown mail provider {other:?}, expected smtp, gmail or sendgrid")),
        }
    }
}

/// Mailbox credentials shared by SMTP and IMAP.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: SecretString,
}

#[derive(Debug, Clone)]
pub struct SendGridConfig {
    pub api_key: SecretString,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub provider: MailProvider,
    pub mailbox: Option<MailboxConfig>,
    pub sendgrid: Option<SendGridConfig>,
}

impl MailConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let provider = match std::env::var("SUPPORT_AGENT_MAIL_PROVIDER") {
            Ok(raw) => parse_value("SUPPORT_AGENT_MAIL_PROVIDER", &raw)?,
            Err(_) => MailProvider::Smtp,
        };

        match provider {
            MailProvider::Smtp | MailProvider::Gmail => Ok(Self {
                provider,
                mailbox: Some(mailbox_from_env(provider)?),
                sendgrid: None,
            }),
            MailProvider::SendGrid => {
                let api_key = std::env::var("SENDGRID_API_KEY").map_err(|_| {
                    ConfigError::MissingRequired {
                        key: "SENDGRID_API_KEY".into(),
                        hint: "Set it or choose SUPPORT_AGENT_MAIL_PROVIDER=smtp.".into(),
                    }
                })?;
                Ok(Self {
                    provider,
                    mailbox: None,
                    sendgrid: Some(SendGridConfig {
                        api_key: SecretString::from(api_key),
                        base_url: std::env::var("SENDGRID_BASE_URL")
                            .unwrap_or_else(|_| sendgrid::DEFAULT_BASE_URL.to_string()),
                    }),
                })
            }
        }
    }
}

fn mailbox_from_env(provider: MailProvider) -> Result<MailboxConfig, ConfigError> {
    let (default_smtp, default_imap) = match provider {
        MailProvider::Gmail => (Some("smtp.gmail.com".to_string()), Some("imap.gmail.com".to_string())),
        _ => (None, None),
    };

    let smtp_host = std::env::var("EMAIL_SMTP_HOST")
        .ok()
        .or(default_smtp)
        .ok_or_else(|| ConfigError::MissingRequired {
            key: "EMAIL_SMTP_HOST".into(),
            hint: "SMTP server used to send replies.".into(),
        })?;
    let imap_host = std::env::var("EMAIL_IMAP_HOST")
        .ok()
        .or(default_imap)
        .unwrap_or_else(|| smtp_host.replace("smtp", "imap"));

    let username = std::env::var("EMAIL_USERNAME").map_err(|_| ConfigError::MissingRequired {
        key: "EMAIL_USERNAME".into(),
        hint: "Mailbox login for SMTP and IMAP.".into(),
    })?;
    let password = std::env::var("EMAIL_PASSWORD").map_err(|_| ConfigError::MissingRequired {
        key: "EMAIL_PASSWORD".into(),
        hint: "Mailbox password or app password.".into(),
    })?;

    Ok(MailboxConfig {
        smtp_host,
        smtp_port: env_parse("EMAIL_SMTP_PORT", 587)?,
        imap_host,
        imap_port: env_parse("EMAIL_IMAP_PORT", 993)?,
        username,
        password: SecretString::from(password),
    })
}

/// Build the transport selected by `config.provider`.
pub fn build_transport(config: &MailConfig) -> Result<Arc<dyn MailTransport>, ConfigError> {
    let missing = |key: &str| ConfigError::MissingRequired {
        key: key.to_string(),
        hint: format!("required by mail provider {}", config.provider),
    };
    match config.provider {
        MailProvider::Smtp | MailProvider::Gmail => {
            let mailbox = config.mailbox.clone().ok_or_else(|| missing("EMAIL_SMTP_HOST"))?;
            Ok(Arc::new(SmtpTransport::new(config.provider, mailbox)))
        }
        MailProvider::SendGrid => {
            let sendgrid = config.sendgrid.clone().ok_or_else(|| missing("SENDGRID_API_KEY"))?;
            let transport = SendGridTransport::new(sendgrid).map_err(|e| ConfigError::InvalidValue {
                key: "SENDGRID_BASE_URL".into(),
                message: e.to_string(),
            })?;
            Ok(Arc::new(transport))
        }
    }
}
