//! Response drafter.
//!
//! Sends the email, its classification and the retrieved knowledge chunks to
//! the LLM, then cleans the output and appends the configured signature.
//! With no retrieved context the model is asked for an acknowledgement, and a
//! templated acknowledgement is used if that call fails.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{info, warn};

use crate::config::DrafterConfig;
use crate::error::{DraftingError, LlmError};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider, complete_with_timeout};
use crate::pipeline::types::{Classification, Draft, Email, RetrievedContext};

const MAX_BODY_CHARS: usize = 4000;
const DEFAULT_GREETING_NAME: &str = "Valued Customer";

/// Placeholders and model-written sign-offs removed from drafts.
static CLEANUP_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\[(?:your|user'?s|customer'?s|company|agent)[^\]]*\]",
        // A closing line on its own, plus the signature lines under it.
        r"(?im)^[ \t]*(?:best regards|kind regards|warm regards|regards|sincerely(?: yours)?|yours sincerely|thanks and regards)[ \t]*,?[ \t]*$(?:\n[^\n]+)*",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static EXTRA_NEWLINES: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\n{3,}").ok());

pub struct Drafter {
    llm: Arc<dyn LlmProvider>,
    config: DrafterConfig,
}

impl Drafter {
    pub fn new(llm: Arc<dyn LlmProvider>, config: DrafterConfig) -> Self {
        Self { llm, config }
    }

    /// Draft a reply. Never fails when `context` is empty.
    pub async fn draft(
        &self,
        email: &Email,
        classification: &Classification,
        context: &RetrievedContext,
    ) -> Result<Draft, DraftingError> {
        let customer_name = extract_customer_name(&email.sender);
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt(
                &self.config,
                classification,
                context,
                &customer_name,
            )),
            ChatMessage::user(build_user_prompt(email)),
        ])
        .with_temperature(self.config.temperature)
        .with_max_tokens(self.config.max_tokens);

        let generated = complete_with_timeout(self.llm.as_ref(), request, self.config.timeout)
            .await
            .map_err(|e| match e {
                LlmError::Timeout { after, .. } => DraftingError::Timeout(after),
                other => DraftingError::Provider(other),
            })
            .and_then(|response| {
                let cleaned = clean_response(&response.content);
                if cleaned.is_empty() {
                    Err(DraftingError::EmptyDraft)
                } else {
                    Ok(cleaned)
                }
            });

        match generated {
            Ok(body) => {
                info!(
                    email_id = %email.id,
                    context_chunks = context.len(),
                    "Draft generated"
                );
                Ok(Draft {
                    email_id: email.id.clone(),
                    text: format!("{body}\n\n{}", self.config.signature),
                    used_context: !context.is_empty(),
                    fallback: false,
                })
            }
            Err(e) if context.is_empty() => {
                warn!(
                    email_id = %email.id,
                    error = %e,
                    "Drafting failed without context, using acknowledgement template"
                );
                Ok(Draft {
                    email_id: email.id.clone(),
                    text: fallback_acknowledgement(&customer_name, &email.subject, &self.config.signature),
                    used_context: false,
                    fallback: true,
                })
            }
            Err(e) => Err(e),
        }
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt(
    config: &DrafterConfig,
    classification: &Classification,
    context: &RetrievedContext,
    customer_name: &str,
) -> String {
    let mut prompt = String::with_capacity(2048);
    prompt.push_str(&format!(
        "You are {}, a customer support assistant.\n\n",
        config.assistant_name
    ));
    prompt.push_str(&format!(
        "Email classification: {} ({} urgency)\n\n",
        classification.category(),
        classification.urgency()
    ));

    if context.is_empty() {
        prompt.push_str(
            "No knowledge base information matched this email. Write a short, polite \
             acknowledgement: confirm the request was received and that the team will follow up. \
             Do not invent policies, prices or timeframes.\n\n",
        );
    } else {
        prompt.push_str("Knowledge base context (use this information):\n");
        for (i, chunk) in context.chunks().iter().enumerate() {
            prompt.push_str(&format!("[{}] {}\n", i + 1, chunk.text.trim()));
        }
        prompt.push_str(
            "\nAnswer the customer's question using the context above. Quote policies, \
             procedures and timeframes exactly as given. Only ask for clarification if the \
             context does not cover the question.\n\n",
        );
    }

    prompt.push_str(&format!(
        "Rules:\n\
         - Start with \"Dear {customer_name},\"\n\
         - Do not add a signature, closing or sign-off; it is added automatically\n\
         - Do not use placeholders such as [Your Name]\n\
         - End with your last helpful sentence"
    ));
    prompt
}

fn build_user_prompt(email: &Email) -> String {
    let body: String = email.body.chars().take(MAX_BODY_CHARS).collect();
    format!(
        "Subject: {}\nBody:\n{}\n\nWrite the reply.",
        email.subject, body
    )
}

// ── Post-processing ─────────────────────────────────────────────────

/// Remove placeholders and sign-offs, collapse blank runs, trim.
fn clean_response(raw: &str) -> String {
    let mut cleaned = raw.to_string();
    for pattern in CLEANUP_PATTERNS.iter() {
        cleaned = pattern.replace_all(&cleaned, "").into_owned();
    }
    if let Some(newlines) = EXTRA_NEWLINES.as_ref() {
        cleaned = newlines.replace_all(&cleaned, "\n\n").into_owned();
    }
    cleaned.trim().to_string()
}

/// Name to greet the customer with.
///
/// `"Jane Doe <j@x.com>"` → `Jane Doe`, `john.smith@x.com` → `John Smith`,
/// anything else → `Valued Customer`.
pub fn extract_customer_name(sender: &str) -> String {
    if let (Some(lt), Some(_)) = (sender.find('<'), sender.find('>')) {
        let display = sender[..lt].trim().trim_matches(|c| c == '"' || c == '\'').trim();
        if display.chars().count() > 1 && !display.chars().all(|c| c.is_ascii_digit()) {
            return display.to_string();
        }
    }

    let address = crate::pipeline::types::sender_address(sender);
    let local = address.split('@').next().unwrap_or_default();
    if local.chars().any(|c| c.is_ascii_digit()) {
        return DEFAULT_GREETING_NAME.to_string();
    }

    let words: Vec<String> = local
        .split(['.', '_', '-'])
        .filter(|w| !w.is_empty())
        .map(title_case)
        .collect();
    if (1..=3).contains(&words.len()) {
        words.join(" ")
    } else {
        DEFAULT_GREETING_NAME.to_string()
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn fallback_acknowledgement(customer_name: &str, subject: &str, signature: &str) -> String {
    format!(
        "Dear {customer_name},\n\n\
         Thank you for contacting us. We have received your inquiry regarding: {subject}\n\n\
         Our team is reviewing your request and will get back to you within 24 hours with a detailed response.\n\n\
         If this is urgent, please reply to this email with additional details.\n\n\
         {signature}"
    )
}
