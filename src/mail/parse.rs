//! Turning raw RFC 822 messages into pipeline `Email`s.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use uuid::Uuid;

use crate::pipeline::types::Email;

/// Parse a raw message. `None` if it is not a parseable email.
pub fn parse_message(raw: &[u8]) -> Option<Email> {
    let parsed = MessageParser::default().parse(raw)?;

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| {
            let address = a.address()?;
            Some(match a.name() {
                Some(name) if !name.trim().is_empty() => format!("{} <{address}>", name.trim()),
                _ => address.to_string(),
            })
        })
        .unwrap_or_default();

    let id = parsed
        .message_id()
        .map(str::to_string)
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let mut email = Email::new(
        id,
        sender,
        parsed.subject().unwrap_or_default(),
        strip_quoted_text(&extract_text(&parsed)),
    )
    .with_received_at(received_at);
    email.to = extract_addresses(parsed.to());
    Some(email)
}

/// Plain-text body, falling back to de-tagged HTML, then a text attachment.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    String::new()
}

/// Strip HTML tags and collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drop quoted reply lines and everything after an attribution line.
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('>') {
            continue;
        }
        // "On Mon, Jan 1, 2026 at 10:00 AM Alice <alice@ex.com> wrote:"
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }
        if trimmed.starts_with("---") && trimmed.contains("Original Message") {
            break;
        }
        result.push(line);
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }
    result.join("\n")
}

pub fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "From: Jane Doe <jane@example.com>\r\n\
To: support@shop.test\r\n\
Subject: Where is my refund?\r\n\
Message-ID: <abc123@example.com>\r\n\
Date: Mon, 12 Jan 2026 10:00:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
I returned order 1234 two weeks ago.\r\n\
\r\n\
On Sun, Jan 11, 2026 at 9:00 AM Support <support@shop.test> wrote:\r\n\
> Thanks for your return.\r\n";

    #[test]
    fn parses_headers_and_body() {
        let email = parse_message(RAW.as_bytes()).unwrap();
        assert_eq!(email.id, "abc123@example.com");
        assert_eq!(email.sender, "Jane Doe <jane@example.com>");
        assert_eq!(email.sender_address(), "jane@example.com");
        assert_eq!(email.to, vec!["support@shop.test"]);
        assert_eq!(email.subject, "Where is my refund?");
        assert_eq!(email.body, "I returned order 1234 two weeks ago.");
        assert_eq!(email.received_at.to_rfc3339(), "2026-01-12T10:00:00+00:00");
        assert!(email.validate().is_ok());
    }

    #[test]
    fn missing_message_id_gets_generated_one() {
        let raw = "From: a@b.com\r\nSubject: hi\r\n\r\nhello\r\n";
        let email = parse_message(raw.as_bytes()).unwrap();
        assert!(email.id.starts_with("gen-"));
        assert_eq!(email.sender, "a@b.com");
    }

    #[test]
    fn html_only_body_is_detagged() {
        let raw = "From: a@b.com\r\nSubject: hi\r\nContent-Type: text/html\r\n\r\n<p>Hello <b>there</b></p>\r\n";
        let email = parse_message(raw.as_bytes()).unwrap();
        assert_eq!(email.body, "Hello there");
    }

    #[test]
    fn strip_html_nested_tags() {
        assert_eq!(strip_html("<div><b>Bold</b> and <i>italic</i></div>"), "Bold and italic");
        assert_eq!(strip_html("No HTML here"), "No HTML here");
    }

    #[test]
    fn strip_quoted_lines_and_attribution() {
        let body = "Line 1\n> quoted\nLine 2\n\nOn Mon, Jan 1 Alice wrote:\n> old";
        assert_eq!(strip_quoted_text(body), "Line 1\nLine 2");
    }

    #[test]
    fn strip_original_message_separator() {
        let body = "My reply\n\n--- Original Message ---\nOld stuff here";
        assert_eq!(strip_quoted_text(body), "My reply");
    }
}
