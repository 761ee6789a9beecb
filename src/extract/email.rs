//! MIME decoding into a plain-text `EmailDocument`.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};

use crate::error::ExtractError;

/// Bodies longer than this are truncated before extraction.
const MAX_BODY_CHARS: usize = 20_000;

/// The parts of an email the extractors work from.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EmailDocument {
    pub message_id: Option<String>,
    /// Sender address.
    pub sender: Option<String>,
    /// Sender display name.
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
    /// Readable body with quoted replies removed.
    pub body: String,
}

impl EmailDocument {
    /// Decode a raw RFC 5322 message.
    ///
    /// Fails with `InvalidInput` when the bytes are not a recognizable email.
    pub fn parse(raw: &[u8]) -> Result<Self, ExtractError> {
        let parsed = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| ExtractError::InvalidInput("not a MIME message".to_string()))?;

        let from = parsed.from().and_then(|addr| addr.first());
        let sender = from.and_then(|a| a.address()).map(str::to_string);
        let sender_name = from.and_then(|a| a.name()).map(str::to_string);
        let subject = parsed
            .subject()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let body = truncate(&strip_quoted_text(&extract_text(&parsed)), MAX_BODY_CHARS);

        if sender.is_none() && subject.is_none() {
            return Err(ExtractError::InvalidInput(
                "message has neither a From nor a Subject header".to_string(),
            ));
        }
        if body.trim().is_empty() && subject.is_none() {
            return Err(ExtractError::InvalidInput("message has no readable content".to_string()));
        }

        Ok(Self {
            message_id: parsed.message_id().map(str::to_string),
            sender,
            sender_name,
            subject,
            date: parsed
                .date()
                .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0)),
            body,
        })
    }

    /// Header block plus body, as handed to extractors.
    pub fn as_text(&self) -> String {
        let mut out = String::new();
        if let Some(sender) = &self.sender {
            match &self.sender_name {
                Some(name) => out.push_str(&format!("From: {name} <{sender}>\n")),
                None => out.push_str(&format!("From: {sender}\n")),
            }
        }
        if let Some(subject) = &self.subject {
            out.push_str(&format!("Subject: {subject}\n"));
        }
        out.push('\n');
        out.push_str(&self.body);
        out
    }
}

/// Extract readable text from a parsed email.
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

/// Strip HTML tags, keeping text content.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drop quoted replies: `>` lines and everything after an attribution line.
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

        result.push(line.trim_end());
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }

    result.join("\n")
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
