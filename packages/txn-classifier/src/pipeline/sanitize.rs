//! PII redaction before any text leaves the process.
//!
//! [`SanitizedText`] can only be produced here, and it is the only text type
//! an [`LlmBackend`](crate::traits::llm::LlmBackend) accepts.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::SanitizeError;
use crate::types::message::Message;

lazy_static! {
    static ref EMAIL_REGEX: Regex =
        Regex::new(r"(?i)\b[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}\b").unwrap();

    // US and international formats
    static ref PHONE_REGEX: Regex =
        Regex::new(r"(?:\+?1[-.\s]?)?\(?\b[0-9]{3}\)?[-.\s]?[0-9]{3}[-.\s]?[0-9]{4}\b").unwrap();

    static ref SSN_REGEX: Regex = Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap();

    static ref CARD_REGEX: Regex =
        Regex::new(r"\b(?:\d{4}[-\s]?){3}\d{4}\b|\b\d{4}[-\s]?\d{6}[-\s]?\d{5}\b").unwrap();
}

/// Text with PII replaced by typed tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedText(String);

impl SanitizedText {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SanitizedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SanitizedText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Regex-based redactor for emails, phone numbers, SSNs and card numbers.
#[derive(Debug, Clone, Default)]
pub struct ContentSanitizer;

impl ContentSanitizer {
    pub fn new() -> Self {
        Self
    }

    /// Redact PII, then re-scan. Any residual match blocks the text.
    pub fn sanitize(&self, text: &str) -> Result<SanitizedText, SanitizeError> {
        verify(redact(text))
    }

    /// Sanitized analysis text for a message: subject, body and attachment
    /// names. Redaction runs on the full text; the redacted text is then cut
    /// to `max_chars` and re-scanned.
    pub fn sanitize_message(
        &self,
        message: &Message,
        max_chars: usize,
    ) -> Result<SanitizedText, SanitizeError> {
        verify(truncate(redact(&compose(message)), max_chars))
    }
}

fn verify(redacted: String) -> Result<SanitizedText, SanitizeError> {
    match detect(&redacted) {
        Some(kind) => Err(SanitizeError::ResidualPii { kind }),
        None => Ok(SanitizedText(redacted)),
    }
}

/// Plain analysis text for a message (not yet sanitized).
pub fn compose(message: &Message) -> String {
    let mut text = format!("Subject: {}\n\n{}", message.subject.trim(), message.body.trim());
    if !message.attachments.is_empty() {
        let names: Vec<&str> = message
            .attachments
            .iter()
            .map(|a| a.filename.as_str())
            .collect();
        text.push_str("\n\nAttachments: ");
        text.push_str(&names.join(", "));
    }
    text
}

/// Cut `text` to at most `max_chars` characters.
pub fn truncate(mut text: String, max_chars: usize) -> String {
    if let Some((cut, _)) = text.char_indices().nth(max_chars) {
        text.truncate(cut);
    }
    text
}

fn redact(text: &str) -> String {
    let text = CARD_REGEX.replace_all(text, |caps: &regex::Captures| {
        let digits = caps[0].replace(['-', ' '], "");
        if is_valid_luhn(&digits) {
            "[CARD]".to_string()
        } else {
            caps[0].to_string()
        }
    });
    let text = SSN_REGEX.replace_all(&text, "[SSN]");
    let text = EMAIL_REGEX.replace_all(&text, "[EMAIL]");
    let text = PHONE_REGEX.replace_all(&text, "[PHONE]");
    text.into_owned()
}

/// First PII class still present in `text`.
fn detect(text: &str) -> Option<&'static str> {
    if EMAIL_REGEX.is_match(text) {
        return Some("email");
    }
    if SSN_REGEX.is_match(text) {
        return Some("ssn");
    }
    if PHONE_REGEX.is_match(text) {
        return Some("phone");
    }
    CARD_REGEX
        .find_iter(text)
        .any(|m| is_valid_luhn(&m.as_str().replace(['-', ' '], "")))
        .then_some("card")
}

fn is_valid_luhn(number: &str) -> bool {
    let digits: Vec<u32> = number.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    let checksum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(idx, &digit)| match idx % 2 {
            1 if digit * 2 > 9 => digit * 2 - 9,
            1 => digit * 2,
            _ => digit,
        })
        .sum();
    checksum % 10 == 0
}
