//! Body text extraction with layered fallbacks.
//!
//! Preference order: plain-text part, HTML part stripped to text, raw
//! payload, and finally a header-only stub. The result is never empty —
//! downstream classifiers need something to look at.

use std::sync::LazyLock;

use mail_parser::Message;
use regex::Regex;

use crate::mail::quotes::strip_quoted_reply;

static HTML_TAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static WHITESPACE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("valid regex"));

/// Extract readable, quote-stripped text from a parsed email.
///
/// `subject` and `from` come from the queue envelope and feed the
/// header-only stub when no body can be recovered.
pub fn extract_text(msg: &Message<'_>, subject: &str, from: &str) -> String {
    let raw = raw_body_text(msg).unwrap_or_else(|| header_stub(subject, from));
    let cleaned = strip_quoted_reply(&raw);
    if cleaned.is_empty() {
        // strip_quoted_reply guards against this, but the stub is the
        // final backstop for a pathological empty raw body.
        return header_stub(subject, from);
    }
    cleaned
}

fn raw_body_text(msg: &Message<'_>) -> Option<String> {
    if let Some(text) = msg.body_text(0) {
        let text = text.trim().to_string();
        if !text.is_empty() {
            return Some(text);
        }
    }
    if let Some(html) = msg.body_html(0) {
        let text = strip_html(html.as_ref());
        if !text.is_empty() {
            return Some(text);
        }
    }
    // Last resort: whatever bytes the first part holds.
    let raw = String::from_utf8_lossy(msg.raw_message());
    let tail = raw
        .split_once("\r\n\r\n")
        .or_else(|| raw.split_once("\n\n"))
        .map(|(_, body)| body.trim().to_string())?;
    (!tail.is_empty()).then_some(tail)
}

/// Crude HTML-to-text: drop tags, collapse whitespace.
fn strip_html(html: &str) -> String {
    let no_tags = HTML_TAGS.replace_all(html, " ");
    WHITESPACE_RUNS
        .replace_all(&no_tags, " ")
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Minimal stand-in body built from headers. Never empty.
fn header_stub(subject: &str, from: &str) -> String {
    let subject = if subject.is_empty() { "No Subject" } else { subject };
    let from = if from.is_empty() { "Unknown Sender" } else { from };
    format!("Subject: {subject}\nFrom: {from}\n\n[Email content could not be extracted]")
}
