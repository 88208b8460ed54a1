//! Quoted-reply stripping.
//!
//! A line classifier walks the body top to bottom; the first line that
//! looks like the start of quoted content (reply header, `>` quote,
//! forwarded-header block, signature separator) ends the fresh content.
//! Under-stripping is preferred to over-stripping: if the result would
//! drop more than ~90% of the input, the original is kept.

use std::sync::LazyLock;

use regex::RegexSet;

/// Patterns that mark the start of quoted or boilerplate content.
static REPLY_MARKERS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        // Reply headers: "On Fri, May 30, 2025 at 12:13 PM <x> wrote:"
        r"(?i)^On .+\d{4}.*wrote:$",
        r"(?i)^On .+ wrote:$",
        r"(?i)^On .* \d{1,2}/\d{1,2}/\d{2,4}.*wrote:$",
        // Outlook / Apple Mail header blocks
        r"(?i)^From:.*$",
        r"(?i)^Sent:.*$",
        r"(?i)^To:.*$",
        r"(?i)^Subject:.*$",
        r"(?i)^Date:.*$",
        r"(?i)^Cc:.*$",
        r"(?i)^Bcc:.*$",
        // Quoted lines and separators
        r"^>",
        r"^--\s*$",
        r"^_{2,}$",
        r"^={2,}$",
        // Forwards
        r"(?i)^Begin forwarded message:$",
        r"(?i)^Forwarded by .*$",
    ])
    .expect("reply marker patterns are valid")
});

/// Strip quoted reply content from an email body.
///
/// Idempotent, and never returns an empty string for non-empty input.
pub fn strip_quoted_reply(text: &str) -> String {
    if text.trim().is_empty() {
        return text.to_string();
    }

    let mut kept: Vec<&str> = Vec::new();
    let mut consecutive_blank = 0usize;

    for line in text.lines() {
        let trimmed = line.trim_end();
        if REPLY_MARKERS.is_match(trimmed.trim_start()) {
            // Everything from the first marker onward is quoted context.
            break;
        }
        if trimmed.trim().is_empty() {
            consecutive_blank += 1;
            if consecutive_blank <= 1 {
                kept.push("");
            }
        } else {
            consecutive_blank = 0;
            kept.push(trimmed);
        }
    }

    let cleaned = kept.join("\n").trim().to_string();

    // Over-stripping guard: keep the original when the classifier would
    // discard more than ~90% of the content, or everything.
    if cleaned.is_empty() || cleaned.len().saturating_mul(10) < text.trim().len() {
        return text.trim().to_string();
    }

    cleaned
}
