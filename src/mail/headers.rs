//! Threading-header normalization.
//!
//! Mail clients disagree on Message-ID formatting (angle brackets,
//! varying domains after forwarding through relays), so ids are reduced
//! to their local token before comparison or storage.

use mail_parser::Message;

/// Normalized threading identifiers for one email.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadingIds {
    /// Normalized Message-ID of this email.
    pub message_id: String,
    /// Message-ID exactly as it appeared on the wire, brackets and all.
    /// Outbound replies thread against this, not the normalized form.
    pub raw_message_id: String,
    /// Normalized In-Reply-To, empty when absent.
    pub in_reply_to: String,
    /// Normalized References, with In-Reply-To merged in when absent.
    pub references: Vec<String>,
}

impl ThreadingIds {
    /// Extract and normalize threading ids from a parsed email.
    pub fn from_message(msg: &Message<'_>) -> Self {
        let raw_message_id = header_text(msg, "Message-ID");
        let message_id = normalize_msg_id(&raw_message_id);
        let in_reply_to = normalize_msg_id(header_text(msg, "In-Reply-To"));

        let mut references: Vec<String> = header_text(msg, "References")
            .split_whitespace()
            .map(normalize_msg_id)
            .filter(|id| !id.is_empty())
            .collect();

        // Merge In-Reply-To into References for better threading.
        if !in_reply_to.is_empty() && !references.contains(&in_reply_to) {
            references.push(in_reply_to.clone());
        }

        Self {
            message_id,
            raw_message_id,
            in_reply_to,
            references,
        }
    }

    /// True when the email carries no threading information at all.
    pub fn is_unthreaded(&self) -> bool {
        self.in_reply_to.is_empty() && self.references.is_empty()
    }
}

/// Normalize a Message-ID-style header value: trim whitespace and angle
/// brackets, then keep only the local token before the `@`.
pub fn normalize_msg_id(raw: impl AsRef<str>) -> String {
    let trimmed = raw
        .as_ref()
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>');
    trimmed.split('@').next().unwrap_or_default().to_string()
}

fn header_text(msg: &Message<'_>, name: &str) -> String {
    msg.header_raw(name)
        .map(|raw| raw.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mail_parser::MessageParser;

    fn parse(raw: &str) -> Message<'_> {
        MessageParser::default()
            .parse(raw.as_bytes())
            .expect("test email parses")
    }

    #[test]
    fn normalizes_angle_brackets_and_domain() {
        assert_eq!(normalize_msg_id("<abc123@mail.example.test>"), "abc123");
        assert_eq!(normalize_msg_id("  <abc123@x>  "), "abc123");
        assert_eq!(normalize_msg_id("abc123"), "abc123");
        assert_eq!(normalize_msg_id(""), "");
    }

    #[test]
    fn merges_in_reply_to_into_references() {
        let raw = "Message-ID: <new@a.test>\r\n\
                   In-Reply-To: <parent@b.test>\r\n\
                   References: <root@c.test>\r\n\
                   From: buyer@example.test\r\n\
                   To: agent@homes.test\r\n\
                   Subject: Re: 12 Oak Street\r\n\r\nbody";
        let ids = ThreadingIds::from_message(&parse(raw));
        assert_eq!(ids.message_id, "new");
        assert_eq!(ids.raw_message_id, "<new@a.test>");
        assert_eq!(ids.in_reply_to, "parent");
        assert_eq!(ids.references, vec!["root".to_string(), "parent".to_string()]);
    }

    #[test]
    fn does_not_duplicate_in_reply_to() {
        let raw = "Message-ID: <new@a.test>\r\n\
                   In-Reply-To: <parent@b.test>\r\n\
                   References: <root@c.test> <parent@other.domain>\r\n\
                   Subject: Re: hi\r\n\r\nbody";
        let ids = ThreadingIds::from_message(&parse(raw));
        assert_eq!(ids.references, vec!["root".to_string(), "parent".to_string()]);
    }

    #[test]
    fn unthreaded_first_contact() {
        let raw = "Message-ID: <first@a.test>\r\nSubject: Looking to buy\r\n\r\nbody";
        let ids = ThreadingIds::from_message(&parse(raw));
        assert!(ids.is_unthreaded());
        assert_eq!(ids.message_id, "first");
    }
}
