//! Persistent domain records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of an email relative to the account under management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// From the lead to the account.
    Inbound,
    /// From the account (human or automated) to the lead.
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// One immutable email in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub id: String,
    pub conversation_id: String,
    pub associated_account: String,
    pub direction: Direction,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// Normalized Message-ID of this email; inbound replies are matched
    /// against these to resolve their conversation.
    pub response_id: String,
    pub in_reply_to: String,
    pub references: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Mutable control record for one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub conversation_id: String,
    pub associated_account: String,
    /// Per-conversation send mutex: true while an automated reply is
    /// scheduled or in flight.
    pub busy: bool,
    pub automation_enabled: bool,
    /// Set by the post-scoring flag classifier.
    pub flag: bool,
    /// Set by the pre-generation review gate.
    pub flag_for_review: bool,
    /// When true, the review gate is skipped for this conversation.
    pub flag_review_override: bool,
    pub read: bool,
    /// Engagement score: 0..=100, or a negative sentinel
    /// (-2 invalid output, -3 transport failure, -4 rate limited).
    pub ev_score: Option<i32>,
    pub ai_summary: Option<String>,
    pub budget_range: Option<String>,
    pub preferred_property_types: Option<String>,
    pub timeline: Option<String>,
    pub spam: bool,
    /// Expiry for spam-classified threads, unset otherwise.
    pub ttl: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ThreadRecord {
    /// Fresh thread for a newly minted conversation.
    pub fn new(conversation_id: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            associated_account: account_id.into(),
            busy: false,
            automation_enabled: true,
            flag: false,
            flag_for_review: false,
            flag_review_override: false,
            read: false,
            ev_score: None,
            ai_summary: None,
            budget_range: None,
            preferred_property_types: None,
            timeline: None,
            spam: false,
            ttl: None,
            updated_at: Utc::now(),
        }
    }
}

/// LLM-derived conversation attributes, refreshed after each stored
/// inbound email. All four are required; the model answers "UNKNOWN"
/// for anything the conversation has not surfaced yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadAttributes {
    pub ai_summary: String,
    pub budget_range: String,
    pub preferred_property_types: String,
    pub timeline: String,
}

/// Per-account configuration: addressing, automation toggles, rate-limit
/// overrides, and the writing preferences infused into response prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSettings {
    pub account_id: String,
    /// The address automated replies are sent from; also how inbound
    /// destinations are mapped to an account.
    pub reply_address: String,
    pub display_name: String,
    pub auto_reply_enabled: bool,
    /// Per-pool limit overrides; engine defaults apply when unset.
    pub api_limit: Option<u32>,
    pub ai_limit: Option<u32>,
    pub tone: Option<String>,
    pub writing_style: Option<String>,
    pub bio: Option<String>,
    pub location: Option<String>,
}

impl AccountSettings {
    pub fn new(account_id: impl Into<String>, reply_address: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            reply_address: reply_address.into(),
            display_name: String::new(),
            auto_reply_enabled: true,
            api_limit: None,
            ai_limit: None,
            tone: None,
            writing_style: None,
            bio: None,
            location: None,
        }
    }
}

/// Append-only audit record for one LLM call.
#[derive(Debug, Clone)]
pub struct InvocationRecord {
    pub id: String,
    pub account_id: String,
    pub conversation_id: Option<String>,
    pub model: String,
    pub purpose: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub created_at: DateTime<Utc>,
}

impl InvocationRecord {
    pub fn new(
        account_id: impl Into<String>,
        conversation_id: Option<String>,
        model: impl Into<String>,
        purpose: impl Into<String>,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            conversation_id,
            model: model.into(),
            purpose: purpose.into(),
            input_tokens,
            output_tokens,
            created_at: Utc::now(),
        }
    }
}
