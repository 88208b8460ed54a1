//! Error types for Leadpilot.

use std::time::Duration;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Authorization error: {0}")]
    Auth(#[from] AuthError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Inbound email parsing / normalization errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Failed to parse raw email: {0}")]
    Parse(String),

    #[error("Raw message not found for storage key {0}")]
    RawNotFound(String),

    #[error("Malformed queue envelope: {0}")]
    Envelope(String),
}

/// LLM API errors. Non-200 responses and missing `choices` are hard
/// failures for the individual call; per-component fail-open/fail-safe
/// policy is applied by the caller.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid LLM response: {0}")]
    InvalidResponse(String),

    #[error("LLM transport error: {0}")]
    Transport(String),

    #[error("LLM call gave up after {attempts} attempts (last wait {last_delay:?})")]
    RetriesExhausted {
        attempts: u32,
        last_delay: Duration,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether the failure is worth retrying (transient upstream trouble).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500,
            Self::Transport(_) => true,
            _ => false,
        }
    }
}

/// Session/account mismatch. Rejected, no retry.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Session {session_id} is not valid for account {account_id}")]
    Unauthorized {
        account_id: String,
        session_id: String,
    },
}

/// Caller-visible rate-limit rejection. No retry, no queue redelivery.
#[derive(Debug, thiserror::Error)]
#[error("Rate limit exceeded for account {account_id} ({pool} pool, limit {limit})")]
pub struct RateLimitError {
    pub account_id: String,
    pub pool: &'static str,
    pub limit: u32,
}

/// Conversation-processing errors. Each inbound unit fails independently;
/// none of these propagate past the worker loop.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Missing or malformed request field: {0}")]
    Validation(String),

    #[error("No account found for destination {0}")]
    AccountNotFound(String),

    #[error("Thread not found for conversation {0}")]
    ThreadNotFound(String),

    #[error("Conversation {0} has no messages")]
    EmptyConversation(String),

    #[error("Engagement scoring failed for conversation {conversation_id} (code {code})")]
    EvFailed {
        conversation_id: String,
        code: i32,
    },

    #[error("Generated response was empty for scenario {0}")]
    EmptyResponse(&'static str),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),
}

/// Scheduling / delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Failed to create schedule {name}: {reason}")]
    Schedule { name: String, reason: String },

    #[error("Failed to send email: {0}")]
    Send(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
