//! Async storage trait.
//!
//! Everything is scoped by `associated_account`; a conversation id from
//! one account never resolves records belonging to another.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::model::{
    AccountSettings, EmailMessage, InvocationRecord, ThreadAttributes, ThreadRecord,
};

/// Rate-limit pool identifier, stored as its string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatePool {
    /// General request pool, checked for session callers.
    Api,
    /// LLM invocation pool, checked before every model call.
    Ai,
}

impl RatePool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Ai => "ai",
        }
    }
}

/// Persistence operations used by the pipeline, orchestrator, and
/// dispatcher. The production backend is libSQL; tests run it in memory.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Messages ────────────────────────────────────────────────────

    /// Append one immutable message to its conversation.
    async fn append_message(&self, message: &EmailMessage) -> Result<(), StoreError>;

    /// All messages of a conversation, oldest first.
    async fn conversation_messages(
        &self,
        account_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<EmailMessage>, StoreError>;

    /// Resolve the conversation owning a stored message with this
    /// normalized Message-ID, if any.
    async fn conversation_by_response_id(
        &self,
        account_id: &str,
        response_id: &str,
    ) -> Result<Option<String>, StoreError>;

    // ── Threads ─────────────────────────────────────────────────────

    async fn upsert_thread(&self, thread: &ThreadRecord) -> Result<(), StoreError>;

    async fn get_thread(
        &self,
        account_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ThreadRecord>, StoreError>;

    /// Write the engagement score and flag in one update. A set flag
    /// forces `busy` back to false in the same statement.
    async fn set_ev_and_flag(
        &self,
        account_id: &str,
        conversation_id: &str,
        ev_score: i32,
        flag: bool,
    ) -> Result<(), StoreError>;

    /// Overwrite the thread's LLM-derived attributes.
    async fn set_thread_attributes(
        &self,
        account_id: &str,
        conversation_id: &str,
        attrs: &ThreadAttributes,
    ) -> Result<(), StoreError>;

    /// Mark the thread for human review and release the send mutex.
    async fn set_flag_for_review(
        &self,
        account_id: &str,
        conversation_id: &str,
    ) -> Result<(), StoreError>;

    /// Atomically take the per-conversation send mutex. Returns false
    /// when the thread is already busy (or does not exist).
    async fn try_acquire_busy(
        &self,
        account_id: &str,
        conversation_id: &str,
    ) -> Result<bool, StoreError>;

    /// Release the send mutex.
    async fn release_busy(
        &self,
        account_id: &str,
        conversation_id: &str,
    ) -> Result<(), StoreError>;

    // ── Accounts ────────────────────────────────────────────────────

    async fn upsert_account(&self, account: &AccountSettings) -> Result<(), StoreError>;

    async fn get_account(&self, account_id: &str) -> Result<Option<AccountSettings>, StoreError>;

    /// Map an inbound destination address to its account.
    async fn account_by_address(
        &self,
        address: &str,
    ) -> Result<Option<AccountSettings>, StoreError>;

    // ── Rate limits ─────────────────────────────────────────────────

    /// Consume one invocation from the account's pool. The counter
    /// check and increment happen in a single conditional statement:
    /// concurrent callers can never push the window past `limit`.
    /// Returns false when the pool is exhausted.
    async fn try_consume(
        &self,
        account_id: &str,
        pool: RatePool,
        limit: u32,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    // ── Invocations ─────────────────────────────────────────────────

    async fn record_invocation(&self, record: &InvocationRecord) -> Result<(), StoreError>;
}
