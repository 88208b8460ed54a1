//! Review gate — the last check before automated generation.
//!
//! Fail-safe: any ambiguity or failure flags the conversation for a
//! human instead of letting the automation keep talking.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, DEFAULT_MODEL};
use crate::ratelimit::RateLimiter;
use crate::respond::prompts::{conversation_turns, reviewer_prompt};
use crate::store::{AccountSettings, EmailMessage, InvocationRecord, Store, ThreadRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewVerdict {
    /// Generation may proceed.
    Continue,
    /// A human needs to take over; the thread was marked and the send
    /// mutex released.
    Flag,
}

pub struct ReviewGate {
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn Store>,
    limiter: Arc<RateLimiter>,
}

impl ReviewGate {
    pub fn new(llm: Arc<dyn LlmProvider>, store: Arc<dyn Store>, limiter: Arc<RateLimiter>) -> Self {
        Self { llm, store, limiter }
    }

    /// Decide whether the conversation may receive an automated reply.
    ///
    /// A `Flag` verdict persists `flag_for_review` and releases the
    /// send mutex before returning.
    pub async fn review(
        &self,
        account: &AccountSettings,
        thread: &ThreadRecord,
        chain: &[EmailMessage],
    ) -> ReviewVerdict {
        if thread.flag_review_override {
            info!(
                conversation_id = %thread.conversation_id,
                "review override enabled, skipping reviewer"
            );
            return ReviewVerdict::Continue;
        }

        match self.decide(account, thread, chain).await {
            Some(ReviewVerdict::Continue) => {
                info!(conversation_id = %thread.conversation_id, "reviewer allowed continuation");
                ReviewVerdict::Continue
            }
            Some(ReviewVerdict::Flag) | None => {
                self.persist_flag(account, thread).await;
                ReviewVerdict::Flag
            }
        }
    }

    /// Returns None for any failure; the caller treats that as FLAG.
    async fn decide(
        &self,
        account: &AccountSettings,
        thread: &ThreadRecord,
        chain: &[EmailMessage],
    ) -> Option<ReviewVerdict> {
        if let Err(err) = self.limiter.check_ai(account).await {
            warn!(
                conversation_id = %thread.conversation_id,
                error = %err,
                "rate limit blocked reviewer"
            );
            return None;
        }

        let (system, params) = reviewer_prompt();
        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(conversation_turns(chain));
        let request = CompletionRequest::new(DEFAULT_MODEL, messages)
            .with_temperature(params.temperature)
            .with_max_tokens(params.max_tokens)
            .with_top_p(params.top_p)
            .with_stop(&["<|im_end|>", "<|endoftext|>"]);

        let response = match self.llm.complete(request).await {
            Ok(response) => response,
            Err(err) => {
                error!(
                    conversation_id = %thread.conversation_id,
                    error = %err,
                    "reviewer call failed, defaulting to FLAG"
                );
                return None;
            }
        };

        let record = InvocationRecord::new(
            &account.account_id,
            Some(thread.conversation_id.clone()),
            DEFAULT_MODEL,
            "reviewer",
            response.input_tokens,
            response.output_tokens,
        );
        if let Err(err) = self.store.record_invocation(&record).await {
            warn!(error = %err, "failed to record reviewer invocation");
        }

        let decision = response.content.trim().to_uppercase();
        info!(conversation_id = %thread.conversation_id, decision = %decision, "reviewer decision");
        match decision.as_str() {
            "CONTINUE" => Some(ReviewVerdict::Continue),
            "FLAG" => Some(ReviewVerdict::Flag),
            other => {
                warn!(decision = %other, "unknown reviewer decision, defaulting to FLAG");
                Some(ReviewVerdict::Flag)
            }
        }
    }

    async fn persist_flag(&self, account: &AccountSettings, thread: &ThreadRecord) {
        info!(conversation_id = %thread.conversation_id, "flagging conversation for review");
        if let Err(err) = self
            .store
            .set_flag_for_review(&account.account_id, &thread.conversation_id)
            .await
        {
            error!(
                conversation_id = %thread.conversation_id,
                error = %err,
                "failed to persist review flag"
            );
        }
    }
}
