//! Spam gate — LLM binary classification of inbound email.
//!
//! Fail-open: any failure after retries classifies the email as not
//! spam, so a flaky model can never silence a real lead.

use std::sync::Arc;

use tracing::{info, warn};

use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, RetryPolicy, DEFAULT_MODEL};
use crate::store::{InvocationRecord, Store};

const SPAM_SYSTEM_PROMPT: &str = "You are a spam detection system for a real estate automation \
platform. Your job is to determine if an email is relevant to real estate conversations or if \
it should be classified as spam.

CLASSIFY AS SPAM if the email is:
- Marketing/promotional emails unrelated to real estate
- Newsletter subscriptions
- Social media notifications
- Online shopping confirmations/receipts
- Technical notifications (server alerts, software updates, etc.)
- Personal emails clearly unrelated to real estate business
- Automated system emails from non-real estate platforms
- Job postings unrelated to real estate

CLASSIFY AS NOT SPAM if the email is:
- Inquiries about buying/selling/renting property
- Questions about real estate services
- Responses to property listings
- Real estate market inquiries
- Mortgage/financing related to property purchases
- Property management questions
- Real estate investment inquiries
- Follow-up emails about property viewings or consultations

Respond with ONLY the word \"spam\" or \"not spam\" - nothing else.";

pub struct SpamGate {
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn Store>,
    retry: RetryPolicy,
}

impl SpamGate {
    pub fn new(llm: Arc<dyn LlmProvider>, store: Arc<dyn Store>) -> Self {
        Self {
            llm,
            store,
            retry: RetryPolicy::default(),
        }
    }

    /// Classify one inbound email. Returns true when it is spam.
    pub async fn is_spam(
        &self,
        account_id: &str,
        subject: &str,
        body: &str,
        sender: &str,
    ) -> bool {
        let email_content = format!("Subject: {subject}\nFrom: {sender}\nBody: {body}");
        let request = CompletionRequest::new(
            DEFAULT_MODEL,
            vec![
                ChatMessage::system(SPAM_SYSTEM_PROMPT),
                ChatMessage::user(email_content),
            ],
        )
        .with_temperature(0.1)
        .with_max_tokens(10)
        .with_top_p(0.9)
        .with_stop(&["<|im_end|>", "<|endoftext|>"]);

        let response = match self
            .retry
            .run("spam_detection", || self.llm.complete(request.clone()))
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(account_id = %account_id, error = %err, "spam detection failed, assuming not spam");
                return false;
            }
        };

        let record = InvocationRecord::new(
            account_id,
            None,
            DEFAULT_MODEL,
            "spam_detection",
            response.input_tokens,
            response.output_tokens,
        );
        if let Err(err) = self.store.record_invocation(&record).await {
            warn!(error = %err, "failed to record spam detection invocation");
        }

        let text = response.content.trim().to_lowercase();
        let is_spam = text.contains("spam") && !text.contains("not spam");
        info!(account_id = %account_id, verdict = %text, is_spam, "spam classification");
        is_spam
    }
}
