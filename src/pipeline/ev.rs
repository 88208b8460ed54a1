//! Engagement-value scoring and the post-scoring flag classifier.
//!
//! The scorer asks the model for a bare integer 0-100. The model gets
//! two attempts to produce one; everything else maps to a negative
//! sentinel so downstream consumers can distinguish "cold lead" from
//! "scoring never happened".

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, DEFAULT_MODEL};
use crate::ratelimit::RateLimiter;
use crate::store::{AccountSettings, Direction, EmailMessage, InvocationRecord, Store};

static EV_INTEGER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}$").expect("valid regex"));

const EV_SYSTEM_PROMPT: &str = "You are an assistant that assesses how likely a prospective \
buyer is to convert—expressed as an integer percentage from 0 to 100—based solely on the email \
thread between a realtor and a buyer.

RULES (follow exactly):
1. Always return exactly one integer between 0 and 100, with no extra text, no explanations, \
and no punctuation.
2. Provide highly granular scores that reflect subtle differences in buyer behavior.
3. NEVER default to round numbers (like 20, 25, 30) unless the signals are truly ambiguous. \
Use the full range of numbers to capture nuanced differences.
4. Evaluate urgency, financing questions, positive signals, hesitations, message frequency, \
pre-approval status, tour readiness, and offer readiness with precise weighting.
5. If you have very little context, still make your best speculative guess based on the \
available signals, but lean conservative (lower scores).";

const FLAG_SYSTEM_PROMPT: &str = "You are an assistant that evaluates whether an AI-driven \
buyer-realtor conversation has reached true conversion readiness and should be handed off to \
a human realtor (i.e. exit the automated pipeline).

Return exactly one word: \"flag\" if the lead is ready to be converted and needs a human \
realtor to close the deal, or \"ok\" if it should remain in automated nurturing.

Flag (return \"flag\") only when the buyer:
1. Explicitly expresses firm intent to purchase (\"I want to buy,\" \"let's make an offer,\" etc.)
2. Asks to schedule a property viewing with no further qualification needed
3. Inquires about financing or pre-approval
4. Requests next steps toward making an offer or contract
5. Shows any unambiguous buying signal that a human touch is required to close

Note: If you feel like nowhere near enough content is available for the realtor at this \
point, do not return \"flag\".

Do NOT flag (return \"ok\") if the buyer:
1. Is only gathering general information (e.g. neighborhood questions)
2. Is asking purely about logistics or availability without stating intent to buy
3. Is in early-stage browsing or remains vague about buying
4. Requires more nurturing or qualification before human handoff

The goal is to escalate only fully qualified, ready-to-buy leads. Return ONLY \"flag\" or \"ok\".";

/// Outcome of engagement scoring. Sentinel codes are stored alongside
/// real scores so a failed run is visible in the thread record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvScore {
    /// Valid score, clamped to 0..=100.
    Value(u8),
    /// The AI rate-limit pool rejected the call. Code -4.
    RateLimited,
    /// The model never produced a bare integer. Code -2.
    InvalidOutput,
    /// Transport or API failure. Code -3.
    Transport,
}

impl EvScore {
    pub fn code(&self) -> i32 {
        match self {
            Self::Value(v) => i32::from(*v),
            Self::RateLimited => -4,
            Self::InvalidOutput => -2,
            Self::Transport => -3,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Value(_))
    }
}

pub struct EvScorer {
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn Store>,
    limiter: Arc<RateLimiter>,
}

impl EvScorer {
    pub fn new(llm: Arc<dyn LlmProvider>, store: Arc<dyn Store>, limiter: Arc<RateLimiter>) -> Self {
        Self { llm, store, limiter }
    }

    /// Score a conversation's conversion likelihood.
    pub async fn score(
        &self,
        account: &AccountSettings,
        conversation_id: &str,
        chain: &[EmailMessage],
    ) -> EvScore {
        match self.limiter.check_ai(account).await {
            Ok(()) => {}
            Err(PipelineError::RateLimit(_)) => return EvScore::RateLimited,
            Err(err) => {
                warn!(error = %err, "rate limit check failed during scoring");
                return EvScore::Transport;
            }
        }

        let thread_text = tag_conversation(&account.reply_address, chain);
        let user_message = format!(
            "Here is the email thread:\n{thread_text}\n\nBased on the conversation above, \
             what is the likelihood (0-100) that this buyer will convert? Return ONLY the integer:"
        );
        let request = CompletionRequest::new(
            DEFAULT_MODEL,
            vec![
                ChatMessage::system(EV_SYSTEM_PROMPT),
                ChatMessage::user(user_message),
            ],
        )
        .with_temperature(0.0)
        .with_max_tokens(5)
        .with_top_p(0.1)
        .with_stop(&["\n", ".", " ", ","]);

        // Two attempts for a clean integer; failures are not retried.
        for attempt in 1..=2u32 {
            let response = match self.llm.complete(request.clone()).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(%conversation_id, error = %err, "engagement scoring call failed");
                    return EvScore::Transport;
                }
            };

            let raw = response.content.trim().to_string();
            if EV_INTEGER.is_match(&raw) {
                let score = raw.parse::<u16>().unwrap_or(0).min(100) as u8;
                info!(%conversation_id, score, "engagement score");
                self.record(account, conversation_id, "ev_calculation", &response)
                    .await;
                return EvScore::Value(score);
            }
            warn!(%conversation_id, attempt, raw = %raw, "non-integer score, retrying");
        }

        warn!(%conversation_id, "no valid integer after retries");
        EvScore::InvalidOutput
    }

    /// Decide whether the lead is conversion-ready and should leave the
    /// automated pipeline. Failures classify as not flagged.
    pub async fn should_flag(
        &self,
        account: &AccountSettings,
        conversation_id: &str,
        chain: &[EmailMessage],
    ) -> bool {
        let formatted = chain
            .iter()
            .map(|msg| {
                format!(
                    "From: {}\nSubject: {}\nBody: {}\n---\n",
                    msg.sender, msg.subject, msg.body
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let request = CompletionRequest::new(
            DEFAULT_MODEL,
            vec![
                ChatMessage::system(FLAG_SYSTEM_PROMPT),
                ChatMessage::user(formatted),
            ],
        )
        .with_temperature(0.0)
        .with_max_tokens(5)
        .with_top_p(0.1)
        .with_stop(&["\n", ".", " ", ","]);

        let response = match self.llm.complete(request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(%conversation_id, error = %err, "flag classification failed, keeping in pipeline");
                return false;
            }
        };

        self.record(account, conversation_id, "flag", &response).await;
        let verdict = response.content.trim().to_lowercase();
        info!(%conversation_id, verdict = %verdict, "flag classification");
        verdict == "flag"
    }

    async fn record(
        &self,
        account: &AccountSettings,
        conversation_id: &str,
        purpose: &str,
        response: &crate::llm::CompletionResponse,
    ) {
        let record = InvocationRecord::new(
            &account.account_id,
            Some(conversation_id.to_string()),
            DEFAULT_MODEL,
            purpose,
            response.input_tokens,
            response.output_tokens,
        );
        if let Err(err) = self.store.record_invocation(&record).await {
            warn!(error = %err, purpose, "failed to record invocation");
        }
    }
}

/// Tag each message with the speaking party, keyed off the account's
/// reply address.
fn tag_conversation(reply_address: &str, chain: &[EmailMessage]) -> String {
    chain
        .iter()
        .map(|msg| {
            let tag = if msg.sender.eq_ignore_ascii_case(reply_address)
                || msg.direction == Direction::Outbound
            {
                "REALTOR: "
            } else {
                "BUYER: "
            };
            format!("{tag}{}", msg.body)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
