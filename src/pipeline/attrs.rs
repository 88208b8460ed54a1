//! Thread attribute extraction.
//!
//! One LLM call per stored inbound email derives a summary of the
//! conversation plus the lead's budget, property preferences, and
//! timeline, and writes them onto the thread. Best-effort: any failure
//! is logged and the previously stored attributes stand.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::PipelineError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, DEFAULT_MODEL};
use crate::ratelimit::RateLimiter;
use crate::store::{AccountSettings, EmailMessage, InvocationRecord, Store, ThreadAttributes};

const ATTRS_SYSTEM_PROMPT: &str = "You are an AI assistant that analyzes real estate \
conversations. Extract the following attributes from the conversation:

1. AI Summary: A concise phrase describing the current state of the conversation
2. Budget Range: A 2-4 word description of the lead's budget (use \"UNKNOWN\" if not mentioned)
3. Preferred Property Types: A maximum 5 word description of preferred property types (use \
\"UNKNOWN\" if not mentioned)
4. Timeline: A 2-5 word description of the lead's timeline to buy

Format your response exactly as:
ai_summary: [summary]
budget_range: [budget]
preferred_property_types: [types]
timeline: [timeline]";

pub struct AttributeExtractor {
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn Store>,
    limiter: Arc<RateLimiter>,
}

impl AttributeExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>, store: Arc<dyn Store>, limiter: Arc<RateLimiter>) -> Self {
        Self { llm, store, limiter }
    }

    /// Refresh the thread's derived attributes from the full chain.
    /// Never fails the record: extraction or persistence trouble is
    /// logged and the thread keeps whatever it had.
    pub async fn refresh(
        &self,
        account: &AccountSettings,
        conversation_id: &str,
        chain: &[EmailMessage],
    ) {
        let attrs = match self.extract(account, conversation_id, chain).await {
            Ok(attrs) => attrs,
            Err(err) => {
                warn!(%conversation_id, error = %err, "thread attribute extraction failed");
                return;
            }
        };
        match self
            .store
            .set_thread_attributes(&account.account_id, conversation_id, &attrs)
            .await
        {
            Ok(()) => info!(%conversation_id, summary = %attrs.ai_summary, "thread attributes updated"),
            Err(err) => {
                warn!(%conversation_id, error = %err, "failed to store thread attributes");
            }
        }
    }

    async fn extract(
        &self,
        account: &AccountSettings,
        conversation_id: &str,
        chain: &[EmailMessage],
    ) -> Result<ThreadAttributes, PipelineError> {
        self.limiter.check_ai(account).await?;

        let conversation = chain
            .iter()
            .map(|msg| {
                format!(
                    "From: {}\nSubject: {}\nBody: {}\n---\n",
                    msg.sender, msg.subject, msg.body
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let user_message = format!(
            "Please analyze this real estate conversation and provide the attributes:\n\n\
             {conversation}"
        );

        let request = CompletionRequest::new(
            DEFAULT_MODEL,
            vec![
                ChatMessage::system(ATTRS_SYSTEM_PROMPT),
                ChatMessage::user(user_message),
            ],
        )
        .with_temperature(0.1)
        .with_max_tokens(500)
        .with_stop(&["<|im_end|>", "<|endoftext|>"]);

        let response = self.llm.complete(request).await?;

        let record = InvocationRecord::new(
            &account.account_id,
            Some(conversation_id.to_string()),
            DEFAULT_MODEL,
            "thread_attributes",
            response.input_tokens,
            response.output_tokens,
        );
        if let Err(err) = self.store.record_invocation(&record).await {
            warn!(error = %err, "failed to record thread-attributes invocation");
        }

        parse_attributes(&response.content)
    }
}

/// Parse the model's `key: value` lines into the four attributes. Lines
/// without a colon are skipped; an unexpected key or a missing required
/// attribute rejects the whole response.
fn parse_attributes(content: &str) -> Result<ThreadAttributes, PipelineError> {
    let mut ai_summary = None;
    let mut budget_range = None;
    let mut preferred_property_types = None;
    let mut timeline = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase().replace([' ', '-'], "_");
        let value = clean_value(value);
        match key.as_str() {
            "ai_summary" => ai_summary = Some(value),
            "budget_range" => budget_range = Some(value),
            "preferred_property_types" => preferred_property_types = Some(value),
            "timeline" => timeline = Some(value),
            other => {
                return Err(PipelineError::Validation(format!(
                    "unexpected thread attribute: {other}"
                )));
            }
        }
    }

    let required = |field: &'static str, value: Option<String>| {
        value
            .filter(|v| !v.is_empty())
            .ok_or_else(|| PipelineError::Validation(format!("missing thread attribute: {field}")))
    };

    Ok(ThreadAttributes {
        ai_summary: required("ai_summary", ai_summary)?,
        budget_range: required("budget_range", budget_range)?,
        preferred_property_types: required(
            "preferred_property_types",
            preferred_property_types,
        )?,
        timeline: required("timeline", timeline)?,
    })
}

/// Collapse internal whitespace and strip stray edge punctuation.
fn clean_value(value: &str) -> String {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_matches(|c: char| ".,;:!?".contains(c))
        .trim()
        .to_string()
}
