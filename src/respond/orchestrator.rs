//! Response orchestration: review, scenario selection, and the
//! two-step strategist/writer workflow with direct-call fallback.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::PipelineError;
use crate::llm::{ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, DEFAULT_MODEL};
use crate::pipeline::review::{ReviewGate, ReviewVerdict};
use crate::ratelimit::RateLimiter;
use crate::respond::prompts::{conversation_turns, prompt_config, selector_prompt, GenParams};
use crate::respond::scenario::Scenario;
use crate::store::{AccountSettings, Direction, EmailMessage, InvocationRecord, Store};

/// Minimum length for strategist instructions to be considered usable.
const MIN_INSTRUCTION_CHARS: usize = 10;

pub struct ResponseOrchestrator {
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn Store>,
    limiter: Arc<RateLimiter>,
    review: ReviewGate,
}

impl ResponseOrchestrator {
    pub fn new(llm: Arc<dyn LlmProvider>, store: Arc<dyn Store>, limiter: Arc<RateLimiter>) -> Self {
        let review = ReviewGate::new(llm.clone(), store.clone(), limiter.clone());
        Self {
            llm,
            store,
            limiter,
            review,
        }
    }

    /// Generate an automated reply for a conversation.
    ///
    /// Returns `Ok(None)` when the review gate pulled the conversation
    /// out of the pipeline; the thread was already marked for review.
    pub async fn generate(
        &self,
        account: &AccountSettings,
        thread: &crate::store::ThreadRecord,
        chain: &[EmailMessage],
        scenario_override: Option<Scenario>,
        is_first: bool,
    ) -> Result<Option<String>, PipelineError> {
        // The reviewer runs only when no scenario was forced.
        if scenario_override.is_none()
            && self.review.review(account, thread, chain).await == ReviewVerdict::Flag
        {
            info!(
                conversation_id = %thread.conversation_id,
                "flagged for review, no reply generated"
            );
            return Ok(None);
        }

        // A first contact is answered on its own; stale context from a
        // mis-threaded chain must not leak into the introduction.
        let chain = if is_first && !chain.is_empty() {
            &chain[..1]
        } else {
            chain
        };

        let scenario = match scenario_override {
            Some(scenario) => scenario,
            None => self.select_scenario(account, thread, chain).await,
        };
        info!(
            conversation_id = %thread.conversation_id,
            scenario = %scenario,
            "generating response"
        );

        let config = prompt_config(scenario, account);
        let turns = conversation_turns(chain);

        // Two-step workflow: strategist first, then the writer with the
        // strategist's instructions appended to its system prompt. Any
        // stage failing falls back to the direct call.
        if let Some((strategist_system, strategist_params)) = &config.middleman {
            let purpose = format!("{scenario}_middleman");
            match self
                .call(account, thread, &purpose, strategist_system, *strategist_params, &turns)
                .await
            {
                Ok(instructions) if instructions.trim().len() >= MIN_INSTRUCTION_CHARS => {
                    let combined = format!(
                        "{}\n\nStrategic Instructions:\n{}",
                        config.system,
                        instructions.trim()
                    );
                    match self
                        .call(account, thread, scenario.as_str(), &combined, config.params, &turns)
                        .await
                    {
                        Ok(reply) => return finalize(scenario, reply),
                        Err(err) => {
                            warn!(error = %err, "writer failed, falling back to direct call");
                        }
                    }
                }
                Ok(short) => {
                    warn!(
                        chars = short.trim().len(),
                        "strategist instructions unusable, falling back to direct call"
                    );
                }
                Err(err) => {
                    warn!(error = %err, "strategist failed, falling back to direct call");
                }
            }
        }

        let reply = self
            .call(account, thread, scenario.as_str(), &config.system, config.params, &turns)
            .await?;
        finalize(scenario, reply)
    }

    /// Pick the scenario for an unforced generation: the latest message
    /// being ours means the lead went quiet, otherwise the selector
    /// model classifies the conversation.
    async fn select_scenario(
        &self,
        account: &AccountSettings,
        thread: &crate::store::ThreadRecord,
        chain: &[EmailMessage],
    ) -> Scenario {
        if chain.is_empty() {
            return Scenario::IntroEmail;
        }
        if chain
            .last()
            .is_some_and(|msg| msg.direction == Direction::Outbound)
        {
            info!("latest message is outbound, following up");
            return Scenario::FollowUp;
        }

        let (system, params) = selector_prompt();
        let turns = conversation_turns(chain);
        match self
            .call(account, thread, "selector", system, params, &turns)
            .await
        {
            Ok(raw) => match Scenario::parse(&raw) {
                Some(scenario) if scenario.selectable() => {
                    info!(scenario = %scenario, "selector chose scenario");
                    scenario
                }
                _ => {
                    warn!(raw = %raw, "invalid selector output, defaulting to continuation");
                    Scenario::ContinuationEmail
                }
            },
            Err(err) => {
                warn!(error = %err, "selector failed, defaulting to continuation");
                Scenario::ContinuationEmail
            }
        }
    }

    /// One rate-checked model call with invocation accounting.
    async fn call(
        &self,
        account: &AccountSettings,
        thread: &crate::store::ThreadRecord,
        purpose: &str,
        system: &str,
        params: GenParams,
        turns: &[ChatMessage],
    ) -> Result<String, PipelineError> {
        self.limiter.check_ai(account).await?;

        let mut messages = Vec::with_capacity(turns.len() + 1);
        messages.push(ChatMessage::system(system));
        messages.extend_from_slice(turns);

        let request = CompletionRequest::new(DEFAULT_MODEL, messages)
            .with_temperature(params.temperature)
            .with_max_tokens(params.max_tokens)
            .with_top_p(params.top_p)
            .with_stop(&["<|im_end|>", "<|endoftext|>"]);

        let response = self.llm.complete(request).await?;
        self.record(account, thread, purpose, &response).await;
        Ok(response.content)
    }

    async fn record(
        &self,
        account: &AccountSettings,
        thread: &crate::store::ThreadRecord,
        purpose: &str,
        response: &CompletionResponse,
    ) {
        let record = InvocationRecord::new(
            &account.account_id,
            Some(thread.conversation_id.clone()),
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

fn finalize(scenario: Scenario, reply: String) -> Result<Option<String>, PipelineError> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::EmptyResponse(scenario.as_str()));
    }
    Ok(Some(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::LlmError;
    use crate::store::{LibSqlStore, ThreadRecord};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays scripted replies in order and captures each request's
    /// system prompt for assertions.
    struct ScriptedLlm {
        replies: Vec<Result<String, u16>>,
        calls: AtomicU32,
        systems: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<Result<&'static str, u16>>) -> Self {
            Self {
                replies: replies
                    .into_iter()
                    .map(|r| r.map(str::to_string))
                    .collect(),
                calls: AtomicU32::new(0),
                systems: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.systems
                .lock()
                .unwrap()
                .push(request.messages[0].content.clone());
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.replies.get(n).cloned().unwrap_or(Err(500)) {
                Ok(content) => Ok(CompletionResponse {
                    content,
                    input_tokens: 100,
                    output_tokens: 20,
                }),
                Err(status) => Err(LlmError::Status {
                    status,
                    body: String::new(),
                }),
            }
        }
    }

    fn message(direction: Direction, body: &str) -> EmailMessage {
        EmailMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: "conv-1".into(),
            associated_account: "acct-1".into(),
            direction,
            sender: match direction {
                Direction::Inbound => "buyer@example.test".into(),
                Direction::Outbound => "agent@homes.test".into(),
            },
            recipient: "whoever".into(),
            subject: "12 Oak Street".into(),
            body: body.into(),
            response_id: uuid::Uuid::new_v4().to_string(),
            in_reply_to: String::new(),
            references: vec![],
            timestamp: Utc::now(),
        }
    }

    async fn setup(
        replies: Vec<Result<&'static str, u16>>,
        ai_limit: u32,
    ) -> (ResponseOrchestrator, Arc<ScriptedLlm>, Arc<LibSqlStore>) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        store
            .upsert_thread(&ThreadRecord::new("conv-1", "acct-1"))
            .await
            .unwrap();
        let config = EngineConfig {
            default_ai_limit: ai_limit,
            ..EngineConfig::default()
        };
        let limiter = Arc::new(RateLimiter::new(store.clone(), &config));
        let llm = Arc::new(ScriptedLlm::new(replies));
        let orchestrator = ResponseOrchestrator::new(llm.clone(), store.clone(), limiter);
        (orchestrator, llm, store)
    }

    fn account() -> AccountSettings {
        AccountSettings::new("acct-1", "agent@homes.test")
    }

    fn thread() -> ThreadRecord {
        ThreadRecord::new("conv-1", "acct-1")
    }

    #[tokio::test]
    async fn two_step_workflow_on_selector_choice() {
        // reviewer CONTINUE -> selector -> strategist -> writer
        let (orchestrator, llm, _store) = setup(
            vec![
                Ok("CONTINUE"),
                Ok("continuation_email"),
                Ok("ACKNOWLEDGE: their tour request and propose times"),
                Ok("Hey Sam, Saturday at 2pm works great for a tour!"),
            ],
            100,
        )
        .await;

        let chain = vec![message(Direction::Inbound, "Can we tour Saturday?")];
        let reply = orchestrator
            .generate(&account(), &thread(), &chain, None, false)
            .await
            .unwrap();
        assert_eq!(
            reply.as_deref(),
            Some("Hey Sam, Saturday at 2pm works great for a tour!")
        );
        assert_eq!(llm.call_count(), 4);

        // The writer saw the strategist's instructions.
        let systems = llm.systems.lock().unwrap();
        assert!(systems[3].contains("Strategic Instructions:"));
        assert!(systems[3].contains("their tour request"));
    }

    #[tokio::test]
    async fn selector_intro_shorthand_maps_to_intro_email() {
        let (orchestrator, llm, _store) = setup(
            vec![
                Ok("CONTINUE"),
                Ok("intro"),
                Ok("GREETING_APPROACH: warm, acknowledge their interest"),
                Ok("Hi! Thanks for reaching out about 12 Oak Street."),
            ],
            100,
        )
        .await;

        let chain = vec![message(Direction::Inbound, "Saw your listing, very interested!")];
        let reply = orchestrator
            .generate(&account(), &thread(), &chain, None, false)
            .await
            .unwrap();
        assert!(reply.is_some());
        let systems = llm.systems.lock().unwrap();
        assert!(systems[2].contains("intro emails"), "strategist should be the intro one");
    }

    #[tokio::test]
    async fn latest_outbound_uses_follow_up_without_selector() {
        // reviewer CONTINUE -> strategist -> writer (no selector call)
        let (orchestrator, llm, _store) = setup(
            vec![
                Ok("CONTINUE"),
                Ok("PREVIOUS_CONTEXT: offered Saturday tour, no reply yet"),
                Ok("Hi Sam, just checking in about that Saturday tour."),
            ],
            100,
        )
        .await;

        let chain = vec![
            message(Direction::Inbound, "Can we tour Saturday?"),
            message(Direction::Outbound, "Sure, what time works?"),
        ];
        let reply = orchestrator
            .generate(&account(), &thread(), &chain, None, false)
            .await
            .unwrap();
        assert!(reply.is_some());
        assert_eq!(llm.call_count(), 3);
        let systems = llm.systems.lock().unwrap();
        assert!(systems[1].contains("follow-up emails"));
    }

    #[tokio::test]
    async fn review_flag_yields_none() {
        let (orchestrator, llm, store) = setup(vec![Ok("FLAG")], 100).await;
        let chain = vec![message(Direction::Inbound, "I want to make an offer now")];
        let reply = orchestrator
            .generate(&account(), &thread(), &chain, None, false)
            .await
            .unwrap();
        assert_eq!(reply, None);
        assert_eq!(llm.call_count(), 1);
        let loaded = store.get_thread("acct-1", "conv-1").await.unwrap().unwrap();
        assert!(loaded.flag_for_review);
    }

    #[tokio::test]
    async fn scenario_override_skips_reviewer_and_selector() {
        let (orchestrator, llm, _store) = setup(
            vec![
                Ok("CLOSING_TYPE: QUALIFIED_HANDOFF"),
                Ok("It's been a pleasure! Your agent will reach out directly."),
            ],
            100,
        )
        .await;

        let chain = vec![message(Direction::Inbound, "We're ready to buy")];
        let reply = orchestrator
            .generate(
                &account(),
                &thread(),
                &chain,
                Some(Scenario::ClosingReferral),
                false,
            )
            .await
            .unwrap();
        assert!(reply.is_some());
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn short_strategist_output_falls_back_to_direct() {
        let (orchestrator, llm, _store) = setup(
            vec![
                Ok("CONTINUE"),
                Ok("continuation_email"),
                Ok("ok"), // under the usable threshold
                Ok("Hey Sam, happy to help with that."),
            ],
            100,
        )
        .await;

        let chain = vec![message(Direction::Inbound, "What's the HOA fee?")];
        let reply = orchestrator
            .generate(&account(), &thread(), &chain, None, false)
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some("Hey Sam, happy to help with that."));
        // The direct call runs on the plain system prompt.
        let systems = llm.systems.lock().unwrap();
        assert!(!systems[3].contains("Strategic Instructions:"));
    }

    #[tokio::test]
    async fn writer_failure_falls_back_to_direct() {
        let (orchestrator, llm, _store) = setup(
            vec![
                Ok("CONTINUE"),
                Ok("continuation_email"),
                Ok("ACKNOWLEDGE: answer their question about schools"),
                Err(500),
                Ok("Hey, the local schools are excellent."),
            ],
            100,
        )
        .await;

        let chain = vec![message(Direction::Inbound, "How are the schools?")];
        let reply = orchestrator
            .generate(&account(), &thread(), &chain, None, false)
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some("Hey, the local schools are excellent."));
        assert_eq!(llm.call_count(), 5);
    }

    #[tokio::test]
    async fn invalid_selector_output_defaults_to_continuation() {
        let (orchestrator, llm, _store) = setup(
            vec![
                Ok("CONTINUE"),
                Ok("escalate_immediately"),
                Ok("ACKNOWLEDGE: their question"),
                Ok("Hey, great question!"),
            ],
            100,
        )
        .await;

        let chain = vec![message(Direction::Inbound, "Tell me more")];
        orchestrator
            .generate(&account(), &thread(), &chain, None, false)
            .await
            .unwrap();
        let systems = llm.systems.lock().unwrap();
        assert!(systems[2].contains("ongoing real estate email conversations"));
    }

    #[tokio::test]
    async fn first_contact_trims_chain_to_first_message() {
        let (orchestrator, llm, _store) = setup(
            vec![
                Ok("ACKNOWLEDGE: x"),
                Ok("Welcome!"),
            ],
            100,
        )
        .await;

        // Mis-threaded chain: two messages, but this is a first contact.
        let chain = vec![
            message(Direction::Inbound, "Hello, new lead here"),
            message(Direction::Outbound, "stale context"),
        ];
        orchestrator
            .generate(
                &account(),
                &thread(),
                &chain,
                Some(Scenario::IntroEmail),
                true,
            )
            .await
            .unwrap();

        // Both calls saw only the single first message (system + 1 turn).
        assert_eq!(llm.call_count(), 2);
        let systems = llm.systems.lock().unwrap();
        assert!(systems[0].contains("intro emails"));
    }

    #[tokio::test]
    async fn exhausted_ai_pool_aborts_with_rate_limit() {
        let (orchestrator, _llm, _store) = setup(vec![Ok("ignored")], 0).await;
        let chain = vec![message(Direction::Inbound, "hello")];
        let err = orchestrator
            .generate(
                &account(),
                &thread(),
                &chain,
                Some(Scenario::ContinuationEmail),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RateLimit(_)));
    }

    #[tokio::test]
    async fn blank_reply_is_an_error() {
        let (orchestrator, _llm, _store) = setup(
            vec![
                Ok("ACKNOWLEDGE: something relevant here"),
                Ok("   "),
                Ok(""),
            ],
            100,
        )
        .await;

        let chain = vec![message(Direction::Inbound, "hello")];
        let err = orchestrator
            .generate(
                &account(),
                &thread(),
                &chain,
                Some(Scenario::ContinuationEmail),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyResponse(_)));
    }
}
