//! Inbound record processing.
//!
//! One record moves through the stages in order: normalize, spam gate,
//! persist, engagement scoring, automation checks, review, generation,
//! dispatch. A failure anywhere aborts only that record; the batch
//! keeps going.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use mail_parser::MessageParser;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::Caller;
use crate::config::EngineConfig;
use crate::dispatch::{DispatchPayload, DispatchScheduler};
use crate::error::{MailError, PipelineError, Result};
use crate::inbound::{InboundRecord, RawMailStore};
use crate::llm::LlmProvider;
use crate::mail::{extract_text, ThreadingIds};
use crate::pipeline::attrs::AttributeExtractor;
use crate::pipeline::ev::EvScorer;
use crate::pipeline::normalizer::resolve_conversation;
use crate::pipeline::spam::SpamGate;
use crate::ratelimit::RateLimiter;
use crate::respond::ResponseOrchestrator;
use crate::store::{AccountSettings, Direction, EmailMessage, Store, ThreadRecord};

/// Terminal state of one processed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Classified as spam; stored with a TTL and dropped from the pipeline.
    Spam,
    /// The flag classifier escalated the lead to a human.
    Escalated,
    /// Automation is off for the thread or the account.
    AutomationOff,
    /// The review gate flagged the conversation.
    ReviewFlagged,
    /// A reply was generated and scheduled.
    Scheduled,
    /// Another reply was already in flight for this conversation.
    MutexHeld,
}

pub struct EmailProcessor {
    store: Arc<dyn Store>,
    raw_mail: Arc<dyn RawMailStore>,
    limiter: Arc<RateLimiter>,
    spam: SpamGate,
    scorer: EvScorer,
    attrs: AttributeExtractor,
    orchestrator: ResponseOrchestrator,
    scheduler: DispatchScheduler,
    spam_ttl: ChronoDuration,
}

impl EmailProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        raw_mail: Arc<dyn RawMailStore>,
        llm: Arc<dyn LlmProvider>,
        limiter: Arc<RateLimiter>,
        scheduler: DispatchScheduler,
        config: &EngineConfig,
    ) -> Self {
        Self {
            spam: SpamGate::new(llm.clone(), store.clone()),
            scorer: EvScorer::new(llm.clone(), store.clone(), limiter.clone()),
            attrs: AttributeExtractor::new(llm.clone(), store.clone(), limiter.clone()),
            orchestrator: ResponseOrchestrator::new(llm, store.clone(), limiter.clone()),
            store,
            raw_mail,
            limiter,
            scheduler,
            spam_ttl: ChronoDuration::days(i64::from(config.spam_ttl_days)),
        }
    }

    /// Process a batch of queued records. Failures are logged per record
    /// and never abort the batch.
    pub async fn process_batch(&self, records: &[InboundRecord]) {
        for record in records {
            match self.process_record(record).await {
                Ok(outcome) => {
                    info!(storage_key = %record.storage_key, outcome = ?outcome, "record processed");
                }
                Err(err) => {
                    error!(
                        storage_key = %record.storage_key,
                        error = %err,
                        "failed to process inbound record"
                    );
                }
            }
        }
    }

    /// Drive one inbound email through the full pipeline.
    pub async fn process_record(&self, record: &InboundRecord) -> Result<ProcessOutcome> {
        let raw = self.raw_mail.fetch_raw(&record.storage_key).await?;
        let parsed = MessageParser::default()
            .parse(&raw)
            .ok_or_else(|| MailError::Parse(record.storage_key.clone()))?;

        let threading = ThreadingIds::from_message(&parsed);
        let body = extract_text(&parsed, &record.subject, &record.from);

        let account = self.account_for(&record.destination).await?;
        // Queue-driven work runs as the internal caller; the API pool
        // meters session traffic only.
        self.limiter
            .check_api(&Caller::internal(&account.account_id), &account)
            .await?;

        let resolved = resolve_conversation(self.store.as_ref(), &account.account_id, &threading)
            .await
            .map_err(PipelineError::from)?;
        let conversation_id = resolved.conversation_id.clone();

        let message = self.inbound_message(record, &account, &conversation_id, &threading, body);

        if self
            .spam
            .is_spam(&account.account_id, &record.subject, &message.body, &record.source)
            .await
        {
            self.quarantine(&account, &conversation_id, &message).await?;
            return Ok(ProcessOutcome::Spam);
        }

        self.store.append_message(&message).await.map_err(PipelineError::from)?;
        self.ensure_thread(&account, &conversation_id).await?;

        let chain = self
            .store
            .conversation_messages(&account.account_id, &conversation_id)
            .await
            .map_err(PipelineError::from)?;

        let ev = self.scorer.score(&account, &conversation_id, &chain).await;
        let flag = self.scorer.should_flag(&account, &conversation_id, &chain).await;
        self.store
            .set_ev_and_flag(&account.account_id, &conversation_id, ev.code(), flag)
            .await
            .map_err(PipelineError::from)?;

        // Derived attributes refresh on every stored email, escalated or
        // not; extraction trouble never stalls the record.
        self.attrs.refresh(&account, &conversation_id, &chain).await;

        if flag {
            info!(%conversation_id, "lead escalated by flag classifier");
            return Ok(ProcessOutcome::Escalated);
        }

        let thread = self
            .store
            .get_thread(&account.account_id, &conversation_id)
            .await
            .map_err(PipelineError::from)?
            .ok_or_else(|| PipelineError::ThreadNotFound(conversation_id.clone()))?;

        if !thread.automation_enabled || !account.auto_reply_enabled {
            info!(%conversation_id, "automation disabled, stopping after scoring");
            return Ok(ProcessOutcome::AutomationOff);
        }

        let reply = match self
            .orchestrator
            .generate(&account, &thread, &chain, None, resolved.is_first)
            .await?
        {
            Some(reply) => reply,
            None => return Ok(ProcessOutcome::ReviewFlagged),
        };

        let payload = DispatchPayload {
            account_id: account.account_id.clone(),
            conversation_id: conversation_id.clone(),
            recipient: record.source.clone(),
            subject: reply_subject(&record.subject),
            body: reply,
            in_reply_to: (!threading.raw_message_id.is_empty())
                .then(|| threading.raw_message_id.clone()),
            reply_to_id: message.response_id.clone(),
        };

        if self.scheduler.schedule_reply(payload).await? {
            Ok(ProcessOutcome::Scheduled)
        } else {
            Ok(ProcessOutcome::MutexHeld)
        }
    }

    /// Map the envelope destinations to a managed account. The first
    /// recipient with a configured reply address wins.
    async fn account_for(&self, destinations: &[String]) -> Result<AccountSettings> {
        for destination in destinations {
            if let Some(account) = self
                .store
                .account_by_address(destination)
                .await
                .map_err(PipelineError::from)?
            {
                return Ok(account);
            }
        }
        Err(PipelineError::AccountNotFound(destinations.join(", ")).into())
    }

    fn inbound_message(
        &self,
        record: &InboundRecord,
        account: &AccountSettings,
        conversation_id: &str,
        threading: &ThreadingIds,
        body: String,
    ) -> EmailMessage {
        // Some senders omit Message-ID entirely; mint one so the row
        // still has a usable key.
        let response_id = if threading.message_id.is_empty() {
            Uuid::new_v4().simple().to_string()
        } else {
            threading.message_id.clone()
        };
        EmailMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            associated_account: account.account_id.clone(),
            direction: Direction::Inbound,
            sender: record.source.clone(),
            recipient: account.reply_address.clone(),
            subject: record.subject.clone(),
            body,
            response_id,
            in_reply_to: threading.in_reply_to.clone(),
            references: threading.references.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Store a spam message and its thread stub with an expiry, with
    /// automation off so nothing downstream ever picks it up.
    async fn quarantine(
        &self,
        account: &AccountSettings,
        conversation_id: &str,
        message: &EmailMessage,
    ) -> Result<()> {
        warn!(%conversation_id, sender = %message.sender, "spam detected, quarantining");
        self.store.append_message(message).await.map_err(PipelineError::from)?;

        let mut thread = self
            .store
            .get_thread(&account.account_id, conversation_id)
            .await
            .map_err(PipelineError::from)?
            .unwrap_or_else(|| ThreadRecord::new(conversation_id, &account.account_id));
        thread.spam = true;
        thread.automation_enabled = false;
        thread.ttl = Some(Utc::now() + self.spam_ttl);
        thread.updated_at = Utc::now();
        self.store.upsert_thread(&thread).await.map_err(PipelineError::from)?;
        Ok(())
    }

    async fn ensure_thread(&self, account: &AccountSettings, conversation_id: &str) -> Result<()> {
        let existing = self
            .store
            .get_thread(&account.account_id, conversation_id)
            .await
            .map_err(PipelineError::from)?;
        if existing.is_none() {
            let thread = ThreadRecord::new(conversation_id, &account.account_id);
            self.store.upsert_thread(&thread).await.map_err(PipelineError::from)?;
        }
        Ok(())
    }
}

/// Reply subject: prefix with `Re:` exactly once.
fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.to_lowercase().starts_with("re:") {
        trimmed.to_string()
    } else {
        format!("Re: {trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ScheduleClient;
    use crate::error::{DispatchError, LlmError};
    use crate::inbound::InMemoryRawMail;
    use crate::llm::{CompletionRequest, CompletionResponse};
    use crate::store::LibSqlStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// One scripted LLM turn: a canned completion or a status failure.
    type Script = std::result::Result<&'static str, u16>;

    struct ScriptedLlm {
        replies: Mutex<VecDeque<std::result::Result<String, u16>>>,
    }

    impl ScriptedLlm {
        fn new(replies: &[Script]) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .iter()
                        .map(|r| r.map(str::to_string))
                        .collect(),
                ),
            }
        }

        fn remaining(&self) -> usize {
            self.replies.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> std::result::Result<CompletionResponse, LlmError> {
            let next = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted reply available");
            match next {
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

    struct RecordingClient {
        calls: Mutex<Vec<(String, Duration, DispatchPayload)>>,
    }

    #[async_trait]
    impl ScheduleClient for RecordingClient {
        async fn create_schedule(
            &self,
            name: &str,
            delay: Duration,
            payload: DispatchPayload,
        ) -> std::result::Result<(), DispatchError> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), delay, payload));
            Ok(())
        }
    }

    const RAW_FIRST_CONTACT: &str = "Message-ID: <first@mail.example.test>\r\n\
        From: Buyer <buyer@example.test>\r\n\
        To: agent@homes.test\r\n\
        Subject: Looking to buy\r\n\
        Content-Type: text/plain\r\n\r\n\
        Hi, I saw the listing on Oak Street and would love a tour.\r\n";

    fn record() -> InboundRecord {
        InboundRecord {
            storage_key: "inbound/first".into(),
            source: "buyer@example.test".into(),
            destination: vec!["agent@homes.test".into()],
            subject: "Looking to buy".into(),
            from: "Buyer <buyer@example.test>".into(),
        }
    }

    struct Fixture {
        processor: EmailProcessor,
        store: Arc<LibSqlStore>,
        raw_mail: Arc<InMemoryRawMail>,
        llm: Arc<ScriptedLlm>,
        client: Arc<RecordingClient>,
    }

    async fn setup(replies: &[Script]) -> Fixture {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        store
            .upsert_account(&AccountSettings::new("acct-1", "agent@homes.test"))
            .await
            .unwrap();

        let raw_mail = Arc::new(InMemoryRawMail::new());
        raw_mail.put("inbound/first", RAW_FIRST_CONTACT.as_bytes().to_vec());

        let llm = Arc::new(ScriptedLlm::new(replies));
        let config = EngineConfig::default();
        let limiter = Arc::new(RateLimiter::new(store.clone(), &config));
        let client = Arc::new(RecordingClient {
            calls: Mutex::new(Vec::new()),
        });
        let scheduler = DispatchScheduler::new(store.clone(), client.clone(), &config);
        let processor = EmailProcessor::new(
            store.clone(),
            raw_mail.clone(),
            llm.clone(),
            limiter,
            scheduler,
            &config,
        );
        Fixture {
            processor,
            store,
            raw_mail,
            llm,
            client,
        }
    }

    const ATTRS_REPLY: Script = Ok("ai_summary: Buyer asked to tour Oak Street\n\
        budget_range: UNKNOWN\n\
        preferred_property_types: UNKNOWN\n\
        timeline: this weekend");

    // Full pipeline order for one fresh lead:
    // spam, ev, flag, attrs, reviewer, selector, strategist, writer.
    fn happy_path() -> Vec<Script> {
        vec![
            Ok("not spam"),
            Ok("57"),
            Ok("ok"),
            ATTRS_REPLY,
            Ok("CONTINUE"),
            Ok("intro_email"),
            Ok("Lead with warmth, offer a Saturday tour, ask about budget."),
            Ok("Hi! I'd love to show you 12 Oak Street this Saturday."),
        ]
    }

    #[tokio::test]
    async fn first_contact_is_scored_and_scheduled() {
        let fx = setup(&happy_path()).await;

        let outcome = fx.processor.process_record(&record()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Scheduled);
        assert_eq!(fx.llm.remaining(), 0);

        let payload = {
            let calls = fx.client.calls.lock().unwrap();
            assert_eq!(calls.len(), 1);
            calls[0].2.clone()
        };
        assert_eq!(payload.subject, "Re: Looking to buy");
        assert_eq!(payload.recipient, "buyer@example.test");
        assert_eq!(
            payload.in_reply_to.as_deref(),
            Some("<first@mail.example.test>")
        );
        assert_eq!(payload.reply_to_id, "first");

        let thread = fx
            .store
            .get_thread("acct-1", &payload.conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(thread.ev_score, Some(57));
        assert_eq!(
            thread.ai_summary.as_deref(),
            Some("Buyer asked to tour Oak Street")
        );
        assert_eq!(thread.timeline.as_deref(), Some("this weekend"));
        assert!(thread.busy);
        assert!(!thread.spam);
    }

    async fn payload_conversation(store: &LibSqlStore) -> String {
        store
            .conversation_by_response_id("acct-1", "first")
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn spam_is_quarantined_before_scoring() {
        let fx = setup(&[Ok("spam")]).await;

        let outcome = fx.processor.process_record(&record()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Spam);
        // No scoring, review, or generation calls happened.
        assert_eq!(fx.llm.remaining(), 0);
        assert!(fx.client.calls.lock().unwrap().is_empty());

        let conversation_id = payload_conversation(&fx.store).await;
        let thread = fx
            .store
            .get_thread("acct-1", &conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert!(thread.spam);
        assert!(!thread.automation_enabled);
        assert!(thread.ttl.is_some());
    }

    #[tokio::test]
    async fn flag_classifier_escalates_and_stops() {
        let fx = setup(&[Ok("not spam"), Ok("88"), Ok("flag"), ATTRS_REPLY]).await;

        let outcome = fx.processor.process_record(&record()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Escalated);
        assert!(fx.client.calls.lock().unwrap().is_empty());

        let conversation_id = payload_conversation(&fx.store).await;
        let thread = fx
            .store
            .get_thread("acct-1", &conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert!(thread.flag);
        assert_eq!(thread.ev_score, Some(88));
    }

    #[tokio::test]
    async fn disabled_auto_reply_stops_after_scoring() {
        let fx = setup(&[Ok("not spam"), Ok("42"), Ok("ok"), ATTRS_REPLY]).await;
        let mut account = AccountSettings::new("acct-1", "agent@homes.test");
        account.auto_reply_enabled = false;
        fx.store.upsert_account(&account).await.unwrap();

        let outcome = fx.processor.process_record(&record()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::AutomationOff);
        assert!(fx.client.calls.lock().unwrap().is_empty());

        // The score was still persisted.
        let conversation_id = payload_conversation(&fx.store).await;
        let thread = fx
            .store
            .get_thread("acct-1", &conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(thread.ev_score, Some(42));
    }

    #[tokio::test]
    async fn reviewer_flag_generates_nothing() {
        let fx = setup(&[Ok("not spam"), Ok("42"), Ok("ok"), ATTRS_REPLY, Ok("FLAG")]).await;

        let outcome = fx.processor.process_record(&record()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::ReviewFlagged);
        assert!(fx.client.calls.lock().unwrap().is_empty());

        let conversation_id = payload_conversation(&fx.store).await;
        let thread = fx
            .store
            .get_thread("acct-1", &conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert!(thread.flag_for_review);
    }

    #[tokio::test]
    async fn unknown_destination_is_an_error() {
        let fx = setup(&[]).await;
        let mut record = record();
        record.destination = vec!["nobody@elsewhere.test".into()];

        let result = fx.processor.process_record(&record).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn busy_conversation_is_not_scheduled_twice() {
        let mut replies = happy_path();
        replies.extend([
            Ok("not spam"),
            Ok("60"),
            Ok("ok"),
            ATTRS_REPLY,
            Ok("CONTINUE"),
            Ok("continuation_email"),
            Ok("Confirm the Saturday tour and ask for a phone number."),
            Ok("Great, see you Saturday! What's the best number to reach you?"),
        ]);
        let fx = setup(&replies).await;

        let first = fx.processor.process_record(&record()).await.unwrap();
        assert_eq!(first, ProcessOutcome::Scheduled);

        // A reply into the same conversation while the first schedule is
        // still pending: everything up to dispatch runs, but the mutex
        // refuses a second schedule.
        let raw_reply = "Message-ID: <second@mail.example.test>\r\n\
            In-Reply-To: <first@mail.example.test>\r\n\
            From: Buyer <buyer@example.test>\r\n\
            To: agent@homes.test\r\n\
            Subject: Re: Looking to buy\r\n\
            Content-Type: text/plain\r\n\r\n\
            Actually, can we do Sunday instead?\r\n";
        fx.raw_mail.put("inbound/second", raw_reply.as_bytes().to_vec());

        let mut second_record = record();
        second_record.storage_key = "inbound/second".into();
        second_record.subject = "Re: Looking to buy".into();

        let outcome = fx.processor.process_record(&second_record).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::MutexHeld);
        assert_eq!(fx.client.calls.lock().unwrap().len(), 1);

        let conversation_id = payload_conversation(&fx.store).await;
        let thread = fx
            .store
            .get_thread("acct-1", &conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert!(thread.busy);
    }

    #[test]
    fn reply_subject_prefixes_once() {
        assert_eq!(reply_subject("Looking to buy"), "Re: Looking to buy");
        assert_eq!(reply_subject("Re: Looking to buy"), "Re: Looking to buy");
        assert_eq!(reply_subject("RE: offer"), "RE: offer");
    }
}
