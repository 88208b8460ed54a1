//! Reply scheduling.
//!
//! An approved reply is not sent inline: it is handed to a one-shot
//! schedule that fires after a short, jittered delay. The window gives a
//! human time to take the conversation over (releasing the send mutex
//! cancels delivery), and the mutex itself guarantees at most one
//! automated reply is ever in flight per conversation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::DispatchError;
use crate::store::Store;

/// Everything the deliverer needs to send one reply, self-contained so
/// the schedule can fire long after the triggering request finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub account_id: String,
    pub conversation_id: String,
    /// Lead address the reply goes to.
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// Raw Message-ID header of the inbound email being answered, used
    /// for In-Reply-To / References on the outbound MIME.
    pub in_reply_to: Option<String>,
    /// Normalized id of the inbound email; names the schedule.
    pub reply_to_id: String,
}

/// One-shot schedule backend. No retries: a failed delivery is logged
/// and the send mutex released, never re-fired.
#[async_trait]
pub trait ScheduleClient: Send + Sync {
    async fn create_schedule(
        &self,
        name: &str,
        delay: Duration,
        payload: DispatchPayload,
    ) -> Result<(), DispatchError>;
}

/// Derive a schedule name that is unique per reply but still readable:
/// a truncated prefix of the base plus a digest suffix, so two inbound
/// emails with long shared prefixes never collide.
pub fn schedule_name(base: &str) -> String {
    let digest = Sha256::digest(base.as_bytes());
    let prefix: String = base.chars().take(20).collect();
    format!("{prefix}-{}", &hex::encode(digest)[..12])
}

pub struct DispatchScheduler {
    store: Arc<dyn Store>,
    client: Arc<dyn ScheduleClient>,
    delay: Duration,
    jitter: Duration,
}

impl DispatchScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn ScheduleClient>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            client,
            delay: config.dispatch_delay,
            jitter: config.dispatch_jitter,
        }
    }

    /// Acquire the conversation's send mutex and schedule delivery.
    ///
    /// Returns false without scheduling when the mutex is already held,
    /// so concurrent processing of the same conversation can never queue
    /// a second reply. If the schedule itself cannot be created the
    /// mutex is released before the error propagates.
    pub async fn schedule_reply(&self, payload: DispatchPayload) -> Result<bool, DispatchError> {
        let acquired = self
            .store
            .try_acquire_busy(&payload.account_id, &payload.conversation_id)
            .await?;
        if !acquired {
            info!(
                conversation_id = %payload.conversation_id,
                "send mutex already held, skipping schedule"
            );
            return Ok(false);
        }

        let name = schedule_name(&format!("send-reply-{}", payload.reply_to_id));
        let delay = self.jittered_delay();
        info!(
            conversation_id = %payload.conversation_id,
            schedule = %name,
            delay_ms = delay.as_millis() as u64,
            "scheduling reply"
        );

        if let Err(err) = self.client.create_schedule(&name, delay, payload.clone()).await {
            error!(
                conversation_id = %payload.conversation_id,
                error = %err,
                "failed to create schedule, releasing send mutex"
            );
            if let Err(release_err) = self
                .store
                .release_busy(&payload.account_id, &payload.conversation_id)
                .await
            {
                warn!(error = %release_err, "failed to release send mutex");
            }
            return Err(err);
        }

        Ok(true)
    }

    fn jittered_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.delay;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        self.delay + Duration::from_millis(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LibSqlStore, ThreadRecord};
    use std::sync::Mutex;

    struct RecordingClient {
        calls: Mutex<Vec<(String, Duration, DispatchPayload)>>,
        fail: bool,
    }

    impl RecordingClient {
        fn new(fail: bool) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl ScheduleClient for RecordingClient {
        async fn create_schedule(
            &self,
            name: &str,
            delay: Duration,
            payload: DispatchPayload,
        ) -> Result<(), DispatchError> {
            if self.fail {
                return Err(DispatchError::Schedule {
                    name: name.to_string(),
                    reason: "backend unavailable".to_string(),
                });
            }
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), delay, payload));
            Ok(())
        }
    }

    fn payload() -> DispatchPayload {
        DispatchPayload {
            account_id: "acct-1".into(),
            conversation_id: "conv-1".into(),
            recipient: "buyer@example.test".into(),
            subject: "Re: 12 Oak Street".into(),
            body: "Saturday works!".into(),
            in_reply_to: Some("<abc@mail.example.test>".into()),
            reply_to_id: "abc".into(),
        }
    }

    async fn setup(fail: bool) -> (DispatchScheduler, Arc<LibSqlStore>, Arc<RecordingClient>) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        store
            .upsert_thread(&ThreadRecord::new("conv-1", "acct-1"))
            .await
            .unwrap();
        let client = Arc::new(RecordingClient::new(fail));
        let config = EngineConfig {
            dispatch_delay: Duration::from_secs(10),
            dispatch_jitter: Duration::from_secs(3),
            ..EngineConfig::default()
        };
        let scheduler = DispatchScheduler::new(store.clone(), client.clone(), &config);
        (scheduler, store, client)
    }

    #[test]
    fn schedule_name_is_deterministic_and_bounded() {
        let a = schedule_name("send-reply-abcdefghijklmnopqrstuvwxyz");
        let b = schedule_name("send-reply-abcdefghijklmnopqrstuvwxyz");
        assert_eq!(a, b);
        assert!(a.starts_with("send-reply-abcdefghi"));
        assert_eq!(a.len(), 20 + 1 + 12);

        // Same 20-char prefix, different tail: names must differ.
        let c = schedule_name("send-reply-abcdefghijklmnopqrstuvwxyZ");
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn scheduling_acquires_mutex_and_creates_schedule() {
        let (scheduler, store, client) = setup(false).await;
        let scheduled = scheduler.schedule_reply(payload()).await.unwrap();
        assert!(scheduled);

        let thread = store.get_thread("acct-1", "conv-1").await.unwrap().unwrap();
        assert!(thread.busy);

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (name, delay, payload) = &calls[0];
        assert!(name.starts_with("send-reply-abc-"));
        assert!(*delay >= Duration::from_secs(10));
        assert!(*delay <= Duration::from_secs(13));
        assert_eq!(payload.conversation_id, "conv-1");
    }

    #[tokio::test]
    async fn held_mutex_skips_scheduling() {
        let (scheduler, store, client) = setup(false).await;
        store.try_acquire_busy("acct-1", "conv-1").await.unwrap();

        let scheduled = scheduler.schedule_reply(payload()).await.unwrap();
        assert!(!scheduled);
        assert!(client.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_one_of_two_competing_schedules_wins() {
        let (scheduler, _store, client) = setup(false).await;
        let first = scheduler.schedule_reply(payload()).await.unwrap();
        let second = scheduler.schedule_reply(payload()).await.unwrap();
        assert!(first);
        assert!(!second);
        assert_eq!(client.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_schedule_releases_mutex() {
        let (scheduler, store, _client) = setup(true).await;
        let result = scheduler.schedule_reply(payload()).await;
        assert!(result.is_err());

        let thread = store.get_thread("acct-1", "conv-1").await.unwrap().unwrap();
        assert!(!thread.busy);
    }
}
