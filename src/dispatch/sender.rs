//! Scheduled delivery.
//!
//! The deliverer runs when a schedule fires. It re-reads the thread
//! before doing anything: if the send mutex was released in the
//! meantime a human has taken over and the reply is dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dispatch::mailer::{Mailer, OutboundEmail};
use crate::dispatch::scheduler::{DispatchPayload, ScheduleClient};
use crate::error::{DispatchError, StoreError};
use crate::mail::normalize_msg_id;
use crate::store::{Direction, EmailMessage, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    /// The thread disappeared between scheduling and firing.
    SkippedMissingThread,
    /// The send mutex was released while the schedule was pending.
    SkippedReleased,
}

pub struct Deliverer {
    store: Arc<dyn Store>,
    mailer: Arc<dyn Mailer>,
}

impl Deliverer {
    pub fn new(store: Arc<dyn Store>, mailer: Arc<dyn Mailer>) -> Self {
        Self { store, mailer }
    }

    /// Send one scheduled reply, append it to the conversation, and
    /// release the send mutex.
    pub async fn deliver(&self, payload: &DispatchPayload) -> Result<DeliveryOutcome, DispatchError> {
        let thread = match self
            .store
            .get_thread(&payload.account_id, &payload.conversation_id)
            .await?
        {
            Some(thread) => thread,
            None => {
                warn!(
                    conversation_id = %payload.conversation_id,
                    "thread missing at delivery time, dropping reply"
                );
                return Ok(DeliveryOutcome::SkippedMissingThread);
            }
        };

        if !thread.busy {
            info!(
                conversation_id = %payload.conversation_id,
                "send mutex released while pending, dropping reply"
            );
            return Ok(DeliveryOutcome::SkippedReleased);
        }

        let account = self
            .store
            .get_account(&payload.account_id)
            .await?
            .ok_or_else(|| {
                DispatchError::Store(StoreError::NotFound {
                    entity: "account",
                    id: payload.account_id.clone(),
                })
            })?;

        let domain = account
            .reply_address
            .split('@')
            .nth(1)
            .unwrap_or("localhost");
        let message_id = format!("<{}@{}>", Uuid::new_v4().simple(), domain);
        let from = if account.display_name.is_empty() {
            account.reply_address.clone()
        } else {
            format!("{} <{}>", account.display_name, account.reply_address)
        };

        let email = OutboundEmail {
            from,
            to: payload.recipient.clone(),
            subject: payload.subject.clone(),
            body: payload.body.clone(),
            message_id: message_id.clone(),
            in_reply_to: payload.in_reply_to.clone(),
        };
        self.mailer.send(&email).await?;

        let outbound = EmailMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: payload.conversation_id.clone(),
            associated_account: payload.account_id.clone(),
            direction: Direction::Outbound,
            sender: account.reply_address.clone(),
            recipient: payload.recipient.clone(),
            subject: payload.subject.clone(),
            body: payload.body.clone(),
            response_id: normalize_msg_id(&message_id),
            in_reply_to: payload
                .in_reply_to
                .as_deref()
                .map(normalize_msg_id)
                .unwrap_or_default(),
            references: Vec::new(),
            timestamp: Utc::now(),
        };
        self.store.append_message(&outbound).await?;

        self.store
            .release_busy(&payload.account_id, &payload.conversation_id)
            .await?;

        info!(
            conversation_id = %payload.conversation_id,
            message_id = %message_id,
            "automated reply delivered"
        );
        Ok(DeliveryOutcome::Sent)
    }
}

/// Schedule backend that fires inside the current process: a spawned
/// task sleeps through the delay and delivers once, with no retry.
pub struct InProcessScheduler {
    deliverer: Arc<Deliverer>,
}

impl InProcessScheduler {
    pub fn new(deliverer: Arc<Deliverer>) -> Self {
        Self { deliverer }
    }
}

#[async_trait]
impl ScheduleClient for InProcessScheduler {
    async fn create_schedule(
        &self,
        name: &str,
        delay: Duration,
        payload: DispatchPayload,
    ) -> Result<(), DispatchError> {
        let deliverer = self.deliverer.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match deliverer.deliver(&payload).await {
                Ok(outcome) => {
                    info!(schedule = %name, outcome = ?outcome, "schedule fired");
                }
                Err(err) => {
                    error!(schedule = %name, error = %err, "scheduled delivery failed");
                    if let Err(release_err) = deliverer
                        .store
                        .release_busy(&payload.account_id, &payload.conversation_id)
                        .await
                    {
                        warn!(error = %release_err, "failed to release send mutex");
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AccountSettings, LibSqlStore, ThreadRecord};
    use std::sync::Mutex;

    struct RecordingMailer {
        sent: Mutex<Vec<OutboundEmail>>,
        fail: bool,
    }

    impl RecordingMailer {
        fn new(fail: bool) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, email: &OutboundEmail) -> Result<(), DispatchError> {
            if self.fail {
                return Err(DispatchError::Send("relay refused".into()));
            }
            self.sent.lock().unwrap().push(email.clone());
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

    async fn setup(fail: bool) -> (Deliverer, Arc<LibSqlStore>, Arc<RecordingMailer>) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let mut account = AccountSettings::new("acct-1", "agent@homes.test");
        account.display_name = "Jordan Realty".into();
        store.upsert_account(&account).await.unwrap();
        store
            .upsert_thread(&ThreadRecord::new("conv-1", "acct-1"))
            .await
            .unwrap();
        let mailer = Arc::new(RecordingMailer::new(fail));
        let deliverer = Deliverer::new(store.clone(), mailer.clone());
        (deliverer, store, mailer)
    }

    #[tokio::test]
    async fn delivers_and_releases_mutex() {
        let (deliverer, store, mailer) = setup(false).await;
        store.try_acquire_busy("acct-1", "conv-1").await.unwrap();

        let outcome = deliverer.deliver(&payload()).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Sent);

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].from, "Jordan Realty <agent@homes.test>");
        assert_eq!(sent[0].in_reply_to.as_deref(), Some("<abc@mail.example.test>"));
        assert!(sent[0].message_id.ends_with("@homes.test>"));
        drop(sent);

        let thread = store.get_thread("acct-1", "conv-1").await.unwrap().unwrap();
        assert!(!thread.busy);

        let messages = store
            .conversation_messages("acct-1", "conv-1")
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].direction, Direction::Outbound);
        assert_eq!(messages[0].in_reply_to, "abc");
    }

    #[tokio::test]
    async fn released_mutex_drops_reply() {
        let (deliverer, store, mailer) = setup(false).await;
        // Mutex never acquired: a human took over before the fire time.
        let outcome = deliverer.deliver(&payload()).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::SkippedReleased);
        assert!(mailer.sent.lock().unwrap().is_empty());

        let messages = store
            .conversation_messages("acct-1", "conv-1")
            .await
            .unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn missing_thread_drops_reply() {
        let (deliverer, _store, mailer) = setup(false).await;
        let mut payload = payload();
        payload.conversation_id = "conv-unknown".into();

        let outcome = deliverer.deliver(&payload).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::SkippedMissingThread);
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_failure_leaves_no_outbound_record() {
        let (deliverer, store, _mailer) = setup(true).await;
        store.try_acquire_busy("acct-1", "conv-1").await.unwrap();

        let result = deliverer.deliver(&payload()).await;
        assert!(result.is_err());

        let messages = store
            .conversation_messages("acct-1", "conv-1")
            .await
            .unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn in_process_schedule_fires_after_delay() {
        let (deliverer, store, mailer) = setup(false).await;
        store.try_acquire_busy("acct-1", "conv-1").await.unwrap();
        let scheduler = InProcessScheduler::new(Arc::new(deliverer));

        scheduler
            .create_schedule("send-reply-abc-0011", Duration::from_secs(10), payload())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;

        assert_eq!(mailer.sent.lock().unwrap().len(), 1);
        let thread = store.get_thread("acct-1", "conv-1").await.unwrap().unwrap();
        assert!(!thread.busy);
    }
}
