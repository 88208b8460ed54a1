//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. The per-conversation
//! send mutex and the rate-limit counters rely on conditional single
//! statements, so correctness does not depend on wrapping transactions.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::model::{
    AccountSettings, Direction, EmailMessage, InvocationRecord, ThreadAttributes, ThreadRecord,
};
use crate::store::traits::{RatePool, Store};

/// libSQL storage backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create database directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn query_err(e: libsql::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn str_to_direction(s: &str) -> Direction {
    match s {
        "outbound" => Direction::Outbound,
        _ => Direction::Inbound,
    }
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, associated_account, direction, sender, \
                               recipient, subject, body, response_id, in_reply_to, \
                               reference_ids, timestamp";

fn row_to_message(row: &libsql::Row) -> Result<EmailMessage, libsql::Error> {
    let direction: String = row.get(3)?;
    let references_json: String = row.get(10)?;
    let timestamp: String = row.get(11)?;
    Ok(EmailMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        associated_account: row.get(2)?,
        direction: str_to_direction(&direction),
        sender: row.get(4)?,
        recipient: row.get(5)?,
        subject: row.get(6)?,
        body: row.get(7)?,
        response_id: row.get(8)?,
        in_reply_to: row.get(9)?,
        references: serde_json::from_str(&references_json).unwrap_or_default(),
        timestamp: parse_datetime(&timestamp),
    })
}

const THREAD_COLUMNS: &str = "conversation_id, associated_account, busy, automation_enabled, \
                              flag, flag_for_review, flag_review_override, read, ev_score, \
                              ai_summary, budget_range, preferred_property_types, timeline, \
                              spam, ttl, updated_at";

fn row_to_thread(row: &libsql::Row) -> Result<ThreadRecord, libsql::Error> {
    let updated: String = row.get(15)?;
    Ok(ThreadRecord {
        conversation_id: row.get(0)?,
        associated_account: row.get(1)?,
        busy: row.get::<i64>(2)? != 0,
        automation_enabled: row.get::<i64>(3)? != 0,
        flag: row.get::<i64>(4)? != 0,
        flag_for_review: row.get::<i64>(5)? != 0,
        flag_review_override: row.get::<i64>(6)? != 0,
        read: row.get::<i64>(7)? != 0,
        ev_score: row.get::<i64>(8).ok().map(|v| v as i32),
        ai_summary: row.get(9).ok(),
        budget_range: row.get(10).ok(),
        preferred_property_types: row.get(11).ok(),
        timeline: row.get(12).ok(),
        spam: row.get::<i64>(13)? != 0,
        ttl: row
            .get::<i64>(14)
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        updated_at: parse_datetime(&updated),
    })
}

const ACCOUNT_COLUMNS: &str = "account_id, reply_address, display_name, auto_reply_enabled, \
                               api_limit, ai_limit, tone, writing_style, bio, location";

fn row_to_account(row: &libsql::Row) -> Result<AccountSettings, libsql::Error> {
    Ok(AccountSettings {
        account_id: row.get(0)?,
        reply_address: row.get(1)?,
        display_name: row.get(2)?,
        auto_reply_enabled: row.get::<i64>(3)? != 0,
        api_limit: row.get::<i64>(4).ok().map(|v| v as u32),
        ai_limit: row.get::<i64>(5).ok().map(|v| v as u32),
        tone: row.get(6).ok(),
        writing_style: row.get(7).ok(),
        bio: row.get(8).ok(),
        location: row.get(9).ok(),
    })
}

// ── Store implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn append_message(&self, message: &EmailMessage) -> Result<(), StoreError> {
        let references_json =
            serde_json::to_string(&message.references).unwrap_or_else(|_| "[]".into());
        self.conn()
            .execute(
                "INSERT INTO messages (id, conversation_id, associated_account, direction, \
                 sender, recipient, subject, body, response_id, in_reply_to, reference_ids, \
                 timestamp) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    message.id.as_str(),
                    message.conversation_id.as_str(),
                    message.associated_account.as_str(),
                    message.direction.as_str(),
                    message.sender.as_str(),
                    message.recipient.as_str(),
                    message.subject.as_str(),
                    message.body.as_str(),
                    message.response_id.as_str(),
                    message.in_reply_to.as_str(),
                    references_json,
                    message.timestamp.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn conversation_messages(
        &self,
        account_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<EmailMessage>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE associated_account = ?1 AND conversation_id = ?2 \
             ORDER BY timestamp ASC, id ASC"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![account_id, conversation_id])
            .await
            .map_err(query_err)?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            messages.push(row_to_message(&row).map_err(query_err)?);
        }
        Ok(messages)
    }

    async fn conversation_by_response_id(
        &self,
        account_id: &str,
        response_id: &str,
    ) -> Result<Option<String>, StoreError> {
        if response_id.is_empty() {
            return Ok(None);
        }
        let mut rows = self
            .conn()
            .query(
                "SELECT conversation_id FROM messages \
                 WHERE associated_account = ?1 AND response_id = ?2 LIMIT 1",
                params![account_id, response_id],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row.get(0).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn upsert_thread(&self, thread: &ThreadRecord) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO threads (conversation_id, associated_account, busy, \
                 automation_enabled, flag, flag_for_review, flag_review_override, read, \
                 ev_score, ai_summary, budget_range, preferred_property_types, timeline, \
                 spam, ttl, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16) \
                 ON CONFLICT(associated_account, conversation_id) DO UPDATE SET \
                 busy = excluded.busy, automation_enabled = excluded.automation_enabled, \
                 flag = excluded.flag, flag_for_review = excluded.flag_for_review, \
                 flag_review_override = excluded.flag_review_override, read = excluded.read, \
                 ev_score = excluded.ev_score, ai_summary = excluded.ai_summary, \
                 budget_range = excluded.budget_range, \
                 preferred_property_types = excluded.preferred_property_types, \
                 timeline = excluded.timeline, spam = excluded.spam, ttl = excluded.ttl, \
                 updated_at = excluded.updated_at",
                params![
                    thread.conversation_id.as_str(),
                    thread.associated_account.as_str(),
                    thread.busy as i64,
                    thread.automation_enabled as i64,
                    thread.flag as i64,
                    thread.flag_for_review as i64,
                    thread.flag_review_override as i64,
                    thread.read as i64,
                    thread.ev_score.map(i64::from),
                    thread.ai_summary.clone(),
                    thread.budget_range.clone(),
                    thread.preferred_property_types.clone(),
                    thread.timeline.clone(),
                    thread.spam as i64,
                    thread.ttl.map(|t| t.timestamp()),
                    thread.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_thread(
        &self,
        account_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ThreadRecord>, StoreError> {
        let sql = format!(
            "SELECT {THREAD_COLUMNS} FROM threads \
             WHERE associated_account = ?1 AND conversation_id = ?2"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![account_id, conversation_id])
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_thread(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn set_ev_and_flag(
        &self,
        account_id: &str,
        conversation_id: &str,
        ev_score: i32,
        flag: bool,
    ) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE threads SET ev_score = ?3, flag = ?4, \
                 busy = CASE WHEN ?4 != 0 THEN 0 ELSE busy END, updated_at = ?5 \
                 WHERE associated_account = ?1 AND conversation_id = ?2",
                params![
                    account_id,
                    conversation_id,
                    ev_score as i64,
                    flag as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "thread",
                id: conversation_id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_thread_attributes(
        &self,
        account_id: &str,
        conversation_id: &str,
        attrs: &ThreadAttributes,
    ) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE threads SET ai_summary = ?3, budget_range = ?4, \
                 preferred_property_types = ?5, timeline = ?6, updated_at = ?7 \
                 WHERE associated_account = ?1 AND conversation_id = ?2",
                params![
                    account_id,
                    conversation_id,
                    attrs.ai_summary.as_str(),
                    attrs.budget_range.as_str(),
                    attrs.preferred_property_types.as_str(),
                    attrs.timeline.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "thread",
                id: conversation_id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_flag_for_review(
        &self,
        account_id: &str,
        conversation_id: &str,
    ) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE threads SET flag_for_review = 1, busy = 0, updated_at = ?3 \
                 WHERE associated_account = ?1 AND conversation_id = ?2",
                params![account_id, conversation_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "thread",
                id: conversation_id.to_string(),
            });
        }
        Ok(())
    }

    async fn try_acquire_busy(
        &self,
        account_id: &str,
        conversation_id: &str,
    ) -> Result<bool, StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE threads SET busy = 1, updated_at = ?3 \
                 WHERE associated_account = ?1 AND conversation_id = ?2 AND busy = 0",
                params![account_id, conversation_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        Ok(affected == 1)
    }

    async fn release_busy(
        &self,
        account_id: &str,
        conversation_id: &str,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE threads SET busy = 0, updated_at = ?3 \
                 WHERE associated_account = ?1 AND conversation_id = ?2",
                params![account_id, conversation_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn upsert_account(&self, account: &AccountSettings) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO accounts (account_id, reply_address, display_name, \
                 auto_reply_enabled, api_limit, ai_limit, tone, writing_style, bio, location) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT(account_id) DO UPDATE SET \
                 reply_address = excluded.reply_address, \
                 display_name = excluded.display_name, \
                 auto_reply_enabled = excluded.auto_reply_enabled, \
                 api_limit = excluded.api_limit, ai_limit = excluded.ai_limit, \
                 tone = excluded.tone, writing_style = excluded.writing_style, \
                 bio = excluded.bio, location = excluded.location",
                params![
                    account.account_id.as_str(),
                    account.reply_address.as_str(),
                    account.display_name.as_str(),
                    account.auto_reply_enabled as i64,
                    account.api_limit.map(i64::from),
                    account.ai_limit.map(i64::from),
                    account.tone.clone(),
                    account.writing_style.clone(),
                    account.bio.clone(),
                    account.location.clone(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<AccountSettings>, StoreError> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![account_id])
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_account(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn account_by_address(
        &self,
        address: &str,
    ) -> Result<Option<AccountSettings>, StoreError> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE LOWER(reply_address) = LOWER(?1)"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![address])
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_account(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn try_consume(
        &self,
        account_id: &str,
        pool: RatePool,
        limit: u32,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        if limit == 0 {
            return Ok(false);
        }
        let now = Utc::now().timestamp();
        let ttl_secs = ttl.as_secs() as i64;

        // Single conditional upsert: a fresh window starts at 1, an open
        // window increments only while under the limit. Zero rows
        // affected means the pool is exhausted.
        let affected = self
            .conn()
            .execute(
                "INSERT INTO rate_limits (account_id, pool, invocations, window_start) \
                 VALUES (?1, ?2, 1, ?3) \
                 ON CONFLICT(account_id, pool) DO UPDATE SET \
                 invocations = CASE WHEN window_start + ?4 <= ?3 \
                                    THEN 1 ELSE invocations + 1 END, \
                 window_start = CASE WHEN window_start + ?4 <= ?3 \
                                     THEN ?3 ELSE window_start END \
                 WHERE rate_limits.invocations < ?5 \
                    OR rate_limits.window_start + ?4 <= ?3",
                params![account_id, pool.as_str(), now, ttl_secs, limit as i64],
            )
            .await
            .map_err(query_err)?;
        Ok(affected == 1)
    }

    async fn record_invocation(&self, record: &InvocationRecord) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO invocations (id, account_id, conversation_id, model, purpose, \
                 input_tokens, output_tokens, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id.as_str(),
                    record.account_id.as_str(),
                    record.conversation_id.clone(),
                    record.model.as_str(),
                    record.purpose.as_str(),
                    record.input_tokens as i64,
                    record.output_tokens as i64,
                    record.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }
}
