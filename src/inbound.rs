//! Inbound queue envelopes and raw-message retrieval.
//!
//! Receipt and processing are decoupled: the receiving edge stores the
//! raw MIME under a key and enqueues a small envelope; the processor
//! fetches the raw bytes back through [`RawMailStore`] when it gets to
//! the record.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MailError;

/// One queued inbound email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundRecord {
    /// Key of the raw MIME message in the mail store.
    pub storage_key: String,
    /// Envelope sender — where the automated reply goes.
    pub source: String,
    /// Envelope recipients; the first one matching a managed account
    /// decides which account processes the email.
    pub destination: Vec<String>,
    pub subject: String,
    /// Display From header, used for body-extraction fallbacks.
    pub from: String,
}

impl InboundRecord {
    /// Parse a queue message body.
    pub fn from_json(raw: &str) -> Result<Self, MailError> {
        serde_json::from_str(raw).map_err(|e| MailError::Envelope(e.to_string()))
    }
}

/// Raw MIME retrieval by storage key.
#[async_trait]
pub trait RawMailStore: Send + Sync {
    async fn fetch_raw(&self, storage_key: &str) -> Result<Vec<u8>, MailError>;
}

/// In-memory mail store, for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryRawMail {
    messages: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryRawMail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, storage_key: impl Into<String>, raw: impl Into<Vec<u8>>) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(storage_key.into(), raw.into());
    }
}

#[async_trait]
impl RawMailStore for InMemoryRawMail {
    async fn fetch_raw(&self, storage_key: &str) -> Result<Vec<u8>, MailError> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(storage_key)
            .cloned()
            .ok_or_else(|| MailError::RawNotFound(storage_key.to_string()))
    }
}

/// Filesystem mail store: raw MIME dropped under a root directory, one
/// file per message, keyed by relative path.
pub struct FsRawMail {
    root: std::path::PathBuf,
}

impl FsRawMail {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RawMailStore for FsRawMail {
    async fn fetch_raw(&self, storage_key: &str) -> Result<Vec<u8>, MailError> {
        let path = self.root.join(storage_key);
        tokio::fs::read(&path)
            .await
            .map_err(|_| MailError::RawNotFound(storage_key.to_string()))
    }
}
