//! Outbound MIME assembly and SMTP delivery.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::info;

use crate::error::DispatchError;

/// A fully addressed reply, ready to be turned into MIME.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Full RFC Message-ID for the outbound email, including brackets.
    pub message_id: String,
    /// Raw Message-ID header of the email being answered, if any.
    pub in_reply_to: Option<String>,
}

/// Transport abstraction so delivery can be faked in tests.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), DispatchError>;
}

/// SMTP relay mailer.
pub struct SmtpMailer {
    host: String,
    port: u16,
    username: String,
    password: String,
}

impl SmtpMailer {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Build the MIME message with threading headers attached.
pub(crate) fn build_mime(email: &OutboundEmail) -> Result<Message, DispatchError> {
    let mut builder = Message::builder()
        .from(email
            .from
            .parse()
            .map_err(|e| DispatchError::Send(format!("Invalid from address: {e}")))?)
        .to(email
            .to
            .parse()
            .map_err(|e| DispatchError::Send(format!("Invalid to address: {e}")))?)
        .subject(&email.subject)
        .message_id(Some(email.message_id.clone()));

    if let Some(in_reply_to) = &email.in_reply_to {
        builder = builder
            .in_reply_to(in_reply_to.clone())
            .references(in_reply_to.clone());
    }

    builder
        .body(email.body.clone())
        .map_err(|e| DispatchError::Send(format!("Failed to build email: {e}")))
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), DispatchError> {
        let message = build_mime(email)?;
        let creds = Credentials::new(self.username.clone(), self.password.clone());

        let transport = SmtpTransport::relay(&self.host)
            .map_err(|e| DispatchError::Send(format!("SMTP relay error: {e}")))?
            .port(self.port)
            .credentials(creds)
            .build();

        transport
            .send(&message)
            .map_err(|e| DispatchError::Send(format!("SMTP send failed: {e}")))?;

        info!(to = %email.to, message_id = %email.message_id, "email sent");
        Ok(())
    }
}
