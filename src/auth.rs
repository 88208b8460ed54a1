//! Caller identity.
//!
//! Every store and component call carries a `Caller` so reads and writes
//! stay scoped to one account. Trusted server-to-server hops use
//! `Caller::Internal` — an explicit credential type rather than a shared
//! bypass token compared against the session id.

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// An authenticated user session.
    Session {
        account_id: String,
        session_id: String,
    },
    /// A trusted internal component acting on behalf of an account.
    Internal { account_id: String },
}

impl Caller {
    /// Internal caller for the given account.
    pub fn internal(account_id: impl Into<String>) -> Self {
        Self::Internal {
            account_id: account_id.into(),
        }
    }

    /// The account this caller is scoped to.
    pub fn account_id(&self) -> &str {
        match self {
            Self::Session { account_id, .. } | Self::Internal { account_id } => account_id,
        }
    }

    /// Internal callers skip the outer API-pool rate check; AI-pool
    /// checks still apply to every LLM call regardless of caller.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Reject a caller acting on an account it is not scoped to.
    pub fn authorize(&self, account_id: &str) -> Result<(), crate::error::AuthError> {
        if self.account_id() == account_id {
            return Ok(());
        }
        Err(crate::error::AuthError::Unauthorized {
            account_id: account_id.to_string(),
            session_id: match self {
                Self::Session { session_id, .. } => session_id.clone(),
                Self::Internal { .. } => "internal".to_string(),
            },
        })
    }
}
