//! Conversation resolution for inbound email.
//!
//! An inbound reply belongs to the conversation that sent the message it
//! answers. In-Reply-To is the strongest signal; References are walked
//! as a fallback for clients that only maintain one of the two. Nothing
//! resolving means a brand-new conversation.

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::mail::ThreadingIds;
use crate::store::Store;

/// Outcome of conversation resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConversation {
    pub conversation_id: String,
    /// True iff neither In-Reply-To nor any Reference matched a stored
    /// message for this account.
    pub is_first: bool,
}

/// Resolve the conversation an inbound email belongs to, scoped to the
/// account. Mints a fresh conversation id when nothing matches.
pub async fn resolve_conversation(
    store: &dyn Store,
    account_id: &str,
    threading: &ThreadingIds,
) -> Result<ResolvedConversation, StoreError> {
    if !threading.in_reply_to.is_empty() {
        if let Some(conversation_id) = store
            .conversation_by_response_id(account_id, &threading.in_reply_to)
            .await?
        {
            debug!(%conversation_id, "resolved via In-Reply-To");
            return Ok(ResolvedConversation {
                conversation_id,
                is_first: false,
            });
        }
    }

    for reference in &threading.references {
        if let Some(conversation_id) = store
            .conversation_by_response_id(account_id, reference)
            .await?
        {
            debug!(%conversation_id, reference = %reference, "resolved via References");
            return Ok(ResolvedConversation {
                conversation_id,
                is_first: false,
            });
        }
    }

    let conversation_id = Uuid::new_v4().to_string();
    info!(%conversation_id, account_id = %account_id, "new conversation");
    Ok(ResolvedConversation {
        conversation_id,
        is_first: true,
    })
}
