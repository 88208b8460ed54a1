//! Per-account rate limiting over two pools.
//!
//! The `api` pool meters session-originated requests; the `ai` pool
//! meters LLM invocations regardless of caller. Both share one
//! sliding-window algorithm: the backend performs the check and the
//! increment in a single conditional statement, so concurrent callers
//! cannot overshoot the limit.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::auth::Caller;
use crate::config::EngineConfig;
use crate::error::{PipelineError, RateLimitError};
use crate::store::{AccountSettings, RatePool, Store};

pub struct RateLimiter {
    store: Arc<dyn Store>,
    api_ttl: Duration,
    ai_ttl: Duration,
    default_api_limit: u32,
    default_ai_limit: u32,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, config: &EngineConfig) -> Self {
        Self {
            store,
            api_ttl: config.api_rate_ttl,
            ai_ttl: config.ai_rate_ttl,
            default_api_limit: config.default_api_limit,
            default_ai_limit: config.default_ai_limit,
        }
    }

    /// Meter a request against the general API pool. Internal callers
    /// (queue-driven pipeline work) are exempt; session callers consume
    /// from their account's pool.
    pub async fn check_api(
        &self,
        caller: &Caller,
        account: &AccountSettings,
    ) -> Result<(), PipelineError> {
        caller.authorize(&account.account_id)?;
        if caller.is_internal() {
            return Ok(());
        }
        let limit = account.api_limit.unwrap_or(self.default_api_limit);
        self.consume(account, RatePool::Api, limit, self.api_ttl)
            .await
    }

    /// Meter one LLM invocation against the AI pool. Applies to every
    /// model call, whatever the caller.
    pub async fn check_ai(&self, account: &AccountSettings) -> Result<(), PipelineError> {
        let limit = account.ai_limit.unwrap_or(self.default_ai_limit);
        self.consume(account, RatePool::Ai, limit, self.ai_ttl).await
    }

    async fn consume(
        &self,
        account: &AccountSettings,
        pool: RatePool,
        limit: u32,
        ttl: Duration,
    ) -> Result<(), PipelineError> {
        let allowed = self
            .store
            .try_consume(&account.account_id, pool, limit, ttl)
            .await?;
        if allowed {
            Ok(())
        } else {
            warn!(
                account_id = %account.account_id,
                pool = pool.as_str(),
                limit,
                "rate limit exceeded"
            );
            Err(RateLimitError {
                account_id: account.account_id.clone(),
                pool: pool.as_str(),
                limit,
            }
            .into())
        }
    }
}
