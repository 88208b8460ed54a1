//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Engine configuration.
///
/// Built once in `main` and passed into the components that need it —
/// there are no module-level singletons.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// OpenAI-compatible chat completions endpoint.
    pub llm_api_url: String,
    /// API key for the LLM endpoint.
    pub llm_api_key: SecretString,
    /// Days a spam-classified message and its thread stub are retained.
    pub spam_ttl_days: u32,
    /// Base delay before a scheduled reply fires.
    pub dispatch_delay: Duration,
    /// Random jitter added on top of `dispatch_delay`.
    pub dispatch_jitter: Duration,
    /// Sliding window for the general API rate-limit pool.
    pub api_rate_ttl: Duration,
    /// Sliding window for the AI rate-limit pool.
    pub ai_rate_ttl: Duration,
    /// Fallback API-pool limit when an account has none configured.
    pub default_api_limit: u32,
    /// Fallback AI-pool limit when an account has none configured.
    pub default_ai_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm_api_url: "https://api.together.xyz/v1/chat/completions".to_string(),
            llm_api_key: SecretString::from(""),
            spam_ttl_days: 30,
            dispatch_delay: Duration::from_secs(10),
            dispatch_jitter: Duration::from_secs(3),
            api_rate_ttl: Duration::from_secs(60),
            ai_rate_ttl: Duration::from_secs(3600),
            default_api_limit: 120,
            default_ai_limit: 100,
        }
    }
}

impl EngineConfig {
    /// Build config from environment variables. Only the API key is
    /// required; everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let llm_api_key = std::env::var("LEADPILOT_LLM_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("LEADPILOT_LLM_API_KEY".into()))?;

        let mut config = Self {
            llm_api_key: SecretString::from(llm_api_key),
            ..Self::default()
        };

        if let Ok(url) = std::env::var("LEADPILOT_LLM_API_URL") {
            config.llm_api_url = url;
        }
        if let Some(days) = env_u64("LEADPILOT_SPAM_TTL_DAYS")? {
            config.spam_ttl_days = days as u32;
        }
        if let Some(secs) = env_u64("LEADPILOT_DISPATCH_DELAY_SECS")? {
            config.dispatch_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("LEADPILOT_API_RATE_TTL_SECS")? {
            config.api_rate_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("LEADPILOT_AI_RATE_TTL_SECS")? {
            config.ai_rate_ttl = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(None),
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected an integer, got '{raw}'"),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_observed_behavior() {
        let config = EngineConfig::default();
        assert_eq!(config.spam_ttl_days, 30);
        assert_eq!(config.dispatch_delay, Duration::from_secs(10));
        assert_eq!(config.ai_rate_ttl, Duration::from_secs(3600));
        assert_eq!(config.api_rate_ttl, Duration::from_secs(60));
    }
}
