//! HTTP client for an OpenAI-compatible chat completions endpoint.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};

/// Chat-completion client speaking the OpenAI wire format.
pub struct HttpLlmClient {
    client: reqwest::Client,
    api_url: String,
    api_key: SecretString,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl HttpLlmClient {
    pub fn new(api_url: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key,
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for HttpLlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if status != 200 {
            return Err(LlmError::Status { status, body });
        }

        let wire: WireResponse = serde_json::from_str(&body)?;
        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("response has no choices".into()))?;

        let usage = wire.usage.unwrap_or_default();
        debug!(
            model = %request.model,
            input_tokens = usage.prompt_tokens,
            output_tokens = usage.completion_tokens,
            "completion received"
        );

        Ok(CompletionResponse {
            content: choice.message.content,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }
}
