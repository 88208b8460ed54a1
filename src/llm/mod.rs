//! LLM access: the provider trait, the HTTP client, and retry policy.

pub mod http;
pub mod provider;
pub mod retry;

/// Model used across classification and generation tasks.
pub const DEFAULT_MODEL: &str = "meta-llama/Llama-4-Maverick-17B-128E-Instruct-FP8";

pub use http::HttpLlmClient;
pub use provider::{ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, Role};
pub use retry::RetryPolicy;
