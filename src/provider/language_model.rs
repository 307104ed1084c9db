//! Unified language-model capability: a unary `call` and a chunked `stream`,
//! implemented by two SSE adapter shapes in `provider::adapter`.

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

/// Message role in a rendered conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Lower-case wire form, matching `BuildPromptText`'s `[role]: content` rendering.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Per-provider connection bundle: endpoint, credentials, and transport knobs.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_endpoint: String,
    pub api_key: String,
    pub headers: HashMap<String, String>,
    pub timeout_secs: u64,
    pub retry_count: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_endpoint: String::new(),
            api_key: String::new(),
            headers: HashMap::new(),
            timeout_secs: 30,
            retry_count: 3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

impl TokenUsage {
    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.total_tokens == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    /// Anything the adapter can't map; carries the raw provider value.
    Other(String),
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model_code: String,
    pub temperature: f64,
    pub max_tokens: i64,
    pub stream: bool,
    pub config: ProviderConfig,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub model_code: String,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub delta: String,
    pub finished: bool,
    pub usage: Option<TokenUsage>,
    pub finish_reason: FinishReason,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Uniform interface for a language-model backend, unary and streaming.
#[async_trait::async_trait]
pub trait LanguageModelProvider: Send + Sync {
    /// Short dispatch name this provider is registered under.
    fn name(&self) -> &str;

    async fn call(&self, req: &CompletionRequest) -> Result<CompletionResponse, ProviderError>;

    async fn stream(&self, req: &CompletionRequest) -> Result<ChunkStream, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("request failed with status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("provider returned no content")]
    EmptyResponse,

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_renders_lowercase() {
        assert_eq!(Role::System.as_str(), "system");
        assert_eq!(Role::User.as_str(), "user");
        assert_eq!(Role::Assistant.as_str(), "assistant");
    }

    #[test]
    fn usage_is_zero_detects_absent_usage() {
        assert!(TokenUsage::default().is_zero());
        assert!(!TokenUsage { input_tokens: 1, ..Default::default() }.is_zero());
    }
}
