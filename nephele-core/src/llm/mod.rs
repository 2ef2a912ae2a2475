//! Completion service abstraction
//!
//! Both the query classifier and the response synthesizer talk to the model
//! through [`LLMProvider`]. Every call made by the pipeline goes through
//! [`complete_with_timeout`] so a hung provider can never stall a turn.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{NepheleError, Result};

pub mod providers;
pub mod retry;

pub use providers::OpenAIProvider;
pub use retry::{Backoff, RetryConfig, with_retry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One completion call: the chat messages plus sampling options
#[derive(Debug, Clone, Default)]
pub struct LLMRequest {
    pub messages: Vec<Message>,
    /// Sampling temperature, clamped to 0.0..=2.0
    pub temperature: Option<f32>,
    /// Cap on generated tokens
    pub max_tokens: Option<usize>,
}

impl LLMRequest {
    /// A single user message
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::new(MessageRole::User, prompt)],
            ..Default::default()
        }
    }

    /// Instructions in a system message, then the user message
    pub fn with_system_prompt(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![
                Message::new(MessageRole::System, system),
                Message::new(MessageRole::User, user),
            ],
            ..Default::default()
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 2.0));
        self
    }

    pub fn max_tokens(mut self, tokens: usize) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    /// Characters across every message, for logging prompt sizes
    pub fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct LLMResponse {
    pub content: String,
    /// Reported by the provider when available
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// A text-generation backend.
///
/// Implementors own their transport-level retry policy; callers in this
/// crate treat a returned error as final for that call.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn generate_request(&self, request: &LLMRequest) -> Result<LLMResponse>;

    /// Short backend name for logs
    fn name(&self) -> &str {
        "llm"
    }
}

/// Run a completion call bounded by `timeout`.
///
/// Elapsed calls are reported as [`NepheleError::LLMTimeout`]; the in-flight
/// request future is dropped.
pub async fn complete_with_timeout(
    provider: &dyn LLMProvider,
    request: &LLMRequest,
    timeout: Duration,
) -> Result<String> {
    match tokio::time::timeout(timeout, provider.generate_request(request)).await {
        Ok(Ok(response)) => Ok(response.content),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            tracing::debug!(
                provider = provider.name(),
                timeout_ms = timeout.as_millis() as u64,
                "completion call timed out"
            );
            Err(NepheleError::LLMTimeout(timeout))
        }
    }
}
