//! OpenAI chat-completions provider

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::LLMSettings;
use crate::error::{NepheleError, Result};
use crate::llm::{LLMProvider, LLMRequest, LLMResponse, MessageRole, TokenUsage};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Slack between the pipeline's own call bound and the HTTP client timeout
const CLIENT_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// Chat-completions client for OpenAI or any API-compatible endpoint
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAIProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Use a compatible endpoint instead of api.openai.com
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Build from `[llm]` settings, taking the key from `OPENAI_API_KEY` when unset.
    ///
    /// # Errors
    ///
    /// Returns [`NepheleError::Configuration`] without an API key, or an HTTP
    /// error if the client cannot be built.
    pub fn from_settings(settings: &LLMSettings) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| {
                NepheleError::Configuration(
                    "no completion API key: set llm.api_key or OPENAI_API_KEY".to_string(),
                )
            })?;

        let client = reqwest::Client::builder()
            .timeout(settings.timeout + CLIENT_TIMEOUT_SLACK)
            .build()?;

        let mut provider = Self {
            client,
            api_key,
            model: settings.model.clone(),
            base_url: DEFAULT_BASE_URL.to_string(),
        };
        if let Some(base_url) = &settings.base_url {
            provider = provider.with_base_url(base_url.clone());
        }
        Ok(provider)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: MessageRole,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

impl<'a> ChatRequest<'a> {
    fn new(model: &'a str, request: &'a LLMRequest) -> Self {
        Self {
            model,
            messages: request
                .messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role,
                    content: &m.content,
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        }
    }
}

/// Readable error for a non-success reply; prefers the API's own `error.message`
fn describe_failure(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().chars().take(200).collect());

    match status {
        StatusCode::UNAUTHORIZED => format!("completion API rejected the key: {}", detail),
        StatusCode::TOO_MANY_REQUESTS => format!("completion API rate limited: {}", detail),
        s if s.is_server_error() => format!("completion API unavailable ({}): {}", s, detail),
        s => format!("completion API error ({}): {}", s, detail),
    }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    async fn generate_request(&self, request: &LLMRequest) -> Result<LLMResponse> {
        let body = ChatRequest::new(&self.model, request);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| NepheleError::LLM(format!("completion request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(NepheleError::LLM(describe_failure(status, &text)));
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| NepheleError::LLM(format!("unreadable completion response: {}", e)))?;

        let content = reply
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| NepheleError::LLM("completion response had no choices".to_string()))?
            .message
            .content
            .unwrap_or_default();

        if let Some(usage) = &reply.usage {
            tracing::debug!(
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "completion finished"
            );
        }

        Ok(LLMResponse {
            content,
            usage: reply.usage,
        })
    }

    fn name(&self) -> &str {
        "openai"
    }
}
