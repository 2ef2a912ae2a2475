//! Query routing
//!
//! A classifier maps each query onto exactly one [`RouteKind`]. The LLM
//! classifier never trusts free text: the model's reply must validate as one
//! of the four labels or classification fails and the orchestrator applies
//! its fallback route.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::conversation::ContextWindow;
use crate::error::{ErrorKind, NepheleError};
use crate::llm::{LLMProvider, LLMRequest, complete_with_timeout};

/// Which information sources a query needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    /// API documentation only
    Rag,
    /// Live weather only
    Weather,
    /// Documentation and weather, fetched concurrently
    Both,
    /// Neither source
    Direct,
}

impl RouteKind {
    pub const ALL: [RouteKind; 4] = [
        RouteKind::Rag,
        RouteKind::Weather,
        RouteKind::Both,
        RouteKind::Direct,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteKind::Rag => "rag",
            RouteKind::Weather => "weather",
            RouteKind::Both => "both",
            RouteKind::Direct => "direct",
        }
    }

    pub fn needs_docs(&self) -> bool {
        matches!(self, RouteKind::Rag | RouteKind::Both)
    }

    pub fn needs_weather(&self) -> bool {
        matches!(self, RouteKind::Weather | RouteKind::Both)
    }

    fn from_sources(docs: bool, weather: bool) -> Self {
        match (docs, weather) {
            (true, true) => RouteKind::Both,
            (true, false) => RouteKind::Rag,
            (false, true) => RouteKind::Weather,
            (false, false) => RouteKind::Direct,
        }
    }
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouteKind {
    type Err = ClassificationError;

    /// Exact, lowercase label match
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RouteKind::ALL
            .into_iter()
            .find(|route| route.as_str() == s)
            .ok_or_else(|| ClassificationError::InvalidLabel(s.to_string()))
    }
}

/// Error type for classification
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClassificationError {
    /// The completion service failed or timed out
    #[error("Classifier model call failed: {0}")]
    Unavailable(String),

    /// The model answered with something other than a route label
    #[error("Classifier returned an invalid label: {0:?}")]
    InvalidLabel(String),
}

impl ClassificationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ClassificationError
    }
}

/// Decides the route for a query
#[async_trait]
pub trait QueryClassifier: Send + Sync {
    async fn classify(
        &self,
        query: &str,
        recent_context: &ContextWindow,
    ) -> Result<RouteKind, ClassificationError>;
}

#[derive(Deserialize)]
struct RouteReply {
    route: String,
}

/// Validate a model reply into a route.
///
/// Accepts a bare label or `{"route": "<label>"}`. Whitespace, quotes,
/// backticks and one trailing period are stripped and the label lowercased;
/// what remains must equal a label exactly.
pub fn parse_label(reply: &str) -> Result<RouteKind, ClassificationError> {
    let trimmed = reply.trim();

    let raw = if trimmed.starts_with('{') {
        serde_json::from_str::<RouteReply>(trimmed)
            .map_err(|_| ClassificationError::InvalidLabel(trimmed.to_string()))?
            .route
    } else {
        trimmed.to_string()
    };

    let is_quote = |c: char| c == '"' || c == '\'' || c == '`';
    let label = raw.trim();
    let label = label.strip_suffix('.').unwrap_or(label);
    let label = label.trim_matches(is_quote).trim();
    let label = label.strip_suffix('.').unwrap_or(label).trim().to_lowercase();

    label.parse()
}

const CLASSIFIER_PROMPT: &str = "You route questions for an assistant that answers questions about \
an API's documentation and about current weather.\n\
Reply with exactly one label and nothing else:\n\
- rag: the question needs the API documentation\n\
- weather: the question needs live weather for a place\n\
- both: the question needs the documentation and live weather\n\
- direct: the question needs neither (greetings, small talk, or follow-ups answerable from the conversation)";

/// Classifier backed by the completion service
pub struct LLMQueryClassifier {
    provider: Arc<dyn LLMProvider>,
    timeout: Duration,
    recent_turns: usize,
}

impl LLMQueryClassifier {
    pub fn new(provider: Arc<dyn LLMProvider>, timeout: Duration) -> Self {
        Self {
            provider,
            timeout,
            recent_turns: 3,
        }
    }

    /// How many recent turns to show the model for follow-up questions
    pub fn with_recent_turns(mut self, turns: usize) -> Self {
        self.recent_turns = turns;
        self
    }

    fn build_request(&self, query: &str, recent_context: &ContextWindow) -> LLMRequest {
        let mut prompt = String::new();
        let recent = recent_context.recent(self.recent_turns);
        if !recent.is_empty() {
            prompt.push_str("Recent conversation:\n");
            for turn in recent {
                prompt.push_str(&format!("User: {}\nAssistant: {}\n", turn.query, turn.answer));
            }
            prompt.push('\n');
        }
        prompt.push_str(&format!("Question: {}", query));

        LLMRequest::with_system_prompt(CLASSIFIER_PROMPT, prompt)
            .temperature(0.0)
            .max_tokens(10)
    }
}

#[async_trait]
impl QueryClassifier for LLMQueryClassifier {
    async fn classify(
        &self,
        query: &str,
        recent_context: &ContextWindow,
    ) -> Result<RouteKind, ClassificationError> {
        let request = self.build_request(query, recent_context);

        let reply = complete_with_timeout(self.provider.as_ref(), &request, self.timeout)
            .await
            .map_err(|e: NepheleError| ClassificationError::Unavailable(e.to_string()))?;

        let route = parse_label(&reply)?;
        tracing::debug!(route = %route, reply = %reply.trim(), "query classified");
        Ok(route)
    }
}

fn default_weather_keywords() -> Vec<String> {
    [
        "weather", "forecast", "rain", "raining", "snow", "snowing", "sunny", "humidity",
        "humid", "wind", "windy", "umbrella", "cold outside", "hot outside", "degrees outside",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_docs_keywords() -> Vec<String> {
    [
        "api", "endpoint", "endpoints", "documentation", "docs", "field", "fields", "parameter",
        "parameters", "rate limit", "rate limits", "status code", "error code", "request",
        "response", "authentication", "api key", "json", "schema",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Word-boundary keyword classifier; makes no model call and never fails.
///
/// Weather and documentation keywords together route to `both`; no match
/// routes to `direct`.
#[derive(Debug, Clone)]
pub struct KeywordQueryClassifier {
    weather_keywords: Vec<String>,
    docs_keywords: Vec<String>,
}

impl Default for KeywordQueryClassifier {
    fn default() -> Self {
        Self {
            weather_keywords: default_weather_keywords(),
            docs_keywords: default_docs_keywords(),
        }
    }
}

impl KeywordQueryClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the weather keyword list
    pub fn with_weather_keywords(mut self, keywords: Vec<String>) -> Self {
        self.weather_keywords = keywords;
        self
    }

    /// Replace the documentation keyword list
    pub fn with_docs_keywords(mut self, keywords: Vec<String>) -> Self {
        self.docs_keywords = keywords;
        self
    }

    fn normalize(text: &str) -> String {
        let words: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        format!(" {} ", words.join(" "))
    }

    fn matches_any(normalized: &str, keywords: &[String]) -> bool {
        keywords.iter().any(|k| {
            let k = Self::normalize(k);
            !k.trim().is_empty() && normalized.contains(&k)
        })
    }

    pub fn route_for(&self, query: &str) -> RouteKind {
        let normalized = Self::normalize(query);
        RouteKind::from_sources(
            Self::matches_any(&normalized, &self.docs_keywords),
            Self::matches_any(&normalized, &self.weather_keywords),
        )
    }
}

#[async_trait]
impl QueryClassifier for KeywordQueryClassifier {
    async fn classify(
        &self,
        query: &str,
        _recent_context: &ContextWindow,
    ) -> Result<RouteKind, ClassificationError> {
        Ok(self.route_for(query))
    }
}
