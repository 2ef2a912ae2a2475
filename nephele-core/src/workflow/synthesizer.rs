//! Prompt assembly and answer synthesis

use std::sync::Arc;
use std::time::Duration;

use super::classifier::RouteKind;
use crate::conversation::{ContextWindow, Turn};
use crate::error::ErrorKind;
use crate::llm::{LLMProvider, LLMRequest, complete_with_timeout};
use crate::retrieval::DocChunk;
use crate::weather::WeatherData;

/// Built-in system preamble
pub const DEFAULT_PREAMBLE: &str = "You are an assistant that answers questions about an API using \
its documentation, and about current weather using live data. Answer concisely and clearly. \
Base documentation answers only on the documents provided and weather answers only on the \
weather data provided; if something you need is missing, say so instead of guessing. \
Use bullet points and emoji where they help.";

const NO_DOCS_NOTICE: &str = "No relevant documentation was found for this question.";
const NO_WEATHER_NOTICE: &str =
    "Live weather data is unavailable for this question. Tell the user it could not be retrieved.";

/// Error type for synthesis
#[derive(Debug, Clone, thiserror::Error)]
pub enum SynthesisError {
    /// The completion service errored or timed out
    #[error("Synthesis failed: {0}")]
    Failed(String),

    /// The completion service answered with nothing usable
    #[error("Synthesis returned an empty response")]
    EmptyResponse,
}

impl SynthesisError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::SynthesisFailed
    }
}

/// Everything a single synthesis call is built from
#[derive(Debug, Clone, Copy)]
pub struct SynthesisInput<'a> {
    pub query: &'a str,
    pub route: RouteKind,
    pub docs: &'a [DocChunk],
    pub weather: Option<&'a WeatherData>,
    pub context: &'a ContextWindow,
    /// Latest long-term summary of the session
    pub summary: Option<&'a str>,
}

/// Builds the answer prompt and invokes the completion service once per call.
#[derive(Clone)]
pub struct ResponseSynthesizer {
    provider: Arc<dyn LLMProvider>,
    preamble: String,
    max_doc_chars: usize,
    min_score: Option<f32>,
    timeout: Duration,
    temperature: f32,
}

impl ResponseSynthesizer {
    pub fn new(provider: Arc<dyn LLMProvider>, timeout: Duration) -> Self {
        Self {
            provider,
            preamble: DEFAULT_PREAMBLE.to_string(),
            max_doc_chars: 2000,
            min_score: None,
            timeout,
            temperature: 0.0,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = preamble.into();
        self
    }

    /// Cap on the document text placed in a prompt
    pub fn with_max_doc_chars(mut self, max_doc_chars: usize) -> Self {
        self.max_doc_chars = max_doc_chars;
        self
    }

    /// Skip chunks scoring below `min_score`
    pub fn with_min_score(mut self, min_score: Option<f32>) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Produce the answer for one turn.
    ///
    /// # Errors
    ///
    /// Returns [`SynthesisError`] if the completion call fails, times out, or
    /// comes back blank.
    pub async fn synthesize(&self, input: SynthesisInput<'_>) -> Result<String, SynthesisError> {
        let request = self.build_request(input);
        tracing::debug!(
            route = %input.route,
            prompt_chars = request.prompt_chars(),
            context_turns = input.context.len(),
            "synthesizing answer"
        );

        let answer = complete_with_timeout(self.provider.as_ref(), &request, self.timeout)
            .await
            .map_err(|e| SynthesisError::Failed(e.to_string()))?;

        let answer = answer.trim();
        if answer.is_empty() {
            return Err(SynthesisError::EmptyResponse);
        }
        Ok(answer.to_string())
    }

    /// The request [`synthesize`](Self::synthesize) sends; deterministic in its input
    pub fn build_request(&self, input: SynthesisInput<'_>) -> LLMRequest {
        let mut sections = Vec::new();

        if let Some(summary) = input.summary.filter(|s| !s.trim().is_empty()) {
            sections.push(format!("[Long-term memory]\n{}", summary.trim()));
        }

        if let Some(history) = format_history(input.context) {
            sections.push(format!("[Conversation so far]\n{}", history));
        }

        if input.route.needs_docs() {
            sections.push(format!("[API documentation]\n{}", self.format_docs(input.docs)));
        }

        if input.route.needs_weather() {
            let weather = input
                .weather
                .map(WeatherData::to_prompt_text)
                .unwrap_or_else(|| NO_WEATHER_NOTICE.to_string());
            sections.push(format!("[Weather]\n{}", weather));
        }

        sections.push(format!("[Question]\n{}", input.query));

        LLMRequest::with_system_prompt(self.preamble.clone(), sections.join("\n\n"))
            .temperature(self.temperature)
    }

    /// Numbered document blocks, capped at `max_doc_chars` of document text
    pub fn format_docs(&self, docs: &[DocChunk]) -> String {
        let mut parts = Vec::new();
        let mut total_chars = 0;

        let relevant = docs
            .iter()
            .filter(|d| self.min_score.is_none_or(|floor| d.similarity_score >= floor));

        for (i, doc) in relevant.enumerate() {
            let remaining = self.max_doc_chars.saturating_sub(total_chars);
            if remaining == 0 {
                break;
            }

            let len = doc.text.chars().count();
            let header = format!("[Document {}] (source: {})", i + 1, doc.source_id);
            if len > remaining {
                let cut: String = doc.text.chars().take(remaining).collect();
                parts.push(format!("{}\n{}...", header, cut));
                break;
            }

            parts.push(format!("{}\n{}", header, doc.text));
            total_chars += len;
        }

        if parts.is_empty() {
            NO_DOCS_NOTICE.to_string()
        } else {
            parts.join("\n\n---\n\n")
        }
    }

    /// Summarise a run of turns for long-term memory.
    ///
    /// # Errors
    ///
    /// Returns [`SynthesisError`] if the completion call fails or comes back blank.
    pub async fn summarize(&self, turns: &[Turn]) -> Result<String, SynthesisError> {
        let transcript = turns
            .iter()
            .map(|t| format!("User: {}\nAssistant: {}", t.query, t.answer))
            .collect::<Vec<_>>()
            .join("\n");

        let request = LLMRequest::with_system_prompt(
            "Summarise the conversation below in a few sentences. Keep facts the user may \
             refer back to: places asked about, API topics discussed, and any preferences.",
            transcript,
        )
        .temperature(0.0);

        let summary = complete_with_timeout(self.provider.as_ref(), &request, self.timeout)
            .await
            .map_err(|e| SynthesisError::Failed(e.to_string()))?;

        let summary = summary.trim();
        if summary.is_empty() {
            return Err(SynthesisError::EmptyResponse);
        }
        Ok(summary.to_string())
    }
}

fn format_history(context: &ContextWindow) -> Option<String> {
    if context.is_empty() && context.evicted_turns() == 0 {
        return None;
    }

    let mut lines = Vec::new();
    if context.evicted_turns() > 0 {
        lines.push(format!(
            "({} earlier turn(s) were dropped to fit the context budget.)",
            context.evicted_turns()
        ));
    }
    for turn in context.turns() {
        lines.push(format!("User: {}", turn.query));
        lines.push(format!("Assistant: {}", turn.answer));
    }
    Some(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ContextManager, Session};
    use crate::error::{NepheleError, Result};
    use crate::llm::LLMResponse;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoProvider(Option<String>);

    #[async_trait]
    impl LLMProvider for EchoProvider {
        async fn generate_request(&self, _request: &LLMRequest) -> Result<LLMResponse> {
            match &self.0 {
                Some(content) => Ok(LLMResponse {
                    content: content.clone(),
                    usage: None,
                }),
                None => Err(NepheleError::LLM("service unavailable".to_string())),
            }
        }
    }

    fn synthesizer(reply: Option<&str>) -> ResponseSynthesizer {
        ResponseSynthesizer::new(
            Arc::new(EchoProvider(reply.map(str::to_string))),
            Duration::from_secs(5),
        )
    }

    fn doc(id: &str, text: &str, score: f32) -> DocChunk {
        DocChunk::new(text, id, Vec::new()).with_score(score)
    }

    fn user_prompt(request: &LLMRequest) -> &str {
        &request.messages[1].content
    }

    fn input<'a>(
        route: RouteKind,
        docs: &'a [DocChunk],
        weather: Option<&'a WeatherData>,
        context: &'a ContextWindow,
    ) -> SynthesisInput<'a> {
        SynthesisInput {
            query: "What are the rate limits?",
            route,
            docs,
            weather,
            context,
            summary: None,
        }
    }

    #[test]
    fn test_sections_follow_route() {
        let docs = vec![doc("limits.md", "60 requests per minute", 0.9)];
        let context = ContextWindow::empty(100);

        let rag = synthesizer(None).build_request(input(RouteKind::Rag, &docs, None, &context));
        assert!(user_prompt(&rag).contains("[Document 1] (source: limits.md)\n60 requests per minute"));
        assert!(!user_prompt(&rag).contains("[Weather]"));

        let direct = synthesizer(None).build_request(input(RouteKind::Direct, &docs, None, &context));
        assert!(!user_prompt(&direct).contains("[API documentation]"));
        assert!(user_prompt(&direct).ends_with("[Question]\nWhat are the rate limits?"));
    }

    #[test]
    fn test_missing_weather_is_disclosed() {
        let context = ContextWindow::empty(100);
        let request = synthesizer(None).build_request(input(RouteKind::Weather, &[], None, &context));
        assert!(user_prompt(&request).contains(NO_WEATHER_NOTICE));

        let payload = json!({"name": "Paris", "weather": [{"main": "Clear"}], "main": {"temp": 20.0}});
        let weather = WeatherData::normalize("Paris", &payload, "metric").unwrap();
        let request =
            synthesizer(None).build_request(input(RouteKind::Both, &[], Some(&weather), &context));
        assert!(user_prompt(&request).contains("☀️ Weather in Paris"));
        assert!(user_prompt(&request).contains(NO_DOCS_NOTICE));
    }

    #[test]
    fn test_doc_char_cap_and_score_floor() {
        let docs = vec![
            doc("a", &"x".repeat(30), 0.9),
            doc("low", "ignored", 0.1),
            doc("b", &"y".repeat(30), 0.8),
            doc("c", "never reached", 0.7),
        ];
        let synth = synthesizer(None).with_max_doc_chars(40).with_min_score(Some(0.5));

        let text = synth.format_docs(&docs);
        assert!(!text.contains("ignored"));
        assert!(text.contains(&format!("[Document 2] (source: b)\n{}...", "y".repeat(10))));
        assert!(!text.contains("never reached"));
        assert_eq!(text.matches("\n\n---\n\n").count(), 1);

        assert_eq!(synth.format_docs(&[doc("low", "weak", 0.2)]), NO_DOCS_NOTICE);
    }

    #[test]
    fn test_history_and_summary_sections() {
        let manager = ContextManager::new(12);
        let mut session = Session::new("s");
        manager.append(&mut session, Turn::new("x".repeat(40), RouteKind::Direct, vec![], None, "old"));
        manager.append(&mut session, Turn::new("hi", RouteKind::Direct, vec![], None, "hello"));
        let context = manager.window(&session);

        let mut synth_input = input(RouteKind::Direct, &[], None, &context);
        synth_input.summary = Some("User lives in Paris.");
        let request = synthesizer(None).build_request(synth_input);
        let prompt = user_prompt(&request);

        assert!(prompt.starts_with("[Long-term memory]\nUser lives in Paris."));
        assert!(prompt.contains("(1 earlier turn(s) were dropped"));
        assert!(prompt.contains("User: hi\nAssistant: hello"));
        assert!(prompt.find("[Long-term memory]") < prompt.find("[Conversation so far]"));
    }

    #[tokio::test]
    async fn test_synthesize_trims_and_rejects_blank() {
        let context = ContextWindow::empty(100);

        let answer = synthesizer(Some("  60 per minute.\n"))
            .synthesize(input(RouteKind::Direct, &[], None, &context))
            .await
            .unwrap();
        assert_eq!(answer, "60 per minute.");

        let err = synthesizer(Some("   "))
            .synthesize(input(RouteKind::Direct, &[], None, &context))
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::EmptyResponse));

        let err = synthesizer(None)
            .synthesize(input(RouteKind::Direct, &[], None, &context))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SynthesisFailed);
    }

    #[tokio::test]
    async fn test_summarize() {
        let turns = vec![Turn::new("Weather in Rome?", RouteKind::Weather, vec![], None, "Sunny")];
        let summary = synthesizer(Some(" Asked about Rome. ")).summarize(&turns).await.unwrap();
        assert_eq!(summary, "Asked about Rome.");
    }
}
