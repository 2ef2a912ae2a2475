//! Scripted collaborators for pipeline tests
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;

use nephele_core::conversation::{
    ConversationStore, InMemoryConversationStore, PersistenceError, SessionSummary, Turn,
};
use nephele_core::embeddings::EmbeddingProvider;
use nephele_core::error::{NepheleError, Result};
use nephele_core::llm::{LLMProvider, LLMRequest, LLMResponse};
use nephele_core::retrieval::{DocChunk, InMemoryVectorStore, RetrievalEngine};
use nephele_core::weather::{LocationExtractor, ProviderError, WeatherAdapter, WeatherProvider};
use nephele_core::workflow::{LLMQueryClassifier, Orchestrator, OrchestratorBuilder, ResponseSynthesizer};

/// Completion service that answers by prompt kind
pub struct ScriptedLLM {
    classifier_reply: Option<String>,
    location_reply: String,
    synthesis_failures: AtomicUsize,
    synthesis_delay: Duration,
    pub classify_calls: AtomicUsize,
    pub location_calls: AtomicUsize,
    pub synthesis_calls: AtomicUsize,
    pub summary_calls: AtomicUsize,
    synthesis_prompts: Mutex<Vec<String>>,
}

impl ScriptedLLM {
    pub fn routing(label: &str) -> Self {
        Self {
            classifier_reply: Some(label.to_string()),
            location_reply: "Paris".to_string(),
            synthesis_failures: AtomicUsize::new(0),
            synthesis_delay: Duration::ZERO,
            classify_calls: AtomicUsize::new(0),
            location_calls: AtomicUsize::new(0),
            synthesis_calls: AtomicUsize::new(0),
            summary_calls: AtomicUsize::new(0),
            synthesis_prompts: Mutex::new(Vec::new()),
        }
    }

    /// Classifier calls fail outright
    pub fn unreachable_classifier() -> Self {
        Self {
            classifier_reply: None,
            ..Self::routing("direct")
        }
    }

    /// Fail the first `n` synthesis calls
    pub fn failing_synthesis(mut self, n: usize) -> Self {
        self.synthesis_failures = AtomicUsize::new(n);
        self
    }

    pub fn slow_synthesis(mut self, delay: Duration) -> Self {
        self.synthesis_delay = delay;
        self
    }

    pub fn synthesis_prompts(&self) -> Vec<String> {
        self.synthesis_prompts.lock().unwrap().clone()
    }

    pub fn last_synthesis_prompt(&self) -> String {
        self.synthesis_prompts().last().cloned().unwrap_or_default()
    }

    fn answer_for(prompt: &str) -> String {
        let question = prompt.rsplit("[Question]\n").next().unwrap_or(prompt).trim();
        format!("Answer to: {}", question)
    }
}

#[async_trait]
impl LLMProvider for ScriptedLLM {
    async fn generate_request(&self, request: &LLMRequest) -> Result<LLMResponse> {
        let prompt = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let content = if prompt.contains("You route questions") {
            self.classify_calls.fetch_add(1, Ordering::SeqCst);
            self.classifier_reply
                .clone()
                .ok_or_else(|| NepheleError::LLM("classifier offline".to_string()))?
        } else if prompt.contains("Return the name of the city") {
            self.location_calls.fetch_add(1, Ordering::SeqCst);
            self.location_reply.clone()
        } else if prompt.contains("Summarise the conversation") {
            self.summary_calls.fetch_add(1, Ordering::SeqCst);
            "The user asked about Paris weather and API rate limits.".to_string()
        } else {
            self.synthesis_calls.fetch_add(1, Ordering::SeqCst);
            if !self.synthesis_delay.is_zero() {
                tokio::time::sleep(self.synthesis_delay).await;
            }
            self.synthesis_prompts.lock().unwrap().push(prompt.clone());

            let remaining = self.synthesis_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.synthesis_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(NepheleError::LLM("model overloaded".to_string()));
            }
            Self::answer_for(&prompt)
        };

        Ok(LLMResponse {
            content,
            usage: None,
        })
    }
}

/// Weather provider that counts calls
pub struct CountingWeather {
    failure: Option<ProviderError>,
    barrier: Option<Arc<Barrier>>,
    pub calls: AtomicUsize,
}

impl CountingWeather {
    pub fn ok() -> Self {
        Self {
            failure: None,
            barrier: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: ProviderError) -> Self {
        Self {
            failure: Some(error),
            ..Self::ok()
        }
    }

    /// Block each call until the barrier trips
    pub fn meeting(barrier: Arc<Barrier>) -> Self {
        Self {
            barrier: Some(barrier),
            ..Self::ok()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn weather_payload(city: &str) -> Value {
    json!({
        "name": city,
        "main": {"temp": 18.5, "feels_like": 17.9, "humidity": 60, "pressure": 1014},
        "weather": [{"main": "Clouds", "description": "broken clouds"}],
        "wind": {"speed": 3.2},
        "visibility": 10000
    })
}

#[async_trait]
impl WeatherProvider for CountingWeather {
    async fn current_weather(&self, location: &str) -> std::result::Result<Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(weather_payload(location)),
        }
    }
}

/// Embedder returning a fixed query vector
pub struct CountingEmbedder {
    barrier: Option<Arc<Barrier>>,
    hangs: bool,
    pub calls: AtomicUsize,
}

impl CountingEmbedder {
    pub fn new() -> Self {
        Self {
            barrier: None,
            hangs: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn meeting(barrier: Arc<Barrier>) -> Self {
        Self {
            barrier: Some(barrier),
            ..Self::new()
        }
    }

    /// Never answers
    pub fn hanging() -> Self {
        Self {
            hangs: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        if self.hangs {
            std::future::pending::<()>().await;
        }
        Ok(vec![1.0, 0.0])
    }

    fn dimension(&self) -> usize {
        2
    }
}

/// Five chunks; against `[1, 0]` the first three rank highest, in order
pub fn doc_chunks() -> Vec<DocChunk> {
    vec![
        DocChunk::new("Requests are limited to 60 per minute.", "rate-limits", vec![1.0, 0.0]),
        DocChunk::new("Exceeding the limit returns HTTP 429.", "errors", vec![0.9, 0.1]),
        DocChunk::new("Send the key in the appid parameter.", "auth", vec![0.8, 0.2]),
        DocChunk::new("Units may be standard, metric or imperial.", "units", vec![0.0, 1.0]),
        DocChunk::new("Responses are JSON by default.", "formats", vec![0.1, 0.9]),
    ]
}

/// Store whose writes always fail
pub struct FailingStore;

#[async_trait]
impl ConversationStore for FailingStore {
    async fn append(&self, _session_id: &str, _turn: &Turn) -> std::result::Result<(), PersistenceError> {
        Err(PersistenceError::Failed("disk full".to_string()))
    }

    async fn history(&self, _session_id: &str, _limit: usize) -> std::result::Result<Vec<Turn>, PersistenceError> {
        Ok(Vec::new())
    }

    async fn append_summary(&self, _session_id: &str, _summary: &str) -> std::result::Result<(), PersistenceError> {
        Err(PersistenceError::Failed("disk full".to_string()))
    }

    async fn summaries(&self, _session_id: &str) -> std::result::Result<Vec<SessionSummary>, PersistenceError> {
        Ok(Vec::new())
    }
}

/// Store whose appends never complete
pub struct HangingStore;

#[async_trait]
impl ConversationStore for HangingStore {
    async fn append(&self, _session_id: &str, _turn: &Turn) -> std::result::Result<(), PersistenceError> {
        std::future::pending().await
    }

    async fn history(&self, _session_id: &str, _limit: usize) -> std::result::Result<Vec<Turn>, PersistenceError> {
        Ok(Vec::new())
    }

    async fn append_summary(&self, _session_id: &str, _summary: &str) -> std::result::Result<(), PersistenceError> {
        std::future::pending().await
    }

    async fn summaries(&self, _session_id: &str) -> std::result::Result<Vec<SessionSummary>, PersistenceError> {
        Ok(Vec::new())
    }
}

/// In-memory store that delays appending one particular query
pub struct SlowAppendStore {
    inner: Arc<InMemoryConversationStore>,
    slow_query: String,
    delay: Duration,
}

impl SlowAppendStore {
    pub fn new(inner: Arc<InMemoryConversationStore>, slow_query: &str, delay: Duration) -> Self {
        Self {
            inner,
            slow_query: slow_query.to_string(),
            delay,
        }
    }
}

#[async_trait]
impl ConversationStore for SlowAppendStore {
    async fn append(&self, session_id: &str, turn: &Turn) -> std::result::Result<(), PersistenceError> {
        if turn.query == self.slow_query {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.append(session_id, turn).await
    }

    async fn history(&self, session_id: &str, limit: usize) -> std::result::Result<Vec<Turn>, PersistenceError> {
        self.inner.history(session_id, limit).await
    }

    async fn append_summary(&self, session_id: &str, summary: &str) -> std::result::Result<(), PersistenceError> {
        self.inner.append_summary(session_id, summary).await
    }

    async fn summaries(&self, session_id: &str) -> std::result::Result<Vec<SessionSummary>, PersistenceError> {
        self.inner.summaries(session_id).await
    }
}

/// Collaborators shared by one test
pub struct Harness {
    pub llm: Arc<ScriptedLLM>,
    pub weather: Arc<CountingWeather>,
    pub embedder: Arc<CountingEmbedder>,
    pub store: Arc<InMemoryConversationStore>,
}

impl Harness {
    pub fn new(llm: ScriptedLLM) -> Self {
        Self::with_sources(llm, CountingWeather::ok(), CountingEmbedder::new())
    }

    pub fn with_sources(llm: ScriptedLLM, weather: CountingWeather, embedder: CountingEmbedder) -> Self {
        Self {
            llm: Arc::new(llm),
            weather: Arc::new(weather),
            embedder: Arc::new(embedder),
            store: Arc::new(InMemoryConversationStore::new()),
        }
    }

    /// Orchestrator wired to every collaborator, storing into `self.store`
    pub fn builder(&self) -> OrchestratorBuilder {
        let llm: Arc<dyn LLMProvider> = self.llm.clone();
        let timeout = Duration::from_secs(5);

        let retrieval = RetrievalEngine::new(
            self.embedder.clone(),
            Arc::new(InMemoryVectorStore::from_chunks(doc_chunks())),
        );

        Orchestrator::builder(
            Arc::new(LLMQueryClassifier::new(llm.clone(), timeout)),
            ResponseSynthesizer::new(llm.clone(), timeout),
        )
        .retrieval(retrieval)
        .weather(WeatherAdapter::new(self.weather.clone()))
        .locations(LocationExtractor::new(llm, timeout))
        .store(self.store.clone())
    }

    pub fn build(&self) -> Orchestrator {
        self.builder().build()
    }
}
