//! Per-query state machine
//!
//! ```text
//! RECEIVED -> CLASSIFIED -> { RETRIEVING | CALLING_WEATHER | BOTH_PENDING } -> SYNTHESIZING
//!          -> PERSISTING -> DONE
//! ```
//!
//! Any state can fall to `ERROR`, which still returns a user-visible answer.
//! Queries for one session run strictly in arrival order: the session lock
//! is held from `RECEIVED` until the turn is in the context window.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use super::classifier::{
    KeywordQueryClassifier, LLMQueryClassifier, QueryClassifier, RouteKind,
};
use super::execution::{AnswerResult, PipelineState};
use super::synthesizer::{ResponseSynthesizer, SynthesisError, SynthesisInput};
use crate::config::{ClassifierKind, NepheleConfig, OrchestratorSettings, PersistMode, StoreBackend};
use crate::conversation::{
    ContextManager, ContextWindow, ConversationStore, InMemoryConversationStore,
    JsonlConversationStore, Session, SessionRegistry, Turn,
};
use crate::embeddings::OpenAIEmbeddings;
use crate::error::{ErrorKind, NepheleError, Result};
use crate::llm::{LLMProvider, OpenAIProvider, RetryConfig, with_retry};
use crate::retrieval::{DocChunk, InMemoryVectorStore, RetrievalEngine, RetrievalError};
use crate::telemetry::{LoggingTraceSink, TraceEvent, TraceSink};
use crate::weather::{LocationExtractor, OpenWeatherProvider, WeatherAdapter, WeatherData, WeatherError};

/// Answer when synthesis fails
pub const SYNTHESIS_FAILED_TEXT: &str =
    "Sorry, I couldn't generate an answer right now. Please try again in a moment.";
/// Answer when the per-query ceiling elapses
pub const QUERY_TIMEOUT_TEXT: &str = "Sorry, that took too long to answer. Please try again.";
/// Answer to a blank query
pub const EMPTY_QUERY_TEXT: &str = "Please ask a question about the API or the weather.";

/// Persisted turns handed to the summariser
const SUMMARY_TURNS: usize = 50;

/// Inputs gathered so far; survives the query timeout dropping the pipeline future
struct PipelineRun {
    route: RouteKind,
    docs: Vec<DocChunk>,
    weather: Option<WeatherData>,
    failures: BTreeSet<ErrorKind>,
}

impl PipelineRun {
    fn new(route: RouteKind) -> Self {
        Self {
            route,
            docs: Vec::new(),
            weather: None,
            failures: BTreeSet::new(),
        }
    }
}

/// Top-level query handler
pub struct Orchestrator {
    classifier: Arc<dyn QueryClassifier>,
    synthesizer: ResponseSynthesizer,
    retrieval: Option<RetrievalEngine>,
    weather: Option<WeatherAdapter>,
    locations: LocationExtractor,
    context: ContextManager,
    store: Arc<dyn ConversationStore>,
    sessions: Arc<SessionRegistry>,
    trace: Arc<dyn TraceSink>,
    settings: OrchestratorSettings,
    top_k: usize,
    history_limit: usize,
    retrieval_timeout: Duration,
}

impl Orchestrator {
    /// Create a builder from the two collaborators every query needs
    pub fn builder(
        classifier: Arc<dyn QueryClassifier>,
        synthesizer: ResponseSynthesizer,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder::new(classifier, synthesizer)
    }

    /// Wire every collaborator from configuration.
    ///
    /// The completion service is required. The document index is loaded from
    /// `retrieval.index_path` when set, and the weather branch is enabled when
    /// an OpenWeather key is available; a missing source makes its route
    /// report the source as unavailable.
    ///
    /// # Errors
    ///
    /// Returns an error if the completion provider, the index or the store
    /// cannot be set up.
    pub async fn from_config(config: &NepheleConfig) -> Result<Self> {
        let llm: Arc<dyn LLMProvider> = Arc::new(OpenAIProvider::from_settings(&config.llm)?);
        Self::from_config_with_llm(config, llm).await
    }

    /// [`from_config`](Self::from_config) with an injected completion service.
    pub async fn from_config_with_llm(
        config: &NepheleConfig,
        llm: Arc<dyn LLMProvider>,
    ) -> Result<Self> {
        config.validate()?;
        tracing::debug!(provider = llm.name(), "wiring orchestrator");

        let classifier: Arc<dyn QueryClassifier> = match config.classifier.kind {
            ClassifierKind::Llm => Arc::new(
                LLMQueryClassifier::new(llm.clone(), config.llm.timeout)
                    .with_recent_turns(config.classifier.recent_turns),
            ),
            ClassifierKind::Keyword => Arc::new(KeywordQueryClassifier::new()),
        };

        let mut synthesizer = ResponseSynthesizer::new(llm.clone(), config.llm.timeout)
            .with_max_doc_chars(config.retrieval.max_doc_chars)
            .with_min_score(config.retrieval.min_score)
            .with_temperature(config.llm.temperature);
        if let Some(preamble) = &config.orchestrator.system_preamble {
            synthesizer = synthesizer.with_preamble(preamble.clone());
        }

        let store: Arc<dyn ConversationStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(InMemoryConversationStore::new()),
            StoreBackend::Jsonl => Arc::new(
                JsonlConversationStore::open(&config.store.dir)
                    .await
                    .map_err(|e| NepheleError::Storage(e.to_string()))?,
            ),
        };

        let mut builder = Self::builder(classifier, synthesizer)
            .store(store)
            .locations(LocationExtractor::new(llm, config.llm.timeout))
            .settings(config.orchestrator.clone())
            .max_tokens(config.context.max_tokens)
            .history_limit(config.context.history_limit)
            .top_k(config.retrieval.top_k)
            .retrieval_timeout(config.embeddings.timeout);

        match &config.retrieval.index_path {
            Some(path) => {
                let index = InMemoryVectorStore::load_json(path).await?;
                let embedder = OpenAIEmbeddings::from_settings(&config.embeddings)?;
                builder = builder.retrieval(RetrievalEngine::new(Arc::new(embedder), Arc::new(index)));
            }
            None => tracing::warn!("retrieval.index_path not set, documentation lookups disabled"),
        }

        match OpenWeatherProvider::from_settings(&config.weather) {
            Ok(provider) => {
                builder = builder.weather(WeatherAdapter::from_settings(Arc::new(provider), &config.weather));
            }
            Err(e) => tracing::warn!(error = %e, "weather lookups disabled"),
        }

        Ok(builder.build())
    }

    /// The session registry queries run against
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Snapshot of a live session's context window
    pub async fn context_window(&self, session_id: &str) -> Option<ContextWindow> {
        let handle = self.sessions.get(session_id).await?;
        let session = handle.lock().await;
        Some(self.context.window(&session))
    }

    /// Answer one query for `session_id`.
    ///
    /// Never fails: every outcome, degraded ones included, is an
    /// [`AnswerResult`] with user-presentable text.
    pub async fn handle_query(&self, session_id: &str, query: &str) -> AnswerResult {
        let mut session = self.sessions.lock(session_id).await;
        let started = Instant::now();

        self.emit(session_id, PipelineState::Received, None, None);

        let query = query.trim();
        if query.is_empty() {
            self.emit(session_id, PipelineState::Error, None, Some("empty query".to_string()));
            return AnswerResult {
                text: EMPTY_QUERY_TEXT.to_string(),
                route: RouteKind::Direct,
                partial_failures: BTreeSet::new(),
                state: PipelineState::Error,
                session_id: session_id.to_string(),
            };
        }

        if !session.hydrated {
            self.hydrate(&mut session).await;
        }

        let window = self.context.window(&session);
        let summary = session.summary.clone();
        let mut run = PipelineRun::new(self.settings.fallback_route);

        let outcome = tokio::time::timeout(
            self.settings.query_timeout,
            self.run_pipeline(&mut run, session_id, query, &window, summary.as_deref()),
        )
        .await;

        let answer = match outcome {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                tracing::error!(session_id, route = %run.route, error = %e, "synthesis failed");
                run.failures.insert(e.kind());
                return self.degraded(session_id, run, SYNTHESIS_FAILED_TEXT, e.to_string());
            }
            Err(_) => {
                tracing::error!(
                    session_id,
                    route = %run.route,
                    timeout_ms = self.settings.query_timeout.as_millis() as u64,
                    "query timed out"
                );
                run.failures.insert(ErrorKind::QueryTimeout);
                return self.degraded(session_id, run, QUERY_TIMEOUT_TEXT, "query timed out".to_string());
            }
        };

        let turn = Turn::new(query, run.route, run.docs, run.weather, answer.clone());
        self.context.append(&mut session, turn.clone());

        self.emit(session_id, PipelineState::Persisting, Some(run.route), None);
        self.persist(&mut session, turn, &mut run.failures).await;

        self.emit(session_id, PipelineState::Done, Some(run.route), None);
        tracing::info!(
            session_id,
            route = %run.route,
            partial_failures = run.failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query answered"
        );

        AnswerResult {
            text: answer,
            route: run.route,
            partial_failures: run.failures,
            state: PipelineState::Done,
            session_id: session_id.to_string(),
        }
    }

    async fn run_pipeline(
        &self,
        run: &mut PipelineRun,
        session_id: &str,
        query: &str,
        window: &ContextWindow,
        summary: Option<&str>,
    ) -> std::result::Result<String, SynthesisError> {
        run.route = match self.classifier.classify(query, window).await {
            Ok(route) => {
                self.emit(session_id, PipelineState::Classified, Some(route), None);
                route
            }
            Err(e) => {
                let fallback = self.settings.fallback_route;
                tracing::warn!(session_id, error = %e, fallback = %fallback, "classification failed, using fallback route");
                run.failures.insert(e.kind());
                self.emit(
                    session_id,
                    PipelineState::Classified,
                    Some(fallback),
                    Some(format!("fallback: {}", e)),
                );
                fallback
            }
        };
        let route = run.route;

        let fan_out = PipelineState::fan_out(route);
        if fan_out != PipelineState::Synthesizing {
            self.emit(session_id, fan_out, Some(route), None);
        }

        let (docs, weather) = tokio::join!(
            self.retrieve_branch(route, query),
            self.weather_branch(route, query)
        );

        match docs {
            Some(Ok(docs)) => run.docs = docs,
            Some(Err(e)) => {
                tracing::warn!(session_id, error = %e, "retrieval failed, answering without documentation");
                run.failures.insert(e.kind());
            }
            None => {}
        }
        match weather {
            Some(Ok(data)) => run.weather = Some(data),
            Some(Err(e)) => {
                tracing::warn!(session_id, error = %e, "weather lookup failed, answering without weather");
                run.failures.insert(e.kind());
            }
            None => {}
        }

        let detail = (!run.failures.is_empty()).then(|| {
            let kinds: Vec<String> = run.failures.iter().map(ToString::to_string).collect();
            format!("partial failures: {}", kinds.join(", "))
        });
        self.emit(session_id, PipelineState::Synthesizing, Some(route), detail);

        let input = SynthesisInput {
            query,
            route,
            docs: &run.docs,
            weather: run.weather.as_ref(),
            context: window,
            summary,
        };
        let retry = RetryConfig::from_retries(self.settings.synthesis_retries)
            .with_initial_delay(self.settings.synthesis_retry_delay);

        with_retry(&retry, || self.synthesizer.synthesize(input)).await
    }

    async fn retrieve_branch(
        &self,
        route: RouteKind,
        query: &str,
    ) -> Option<std::result::Result<Vec<DocChunk>, RetrievalError>> {
        if !route.needs_docs() {
            return None;
        }
        let Some(engine) = &self.retrieval else {
            return Some(Err(RetrievalError::Unavailable(
                "no document index configured".to_string(),
            )));
        };

        let result = match tokio::time::timeout(self.retrieval_timeout, engine.retrieve(query, self.top_k)).await {
            Ok(result) => result,
            Err(_) => Err(RetrievalError::Unavailable(format!(
                "timed out after {:?}",
                self.retrieval_timeout
            ))),
        };
        Some(result)
    }

    async fn weather_branch(
        &self,
        route: RouteKind,
        query: &str,
    ) -> Option<std::result::Result<WeatherData, WeatherError>> {
        if !route.needs_weather() {
            return None;
        }
        let Some(adapter) = &self.weather else {
            return Some(Err(WeatherError::Unavailable {
                last_error: "no weather provider configured".to_string(),
            }));
        };

        let location = self.locations.extract(query).await;
        tracing::debug!(location = %location, "resolved weather location");
        Some(adapter.fetch(&location).await)
    }

    async fn persist(&self, session: &mut Session, turn: Turn, failures: &mut BTreeSet<ErrorKind>) {
        let timeout = self.settings.persist_timeout;

        match self.settings.persist_mode {
            PersistMode::Await => {
                let outcome = tokio::time::timeout(timeout, self.store.append(session.id(), &turn)).await;
                let error = match outcome {
                    Ok(Ok(())) => return,
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => format!("append timed out after {:?}", timeout),
                };
                tracing::warn!(session_id = %session.id(), error = %error, "failed to persist turn");
                failures.insert(ErrorKind::PersistenceFailed);
            }
            PersistMode::Background => {
                let previous = session.persist_tail.take();
                let store = self.store.clone();
                let session_id = session.id().to_string();

                session.persist_tail = Some(tokio::spawn(async move {
                    // keep appends in arrival order
                    if let Some(previous) = previous {
                        if let Err(e) = previous.await {
                            tracing::warn!(session_id = %session_id, error = %e, "previous persist task failed");
                        }
                    }
                    let error = match tokio::time::timeout(timeout, store.append(&session_id, &turn)).await {
                        Ok(Ok(())) => return,
                        Ok(Err(e)) => e.to_string(),
                        Err(_) => format!("append timed out after {:?}", timeout),
                    };
                    tracing::warn!(session_id = %session_id, error = %error, "failed to persist turn");
                }));
            }
        }
    }

    /// Wait for a session's background appends to land
    pub async fn flush(&self, session_id: &str) {
        match self.sessions.get(session_id).await {
            Some(handle) => {
                let mut session = handle.lock().await;
                if let Some(tail) = session.persist_tail.take() {
                    await_write(session_id, tail).await;
                }
            }
            None => {
                if let Some(tail) = self.sessions.take_pending_write(session_id).await {
                    await_write(session_id, tail).await;
                }
            }
        }
    }

    async fn hydrate(&self, session: &mut Session) {
        session.hydrated = true;
        // writes left by an evicted predecessor land before history is read
        if let Some(tail) = session.persist_tail.take() {
            await_write(session.id(), tail).await;
        }
        let timeout = self.settings.persist_timeout;

        if self.history_limit > 0 {
            match tokio::time::timeout(timeout, self.store.history(session.id(), self.history_limit)).await {
                Ok(Ok(turns)) => {
                    let loaded = turns.len();
                    for turn in turns {
                        self.context.append(session, turn);
                    }
                    if loaded > 0 {
                        tracing::debug!(session_id = %session.id(), loaded, "hydrated session from store");
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(session_id = %session.id(), error = %e, "could not load history, starting empty")
                }
                Err(_) => tracing::warn!(session_id = %session.id(), "history load timed out, starting empty"),
            }
        }

        match tokio::time::timeout(timeout, self.store.summaries(session.id())).await {
            Ok(Ok(summaries)) => session.summary = summaries.into_iter().last().map(|s| s.summary),
            Ok(Err(e)) => tracing::warn!(session_id = %session.id(), error = %e, "could not load summaries"),
            Err(_) => tracing::warn!(session_id = %session.id(), "summary load timed out"),
        }
    }

    /// Summarise a session's persisted history into long-term memory.
    ///
    /// The summary is stored with the conversation and used in later prompts
    /// for the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session has no history, the store fails, or
    /// the completion service cannot produce a summary.
    pub async fn summarize_session(&self, session_id: &str) -> Result<String> {
        self.flush(session_id).await;

        let history = self
            .store
            .history(session_id, SUMMARY_TURNS)
            .await
            .map_err(|e| NepheleError::Storage(e.to_string()))?;
        if history.is_empty() {
            return Err(NepheleError::Other(format!(
                "No conversation history for session {}",
                session_id
            )));
        }

        let summary = self
            .synthesizer
            .summarize(&history)
            .await
            .map_err(|e| NepheleError::LLM(e.to_string()))?;

        self.store
            .append_summary(session_id, &summary)
            .await
            .map_err(|e| NepheleError::Storage(e.to_string()))?;

        if let Some(handle) = self.sessions.get(session_id).await {
            handle.lock().await.summary = Some(summary.clone());
        }

        tracing::info!(session_id, turns = history.len(), "session summarised");
        Ok(summary)
    }

    fn degraded(&self, session_id: &str, run: PipelineRun, text: &str, detail: String) -> AnswerResult {
        self.emit(session_id, PipelineState::Error, Some(run.route), Some(detail));
        AnswerResult {
            text: text.to_string(),
            route: run.route,
            partial_failures: run.failures,
            state: PipelineState::Error,
            session_id: session_id.to_string(),
        }
    }

    fn emit(&self, session_id: &str, state: PipelineState, route: Option<RouteKind>, detail: Option<String>) {
        let mut event = TraceEvent::new(session_id, state).with_route(route);
        event.detail = detail;
        self.trace.record(event);
    }
}

async fn await_write(session_id: &str, tail: JoinHandle<()>) {
    if let Err(e) = tail.await {
        tracing::warn!(session_id, error = %e, "persist task failed");
    }
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    classifier: Arc<dyn QueryClassifier>,
    synthesizer: ResponseSynthesizer,
    retrieval: Option<RetrievalEngine>,
    weather: Option<WeatherAdapter>,
    locations: LocationExtractor,
    store: Arc<dyn ConversationStore>,
    sessions: Arc<SessionRegistry>,
    trace: Arc<dyn TraceSink>,
    settings: OrchestratorSettings,
    max_tokens: usize,
    top_k: usize,
    history_limit: usize,
    retrieval_timeout: Duration,
}

impl OrchestratorBuilder {
    fn new(classifier: Arc<dyn QueryClassifier>, synthesizer: ResponseSynthesizer) -> Self {
        let defaults = NepheleConfig::default();
        Self {
            classifier,
            synthesizer,
            retrieval: None,
            weather: None,
            locations: LocationExtractor::pattern_only(),
            store: Arc::new(InMemoryConversationStore::new()),
            sessions: Arc::new(SessionRegistry::new()),
            trace: Arc::new(LoggingTraceSink),
            settings: defaults.orchestrator,
            max_tokens: defaults.context.max_tokens,
            top_k: defaults.retrieval.top_k,
            history_limit: defaults.context.history_limit,
            retrieval_timeout: defaults.embeddings.timeout,
        }
    }

    pub fn retrieval(mut self, engine: RetrievalEngine) -> Self {
        self.retrieval = Some(engine);
        self
    }

    pub fn weather(mut self, adapter: WeatherAdapter) -> Self {
        self.weather = Some(adapter);
        self
    }

    /// How weather queries are turned into a location
    pub fn locations(mut self, extractor: LocationExtractor) -> Self {
        self.locations = extractor;
        self
    }

    pub fn store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = store;
        self
    }

    /// Share a session registry, e.g. with an external expiry task
    pub fn sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = sink;
        self
    }

    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Context window budget in estimated tokens
    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Persisted turns loaded when a session is first seen
    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn retrieval_timeout(mut self, timeout: Duration) -> Self {
        self.retrieval_timeout = timeout;
        self
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator {
            classifier: self.classifier,
            synthesizer: self.synthesizer,
            retrieval: self.retrieval,
            weather: self.weather,
            locations: self.locations,
            context: ContextManager::new(self.max_tokens),
            store: self.store,
            sessions: self.sessions,
            trace: self.trace,
            settings: self.settings,
            top_k: self.top_k,
            history_limit: self.history_limit,
            retrieval_timeout: self.retrieval_timeout,
        }
    }
}
