//! End-to-end pipeline tests against scripted collaborators

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

use common::{
    CountingEmbedder, CountingWeather, FailingStore, HangingStore, Harness, ScriptedLLM,
    SlowAppendStore,
};
use nephele_core::config::{OrchestratorSettings, PersistMode};
use nephele_core::conversation::{ConversationStore, JsonlConversationStore, Turn};
use nephele_core::error::ErrorKind;
use nephele_core::telemetry::trace_channel;
use nephele_core::weather::ProviderError;
use nephele_core::workflow::{
    EMPTY_QUERY_TEXT, PipelineState, QUERY_TIMEOUT_TEXT, RouteKind, SYNTHESIS_FAILED_TEXT,
};

fn settings(persist_mode: PersistMode) -> OrchestratorSettings {
    OrchestratorSettings {
        persist_mode,
        ..OrchestratorSettings::default()
    }
}

#[tokio::test]
async fn test_direct_route_touches_no_sources() {
    let harness = Harness::new(ScriptedLLM::routing("direct"));
    let orchestrator = harness.build();

    let result = orchestrator.handle_query("s1", "Hello there!").await;

    assert_eq!(result.route, RouteKind::Direct);
    assert_eq!(result.state, PipelineState::Done);
    assert!(result.is_complete());
    assert_eq!(result.text, "Answer to: Hello there!");
    assert_eq!(harness.embedder.calls(), 0);
    assert_eq!(harness.weather.calls(), 0);

    let prompt = harness.llm.last_synthesis_prompt();
    assert!(!prompt.contains("[API documentation]"));
    assert!(!prompt.contains("[Weather]"));
}

#[tokio::test]
async fn test_rag_route_records_top_three_docs() {
    let harness = Harness::new(ScriptedLLM::routing("rag"));
    let orchestrator = harness.build();

    let result = orchestrator
        .handle_query("s1", "What is the rate limit?")
        .await;
    assert_eq!(result.route, RouteKind::Rag);
    assert!(result.is_complete());
    assert_eq!(harness.embedder.calls(), 1);
    assert_eq!(harness.weather.calls(), 0);

    let history = harness.store.history("s1", 10).await.unwrap();
    assert_eq!(history.len(), 1);
    let turn = &history[0];
    assert_eq!(turn.route, RouteKind::Rag);
    assert!(turn.weather_snapshot.is_none());
    let sources: Vec<&str> = turn.retrieved_docs.iter().map(|d| d.source_id.as_str()).collect();
    assert_eq!(sources, vec!["rate-limits", "errors", "auth"]);

    let prompt = harness.llm.last_synthesis_prompt();
    assert!(prompt.contains("[Document 1] (source: rate-limits)"));
    assert!(prompt.contains("[Document 3] (source: auth)"));
    assert!(!prompt.contains("source: units"));
}

#[tokio::test]
async fn test_both_route_fetches_sources_concurrently() {
    // Each source blocks until the other has started
    let barrier = Arc::new(Barrier::new(2));
    let harness = Harness::with_sources(
        ScriptedLLM::routing("both"),
        CountingWeather::meeting(barrier.clone()),
        CountingEmbedder::meeting(barrier),
    );
    let orchestrator = harness
        .builder()
        .settings(OrchestratorSettings {
            query_timeout: Duration::from_secs(10),
            ..OrchestratorSettings::default()
        })
        .build();

    let result = orchestrator
        .handle_query("s1", "What's the weather in Paris and what does the humidity field mean?")
        .await;

    assert_eq!(result.route, RouteKind::Both);
    assert_eq!(result.state, PipelineState::Done);
    assert!(result.is_complete());
    assert_eq!(harness.weather.calls(), 1);
    assert_eq!(harness.embedder.calls(), 1);

    let prompt = harness.llm.last_synthesis_prompt();
    assert!(prompt.contains("[Document 1]"));
    assert!(prompt.contains("broken clouds"));

    let history = harness.store.history("s1", 1).await.unwrap();
    assert_eq!(history[0].retrieved_docs.len(), 3);
    assert_eq!(
        history[0].weather_snapshot.as_ref().map(|w| w.location.as_str()),
        Some("Paris")
    );
}

#[tokio::test(start_paused = true)]
async fn test_both_route_survives_weather_outage() {
    let harness = Harness::with_sources(
        ScriptedLLM::routing("both"),
        CountingWeather::failing(ProviderError::Status(503)),
        CountingEmbedder::new(),
    );
    let orchestrator = harness.build();

    let result = orchestrator
        .handle_query("s1", "Weather in Paris, and how do I authenticate?")
        .await;

    assert_eq!(result.state, PipelineState::Done);
    assert_eq!(
        result.partial_failures,
        BTreeSet::from([ErrorKind::WeatherUnavailable])
    );
    assert!(!result.text.is_empty());
    assert_eq!(result.caveats(), vec!["Note: weather data unavailable.".to_string()]);
    // one attempt plus the default two retries
    assert_eq!(harness.weather.calls(), 3);

    let prompt = harness.llm.last_synthesis_prompt();
    assert!(prompt.contains("[Document 1]"));
    assert!(prompt.contains("[Weather]"));
    assert!(!prompt.contains("broken clouds"));
}

#[tokio::test(start_paused = true)]
async fn test_both_route_survives_retrieval_timeout() {
    let harness = Harness::with_sources(
        ScriptedLLM::routing("both"),
        CountingWeather::ok(),
        CountingEmbedder::hanging(),
    );
    let orchestrator = harness
        .builder()
        .retrieval_timeout(Duration::from_secs(2))
        .build();

    let started = tokio::time::Instant::now();
    let result = orchestrator
        .handle_query("s1", "Weather in Paris, and how do I authenticate?")
        .await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(result.state, PipelineState::Done);
    assert_eq!(
        result.partial_failures,
        BTreeSet::from([ErrorKind::RetrievalUnavailable])
    );
    assert_eq!(harness.embedder.calls(), 1);
    assert_eq!(harness.weather.calls(), 1);

    let prompt = harness.llm.last_synthesis_prompt();
    assert!(prompt.contains("broken clouds"));
    assert!(!prompt.contains("[Document 1]"));
}

#[tokio::test]
async fn test_unknown_location_is_not_retried() {
    let harness = Harness::with_sources(
        ScriptedLLM::routing("weather"),
        CountingWeather::failing(ProviderError::NotFound),
        CountingEmbedder::new(),
    );
    let orchestrator = harness.build();

    let result = orchestrator.handle_query("s1", "Is it windy in Atlantis?").await;

    assert_eq!(result.route, RouteKind::Weather);
    assert_eq!(result.state, PipelineState::Done);
    assert!(result.has_failure(ErrorKind::UnknownLocation));
    assert_eq!(harness.weather.calls(), 1);
    assert_eq!(harness.embedder.calls(), 0);
}

#[tokio::test]
async fn test_classifier_failure_falls_back_to_direct() {
    let harness = Harness::new(ScriptedLLM::unreachable_classifier());
    let orchestrator = harness.build();

    let result = orchestrator
        .handle_query("s1", "Tell me about rate limits in Paris")
        .await;

    assert_eq!(result.route, RouteKind::Direct);
    assert_eq!(result.state, PipelineState::Done);
    assert_eq!(
        result.partial_failures,
        BTreeSet::from([ErrorKind::ClassificationError])
    );
    assert_eq!(harness.embedder.calls(), 0);
    assert_eq!(harness.weather.calls(), 0);
}

#[tokio::test]
async fn test_invalid_label_falls_back_to_configured_route() {
    let harness = Harness::new(ScriptedLLM::routing("banana"));
    let orchestrator = harness
        .builder()
        .settings(OrchestratorSettings {
            fallback_route: RouteKind::Rag,
            ..OrchestratorSettings::default()
        })
        .build();

    let result = orchestrator.handle_query("s1", "how do I page results?").await;

    assert_eq!(result.route, RouteKind::Rag);
    assert!(result.has_failure(ErrorKind::ClassificationError));
    assert_eq!(harness.embedder.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_synthesis_is_retried_once() {
    let harness = Harness::new(ScriptedLLM::routing("direct").failing_synthesis(1));
    let orchestrator = harness.build();

    let result = orchestrator.handle_query("s1", "hi").await;

    assert_eq!(result.state, PipelineState::Done);
    assert!(result.is_complete());
    assert_eq!(harness.llm.synthesis_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_synthesis_failure_is_an_error_turn() {
    let harness = Harness::new(ScriptedLLM::routing("rag").failing_synthesis(10));
    let orchestrator = harness.build();

    let result = orchestrator.handle_query("s1", "What is the rate limit?").await;

    assert_eq!(result.state, PipelineState::Error);
    assert_eq!(result.route, RouteKind::Rag);
    assert_eq!(result.text, SYNTHESIS_FAILED_TEXT);
    assert!(result.has_failure(ErrorKind::SynthesisFailed));
    assert_eq!(harness.llm.synthesis_calls.load(std::sync::atomic::Ordering::SeqCst), 2);

    assert_eq!(harness.store.turn_count("s1").await, 0);
    assert!(orchestrator.context_window("s1").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_query_timeout_returns_apology() {
    let harness = Harness::new(ScriptedLLM::routing("rag").slow_synthesis(Duration::from_secs(120)));
    let orchestrator = harness
        .builder()
        .settings(OrchestratorSettings {
            query_timeout: Duration::from_secs(3),
            ..OrchestratorSettings::default()
        })
        .build();

    let result = orchestrator.handle_query("s1", "What is the rate limit?").await;

    assert_eq!(result.state, PipelineState::Error);
    assert_eq!(result.text, QUERY_TIMEOUT_TEXT);
    assert_eq!(result.route, RouteKind::Rag);
    assert!(result.has_failure(ErrorKind::QueryTimeout));
    assert_eq!(harness.store.turn_count("s1").await, 0);
}

#[tokio::test]
async fn test_empty_query_makes_no_calls() {
    let harness = Harness::new(ScriptedLLM::routing("both"));
    let orchestrator = harness.build();

    let result = orchestrator.handle_query("s1", " \n ").await;

    assert_eq!(result.state, PipelineState::Error);
    assert_eq!(result.text, EMPTY_QUERY_TEXT);
    assert_eq!(harness.llm.classify_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(harness.llm.synthesis_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(harness.store.turn_count("s1").await, 0);
}

#[tokio::test]
async fn test_sequential_queries_build_context_in_order() {
    let harness = Harness::new(ScriptedLLM::routing("direct"));
    let orchestrator = harness.build();

    orchestrator.handle_query("s1", "first question").await;
    orchestrator.handle_query("s1", "second question").await;

    let window = orchestrator.context_window("s1").await.unwrap();
    let queries: Vec<&str> = window.turns().iter().map(|t| t.query.as_str()).collect();
    assert_eq!(queries, vec!["first question", "second question"]);

    let prompts = harness.llm.synthesis_prompts();
    assert!(!prompts[0].contains("[Conversation so far]"));
    assert!(prompts[1].contains("User: first question"));
    assert!(prompts[1].contains("Assistant: Answer to: first question"));
}

#[tokio::test]
async fn test_same_session_queries_run_in_arrival_order() {
    let harness = Harness::new(ScriptedLLM::routing("direct"));
    let orchestrator = harness.build();

    let (first, second) = tokio::join!(
        orchestrator.handle_query("s1", "one"),
        orchestrator.handle_query("s1", "two")
    );
    assert!(first.is_complete());
    assert!(second.is_complete());

    let history = harness.store.history("s1", 10).await.unwrap();
    let queries: Vec<&str> = history.iter().map(|t| t.query.as_str()).collect();
    assert_eq!(queries, vec!["one", "two"]);
    assert!(harness.llm.synthesis_prompts()[1].contains("User: one"));
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let harness = Harness::new(ScriptedLLM::routing("direct"));
    let orchestrator = harness.build();

    orchestrator.handle_query("alice", "my secret is blue").await;
    orchestrator.handle_query("bob", "what is my secret?").await;

    assert_eq!(orchestrator.context_window("alice").await.unwrap().len(), 1);
    assert_eq!(orchestrator.context_window("bob").await.unwrap().len(), 1);
    assert!(!harness.llm.last_synthesis_prompt().contains("blue"));
}

#[tokio::test]
async fn test_context_window_stays_within_budget() {
    let harness = Harness::new(ScriptedLLM::routing("direct"));
    let orchestrator = harness.builder().max_tokens(40).build();

    for i in 0..8 {
        let query = format!("question number {} about the forecast format", i);
        orchestrator.handle_query("s1", &query).await;

        let window = orchestrator.context_window("s1").await.unwrap();
        assert!(window.used_tokens() <= window.max_tokens());
        let recount: usize = window.turns().iter().map(Turn::estimate_tokens).sum();
        assert_eq!(recount, window.used_tokens());
    }

    let window = orchestrator.context_window("s1").await.unwrap();
    assert!(window.evicted_turns() > 0);
    assert_eq!(
        window.turns().last().map(|t| t.query.as_str()),
        Some("question number 7 about the forecast format")
    );
    // evicted turns stay in the store
    assert_eq!(harness.store.turn_count("s1").await, 8);
}

#[tokio::test]
async fn test_persistence_failure_is_flagged_when_awaited() {
    let harness = Harness::new(ScriptedLLM::routing("direct"));
    let orchestrator = harness.builder().store(Arc::new(FailingStore)).build();

    let result = orchestrator.handle_query("s1", "hello").await;

    assert_eq!(result.state, PipelineState::Done);
    assert_eq!(
        result.partial_failures,
        BTreeSet::from([ErrorKind::PersistenceFailed])
    );
    assert_eq!(result.text, "Answer to: hello");
    assert_eq!(orchestrator.context_window("s1").await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_store_is_flagged_within_persist_timeout() {
    let harness = Harness::new(ScriptedLLM::routing("direct"));
    let orchestrator = harness
        .builder()
        .store(Arc::new(HangingStore))
        .settings(OrchestratorSettings {
            persist_mode: PersistMode::Await,
            persist_timeout: Duration::from_secs(2),
            ..OrchestratorSettings::default()
        })
        .build();

    let started = tokio::time::Instant::now();
    let result = orchestrator.handle_query("s1", "hello").await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(3));
    assert_eq!(result.state, PipelineState::Done);
    assert_eq!(result.text, "Answer to: hello");
    assert_eq!(
        result.partial_failures,
        BTreeSet::from([ErrorKind::PersistenceFailed])
    );
    assert_eq!(orchestrator.context_window("s1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_background_persistence_keeps_order() {
    let harness = Harness::new(ScriptedLLM::routing("direct"));
    let orchestrator = harness
        .builder()
        .settings(settings(PersistMode::Background))
        .build();

    for query in ["a", "b", "c"] {
        let result = orchestrator.handle_query("s1", query).await;
        assert!(result.is_complete());
    }
    orchestrator.flush("s1").await;

    let history = harness.store.history("s1", 10).await.unwrap();
    let queries: Vec<&str> = history.iter().map(|t| t.query.as_str()).collect();
    assert_eq!(queries, vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn test_eviction_keeps_background_writes_in_order() {
    let harness = Harness::new(ScriptedLLM::routing("direct"));
    let store = SlowAppendStore::new(harness.store.clone(), "a", Duration::from_millis(500));
    let orchestrator = harness
        .builder()
        .store(Arc::new(store))
        .settings(settings(PersistMode::Background))
        .build();

    orchestrator.handle_query("s1", "a").await;
    assert!(orchestrator.sessions().evict("s1").await);
    orchestrator.handle_query("s1", "b").await;
    orchestrator.flush("s1").await;

    let history = harness.store.history("s1", 10).await.unwrap();
    let queries: Vec<&str> = history.iter().map(|t| t.query.as_str()).collect();
    assert_eq!(queries, vec!["a", "b"]);

    // the recreated session was hydrated after the first write landed
    let prompt = harness.llm.last_synthesis_prompt();
    assert!(prompt.contains("User: a"));
    assert!(prompt.contains("Assistant: Answer to: a"));
}

#[tokio::test(start_paused = true)]
async fn test_flush_after_eviction_waits_for_pending_write() {
    let harness = Harness::new(ScriptedLLM::routing("direct"));
    let store = SlowAppendStore::new(harness.store.clone(), "a", Duration::from_millis(500));
    let orchestrator = harness
        .builder()
        .store(Arc::new(store))
        .settings(settings(PersistMode::Background))
        .build();

    orchestrator.handle_query("s1", "a").await;
    orchestrator.sessions().evict("s1").await;
    assert_eq!(harness.store.turn_count("s1").await, 0);

    orchestrator.flush("s1").await;
    assert_eq!(harness.store.turn_count("s1").await, 1);
}

#[tokio::test]
async fn test_background_persistence_failure_is_not_flagged() {
    let harness = Harness::new(ScriptedLLM::routing("direct"));
    let orchestrator = harness
        .builder()
        .store(Arc::new(FailingStore))
        .settings(settings(PersistMode::Background))
        .build();

    let result = orchestrator.handle_query("s1", "hello").await;
    orchestrator.flush("s1").await;

    assert!(result.is_complete());
}

#[tokio::test]
async fn test_new_session_is_hydrated_from_store() {
    let harness = Harness::new(ScriptedLLM::routing("direct"));
    harness
        .store
        .append(
            "s1",
            &Turn::new("What's the limit?", RouteKind::Rag, Vec::new(), None, "60 per minute."),
        )
        .await
        .unwrap();
    let orchestrator = harness.build();

    orchestrator.handle_query("s1", "And per hour?").await;

    assert!(harness.llm.last_synthesis_prompt().contains("User: What's the limit?"));
    let window = orchestrator.context_window("s1").await.unwrap();
    assert_eq!(window.len(), 2);
    assert_eq!(harness.store.turn_count("s1").await, 2);
}

#[tokio::test]
async fn test_summary_feeds_later_prompts() {
    let harness = Harness::new(ScriptedLLM::routing("direct"));
    let orchestrator = harness.build();

    orchestrator.handle_query("s1", "Weather in Paris?").await;
    orchestrator.handle_query("s1", "And the rate limit?").await;

    let summary = orchestrator.summarize_session("s1").await.unwrap();
    assert_eq!(summary, "The user asked about Paris weather and API rate limits.");
    assert_eq!(harness.store.summaries("s1").await.unwrap().len(), 1);

    orchestrator.handle_query("s1", "Thanks!").await;
    let prompt = harness.llm.last_synthesis_prompt();
    assert!(prompt.contains("[Long-term memory]\nThe user asked about Paris weather"));
}

#[tokio::test]
async fn test_summarize_unknown_session_fails() {
    let harness = Harness::new(ScriptedLLM::routing("direct"));
    let orchestrator = harness.build();

    assert!(orchestrator.summarize_session("nobody").await.is_err());
    assert_eq!(harness.llm.summary_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_trace_events_follow_pipeline() {
    let harness = Harness::new(ScriptedLLM::routing("both"));
    let (sink, mut events) = trace_channel(32);
    let orchestrator = harness.builder().trace_sink(Arc::new(sink)).build();

    orchestrator.handle_query("s1", "Weather in Paris and the units field?").await;

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.session_id, "s1");
        states.push(event.state);
    }
    assert_eq!(
        states,
        vec![
            PipelineState::Received,
            PipelineState::Classified,
            PipelineState::BothPending,
            PipelineState::Synthesizing,
            PipelineState::Persisting,
            PipelineState::Done,
        ]
    );
}

#[tokio::test]
async fn test_jsonl_history_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let first = Harness::new(ScriptedLLM::routing("direct"));
    let store = Arc::new(JsonlConversationStore::open(dir.path()).await.unwrap());
    let orchestrator = first.builder().store(store).build();
    orchestrator.handle_query("user/42", "Remember that I live in Oslo").await;
    drop(orchestrator);

    let second = Harness::new(ScriptedLLM::routing("direct"));
    let store = Arc::new(JsonlConversationStore::open(dir.path()).await.unwrap());
    let orchestrator = second.builder().store(store.clone()).build();
    orchestrator.handle_query("user/42", "Where do I live?").await;

    assert!(second.llm.last_synthesis_prompt().contains("User: Remember that I live in Oslo"));
    assert_eq!(store.history("user/42", 10).await.unwrap().len(), 2);
}
