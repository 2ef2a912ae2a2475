//! Query routing pipeline
//!
//! A query is classified into a [`RouteKind`], the inputs that route needs are
//! gathered (documentation chunks, live weather, or both concurrently), and a
//! single completion grounds the answer in them:
//!
//! - **Classifier**: picks the route from the query and recent turns
//! - **Synthesizer**: builds the grounded prompt and produces the answer
//! - **Orchestrator**: drives the per-query state machine and records the turn
//!
//! # Example
//!
//! ```rust,ignore
//! use nephele_core::workflow::{KeywordQueryClassifier, Orchestrator, ResponseSynthesizer};
//!
//! let orchestrator = Orchestrator::builder(
//!     Arc::new(KeywordQueryClassifier::new()),
//!     ResponseSynthesizer::new(llm, Duration::from_secs(30)),
//! )
//! .weather(weather)
//! .build();
//!
//! let answer = orchestrator.handle_query("session-1", "Is it raining in Oslo?").await;
//! println!("{}", answer.text);
//! ```

mod classifier;
mod execution;
mod orchestrator;
mod synthesizer;

pub use classifier::{
    ClassificationError, KeywordQueryClassifier, LLMQueryClassifier, QueryClassifier, RouteKind,
    parse_label,
};
pub use execution::{AnswerResult, PipelineState};
pub use orchestrator::{
    EMPTY_QUERY_TEXT, Orchestrator, OrchestratorBuilder, QUERY_TIMEOUT_TEXT, SYNTHESIS_FAILED_TEXT,
};
pub use synthesizer::{DEFAULT_PREAMBLE, ResponseSynthesizer, SynthesisError, SynthesisInput};
