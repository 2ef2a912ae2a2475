//! # Nephele - a routing assistant for API docs and live weather
//!
//! Nephele answers conversational questions about an API's documentation,
//! about current weather conditions, or both at once:
//! - Query classification into `rag`, `weather`, `both` or `direct` routes
//! - Semantic retrieval over pre-embedded documentation chunks
//! - Live weather lookups with bounded retries and timeouts
//! - Token-budgeted conversation memory with persistent history
//! - Graceful degradation: a failed source becomes a caveat, not an error
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nephele_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = NepheleConfig::load()?;
//!     let orchestrator = Orchestrator::from_config(&config).await?;
//!
//!     let answer = orchestrator
//!         .handle_query("session-1", "What's the weather in Paris and what does the humidity field mean?")
//!         .await;
//!     println!("{}", answer.text);
//!     for caveat in answer.caveats() {
//!         println!("{}", caveat);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod conversation;
pub mod embeddings;
pub mod error;
pub mod llm;
pub mod retrieval;
pub mod telemetry;
pub mod weather;
pub mod workflow;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{NepheleConfig, OrchestratorSettings, PersistMode};
    pub use crate::conversation::{
        ContextManager, ContextWindow, ConversationStore, InMemoryConversationStore,
        JsonlConversationStore, Session, SessionRegistry, Turn,
    };
    pub use crate::embeddings::{EmbeddingProvider, OpenAIEmbeddings};
    pub use crate::error::{ErrorKind, NepheleError, Result};
    pub use crate::llm::{LLMProvider, LLMRequest, LLMResponse, Message, MessageRole, OpenAIProvider};
    pub use crate::retrieval::{DocChunk, InMemoryVectorStore, RetrievalEngine, VectorStore};
    pub use crate::telemetry::{TraceEvent, TraceSink};
    pub use crate::weather::{OpenWeatherProvider, WeatherAdapter, WeatherData, WeatherProvider};
    pub use crate::workflow::{
        AnswerResult, KeywordQueryClassifier, LLMQueryClassifier, Orchestrator, PipelineState,
        QueryClassifier, ResponseSynthesizer, RouteKind,
    };
}
