//! Configuration types for Nephele

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{NepheleError, Result};
use crate::llm::RetryConfig;
use crate::workflow::RouteKind;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NepheleConfig {
    /// Completion service settings
    pub llm: LLMSettings,

    /// Embedding provider settings
    pub embeddings: EmbeddingsSettings,

    /// Query classifier settings
    pub classifier: ClassifierSettings,

    /// Document retrieval settings
    pub retrieval: RetrievalSettings,

    /// Weather adapter settings
    pub weather: WeatherSettings,

    /// Short-term context window settings
    pub context: ContextSettings,

    /// Pipeline settings
    pub orchestrator: OrchestratorSettings,

    /// Long-term conversation store settings
    pub store: StoreSettings,
}

/// Completion service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMSettings {
    /// Provider type
    pub provider: LLMProviderKind,

    /// Model name
    pub model: String,

    /// API key (prefer `OPENAI_API_KEY`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL for compatible endpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Sampling temperature for synthesis
    pub temperature: f32,

    /// Bound on every completion call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for LLMSettings {
    fn default() -> Self {
        Self {
            provider: LLMProviderKind::OpenAI,
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            base_url: None,
            temperature: 0.0,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Completion provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LLMProviderKind {
    OpenAI,
}

/// Embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsSettings {
    /// Model name
    pub model: String,

    /// API key (prefer `OPENAI_API_KEY`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL for compatible endpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for EmbeddingsSettings {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            api_key: None,
            base_url: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Which classifier implementation routes queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierKind {
    /// Completion-service classifier
    #[default]
    Llm,
    /// Offline keyword matching
    Keyword,
}

/// Query classifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    pub kind: ClassifierKind,

    /// Recent turns shown to the classifier for follow-up questions
    pub recent_turns: usize,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            kind: ClassifierKind::Llm,
            recent_turns: 3,
        }
    }
}

/// Document retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    /// Number of chunks returned per query
    pub top_k: usize,

    /// Cap on the total document text placed in a prompt
    pub max_doc_chars: usize,

    /// Optional relevance floor applied during prompt construction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f32>,

    /// JSON snapshot of pre-embedded chunks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_path: Option<PathBuf>,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 3,
            max_doc_chars: 2000,
            min_score: None,
            index_path: None,
        }
    }
}

/// Weather adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherSettings {
    /// API key (prefer `OPENWEATHER_API_KEY`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Provider base URL
    pub base_url: String,

    /// Unit system (`metric`, `imperial`, `standard`)
    pub units: String,

    /// Language for condition descriptions
    pub lang: String,

    /// Bound on a single provider call
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,

    /// Retries after the initial attempt on transient failure
    pub max_retries: usize,

    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound on a single backoff delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Backoff growth factor
    pub backoff_multiplier: f64,

    /// Hard ceiling on the whole fetch, retries included
    #[serde(with = "humantime_serde")]
    pub total_timeout: Duration,
}

impl Default for WeatherSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openweathermap.org/data/2.5".to_string(),
            units: "metric".to_string(),
            lang: "en".to_string(),
            attempt_timeout: Duration::from_secs(5),
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(4),
            backoff_multiplier: 2.0,
            total_timeout: Duration::from_secs(15),
        }
    }
}

impl WeatherSettings {
    /// Retry policy derived from these settings
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::from_retries(self.max_retries)
            .with_initial_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_backoff_multiplier(self.backoff_multiplier)
    }
}

/// Short-term memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Token budget for the context window (estimated at 4 chars per token)
    pub max_tokens: usize,

    /// Persisted turns loaded when a session is first seen
    pub history_limit: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_tokens: 4000,
            history_limit: 10,
        }
    }
}

/// How finished turns reach the conversation store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PersistMode {
    /// Append inside the pipeline and report failures in the answer
    #[default]
    Await,
    /// Append on a background task; failures are only logged
    Background,
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Ceiling on classify + fan-out + synthesize
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,

    /// Route used when classification fails
    pub fallback_route: RouteKind,

    /// Extra synthesis attempts after a failure
    pub synthesis_retries: usize,

    /// Pause before re-running synthesis
    #[serde(with = "humantime_serde")]
    pub synthesis_retry_delay: Duration,

    pub persist_mode: PersistMode,

    /// Bound on an awaited store append
    #[serde(with = "humantime_serde")]
    pub persist_timeout: Duration,

    /// Replaces the built-in system preamble
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_preamble: Option<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(60),
            fallback_route: RouteKind::Direct,
            synthesis_retries: 1,
            synthesis_retry_delay: Duration::from_millis(250),
            persist_mode: PersistMode::Await,
            persist_timeout: Duration::from_secs(5),
            system_preamble: None,
        }
    }
}

/// Conversation store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local, lost on exit
    Memory,
    /// One JSON-lines file per session
    #[default]
    Jsonl,
}

/// Long-term memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,

    /// Directory for the JSONL backend
    pub dir: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Jsonl,
            dir: PathBuf::from("./data/conversations"),
        }
    }
}

impl NepheleConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `nephele.toml` in the working directory
    /// 3. The file named by `NEPHELE_CONFIG_PATH`
    /// 4. `NEPHELE_`-prefixed environment variables (`__` separates sections,
    ///    e.g. `NEPHELE_WEATHER__MAX_RETRIES=3`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid or validation fails.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(NepheleConfig::default()))
            .merge(Toml::file("nephele.toml"));

        if let Ok(path) = std::env::var("NEPHELE_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("NEPHELE_").ignore(&["CONFIG_PATH"]).split("__"));

        Self::from_figment(figment)
    }

    /// Load configuration from a specific TOML file layered over the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let path = path.as_ref();
        if !path.exists() {
            return Err(NepheleError::Configuration(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        Self::from_figment(
            Figment::from(Serialized::defaults(NepheleConfig::default())).merge(Toml::file(path)),
        )
    }

    /// Extract and validate configuration from an assembled figment.
    pub fn from_figment(figment: figment::Figment) -> Result<Self> {
        let config: NepheleConfig = figment.extract().map_err(|e| {
            NepheleError::Configuration(format!("Failed to load configuration: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.retrieval.top_k == 0 {
            return Err(NepheleError::Configuration(
                "retrieval.top_k must be at least 1".to_string(),
            ));
        }
        if self.retrieval.max_doc_chars == 0 {
            return Err(NepheleError::Configuration(
                "retrieval.max_doc_chars must be at least 1".to_string(),
            ));
        }
        if self.context.max_tokens == 0 {
            return Err(NepheleError::Configuration(
                "context.max_tokens must be positive".to_string(),
            ));
        }
        if self.weather.backoff_multiplier < 1.0 {
            return Err(NepheleError::Configuration(
                "weather.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }

        let timeouts = [
            ("llm.timeout", self.llm.timeout),
            ("embeddings.timeout", self.embeddings.timeout),
            ("weather.attempt_timeout", self.weather.attempt_timeout),
            ("weather.total_timeout", self.weather.total_timeout),
            ("orchestrator.query_timeout", self.orchestrator.query_timeout),
            ("orchestrator.persist_timeout", self.orchestrator.persist_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(NepheleError::Configuration(format!(
                    "{} must be non-zero",
                    name
                )));
            }
        }

        Ok(())
    }
}
