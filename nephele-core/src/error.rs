//! Error types for Nephele operations

use serde::{Deserialize, Serialize};

/// Result type for Nephele operations
pub type Result<T> = std::result::Result<T, NepheleError>;

/// Error types for the Nephele framework
#[derive(Debug, thiserror::Error)]
pub enum NepheleError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Completion service error
    #[error("LLM error: {0}")]
    LLM(String),

    /// Completion call exceeded its time bound
    #[error("LLM call timed out after {0:?}")]
    LLMTimeout(std::time::Duration),

    /// Embedding provider error
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for NepheleError {
    fn from(s: String) -> Self {
        NepheleError::Other(s)
    }
}

impl From<&str> for NepheleError {
    fn from(s: &str) -> Self {
        NepheleError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for NepheleError {
    fn from(err: anyhow::Error) -> Self {
        NepheleError::Other(err.to_string())
    }
}

/// Failure categories surfaced to callers in [`AnswerResult`](crate::workflow::AnswerResult).
///
/// Every component error maps onto exactly one kind. Only `SynthesisFailed`
/// and `QueryTimeout` mean the turn produced no real answer; the rest flag a
/// degraded input that the answer was built without.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ClassificationError,
    RetrievalUnavailable,
    WeatherUnavailable,
    WeatherTimeout,
    UnknownLocation,
    SynthesisFailed,
    PersistenceFailed,
    QueryTimeout,
}

impl ErrorKind {
    /// Whether the turn still produced a synthesized answer despite this failure
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ErrorKind::SynthesisFailed | ErrorKind::QueryTimeout)
    }

    /// Short human-readable caveat for rendering next to an answer
    pub fn caveat(&self) -> &'static str {
        match self {
            ErrorKind::ClassificationError => "query routing failed, answered without lookups",
            ErrorKind::RetrievalUnavailable => "API documentation unavailable",
            ErrorKind::WeatherUnavailable => "weather data unavailable",
            ErrorKind::WeatherTimeout => "weather service timed out",
            ErrorKind::UnknownLocation => "location could not be resolved",
            ErrorKind::SynthesisFailed => "answer could not be generated",
            ErrorKind::PersistenceFailed => "conversation could not be saved",
            ErrorKind::QueryTimeout => "request timed out",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::ClassificationError => "ClassificationError",
            ErrorKind::RetrievalUnavailable => "RetrievalUnavailable",
            ErrorKind::WeatherUnavailable => "WeatherUnavailable",
            ErrorKind::WeatherTimeout => "WeatherTimeout",
            ErrorKind::UnknownLocation => "UnknownLocation",
            ErrorKind::SynthesisFailed => "SynthesisFailed",
            ErrorKind::PersistenceFailed => "PersistenceFailed",
            ErrorKind::QueryTimeout => "QueryTimeout",
        };
        f.write_str(name)
    }
}
