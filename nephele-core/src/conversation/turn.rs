//! A single query/answer exchange

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::retrieval::DocChunk;
use crate::weather::WeatherData;
use crate::workflow::RouteKind;

/// Rough token estimate: four characters per token, at least one for non-empty text
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    if chars == 0 { 0 } else { (chars / 4).max(1) }
}

/// One query/answer exchange plus the evidence it was answered from.
///
/// Turns are appended, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// The user's question
    pub query: String,
    /// Route decided before any lookup ran
    pub route: RouteKind,
    /// Chunks retrieved for this turn, best first, without their embeddings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retrieved_docs: Vec<DocChunk>,
    /// Weather observed for this turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather_snapshot: Option<WeatherData>,
    /// The synthesized answer
    pub answer: String,
    /// When the turn completed
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    /// Create a turn stamped with the current time
    pub fn new(
        query: impl Into<String>,
        route: RouteKind,
        retrieved_docs: Vec<DocChunk>,
        weather_snapshot: Option<WeatherData>,
        answer: impl Into<String>,
    ) -> Self {
        Self {
            query: query.into(),
            route,
            retrieved_docs: retrieved_docs
                .into_iter()
                .map(DocChunk::without_embedding)
                .collect(),
            weather_snapshot,
            answer: answer.into(),
            timestamp: Utc::now(),
        }
    }

    /// Estimated size of the turn as it appears in a prompt
    pub fn estimate_tokens(&self) -> usize {
        estimate_tokens(&self.query) + estimate_tokens(&self.answer)
    }
}
