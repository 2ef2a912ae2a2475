//! Location extraction from free-text queries

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

use crate::llm::{LLMProvider, LLMRequest, complete_with_timeout};

static LOCATION_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"\b(?i:in|for|of|at)\s+(\p{Lu}[\p{L}'-]*(?:\s+\p{Lu}[\p{L}'-]*)*)").ok()
});

const MAX_LOCATION_CHARS: usize = 64;

/// Pulls the city name out of a weather question.
///
/// Tries the completion service first, then a preposition pattern
/// (`in Paris`, `for New York`), then falls back to the trimmed query.
#[derive(Clone)]
pub struct LocationExtractor {
    llm: Option<Arc<dyn LLMProvider>>,
    timeout: Duration,
}

impl LocationExtractor {
    pub fn new(llm: Arc<dyn LLMProvider>, timeout: Duration) -> Self {
        Self {
            llm: Some(llm),
            timeout,
        }
    }

    /// Extractor that never calls the completion service
    pub fn pattern_only() -> Self {
        Self {
            llm: None,
            timeout: Duration::ZERO,
        }
    }

    pub async fn extract(&self, query: &str) -> String {
        if let Some(llm) = &self.llm {
            let request = LLMRequest::from_prompt(format!(
                "Return the name of the city mentioned in the text below.\n\
                 Reply with the city name only, nothing else.\n\
                 Text: {}",
                query
            ))
            .temperature(0.0);

            match complete_with_timeout(llm.as_ref(), &request, self.timeout).await {
                Ok(answer) => {
                    if let Some(city) = clean_model_answer(&answer) {
                        return city;
                    }
                    tracing::debug!(answer = %answer, "model gave no usable location");
                }
                Err(e) => tracing::debug!(error = %e, "location extraction call failed"),
            }
        }

        extract_with_pattern(query).unwrap_or_else(|| query.trim().to_string())
    }
}

fn clean_model_answer(answer: &str) -> Option<String> {
    let line = answer.lines().next()?.trim();
    let city = line
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .trim_end_matches(['.', '!', '?'])
        .trim();

    if city.is_empty()
        || city.chars().count() > MAX_LOCATION_CHARS
        || matches!(city.to_lowercase().as_str(), "none" | "unknown" | "n/a")
    {
        return None;
    }
    Some(city.to_string())
}

/// Capitalised words after `in`, `for`, `of` or `at`
pub fn extract_with_pattern(query: &str) -> Option<String> {
    let pattern = LOCATION_PATTERN.as_ref()?;
    pattern
        .captures(query)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
