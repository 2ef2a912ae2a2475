//! Pipeline states and query results

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::classifier::RouteKind;
use crate::error::ErrorKind;

/// States of the per-query pipeline.
///
/// `Received` is initial; `Done` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Received,
    Classified,
    Retrieving,
    CallingWeather,
    BothPending,
    Synthesizing,
    Persisting,
    Done,
    Error,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Received => "RECEIVED",
            PipelineState::Classified => "CLASSIFIED",
            PipelineState::Retrieving => "RETRIEVING",
            PipelineState::CallingWeather => "CALLING_WEATHER",
            PipelineState::BothPending => "BOTH_PENDING",
            PipelineState::Synthesizing => "SYNTHESIZING",
            PipelineState::Persisting => "PERSISTING",
            PipelineState::Done => "DONE",
            PipelineState::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Error)
    }

    /// State entered after classification for `route`
    pub fn fan_out(route: RouteKind) -> Self {
        match route {
            RouteKind::Rag => PipelineState::Retrieving,
            RouteKind::Weather => PipelineState::CallingWeather,
            RouteKind::Both => PipelineState::BothPending,
            RouteKind::Direct => PipelineState::Synthesizing,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one query.
///
/// `text` is always user-presentable: a degraded turn carries an apology
/// rather than an empty string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResult {
    pub text: String,
    pub route: RouteKind,
    /// Failures the answer was produced despite (or, in `Error`, because of)
    pub partial_failures: BTreeSet<ErrorKind>,
    /// Terminal state, `Done` or `Error`
    pub state: PipelineState,
    pub session_id: String,
}

impl AnswerResult {
    pub fn is_complete(&self) -> bool {
        self.state == PipelineState::Done && self.partial_failures.is_empty()
    }

    pub fn is_error(&self) -> bool {
        self.state == PipelineState::Error
    }

    pub fn has_failure(&self, kind: ErrorKind) -> bool {
        self.partial_failures.contains(&kind)
    }

    /// One caveat line per partial failure, in stable order
    pub fn caveats(&self) -> Vec<String> {
        self.partial_failures
            .iter()
            .map(|kind| format!("Note: {}.", kind.caveat()))
            .collect()
    }
}
