//! Budgeted short-term memory

use serde::{Deserialize, Serialize};

use super::session::Session;
use super::turn::Turn;

/// The bounded slice of recent turns handed to the classifier and synthesizer.
///
/// Turns are in chronological order and always complete; `used_tokens`
/// never exceeds `max_tokens`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextWindow {
    turns: Vec<Turn>,
    used_tokens: usize,
    max_tokens: usize,
    evicted_turns: usize,
}

impl ContextWindow {
    /// An empty window
    pub fn empty(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            ..Default::default()
        }
    }

    /// Turns, oldest first
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// The last `n` turns
    pub fn recent(&self, n: usize) -> &[Turn] {
        let start = self.turns.len().saturating_sub(n);
        &self.turns[start..]
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Estimated tokens held by the window
    pub fn used_tokens(&self) -> usize {
        self.used_tokens
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Turns dropped from this session so far
    pub fn evicted_turns(&self) -> usize {
        self.evicted_turns
    }
}

/// Maintains per-session turn history under a token budget.
///
/// Eviction drops whole turns, oldest first. A turn is never truncated; a
/// single turn larger than the whole budget is not admitted and leaves the
/// window as it was.
#[derive(Debug, Clone)]
pub struct ContextManager {
    max_tokens: usize,
}

impl ContextManager {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Snapshot of the session's current window
    pub fn window(&self, session: &Session) -> ContextWindow {
        ContextWindow {
            turns: session.turns.iter().cloned().collect(),
            used_tokens: session.used_tokens,
            max_tokens: self.max_tokens,
            evicted_turns: session.evicted_turns,
        }
    }

    /// Append a completed turn and enforce the budget
    pub fn append(&self, session: &mut Session, turn: Turn) {
        session.total_turns += 1;
        session.touch();

        let tokens = turn.estimate_tokens();
        if tokens > self.max_tokens {
            session.evicted_turns += 1;
            tracing::debug!(
                session_id = %session.id(),
                tokens,
                max_tokens = self.max_tokens,
                "turn larger than the context budget, not windowed"
            );
            return;
        }

        session.used_tokens += tokens;
        session.turns.push_back(turn);
        self.evict(session);
    }

    fn evict(&self, session: &mut Session) {
        let mut dropped = 0;
        while session.used_tokens > self.max_tokens {
            match session.turns.pop_front() {
                Some(oldest) => {
                    session.used_tokens -= oldest.estimate_tokens();
                    session.evicted_turns += 1;
                    dropped += 1;
                }
                None => break,
            }
        }

        if dropped > 0 {
            tracing::debug!(
                session_id = %session.id(),
                dropped,
                used_tokens = session.used_tokens,
                max_tokens = self.max_tokens,
                "context window over budget, evicted oldest turns"
            );
        }
    }
}
