//! Long-term conversation persistence
//!
//! [`ConversationStore`] is the durable record of every completed turn,
//! keyed by session id. Two backends ship with the crate: a process-local
//! map for tests and ephemeral runs, and a JSON-lines directory with one
//! file per session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::turn::Turn;
use crate::error::ErrorKind;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Persistence failed: {0}")]
    Failed(String),

    #[error("Persistence IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Persistence serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PersistenceError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::PersistenceFailed
    }
}

/// A stored summary of a session's older conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

/// Durable store for session turns and summaries
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append a completed turn
    async fn append(&self, session_id: &str, turn: &Turn) -> Result<(), PersistenceError>;

    /// The most recent `limit` turns, oldest first
    async fn history(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>, PersistenceError>;

    /// Store a summary of the session so far
    async fn append_summary(&self, session_id: &str, summary: &str) -> Result<(), PersistenceError>;

    /// All summaries, oldest first
    async fn summaries(&self, session_id: &str) -> Result<Vec<SessionSummary>, PersistenceError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StoredRecord {
    Turn {
        session_id: String,
        turn: Turn,
    },
    Summary {
        session_id: String,
        #[serde(flatten)]
        summary: SessionSummary,
    },
}

fn last_turns(records: &[StoredRecord], limit: usize) -> Vec<Turn> {
    let turns: Vec<&Turn> = records
        .iter()
        .filter_map(|r| match r {
            StoredRecord::Turn { turn, .. } => Some(turn),
            StoredRecord::Summary { .. } => None,
        })
        .collect();

    let start = turns.len().saturating_sub(limit);
    turns[start..].iter().map(|t| (*t).clone()).collect()
}

fn all_summaries(records: &[StoredRecord]) -> Vec<SessionSummary> {
    records
        .iter()
        .filter_map(|r| match r {
            StoredRecord::Summary { summary, .. } => Some(summary.clone()),
            StoredRecord::Turn { .. } => None,
        })
        .collect()
}

/// Process-local store
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    records: RwLock<HashMap<String, Vec<StoredRecord>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of turns stored for a session
    pub async fn turn_count(&self, session_id: &str) -> usize {
        self.records
            .read()
            .await
            .get(session_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| matches!(r, StoredRecord::Turn { .. }))
                    .count()
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn append(&self, session_id: &str, turn: &Turn) -> Result<(), PersistenceError> {
        self.records
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(StoredRecord::Turn {
                session_id: session_id.to_string(),
                turn: turn.clone(),
            });
        Ok(())
    }

    async fn history(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>, PersistenceError> {
        let records = self.records.read().await;
        Ok(records
            .get(session_id)
            .map(|r| last_turns(r, limit))
            .unwrap_or_default())
    }

    async fn append_summary(&self, session_id: &str, summary: &str) -> Result<(), PersistenceError> {
        self.records
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(StoredRecord::Summary {
                session_id: session_id.to_string(),
                summary: SessionSummary {
                    summary: summary.to_string(),
                    timestamp: Utc::now(),
                },
            });
        Ok(())
    }

    async fn summaries(&self, session_id: &str) -> Result<Vec<SessionSummary>, PersistenceError> {
        let records = self.records.read().await;
        Ok(records
            .get(session_id)
            .map(|r| all_summaries(r))
            .unwrap_or_default())
    }
}

/// JSON-lines store: `<dir>/<url-encoded session id>.jsonl`
#[derive(Debug, Clone)]
pub struct JsonlConversationStore {
    dir: PathBuf,
}

impl JsonlConversationStore {
    /// Create a store rooted at `dir`, creating the directory if needed
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.jsonl", urlencoding::encode(session_id)))
    }

    async fn write_record(&self, session_id: &str, record: &StoredRecord) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.session_path(session_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_records(&self, session_id: &str) -> Result<Vec<StoredRecord>, PersistenceError> {
        let path = self.session_path(session_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // a crash mid-append leaves a torn final line
                    tracing::warn!(
                        path = %path.display(),
                        line = line_no + 1,
                        error = %e,
                        "skipping unreadable conversation record"
                    );
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl ConversationStore for JsonlConversationStore {
    async fn append(&self, session_id: &str, turn: &Turn) -> Result<(), PersistenceError> {
        self.write_record(
            session_id,
            &StoredRecord::Turn {
                session_id: session_id.to_string(),
                turn: turn.clone(),
            },
        )
        .await
    }

    async fn history(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>, PersistenceError> {
        let records = self.read_records(session_id).await?;
        Ok(last_turns(&records, limit))
    }

    async fn append_summary(&self, session_id: &str, summary: &str) -> Result<(), PersistenceError> {
        self.write_record(
            session_id,
            &StoredRecord::Summary {
                session_id: session_id.to_string(),
                summary: SessionSummary {
                    summary: summary.to_string(),
                    timestamp: Utc::now(),
                },
            },
        )
        .await
    }

    async fn summaries(&self, session_id: &str) -> Result<Vec<SessionSummary>, PersistenceError> {
        let records = self.read_records(session_id).await?;
        Ok(all_summaries(&records))
    }
}
