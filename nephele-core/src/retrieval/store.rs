//! Brute-force in-memory vector index

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use tokio::sync::RwLock;

use super::{DocChunk, RetrievalError, VectorStore};
use crate::error::{NepheleError, Result};

/// Cosine similarity, accumulated in f64.
///
/// Returns 0.0 for mismatched lengths, a zero-norm vector, or non-finite input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    let score = dot / denom;
    if score.is_finite() { score } else { 0.0 }
}

/// One entry of an index snapshot file
#[derive(Debug, Deserialize)]
struct SnapshotEntry {
    text: String,
    source_id: String,
    embedding: Vec<f32>,
}

/// Vector store holding every chunk in memory and scanning all of them per query.
///
/// Ties are broken by insertion order. Chunks whose dimension differs from
/// the query are skipped.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    chunks: RwLock<Vec<DocChunk>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_chunks(chunks: Vec<DocChunk>) -> Self {
        Self {
            chunks: RwLock::new(chunks),
        }
    }

    /// Load a JSON snapshot of pre-embedded chunks (`[{text, source_id, embedding}]`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid snapshot.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            NepheleError::Storage(format!("Failed to read index {}: {}", path.display(), e))
        })?;
        let entries: Vec<SnapshotEntry> = serde_json::from_str(&content)?;

        let chunks: Vec<DocChunk> = entries
            .into_iter()
            .map(|e| DocChunk::new(e.text, e.source_id, e.embedding))
            .collect();

        tracing::info!(path = %path.display(), chunks = chunks.len(), "loaded document index");
        Ok(Self::from_chunks(chunks))
    }

    /// Add a chunk at the end of the index
    pub async fn insert(&self, chunk: DocChunk) {
        self.chunks.write().await.push(chunk);
    }

    pub async fn len(&self) -> usize {
        self.chunks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.chunks.read().await.is_empty()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn similarity_search(
        &self,
        embedding: &[f32],
        k: usize,
    ) -> std::result::Result<Vec<DocChunk>, RetrievalError> {
        let query_norm_sq: f64 = embedding.iter().map(|x| (*x as f64) * (*x as f64)).sum();
        if query_norm_sq == 0.0 {
            return Ok(Vec::new());
        }

        let chunks = self.chunks.read().await;
        let mut scored: Vec<(usize, f64)> = chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.embedding.len() == embedding.len())
            .map(|(i, c)| (i, cosine_similarity(embedding, &c.embedding)))
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(i, score)| chunks[i].clone().with_score(score as f32))
            .collect())
    }
}
