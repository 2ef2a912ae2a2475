//! Document retrieval over a vector index
//!
//! The [`RetrievalEngine`] embeds the query and asks a [`VectorStore`] for the
//! nearest chunks. It applies no relevance floor: weak matches are returned
//! and left for prompt construction to filter.

mod store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::embeddings::EmbeddingProvider;
use crate::error::ErrorKind;

pub use store::{InMemoryVectorStore, cosine_similarity};

/// A retrievable unit of pre-embedded document text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocChunk {
    pub text: String,
    pub source_id: String,
    /// Read from index snapshots but never written into conversation records
    #[serde(default, skip_serializing)]
    pub embedding: Vec<f32>,
    /// Cosine similarity to the query that retrieved this chunk
    #[serde(default)]
    pub similarity_score: f32,
}

impl DocChunk {
    pub fn new(text: impl Into<String>, source_id: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            text: text.into(),
            source_id: source_id.into(),
            embedding,
            similarity_score: 0.0,
        }
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.similarity_score = score;
        self
    }

    /// Drop the embedding once the chunk has been ranked
    pub fn without_embedding(mut self) -> Self {
        self.embedding = Vec::new();
        self
    }
}

/// Error type for retrieval
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetrievalError {
    /// The embedding provider or vector store could not be reached
    #[error("Retrieval unavailable: {0}")]
    Unavailable(String),
}

impl RetrievalError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::RetrievalUnavailable
    }
}

/// Vector store collaborator
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Up to `k` chunks nearest to `embedding`, best first
    async fn similarity_search(
        &self,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<DocChunk>, RetrievalError>;
}

/// Sort key for a chunk; NaN scores rank below everything else
fn rank_score(chunk: &DocChunk) -> f32 {
    if chunk.similarity_score.is_nan() {
        f32::NEG_INFINITY
    } else {
        chunk.similarity_score
    }
}

/// Top-k semantic search over the document index.
///
/// Stateless per call; one engine is shared by every session.
#[derive(Clone)]
pub struct RetrievalEngine {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
}

impl RetrievalEngine {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, store: Arc<dyn VectorStore>) -> Self {
        Self { embedder, store }
    }

    /// Retrieve up to `k` chunks ranked by descending similarity.
    ///
    /// Equal scores keep the order the store returned them in. An index with
    /// no matches yields an empty list, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Unavailable`] if the query cannot be embedded
    /// or the store cannot be searched.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<DocChunk>, RetrievalError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let embedding = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| RetrievalError::Unavailable(format!("embedding failed: {}", e)))?;

        let mut chunks = self.store.similarity_search(&embedding, k).await?;

        // stable: ties keep store order
        chunks.sort_by(|a, b| rank_score(b).total_cmp(&rank_score(a)));
        chunks.truncate(k);

        tracing::debug!(
            k,
            returned = chunks.len(),
            top_score = chunks.first().map(|c| c.similarity_score),
            "retrieval finished"
        );

        Ok(chunks)
    }
}
