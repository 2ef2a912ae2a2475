//! Query embedding backends

use async_trait::async_trait;

use crate::error::Result;

mod openai;

pub use openai::OpenAIEmbeddings;

/// Turns text into a vector comparable with the indexed chunks.
///
/// Must use the same model the index was built with, otherwise similarity
/// scores are meaningless.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts; one call each unless the backend batches
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    /// Length of the vectors this backend produces
    fn dimension(&self) -> usize;
}
