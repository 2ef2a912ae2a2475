//! Embedding provider implementations for turning query text into vectors.

pub mod providers;

pub use providers::{EmbeddingProvider, OpenAIEmbeddings};
