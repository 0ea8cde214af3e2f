//! Semantic response cache.
//!
//! Keys are embedding vectors; equality is approximate (cosine similarity
//! over a configured threshold). Point ids are derived deterministically
//! from the query text, so re-inserting the same query overwrites instead
//! of duplicating, and entries expire through a periodic TTL sweep.
//!
//! Lookup failures are treated as misses by callers and insert failures
//! are logged and swallowed; the cache is strictly best-effort.

mod qdrant;

pub use qdrant::QdrantSemanticCache;

use async_trait::async_trait;

use crate::types::{CacheResponse, LlmOutput};

/// Errors from the vector store backing the cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("vector store error: {0}")]
    Backend(#[from] qdrant_client::QdrantError),

    #[error("cache lookup timed out")]
    Timeout,
}

/// Approximate-nearest-neighbor cache over embedding vectors.
#[async_trait]
pub trait SemanticCache: Send + Sync {
    /// Search for the closest cached answer to `vector`; `Ok(None)` when
    /// nothing scores over the similarity threshold.
    async fn lookup(&self, vector: &[f32], query: &str)
        -> Result<Option<CacheResponse>, CacheError>;

    /// Upsert an answer keyed by the query text. Best-effort: failures are
    /// logged, never returned.
    async fn insert(&self, vector: Vec<f32>, output: &LlmOutput, query: &str);
}
