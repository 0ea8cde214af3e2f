//! Text encoders producing dense embedding vectors.

use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use super::EmbedError;

/// Anything that can turn a query string into a fixed-dimension vector.
///
/// The worker pool only talks to this trait, so tests can substitute a
/// deterministic stub for the real model.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// Dimensionality of produced vectors.
    fn dimension(&self) -> usize;
}

/// In-process encoder backed by BGE-small-en-v1.5 (384 dimensions).
pub struct FastembedEncoder {
    model: Arc<TextEmbedding>,
}

impl FastembedEncoder {
    pub const DIMENSION: usize = 384;

    /// Load the embedding model. Downloads weights on first use, so this
    /// can take a while on a cold machine.
    pub fn new() -> Result<Self, EmbedError> {
        let model = TextEmbedding::try_new(InitOptions {
            model_name: EmbeddingModel::BGESmallENV15,
            show_download_progress: true,
            ..Default::default()
        })
        .map_err(|e| EmbedError::Encoder(e.to_string()))?;

        tracing::info!(
            model = "BAAI/bge-small-en-v1.5",
            dimension = Self::DIMENSION,
            "embedding model loaded"
        );

        Ok(Self { model: Arc::new(model) })
    }
}

#[async_trait]
impl Encoder for FastembedEncoder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let model = Arc::clone(&self.model);
        let text = text.to_string();

        // Model inference is CPU-bound; keep it off the async workers.
        let embeddings = tokio::task::spawn_blocking(move || model.embed(vec![text], None))
            .await
            .map_err(|e| EmbedError::Encoder(e.to_string()))?
            .map_err(|e| EmbedError::Encoder(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::Encoder("model returned no embedding".to_string()))
    }

    fn dimension(&self) -> usize {
        Self::DIMENSION
    }
}
