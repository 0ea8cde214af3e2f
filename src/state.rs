//! Application state shared across all handlers.

use std::sync::Arc;

use crate::cache::SemanticCache;
use crate::config::GatewayConfig;
use crate::embed::EmbeddingService;
use crate::llm::LlmRouter;
use crate::middleware::RateLimiter;
use crate::store::{PgStore, StoreQueue};

/// The semantic-caching subsystems, present only when both the vector
/// store and the embedding model came up at boot.
pub struct SemanticLayer {
    pub cache: Arc<dyn SemanticCache>,
    pub embedder: Arc<EmbeddingService>,
}

/// Shared application state. No request-scoped data lives here; handlers
/// only read it.
pub struct AppState {
    pub config: GatewayConfig,
    /// Direct SQL access, used by the analytics endpoints.
    pub store: Arc<PgStore>,
    /// Non-blocking submission side of the accounting pipeline.
    pub queue: StoreQueue,
    pub llm: LlmRouter,
    /// `None` disables cacheability for every request.
    pub semantic: Option<SemanticLayer>,
    pub rate_limiter: RateLimiter,
}
