//! AI Gateway binary.
//!
//! Boot order matters: the database must be reachable (hard failure),
//! while the vector store and the embedding model degrade gracefully by
//! switching the semantic cache off.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ai_gateway::cache::{QdrantSemanticCache, SemanticCache};
use ai_gateway::embed::{EmbeddingService, FastembedEncoder};
use ai_gateway::llm::LlmRouter;
use ai_gateway::middleware::RateLimiter;
use ai_gateway::store::{self, PgStore, StoreQueue};
use ai_gateway::{run_server, AppState, GatewayConfig, SemanticLayer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ai_gateway=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let config = GatewayConfig::from_env();

    let store = Arc::new(
        PgStore::connect(&config.store.database_url)
            .await
            .context("postgres is unreachable")?,
    );
    store.init().await.context("database schema init failed")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let semantic = if config.semantic_cache {
        build_semantic_layer(&config, shutdown_rx.clone()).await
    } else {
        None
    };
    info!(enabled = semantic.is_some(), "semantic cache");

    let (queue, receivers) = StoreQueue::bounded(config.store.queue_capacity);
    store::spawn_workers(
        Arc::clone(&store),
        receivers,
        config.store.workers,
        shutdown_rx.clone(),
    );

    let llm = LlmRouter::from_config(&config.llm);
    let rate_limiter = RateLimiter::new(Duration::from_secs(config.rate_limit_secs));

    print_banner(&config, semantic.is_some());

    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        queue,
        llm,
        semantic,
        rate_limiter,
    });

    run_server(state, shutdown_tx).await
}

/// Bring up the embedding model and the vector store. Either failing
/// disables the semantic cache instead of aborting boot.
async fn build_semantic_layer(
    config: &GatewayConfig,
    shutdown: watch::Receiver<bool>,
) -> Option<SemanticLayer> {
    let encoder = match FastembedEncoder::new() {
        Ok(encoder) => Arc::new(encoder),
        Err(e) => {
            warn!(error = %e, "embedding model failed to load, running without the semantic cache");
            return None;
        }
    };

    let cache = match QdrantSemanticCache::connect(config.cache.clone()).await {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            warn!(error = %e, "qdrant unavailable, running without the semantic cache");
            return None;
        }
    };

    {
        let sweeper = Arc::clone(&cache);
        tokio::spawn(async move { sweeper.sweep(shutdown).await });
    }

    let embedder = Arc::new(EmbeddingService::new(encoder, &config.embed));
    let cache: Arc<dyn SemanticCache> = cache;
    Some(SemanticLayer { cache, embedder })
}

fn print_banner(config: &GatewayConfig, semantic_enabled: bool) {
    println!();
    println!("==================================================");
    println!("  AI Gateway v{}", env!("CARGO_PKG_VERSION"));
    println!("==================================================");
    println!("  Listening on:   http://{}", config.listen_addr);
    println!(
        "  Semantic cache: {}",
        if semantic_enabled { "enabled" } else { "disabled" }
    );
    if semantic_enabled {
        println!(
            "    Threshold: {:.0}%, dim {}, TTL {}h",
            config.cache.similarity_threshold * 100.0,
            config.cache.vector_size,
            config.cache.entry_ttl.as_secs() / 3600
        );
    }
    println!("  Providers:");
    println!("    easy -> {}", config.llm.easy_model);
    println!("    high -> {}", config.llm.high_model);
    println!("  Endpoints:");
    println!("    Chat:    POST /chat");
    println!("    Stats:   GET  /stats");
    println!("    Health:  GET  /health");
    println!("    Metrics: GET  /metrics/prometheus");
    println!("==================================================");
    println!();
}
