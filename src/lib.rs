//! AI Gateway library.
//!
//! A streaming HTTP front-end between chat clients and LLM backends. Each
//! request is answered either from a semantic cache (embedding-keyed,
//! cosine similarity) or from a tier-routed upstream LLM whose SSE stream
//! is forwarded to the client while being accumulated for accounting and
//! lazy cache insertion.

use std::future::IntoFuture;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

pub mod cache;
pub mod config;
pub mod embed;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod store;
pub mod types;

pub use config::GatewayConfig;
pub use state::{AppState, SemanticLayer};

/// Build the gateway router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let mut chat = Router::new().route("/chat", post(routes::chat));
    if state.config.rate_limit_enabled {
        chat = chat.layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::rate_limit,
        ));
    }

    Router::new()
        .merge(chat)
        .route("/health", get(routes::health))
        .route("/stats", get(routes::stats))
        .route("/requests", get(routes::requests))
        .route("/metrics/prometheus", get(routes::metrics_prometheus))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the gateway until SIGINT/SIGTERM, then drain.
///
/// The `shutdown` sender flips once a signal arrives; background workers
/// (store drain, cache sweeper) subscribe to it. In-flight requests get
/// `config.drain_timeout` to finish before the process gives up on them.
pub async fn run_server(state: Arc<AppState>, shutdown: watch::Sender<bool>) -> anyhow::Result<()> {
    if let Err(e) = metrics::register_metrics() {
        warn!("failed to register prometheus metrics: {}", e);
    }

    let app = router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&state.config.listen_addr).await?;
    info!("AI gateway listening on http://{}", state.config.listen_addr);

    let mut drain_rx = shutdown.subscribe();
    let drain_timeout = state.config.drain_timeout;
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .into_future();

    tokio::select! {
        result = server => result?,
        _ = async {
            let _ = drain_rx.changed().await;
            tokio::time::sleep(drain_timeout).await;
        } => {
            warn!("drain window elapsed with requests still in flight, exiting");
        }
    }

    Ok(())
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining in-flight requests");
    let _ = shutdown.send(true);
}
