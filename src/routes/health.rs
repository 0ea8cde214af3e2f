//! Health, analytics and metrics endpoints.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use tracing::error;

use crate::error::GatewayError;
use crate::metrics;
use crate::state::AppState;
use crate::types::{AnalyticsResponse, RequestRecord};

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json("Server is healthy!")
}

/// GET /stats
pub async fn stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<AnalyticsResponse>, GatewayError> {
    let analytics = state.store.analytics().await.map_err(|e| {
        error!(error = %e, "failed to compute analytics");
        GatewayError::Internal("analytics unavailable".to_string())
    })?;
    Ok(Json(analytics))
}

/// GET /requests — every logged request row, mostly for debugging.
pub async fn requests(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RequestRecord>>, GatewayError> {
    let rows = state.store.all_requests().await.map_err(|e| {
        error!(error = %e, "failed to list requests");
        GatewayError::Internal("request log unavailable".to_string())
    })?;
    Ok(Json(rows))
}

/// GET /metrics/prometheus
pub async fn metrics_prometheus() -> impl IntoResponse {
    metrics::encode_metrics()
}
