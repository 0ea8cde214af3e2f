//! Error types for the gateway HTTP boundary.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::llm::LlmError;

/// Neutral message returned whenever an upstream or internal failure is
/// surfaced to the client. Provider error text never leaves the process.
const SAFE_INTERNAL_MESSAGE: &str = "We are facing technical issues, please try again!";

/// Errors that can reach the HTTP boundary.
///
/// Everything else in the gateway (cache misses, embedding failures,
/// dropped store submissions) is logged and swallowed before it gets here.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The request body or headers failed validation.
    #[error("{0}")]
    Validation(String),

    /// The selected LLM provider failed before streaming began.
    #[error("llm dispatch failed: {0}")]
    Upstream(#[source] LlmError),

    /// Anything else that should read as a 500.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            GatewayError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            GatewayError::Upstream(e) => {
                error!(error = %e, "upstream LLM failure");
                (StatusCode::INTERNAL_SERVER_ERROR, SAFE_INTERNAL_MESSAGE.to_string())
            }
            GatewayError::Internal(msg) => {
                error!(error = %msg, "internal gateway failure");
                (StatusCode::INTERNAL_SERVER_ERROR, SAFE_INTERNAL_MESSAGE.to_string())
            }
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_maps_to_400() {
        let response = GatewayError::Validation("no messages provided".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_upstream_error_is_neutral() {
        let err = GatewayError::Upstream(LlmError::StreamClosed);
        let msg = match &err {
            GatewayError::Upstream(_) => SAFE_INTERNAL_MESSAGE,
            _ => unreachable!(),
        };
        assert!(!msg.contains("stream"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
