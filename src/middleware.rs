//! Per-user rate limiting for POST /chat.
//!
//! A fixed window of one request per `rate_limit_secs` per user. Present
//! for parity with the original deployment but disabled by default; flip
//! `GATEWAY_RATE_LIMIT=true` to wire it into the chat route.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::info;

use crate::state::AppState;

/// Mutex-guarded map of the last accepted request time per user.
pub struct RateLimiter {
    window: Duration,
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self { window, last_seen: Mutex::new(HashMap::new()) }
    }

    /// Record and admit the request if the user's window has elapsed.
    pub fn allow(&self, user_id: &str) -> bool {
        let now = Instant::now();
        let mut last_seen = self.last_seen.lock().expect("rate limiter lock poisoned");

        match last_seen.get(user_id) {
            Some(last) if now.duration_since(*last) <= self.window => false,
            _ => {
                last_seen.insert(user_id.to_string(), now);
                true
            }
        }
    }
}

/// Axum middleware wrapping the chat route when rate limiting is enabled.
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let user_id = request
        .headers()
        .get("userId")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if user_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "Bad Request! Access Denied").into_response();
    }

    if !state.rate_limiter.allow(user_id) {
        info!(user_id = %user_id, "too many requests in a short period of time");
        return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_request_allowed() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        assert!(limiter.allow("u1"));
    }

    #[test]
    fn test_second_request_in_window_denied() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        assert!(limiter.allow("u1"));
        assert!(!limiter.allow("u1"));
        // A different user has their own window.
        assert!(limiter.allow("u2"));
    }

    #[test]
    fn test_allowed_again_after_window() {
        let limiter = RateLimiter::new(Duration::from_millis(0));
        assert!(limiter.allow("u1"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.allow("u1"));
    }
}
