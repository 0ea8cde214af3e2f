//! HTTP route handlers.
//!
//! - `chat`: the streaming chat orchestrator
//! - `health`: liveness, analytics and metrics endpoints

pub mod chat;
pub mod health;

pub use chat::chat;
pub use health::{health, metrics_prometheus, requests, stats};
