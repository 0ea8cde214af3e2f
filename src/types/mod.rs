//! Wire and domain types shared across the gateway.
//!
//! The chat request/response shapes mirror what clients already send to
//! chat-completion style APIs; the accounting types mirror the SQL schema.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// A single conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Request body for POST /chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
}

/// Difficulty tier of a query, used to pick an LLM provider and to split
/// token accounting into simple/complex buckets.
///
/// `Medium` exists in the schema and the accounting split but has no
/// provider registered; only `Easy` and `High` are produced by the
/// complexity classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "level", rename_all = "lowercase")]
pub enum Level {
    Easy,
    High,
    Medium,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Easy => write!(f, "easy"),
            Level::High => write!(f, "high"),
            Level::Medium => write!(f, "medium"),
        }
    }
}

/// Outcome of the pre-flight embedding race, tracked per request.
///
/// `Pending` means the orchestrator stopped waiting before the worker
/// delivered; the embedding may still arrive in time for lazy caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedStatus {
    Pending,
    Success,
    Errored,
}

/// Body of a cache-hit reply.
///
/// Field names are part of the client-facing wire format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CacheResponse {
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub cached_answer: String,
    pub cached_query: String,
}

/// Body of GET /stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AnalyticsResponse {
    pub cost_saved: f64,
    pub cache_hit_percentage: f64,
    pub msg: String,
}

/// Accumulated result of one streamed LLM call.
///
/// Providers dual-write: every text delta is forwarded to the client and
/// appended to `text`, and the final usage event fills the token counters.
/// Counters absent from the stream stay zero.
#[derive(Debug, Clone)]
pub struct LlmOutput {
    pub text: String,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub total_tokens: i32,
    pub model: String,
    pub level: Level,
}

impl Default for LlmOutput {
    fn default() -> Self {
        Self {
            text: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            model: String::new(),
            level: Level::Easy,
        }
    }
}

/// The logged request entity, one row per accepted request.
///
/// Mirrors the `requests` table; immutable once submitted to the store
/// queue.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RequestRecord {
    pub id: Uuid,
    pub cacheable: bool,
    pub user_id: String,
    pub user_query: String,
    pub llm_response: String,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub total_tokens: i32,
    #[sqlx(rename = "time_taken")]
    pub time_taken_ms: i64,
    pub model: String,
    pub cache_hit: bool,
    pub level: Level,
}

/// A pending token-accounting update for one user.
#[derive(Debug, Clone)]
pub struct TokenIncrement {
    pub user_id: String,
    pub tokens: i32,
    pub level: Level,
}

/// One row of the `account` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub user_id: String,
    pub simple_tokens: i64,
    pub complex_tokens: i64,
    pub num_requests: i64,
}
