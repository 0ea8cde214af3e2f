//! The chat request orchestrator.
//!
//! Lifecycle per request:
//!
//! ```text
//! decode -> validate -> classify cacheable
//!        -> (embed race || cache lookup) -> [hit reply | llm stream -> post-flight]
//! ```
//!
//! Two timing domains apply to the embedding: the orchestrator waits at
//! most [`EmbedConfig::wait`] (300 ms) before giving up on the cache
//! lookup, while generation itself keeps running on a detached 2 s budget
//! so a late vector can still feed the lazy cache insert after the client
//! has been answered. Post-flight work (accounting rows, token
//! increments, cache insertion) happens on spawned tasks and bounded
//! queues, never on the client's critical path.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::embed::EmbeddingResult;
use crate::error::GatewayError;
use crate::llm::StreamSink;
use crate::metrics;
use crate::state::AppState;
use crate::types::{
    CacheResponse, ChatRequest, EmbedStatus, Level, LlmOutput, Message, RequestRecord, Role,
    TokenIncrement,
};

/// Queries containing any of these tokens get volatile answers and are
/// never cached. Case-sensitive substring match; the token set is part of
/// the cache's versioned behavior.
const TIME_SENSITIVE_TOKENS: [&str; 7] =
    ["now", "today", "weather", "latest", "time", "today's", "current"];

/// Queries at or past this many words are routed to the capable tier.
const HIGH_COMPLEXITY_WORDS: usize = 10;

fn is_time_sensitive(query: &str) -> bool {
    TIME_SENSITIVE_TOKENS.iter().any(|token| query.contains(token))
}

fn classify_complexity(query: &str) -> Level {
    if query.split_whitespace().count() >= HIGH_COMPLEXITY_WORDS {
        Level::High
    } else {
        Level::Easy
    }
}

/// POST /chat
pub async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let started = Instant::now();
    let Json(request) = payload
        .map_err(|e| {
            debug!(error = %e, "rejecting undecodable chat body");
            GatewayError::Validation("invalid request body".to_string())
        })?;

    let user_id = headers
        .get("userId")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let Some(last) = request.messages.last() else {
        return Err(GatewayError::Validation("no messages provided".to_string()));
    };
    if last.role != Role::User {
        return Err(GatewayError::Validation(
            "the last message in the conversation must come from the user".to_string(),
        ));
    }
    let user_query = last.content.clone();
    let request_id = Uuid::new_v4();

    let time_sensitive = is_time_sensitive(&user_query);
    let cacheable =
        request.messages.len() == 1 && !time_sensitive && state.semantic.is_some();
    debug!(
        user_id = %user_id,
        time_sensitive,
        cacheable,
        "classified incoming chat request"
    );

    let mut embed_status = EmbedStatus::Pending;
    let mut vector: Option<Vec<f32>> = None;
    let mut pending_embedding: Option<oneshot::Receiver<EmbeddingResult>> = None;

    if cacheable {
        if let Some(semantic) = state.semantic.as_ref() {
            let mut rx = semantic.embedder.generate(user_query.clone());

            tokio::select! {
                _ = tokio::time::sleep(state.config.embed.wait) => {
                    debug!("embedding missed the race window, skipping cache lookup");
                    metrics::record_embed_race("timeout");
                    // Generation keeps running on its own budget; the
                    // post-flight may still consume the result.
                    pending_embedding = Some(rx);
                }
                result = &mut rx => match result {
                    Ok(EmbeddingResult { outcome: Ok(v), .. }) => {
                        embed_status = EmbedStatus::Success;
                        metrics::record_embed_race("success");

                        match semantic.cache.lookup(&v, &user_query).await {
                            Ok(Some(cached)) => {
                                return Ok(cache_hit_reply(
                                    &state, request_id, cacheable, &user_id, cached, started,
                                ));
                            }
                            Ok(None) => {
                                debug!("semantic cache miss");
                                metrics::record_cache_miss();
                            }
                            Err(e) => {
                                warn!(error = %e, "cache lookup failed, treating as a miss");
                                metrics::record_cache_miss();
                            }
                        }
                        vector = Some(v);
                    }
                    Ok(EmbeddingResult { outcome: Err(e), .. }) => {
                        warn!(error = %e, "embedding generation failed, skipping cache");
                        metrics::record_embed_race("error");
                        embed_status = EmbedStatus::Errored;
                    }
                    Err(_) => {
                        warn!("embedding result channel closed unexpectedly");
                        metrics::record_embed_race("error");
                        embed_status = EmbedStatus::Errored;
                    }
                }
            }
        }
    }

    let level = classify_complexity(&user_query);
    debug!(level = %level, "dispatching to the llm tier");

    let (sink, ready_rx, frames) = StreamSink::channel(64);
    tokio::spawn(run_llm_exchange(
        LlmExchange {
            state: Arc::clone(&state),
            messages: request.messages,
            level,
            request_id,
            user_id,
            user_query,
            cacheable,
            embed_status,
            vector,
            pending_embedding,
            started,
        },
        sink,
    ));

    // Rendezvous with the upstream connection: until the provider accepts
    // the call we can still answer with a plain 500.
    match ready_rx.await {
        Ok(Ok(())) => sse_response(frames),
        Ok(Err(e)) => Err(GatewayError::Upstream(e)),
        Err(_) => Err(GatewayError::Internal(
            "llm task ended before opening the stream".to_string(),
        )),
    }
}

/// Everything the spawned LLM/post-flight task needs, detached from the
/// client connection.
struct LlmExchange {
    state: Arc<AppState>,
    messages: Vec<Message>,
    level: Level,
    request_id: Uuid,
    user_id: String,
    user_query: String,
    cacheable: bool,
    embed_status: EmbedStatus,
    vector: Option<Vec<f32>>,
    pending_embedding: Option<oneshot::Receiver<EmbeddingResult>>,
    started: Instant,
}

async fn run_llm_exchange(exchange: LlmExchange, mut sink: StreamSink) {
    let LlmExchange {
        state,
        messages,
        level,
        request_id,
        user_id,
        user_query,
        cacheable,
        embed_status,
        vector,
        pending_embedding,
        started,
    } = exchange;

    let mut out = LlmOutput::default();
    if let Err(e) = state.llm.generate(&mut sink, &messages, level, &mut out).await {
        metrics::record_request(&level.to_string(), "error");
        sink.abort(e);
        return;
    }

    let level_label = out.level.to_string();
    metrics::record_request(&level_label, "success");
    metrics::record_tokens(&out.model, out.total_tokens);
    metrics::observe_request_duration(&level_label, started.elapsed().as_secs_f64());

    // Increment goes first so a brand-new user's account row exists by
    // the time the request insert checks its foreign key.
    state.queue.submit_increment_tokens(TokenIncrement {
        user_id: user_id.clone(),
        tokens: out.total_tokens,
        level: out.level,
    });

    if cacheable && embed_status != EmbedStatus::Errored {
        if let Some(semantic) = state.semantic.as_ref() {
            let cache = Arc::clone(&semantic.cache);
            let output = out.clone();
            let query = user_query.clone();

            if let Some(vector) = vector {
                // The race produced a vector in time; insert straight away.
                tokio::spawn(async move {
                    cache.insert(vector, &output, &query).await;
                });
            } else if let Some(rx) = pending_embedding {
                // The embedder delivers exactly one result per job, so a
                // plain await is safe here.
                tokio::spawn(async move {
                    match rx.await {
                        Ok(EmbeddingResult { outcome: Ok(vector), .. }) => {
                            info!("embedding arrived after the race window, lazily caching");
                            cache.insert(vector, &output, &query).await;
                        }
                        Ok(EmbeddingResult { outcome: Err(e), .. }) => {
                            warn!(error = %e, "skipping lazy cache insert");
                        }
                        Err(_) => warn!("embedding worker dropped its result channel"),
                    }
                });
            }
        }
    }

    let record = RequestRecord {
        id: request_id,
        cacheable,
        user_id,
        user_query,
        llm_response: out.text.clone(),
        input_tokens: out.input_tokens,
        output_tokens: out.output_tokens,
        total_tokens: out.total_tokens,
        time_taken_ms: started.elapsed().as_millis() as i64,
        model: out.model.clone(),
        cache_hit: false,
        level: out.level,
    };
    state.queue.submit_insert_request(record);

    info!(
        request_id = %request_id,
        model = %out.model,
        total_tokens = out.total_tokens,
        "chat request answered from the llm"
    );
}

fn cache_hit_reply(
    state: &AppState,
    request_id: Uuid,
    cacheable: bool,
    user_id: &str,
    cached: CacheResponse,
    started: Instant,
) -> Response {
    let elapsed = started.elapsed();
    metrics::record_cache_hit();
    metrics::record_request("high", "cache_hit");
    metrics::observe_request_duration("high", elapsed.as_secs_f64());
    info!(user_id = %user_id, request_id = %request_id, "serving answer from the semantic cache");

    let record = RequestRecord {
        id: request_id,
        cacheable,
        user_id: user_id.to_string(),
        user_query: cached.cached_query.clone(),
        llm_response: cached.cached_answer.clone(),
        input_tokens: cached.input_tokens,
        output_tokens: cached.output_tokens,
        total_tokens: 0,
        time_taken_ms: elapsed.as_millis() as i64,
        model: String::new(),
        cache_hit: true,
        // Cached replies log as high regardless of the original tier, a
        // long-standing convention of the accounting schema.
        level: Level::High,
    };
    state.queue.submit_insert_request(record);

    (StatusCode::OK, Json(cached)).into_response()
}

fn sse_response(frames: mpsc::Receiver<Bytes>) -> Result<Response, GatewayError> {
    let stream = futures::stream::unfold(frames, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok::<_, Infallible>(frame), rx))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .map_err(|e| GatewayError::Internal(format!("failed to build streaming response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_sensitive_tokens() {
        assert!(is_time_sensitive("What is the weather today?"));
        assert!(is_time_sensitive("latest rust release"));
        assert!(is_time_sensitive("what is the time in Tokyo"));
        assert!(!is_time_sensitive("What is the capital of France?"));
        // Case-sensitive on purpose.
        assert!(!is_time_sensitive("Weather report"));
        // Substring semantics, not word-boundary.
        assert!(is_time_sensitive("lifetime of a lexical borrow"));
    }

    #[test]
    fn test_complexity_word_boundary() {
        let nine = "one two three four five six seven eight nine";
        let ten = "one two three four five six seven eight nine ten";
        assert_eq!(classify_complexity(nine), Level::Easy);
        assert_eq!(classify_complexity(ten), Level::High);
        assert_eq!(classify_complexity(""), Level::Easy);
        // Repeated whitespace does not inflate the count.
        assert_eq!(classify_complexity("a  b   c"), Level::Easy);
    }
}
