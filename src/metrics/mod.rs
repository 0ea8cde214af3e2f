//! Prometheus metrics for the gateway.
//!
//! Exposed in text format on `GET /metrics/prometheus`.

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global registry for gateway metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total chat requests by level and terminal status
    /// (cache_hit / success / error).
    pub static ref REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("requests_total", "Total chat requests")
            .namespace("ai_gateway"),
        &["level", "status"]
    ).expect("metric can be created");

    /// End-to-end chat request duration.
    pub static ref REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("request_duration_seconds", "Chat request duration in seconds")
            .namespace("ai_gateway")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["level"]
    ).expect("metric can be created");

    /// Semantic cache hits.
    pub static ref CACHE_HITS_TOTAL: Counter = Counter::with_opts(
        Opts::new("cache_hits_total", "Total semantic cache hits")
            .namespace("ai_gateway")
    ).expect("metric can be created");

    /// Semantic cache misses (lookup performed, nothing over threshold).
    pub static ref CACHE_MISSES_TOTAL: Counter = Counter::with_opts(
        Opts::new("cache_misses_total", "Total semantic cache misses")
            .namespace("ai_gateway")
    ).expect("metric can be created");

    /// Store submissions dropped because a queue was full, by kind
    /// (insert / increment).
    pub static ref STORE_DROPPED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("store_dropped_total", "Store submissions dropped on queue overflow")
            .namespace("ai_gateway"),
        &["kind"]
    ).expect("metric can be created");

    /// Outcomes of the pre-flight embedding race
    /// (success / timeout / error).
    pub static ref EMBED_RACE_TOTAL: CounterVec = CounterVec::new(
        Opts::new("embed_race_total", "Embedding race outcomes")
            .namespace("ai_gateway"),
        &["outcome"]
    ).expect("metric can be created");

    /// Total tokens reported by upstream providers, by model.
    pub static ref TOKENS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("tokens_total", "Total tokens reported by providers")
            .namespace("ai_gateway"),
        &["model"]
    ).expect("metric can be created");
}

/// Register all metrics with the global registry. Call once at startup.
pub fn register_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(CACHE_HITS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_MISSES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORE_DROPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(EMBED_RACE_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TOKENS_TOTAL.clone()))?;
    Ok(())
}

/// Encode all registered metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
}

pub fn record_request(level: &str, status: &str) {
    REQUESTS_TOTAL.with_label_values(&[level, status]).inc();
}

pub fn observe_request_duration(level: &str, seconds: f64) {
    REQUEST_DURATION_SECONDS.with_label_values(&[level]).observe(seconds);
}

pub fn record_cache_hit() {
    CACHE_HITS_TOTAL.inc();
}

pub fn record_cache_miss() {
    CACHE_MISSES_TOTAL.inc();
}

pub fn record_store_dropped(kind: &str) {
    STORE_DROPPED_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_embed_race(outcome: &str) {
    EMBED_RACE_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_tokens(model: &str, tokens: i32) {
    if tokens > 0 {
        TOKENS_TOTAL.with_label_values(&[model]).inc_by(tokens as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_is_infallible() {
        record_request("easy", "success");
        record_cache_hit();
        record_cache_miss();
        record_store_dropped("insert");
        record_embed_race("timeout");
        record_tokens("gpt-4o", 42);
        record_tokens("gpt-4o", 0);
    }

    #[test]
    fn test_encode_metrics() {
        let output = encode_metrics();
        assert!(output.is_empty() || output.starts_with('#') || output.contains("ai_gateway"));
    }
}
