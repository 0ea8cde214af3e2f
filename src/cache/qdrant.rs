//! Qdrant-backed semantic cache.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use qdrant_client::qdrant::{
    value::Kind, Condition, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
    DatetimeRange, DeletePointsBuilder, Distance, FieldType, Filter, PointStruct,
    SearchPointsBuilder, Timestamp, UpsertPointsBuilder, Value, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{CacheError, SemanticCache};
use crate::config::CacheConfig;
use crate::types::{CacheResponse, LlmOutput};

const PAYLOAD_ANSWER: &str = "cached_answer";
const PAYLOAD_QUERY: &str = "cached_query";
const PAYLOAD_INPUT_TOKENS: &str = "input_tokens";
const PAYLOAD_OUTPUT_TOKENS: &str = "output_tokens";
const PAYLOAD_TTL: &str = "ttl";

/// Lookup and insert are bounded independently of the caller's deadline.
const OP_DEADLINE: Duration = Duration::from_secs(1);

/// Semantic cache stored as a Qdrant collection of cosine-distance vectors
/// with the answer and its TTL in the point payload.
pub struct QdrantSemanticCache {
    client: Qdrant,
    config: CacheConfig,
}

impl QdrantSemanticCache {
    /// Connect to Qdrant and make sure the collection and the TTL payload
    /// index exist.
    pub async fn connect(config: CacheConfig) -> Result<Self, CacheError> {
        let client = Qdrant::from_url(&config.url).build()?;
        let cache = Self { client, config };
        cache.ensure_collection().await?;
        Ok(cache)
    }

    async fn ensure_collection(&self) -> Result<(), CacheError> {
        let exists = self.client.collection_exists(&self.config.collection_name).await?;
        if exists {
            return Ok(());
        }

        info!(collection = %self.config.collection_name, "creating semantic cache collection");
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.config.collection_name).vectors_config(
                    VectorParamsBuilder::new(self.config.vector_size, Distance::Cosine),
                ),
            )
            .await?;

        // Datetime index so the sweeper can range-filter on expiry.
        self.client
            .create_field_index(CreateFieldIndexCollectionBuilder::new(
                &self.config.collection_name,
                PAYLOAD_TTL,
                FieldType::Datetime,
            ))
            .await?;

        Ok(())
    }

    /// Deterministic point id for a query: identical text always maps to
    /// the same id, which makes insertion an idempotent upsert.
    fn point_id(query: &str) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, query.as_bytes()).to_string()
    }

    /// Periodically delete entries whose TTL has elapsed. Runs until the
    /// shutdown channel flips.
    pub async fn sweep(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        // interval fires immediately; the first sweep should wait a full period
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    info!("starting periodic cache sweep");
                    self.evict_expired().await;
                }
                _ = shutdown.changed() => {
                    info!("stopping cache sweeper");
                    return;
                }
            }
        }
    }

    async fn evict_expired(&self) {
        let now = Utc::now();
        let cutoff = Timestamp { seconds: now.timestamp(), nanos: now.timestamp_subsec_nanos() as i32 };
        let expired = Filter::must([Condition::datetime_range(
            PAYLOAD_TTL,
            DatetimeRange { lte: Some(cutoff), ..Default::default() },
        )]);

        match self
            .client
            .delete_points(DeletePointsBuilder::new(&self.config.collection_name).points(expired))
            .await
        {
            Ok(response) => debug!(result = ?response.result, "cache sweep complete"),
            Err(e) => error!(error = %e, "cache sweep failed"),
        }
    }
}

#[async_trait]
impl SemanticCache for QdrantSemanticCache {
    async fn lookup(
        &self,
        vector: &[f32],
        _query: &str,
    ) -> Result<Option<CacheResponse>, CacheError> {
        let search = SearchPointsBuilder::new(&self.config.collection_name, vector.to_vec(), 1)
            .with_payload(true)
            .score_threshold(self.config.similarity_threshold);

        let response = tokio::time::timeout(OP_DEADLINE, self.client.search_points(search))
            .await
            .map_err(|_| CacheError::Timeout)??;

        match response.result.into_iter().next() {
            Some(point) => {
                debug!(score = point.score, "semantic cache hit");
                Ok(Some(decode_payload(&point.payload)))
            }
            None => Ok(None),
        }
    }

    async fn insert(&self, vector: Vec<f32>, output: &LlmOutput, query: &str) {
        if vector.len() != self.config.vector_size as usize {
            warn!(
                got = vector.len(),
                want = self.config.vector_size,
                "refusing to cache vector of wrong dimension"
            );
            return;
        }

        let expires_at = Utc::now() + chrono::Duration::from_std(self.config.entry_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(24));

        let payload: HashMap<String, Value> = HashMap::from([
            (PAYLOAD_ANSWER.to_string(), Value::from(output.text.clone())),
            (PAYLOAD_QUERY.to_string(), Value::from(query.to_string())),
            (PAYLOAD_INPUT_TOKENS.to_string(), Value::from(i64::from(output.input_tokens))),
            (PAYLOAD_OUTPUT_TOKENS.to_string(), Value::from(i64::from(output.output_tokens))),
            (PAYLOAD_TTL.to_string(), Value::from(expires_at.to_rfc3339())),
        ]);

        let point = PointStruct::new(Self::point_id(query), vector, payload);
        let upsert =
            UpsertPointsBuilder::new(&self.config.collection_name, vec![point]);

        match tokio::time::timeout(OP_DEADLINE, self.client.upsert_points(upsert)).await {
            Ok(Ok(_)) => debug!(query = %query, "cached llm response"),
            Ok(Err(e)) => error!(error = %e, "cache insert failed"),
            Err(_) => error!("cache insert timed out"),
        }
    }
}

fn decode_payload(payload: &HashMap<String, Value>) -> CacheResponse {
    CacheResponse {
        cached_answer: payload_str(payload, PAYLOAD_ANSWER),
        cached_query: payload_str(payload, PAYLOAD_QUERY),
        input_tokens: payload_int(payload, PAYLOAD_INPUT_TOKENS),
        output_tokens: payload_int(payload, PAYLOAD_OUTPUT_TOKENS),
    }
}

fn payload_str(payload: &HashMap<String, Value>, key: &str) -> String {
    match payload.get(key).and_then(|v| v.kind.as_ref()) {
        Some(Kind::StringValue(s)) => s.clone(),
        _ => String::new(),
    }
}

fn payload_int(payload: &HashMap<String, Value>, key: &str) -> i32 {
    match payload.get(key).and_then(|v| v.kind.as_ref()) {
        Some(Kind::IntegerValue(i)) => *i as i32,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_id_is_deterministic() {
        let a = QdrantSemanticCache::point_id("What is the capital of France?");
        let b = QdrantSemanticCache::point_id("What is the capital of France?");
        let c = QdrantSemanticCache::point_id("What is the capital of Germany?");
        assert_eq!(a, b);
        assert_ne!(a, c);
        // v5 over the OID namespace, not a random id
        assert_eq!(Uuid::parse_str(&a).unwrap().get_version_num(), 5);
    }

    #[test]
    fn test_decode_payload() {
        let mut payload = HashMap::new();
        payload.insert(
            PAYLOAD_ANSWER.to_string(),
            Value { kind: Some(Kind::StringValue("Paris.".into())) },
        );
        payload.insert(
            PAYLOAD_QUERY.to_string(),
            Value { kind: Some(Kind::StringValue("capital of France?".into())) },
        );
        payload.insert(PAYLOAD_INPUT_TOKENS.to_string(), Value { kind: Some(Kind::IntegerValue(7)) });
        payload.insert(PAYLOAD_OUTPUT_TOKENS.to_string(), Value { kind: Some(Kind::IntegerValue(2)) });

        let decoded = decode_payload(&payload);
        assert_eq!(decoded.cached_answer, "Paris.");
        assert_eq!(decoded.cached_query, "capital of France?");
        assert_eq!(decoded.input_tokens, 7);
        assert_eq!(decoded.output_tokens, 2);
    }

    #[test]
    fn test_decode_payload_tolerates_missing_fields() {
        let decoded = decode_payload(&HashMap::new());
        assert_eq!(decoded.cached_answer, "");
        assert_eq!(decoded.input_tokens, 0);
    }
}
