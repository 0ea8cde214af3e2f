//! Request accounting over Postgres.
//!
//! The hot path never waits for SQL: [`StoreQueue`] offers two
//! non-blocking submit operations backed by bounded channels, and a small
//! pool of workers drains them. When a queue is full the submission is
//! dropped with a warning and a `store_dropped_total` tick; latency is
//! preferred over durability here.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::types::{Account, AnalyticsResponse, Level, RequestRecord, TokenIncrement};

/// Per-operation SQL deadline for the workers.
const OP_DEADLINE: Duration = Duration::from_secs(3);

/// Assumed upstream pricing used for the cost-saved analytics.
const COST_PER_INPUT_TOKEN: f64 = 0.000002;
const COST_PER_OUTPUT_TOKEN: f64 = 0.000012;

/// Errors from the SQL layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database operation timed out")]
    Timeout,
}

/// Direct SQL operations against the `account` and `requests` tables.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and ping the database. Boot fails if this does.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        info!("connected to postgres");
        Ok(Self { pool })
    }

    /// Create the schema if it does not exist. Idempotent.
    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS account(
                user_id varchar(50) PRIMARY KEY,
                simple_tokens BIGINT NOT NULL DEFAULT 0,
                complex_tokens BIGINT NOT NULL DEFAULT 0,
                num_requests BIGINT NOT NULL DEFAULT 0
            )"#,
        )
        .execute(&self.pool)
        .await?;

        // No CREATE TYPE IF NOT EXISTS in postgres; a second boot trips
        // over the existing type, which is fine.
        if let Err(e) = sqlx::query("CREATE TYPE level AS ENUM ('easy', 'high', 'medium')")
            .execute(&self.pool)
            .await
        {
            debug!(error = %e, "level enum not created (it usually already exists)");
        }

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS requests(
                id UUID PRIMARY KEY,
                cacheable bool,
                user_id varchar(50) REFERENCES account(user_id),
                user_query TEXT NOT NULL,
                llm_response TEXT NOT NULL,
                input_tokens integer,
                output_tokens integer,
                total_tokens integer,
                time_taken BIGINT,
                model varchar(50),
                cache_hit bool,
                level level
            )"#,
        )
        .execute(&self.pool)
        .await?;

        info!("database schema ready");
        Ok(())
    }

    pub async fn insert_request(&self, record: &RequestRecord) -> Result<(), StoreError> {
        let query = sqlx::query(
            r#"INSERT INTO requests(
                id, cacheable, user_id, user_query, llm_response,
                input_tokens, output_tokens, total_tokens, time_taken,
                model, cache_hit, level
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
        )
        .bind(record.id)
        .bind(record.cacheable)
        .bind(&record.user_id)
        .bind(&record.user_query)
        .bind(&record.llm_response)
        .bind(record.input_tokens)
        .bind(record.output_tokens)
        .bind(record.total_tokens)
        .bind(record.time_taken_ms)
        .bind(&record.model)
        .bind(record.cache_hit)
        .bind(record.level);

        tokio::time::timeout(OP_DEADLINE, query.execute(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    /// Atomically add tokens to the user's per-tier counter and bump
    /// `num_requests`, creating the account row on first sight.
    pub async fn increment_tokens(&self, inc: &TokenIncrement) -> Result<Account, StoreError> {
        let (simple, complex) = match inc.level {
            Level::Easy => (i64::from(inc.tokens), 0),
            Level::High => (0, i64::from(inc.tokens)),
            Level::Medium => (0, 0),
        };

        let query = sqlx::query_as::<_, Account>(
            r#"INSERT INTO account (user_id, simple_tokens, complex_tokens, num_requests)
               VALUES ($1, $2, $3, 1)
               ON CONFLICT (user_id) DO UPDATE
               SET simple_tokens  = account.simple_tokens  + EXCLUDED.simple_tokens,
                   complex_tokens = account.complex_tokens + EXCLUDED.complex_tokens,
                   num_requests   = account.num_requests   + 1
               RETURNING user_id, simple_tokens, complex_tokens, num_requests"#,
        )
        .bind(&inc.user_id)
        .bind(simple)
        .bind(complex);

        let account = tokio::time::timeout(OP_DEADLINE, query.fetch_one(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(account)
    }

    pub async fn all_requests(&self) -> Result<Vec<RequestRecord>, StoreError> {
        let rows = sqlx::query_as::<_, RequestRecord>(
            r#"SELECT id, cacheable, user_id, user_query, llm_response,
                      input_tokens, output_tokens, total_tokens, time_taken,
                      model, cache_hit, level
               FROM requests"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn analytics(&self) -> Result<AnalyticsResponse, StoreError> {
        let rows = self.all_requests().await?;
        Ok(compute_analytics(&rows))
    }
}

/// Cost and hit-rate aggregates over the logged requests. Eventually
/// consistent with the submit queues by design.
fn compute_analytics(rows: &[RequestRecord]) -> AnalyticsResponse {
    let mut cost_saved = 0.0;
    let mut hits = 0u64;

    for row in rows {
        if row.cache_hit {
            hits += 1;
            cost_saved += f64::from(row.input_tokens) * COST_PER_INPUT_TOKEN
                + f64::from(row.output_tokens) * COST_PER_OUTPUT_TOKEN;
        }
    }

    let cache_hit_percentage = if rows.is_empty() {
        0.0
    } else {
        hits as f64 / rows.len() as f64 * 100.0
    };

    AnalyticsResponse {
        cost_saved,
        cache_hit_percentage,
        msg: "Here are the analytics!".to_string(),
    }
}

/// Non-blocking submission side of the store.
#[derive(Clone)]
pub struct StoreQueue {
    inserts: mpsc::Sender<RequestRecord>,
    increments: mpsc::Sender<TokenIncrement>,
}

/// Receiver side handed to [`spawn_workers`]. Kept separate so tests can
/// hold onto the receivers and observe submissions directly.
pub struct StoreReceivers {
    pub inserts: mpsc::Receiver<RequestRecord>,
    pub increments: mpsc::Receiver<TokenIncrement>,
}

impl StoreQueue {
    /// Create the paired queue and receivers with the given per-channel
    /// capacity.
    pub fn bounded(capacity: usize) -> (Self, StoreReceivers) {
        let (insert_tx, insert_rx) = mpsc::channel(capacity);
        let (increment_tx, increment_rx) = mpsc::channel(capacity);
        (
            Self { inserts: insert_tx, increments: increment_tx },
            StoreReceivers { inserts: insert_rx, increments: increment_rx },
        )
    }

    /// Queue a request row for insertion; drops it when the queue is full.
    pub fn submit_insert_request(&self, record: RequestRecord) {
        if self.inserts.try_send(record).is_err() {
            warn!("insert queue full, dropping request row to preserve latency");
            metrics::record_store_dropped("insert");
        }
    }

    /// Queue a token-accounting update; drops it when the queue is full.
    pub fn submit_increment_tokens(&self, inc: TokenIncrement) {
        if self.increments.try_send(inc).is_err() {
            warn!("increment queue full, dropping token update to preserve latency");
            metrics::record_store_dropped("increment");
        }
    }
}

/// Spawn `workers` tasks draining both queues into the store. On shutdown
/// the workers finish whatever is still queued before exiting.
pub fn spawn_workers(
    store: Arc<PgStore>,
    receivers: StoreReceivers,
    workers: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let inserts = Arc::new(Mutex::new(receivers.inserts));
    let increments = Arc::new(Mutex::new(receivers.increments));

    (0..workers.max(1))
        .map(|id| {
            tokio::spawn(store_worker(
                id,
                Arc::clone(&store),
                Arc::clone(&inserts),
                Arc::clone(&increments),
                shutdown.clone(),
            ))
        })
        .collect()
}

async fn store_worker(
    id: usize,
    store: Arc<PgStore>,
    inserts: Arc<Mutex<mpsc::Receiver<RequestRecord>>>,
    increments: Arc<Mutex<mpsc::Receiver<TokenIncrement>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(id, "store worker started");
    loop {
        tokio::select! {
            record = recv_next(&inserts) => match record {
                Some(record) => run_insert(&store, &record).await,
                None => break,
            },
            inc = recv_next(&increments) => match inc {
                Some(inc) => run_increment(&store, &inc).await,
                None => break,
            },
            _ = shutdown.changed() => {
                drain(&store, &inserts, &increments).await;
                break;
            }
        }
    }
    info!(id, "store worker stopped");
}

async fn recv_next<T>(rx: &Mutex<mpsc::Receiver<T>>) -> Option<T> {
    rx.lock().await.recv().await
}

async fn run_insert(store: &PgStore, record: &RequestRecord) {
    if let Err(e) = store.insert_request(record).await {
        error!(error = %e, user_id = %record.user_id, request_id = %record.id, "request insert failed");
    }
}

async fn run_increment(store: &PgStore, inc: &TokenIncrement) {
    match store.increment_tokens(inc).await {
        Ok(account) => debug!(
            user_id = %account.user_id,
            num_requests = account.num_requests,
            "tokens incremented"
        ),
        Err(e) => error!(error = %e, user_id = %inc.user_id, "token increment failed"),
    }
}

/// Flush whatever is still queued; called once the shutdown signal fires.
async fn drain(
    store: &PgStore,
    inserts: &Mutex<mpsc::Receiver<RequestRecord>>,
    increments: &Mutex<mpsc::Receiver<TokenIncrement>>,
) {
    let mut flushed = 0usize;
    while let Ok(inc) = increments.lock().await.try_recv() {
        run_increment(store, &inc).await;
        flushed += 1;
    }
    while let Ok(record) = inserts.lock().await.try_recv() {
        run_insert(store, &record).await;
        flushed += 1;
    }
    if flushed > 0 {
        info!(flushed, "drained queued store work during shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(cache_hit: bool, input: i32, output: i32) -> RequestRecord {
        RequestRecord {
            id: Uuid::new_v4(),
            cacheable: true,
            user_id: "u1".into(),
            user_query: "q".into(),
            llm_response: "a".into(),
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
            time_taken_ms: 10,
            model: "gpt-4o".into(),
            cache_hit,
            level: Level::Easy,
        }
    }

    #[test]
    fn test_analytics_empty() {
        let analytics = compute_analytics(&[]);
        assert_eq!(analytics.cost_saved, 0.0);
        assert_eq!(analytics.cache_hit_percentage, 0.0);
    }

    #[test]
    fn test_analytics_counts_only_hits() {
        let rows = vec![
            record(true, 100, 50),
            record(false, 200, 80),
            record(true, 10, 5),
            record(false, 1, 1),
        ];
        let analytics = compute_analytics(&rows);

        let expected = (100.0 + 10.0) * COST_PER_INPUT_TOKEN + (50.0 + 5.0) * COST_PER_OUTPUT_TOKEN;
        assert!((analytics.cost_saved - expected).abs() < 1e-12);
        assert!((analytics.cache_hit_percentage - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_queue_drops_on_overflow() {
        let (queue, mut receivers) = StoreQueue::bounded(2);

        for _ in 0..5 {
            queue.submit_insert_request(record(false, 1, 1));
        }

        // Only the first two made it in; the rest were dropped silently.
        assert!(receivers.inserts.try_recv().is_ok());
        assert!(receivers.inserts.try_recv().is_ok());
        assert!(receivers.inserts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_queue_submissions_are_observable() {
        let (queue, mut receivers) = StoreQueue::bounded(4);

        queue.submit_increment_tokens(TokenIncrement {
            user_id: "u1".into(),
            tokens: 42,
            level: Level::High,
        });

        let inc = receivers.increments.recv().await.unwrap();
        assert_eq!(inc.user_id, "u1");
        assert_eq!(inc.tokens, 42);
        assert_eq!(inc.level, Level::High);
    }
}
