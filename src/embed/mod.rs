//! Embedding generation service.
//!
//! A bounded job queue feeds a small pool of worker tasks that run the
//! [`Encoder`]. Every submitted query gets **exactly one**
//! [`EmbeddingResult`] on its private result channel, no matter what goes
//! wrong (queue overflow, encoder failure, budget exhaustion), so
//! consumers in the lazy-caching path can block-await the receiver without
//! a second cancellation check.
//!
//! Generation runs on a detached budget measured from submission: a client
//! that stops waiting after the short race window does not abort an
//! in-flight embedding that is still useful for lazy cache insertion.

mod encoder;

pub use encoder::{Encoder, FastembedEncoder};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, mpsc::error::TrySendError, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EmbedConfig;

/// Errors from embedding generation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbedError {
    #[error("embedding job queue is full")]
    QueueFull,

    #[error("embedding generation exceeded its budget")]
    BudgetExceeded,

    #[error("embedding service is shut down")]
    Closed,

    #[error("encoder failed: {0}")]
    Encoder(String),
}

/// Result of one embedding job, delivered exactly once.
#[derive(Debug)]
pub struct EmbeddingResult {
    pub query: String,
    pub outcome: Result<Vec<f32>, EmbedError>,
}

struct EmbeddingJob {
    query: String,
    submitted: Instant,
    result_tx: oneshot::Sender<EmbeddingResult>,
}

/// Handle to the embedding worker pool.
pub struct EmbeddingService {
    jobs: mpsc::Sender<EmbeddingJob>,
    budget: Duration,
}

impl EmbeddingService {
    /// Spawn `config.workers` workers sharing a queue of `config.queue_len`
    /// jobs.
    pub fn new(encoder: Arc<dyn Encoder>, config: &EmbedConfig) -> Self {
        let (tx, rx) = mpsc::channel::<EmbeddingJob>(config.queue_len);
        let rx = Arc::new(Mutex::new(rx));

        for id in 0..config.workers.max(1) {
            tokio::spawn(worker(id, Arc::clone(&rx), Arc::clone(&encoder), config.budget));
        }
        info!(workers = config.workers.max(1), queue = config.queue_len, "embedding service started");

        Self { jobs: tx, budget: config.budget }
    }

    /// Submit a query for embedding and return the receiver for its result.
    ///
    /// Never blocks. If the job cannot be enqueued, the error result is
    /// delivered immediately; the returned receiver always yields exactly
    /// one value.
    pub fn generate(&self, query: String) -> oneshot::Receiver<EmbeddingResult> {
        let (result_tx, result_rx) = oneshot::channel();
        let job = EmbeddingJob { query, submitted: Instant::now(), result_tx };

        if let Err(err) = self.jobs.try_send(job) {
            let (job, outcome) = match err {
                TrySendError::Full(job) => {
                    warn!("embedding queue full, rejecting job");
                    (job, Err(EmbedError::QueueFull))
                }
                TrySendError::Closed(job) => (job, Err(EmbedError::Closed)),
            };
            let _ = job.result_tx.send(EmbeddingResult { query: job.query.clone(), outcome });
        }

        result_rx
    }

    /// The detached per-job generation budget.
    pub fn budget(&self) -> Duration {
        self.budget
    }
}

async fn worker(
    id: usize,
    jobs: Arc<Mutex<mpsc::Receiver<EmbeddingJob>>>,
    encoder: Arc<dyn Encoder>,
    budget: Duration,
) {
    debug!(id, "embedding worker started");
    loop {
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else {
            debug!(id, "embedding job queue closed, worker exiting");
            break;
        };

        let elapsed = job.submitted.elapsed();
        let outcome = if elapsed >= budget {
            // The job sat in the queue past its whole budget.
            Err(EmbedError::BudgetExceeded)
        } else {
            match tokio::time::timeout(budget - elapsed, encoder.encode(&job.query)).await {
                Ok(result) => result,
                Err(_) => Err(EmbedError::BudgetExceeded),
            }
        };

        if let Err(ref e) = outcome {
            warn!(id, error = %e, query = %job.query, "embedding generation failed");
        }

        // The receiver may be long gone (request already answered without
        // the cache); a failed send is fine.
        let _ = job.result_tx.send(EmbeddingResult { query: job.query, outcome });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubEncoder {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Encoder for StubEncoder {
        async fn encode(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(EmbedError::Encoder("stub failure".into()));
            }
            Ok(vec![text.len() as f32; 4])
        }

        fn dimension(&self) -> usize {
            4
        }
    }

    fn config(budget: Duration) -> EmbedConfig {
        EmbedConfig { workers: 1, queue_len: 2, budget, wait: Duration::from_millis(300) }
    }

    #[tokio::test]
    async fn test_delivers_vector() {
        let encoder = Arc::new(StubEncoder { delay: Duration::ZERO, fail: false });
        let service = EmbeddingService::new(encoder, &config(Duration::from_secs(2)));

        let result = service.generate("hello".into()).await.unwrap();
        assert_eq!(result.query, "hello");
        assert_eq!(result.outcome.unwrap(), vec![5.0; 4]);
    }

    #[tokio::test]
    async fn test_delivers_encoder_error() {
        let encoder = Arc::new(StubEncoder { delay: Duration::ZERO, fail: true });
        let service = EmbeddingService::new(encoder, &config(Duration::from_secs(2)));

        let result = service.generate("hello".into()).await.unwrap();
        assert!(matches!(result.outcome, Err(EmbedError::Encoder(_))));
    }

    #[tokio::test]
    async fn test_budget_exceeded_still_delivers() {
        let encoder = Arc::new(StubEncoder { delay: Duration::from_secs(5), fail: false });
        let service = EmbeddingService::new(encoder, &config(Duration::from_millis(20)));

        let result = service.generate("slow".into()).await.unwrap();
        assert!(matches!(result.outcome, Err(EmbedError::BudgetExceeded)));
    }

    #[tokio::test]
    async fn test_queue_overflow_delivers_immediately() {
        // One slow worker, queue of 2: the first job occupies the worker,
        // two more fill the queue, the fourth must be rejected inline.
        let encoder = Arc::new(StubEncoder { delay: Duration::from_secs(5), fail: false });
        let service = EmbeddingService::new(encoder, &config(Duration::from_secs(10)));

        let _a = service.generate("a".into());
        tokio::task::yield_now().await;
        let _b = service.generate("b".into());
        let _c = service.generate("c".into());
        let d = service.generate("d".into());

        let result = tokio::time::timeout(Duration::from_millis(100), d)
            .await
            .expect("overflow result must be delivered without waiting")
            .unwrap();
        assert!(matches!(result.outcome, Err(EmbedError::QueueFull)));
    }

    #[tokio::test]
    async fn test_every_submission_gets_exactly_one_result() {
        let encoder = Arc::new(StubEncoder { delay: Duration::from_millis(1), fail: false });
        let service = EmbeddingService::new(encoder, &config(Duration::from_secs(2)));

        let receivers: Vec<_> = (0..10).map(|i| service.generate(format!("query {i}"))).collect();
        for rx in receivers {
            // A dropped sender would surface here as a RecvError.
            rx.await.expect("result delivered");
        }
    }
}
