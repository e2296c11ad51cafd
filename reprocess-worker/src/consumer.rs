use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use reprocess_common::channel::{Delivery, Outcome};
use reprocess_common::payload::BatchPayload;

use crate::breaker::CircuitBreaker;
use crate::chunk::{ChunkOutcome, ChunkProcessor};
use crate::error::{BatchError, ChunkError};
use crate::stats::WorkerMetrics;

pub const DEFAULT_CHUNK_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchReport {
    pub chunks: usize,
    pub chunks_skipped: usize,
    pub items_processed: usize,
}

/// Handles delivered batches: splits them into chunks and fans the chunks out under the
/// shared breaker.
pub struct BatchConsumer {
    chunks: ChunkProcessor,
    breaker: CircuitBreaker,
    metrics: Arc<WorkerMetrics>,
    chunk_size: usize,
}

impl BatchConsumer {
    pub fn new(chunks: ChunkProcessor, breaker: CircuitBreaker, metrics: Arc<WorkerMetrics>) -> Self {
        Self {
            chunks,
            breaker,
            metrics,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    /// Decide how the channel should settle a delivery.
    pub async fn handle(&self, delivery: &Delivery) -> Outcome {
        let payload = match BatchPayload::decode(&delivery.payload) {
            Ok(payload) => payload,
            Err(error) => {
                // Redelivering a payload we cannot read would only fail again.
                error!(
                    queue = %delivery.queue,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    %error,
                    "dropping malformed batch payload"
                );
                metrics::counter!("reprocess_worker_malformed_payloads_total").increment(1);
                return Outcome::Ack;
            }
        };

        match self.process_batch(&payload).await {
            Ok(_) => Outcome::Ack,
            Err(_) => Outcome::Nack,
        }
    }

    pub async fn process_batch(&self, payload: &BatchPayload) -> Result<BatchReport, BatchError> {
        let start = Instant::now();
        let size = payload.ids.len();
        self.metrics.record_batch_start();

        if size == 0 {
            info!(batch_id = %payload.batch_id, "empty batch, nothing to do");
            self.metrics.record_success(0, start.elapsed());
            return Ok(BatchReport::default());
        }

        if let Err(open) = self.breaker.check() {
            warn!(
                batch_id = %payload.batch_id,
                retry_in_s = open.retry_in.as_secs_f64(),
                "circuit breaker open, failing batch without processing"
            );
            self.metrics.record_failure(size, size);
            return Err(BatchError::CircuitOpen(open));
        }

        let semaphore = Arc::new(Semaphore::new(payload.concurrency_hint.max(1)));
        let mut tasks = JoinSet::new();
        for chunk in payload.ids.chunks(self.chunk_size) {
            let chunk = chunk.to_vec();
            let chunks = self.chunks.clone();
            let breaker = self.breaker.clone();
            let semaphore = semaphore.clone();
            let force = payload.force;

            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(permit) => {
                        let result = breaker.call(chunks.process(&chunk, force)).await;
                        drop(permit);
                        result
                    }
                    Err(error) => Err(ChunkError::Task(error.to_string())),
                };
                (chunk.len(), result)
            });
        }

        let total = tasks.len();
        let mut report = BatchReport {
            chunks: total,
            ..Default::default()
        };
        let mut failed = 0;
        let mut succeeded_items = 0;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((chunk_len, Ok(outcome))) => {
                    succeeded_items += chunk_len;
                    match outcome {
                        ChunkOutcome::Processed(n) => report.items_processed += n,
                        ChunkOutcome::Skipped => report.chunks_skipped += 1,
                    }
                }
                Ok((chunk_len, Err(error))) => {
                    failed += 1;
                    warn!(batch_id = %payload.batch_id, chunk_size = chunk_len, %error, "chunk failed");
                }
                Err(error) => {
                    failed += 1;
                    error!(batch_id = %payload.batch_id, %error, "chunk task did not complete");
                }
            }
        }

        if failed > 0 {
            let failed_items = size - succeeded_items;
            warn!(
                batch_id = %payload.batch_id,
                batch_number = payload.batch_number,
                total_batches = payload.total_batches,
                failed_chunks = failed,
                total_chunks = total,
                failed_items,
                "batch partially failed"
            );
            self.metrics.record_failure(size, failed_items);
            return Err(BatchError::PartialFailure { failed, total });
        }

        let elapsed = start.elapsed();
        info!(
            batch_id = %payload.batch_id,
            batch_number = payload.batch_number,
            total_batches = payload.total_batches,
            chunks = total,
            chunks_skipped = report.chunks_skipped,
            items_processed = report.items_processed,
            duration_s = elapsed.as_secs_f64(),
            "batch processed"
        );
        self.metrics.record_success(size, elapsed);

        Ok(report)
    }
}
