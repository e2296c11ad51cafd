use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use reprocess_common::dedup::DedupStore;
use reprocess_common::payload::MatchId;
use reprocess_common::retry::RetryPolicy;

use crate::config::Config;
use crate::error::{AttemptError, ChunkError};
use crate::processor::MatchProcessor;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The domain action ran over this many ids.
    Processed(usize),
    /// Every id was already processed.
    Skipped,
}

/// Runs the domain action for one chunk with a timeout and retries, recording the ids as
/// processed only once the action succeeded.
#[derive(Clone)]
pub struct ChunkProcessor {
    processor: Arc<dyn MatchProcessor + Send + Sync>,
    processed: DedupStore,
    timeout: Duration,
    max_attempts: u32,
    retry_policy: RetryPolicy,
}

impl ChunkProcessor {
    pub fn new(processor: Arc<dyn MatchProcessor + Send + Sync>, processed: DedupStore) -> Self {
        Self {
            processor,
            processed,
            timeout: DEFAULT_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_policy: RetryPolicy::new(2.0, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY),
        }
    }

    pub fn from_config(
        processor: Arc<dyn MatchProcessor + Send + Sync>,
        processed: DedupStore,
        config: &Config,
    ) -> Self {
        Self::new(processor, processed)
            .timeout(config.chunk_timeout.0)
            .retry(
                config.chunk_max_attempts,
                config.chunk_retry_base_delay.0,
                config.chunk_retry_max_delay.0,
            )
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry(mut self, max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_policy = RetryPolicy::new(2.0, base_delay, max_delay);
        self
    }

    pub async fn process(&self, ids: &[MatchId], force: bool) -> Result<ChunkOutcome, ChunkError> {
        let pending: Vec<MatchId> = if force {
            ids.to_vec()
        } else {
            // Redelivered batches land here with some or all ids already done.
            let unseen = self.processed.filter_unseen(ids).await?;
            ids.iter().copied().filter(|id| unseen.contains(id)).collect()
        };

        if pending.is_empty() {
            debug!(chunk_size = ids.len(), "chunk already processed, skipping");
            return Ok(ChunkOutcome::Skipped);
        }

        self.run_with_retry(&pending, force).await?;
        self.processed.mark_processed(&pending).await?;

        Ok(ChunkOutcome::Processed(pending.len()))
    }

    async fn run_with_retry(&self, ids: &[MatchId], force: bool) -> Result<(), ChunkError> {
        let mut attempt = 1;

        loop {
            let error = match tokio::time::timeout(self.timeout, self.processor.process(ids, force))
                .await
            {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(error)) => AttemptError::Process(error),
                Err(_elapsed) => AttemptError::Timeout(self.timeout),
            };

            if !error.is_retryable() {
                warn!(chunk_size = ids.len(), %error, "chunk rejected, not retrying");
                metrics::counter!("reprocess_chunks_rejected_total").increment(1);
                return Err(ChunkError::Rejected(error));
            }

            if attempt >= self.max_attempts {
                error!(
                    chunk_size = ids.len(),
                    attempts = attempt,
                    %error,
                    "chunk failed after max attempts"
                );
                return Err(ChunkError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self.retry_policy.time_until_next_retry(attempt - 1);
            warn!(
                chunk_size = ids.len(),
                attempt,
                %error,
                next_delay_ms = delay.as_millis() as u64,
                "chunk attempt failed, retry scheduled"
            );
            metrics::counter!("reprocess_chunk_retries_total").increment(1);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
