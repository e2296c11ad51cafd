use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, warn};

use crate::config::DedupConfig;
use crate::payload::MatchId;
use crate::redis::{Client, CustomRedisError};

pub const DEFAULT_KEY_TTL_SECONDS: u64 = 60 * 60 * 24 * 3;
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("dedup store {operation} on {key} failed after {attempts} attempts: {error}")]
    Unavailable {
        operation: &'static str,
        key: String,
        attempts: u32,
        #[source]
        error: CustomRedisError,
    },
}

/// "Have we seen this match id recently?" backed by a single Redis set.
///
/// The TTL applies to the whole key and is refreshed by every write, so membership means
/// "seen within the TTL window of the most recent write".
///
/// `filter_new` checks and marks slice by slice without a lock: two callers racing on the
/// same ids can both observe them as new.
#[derive(Clone)]
pub struct DedupStore {
    client: Arc<dyn Client + Send + Sync>,
    key: String,
    ttl_seconds: u64,
    batch_size: usize,
    max_attempts: u32,
    retry_delay: Duration,
}

impl DedupStore {
    pub fn new(client: Arc<dyn Client + Send + Sync>, key: &str) -> Self {
        Self {
            client,
            key: key.to_owned(),
            ttl_seconds: DEFAULT_KEY_TTL_SECONDS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn from_config(client: Arc<dyn Client + Send + Sync>, key: &str, config: &DedupConfig) -> Self {
        Self::new(client, key)
            .ttl_seconds(config.dedup_ttl_seconds)
            .batch_size(config.dedup_batch_size)
            .retry(config.dedup_max_attempts, config.dedup_retry_delay.0)
    }

    pub fn ttl_seconds(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Return the ids not yet recorded, recording them in the same pass.
    ///
    /// On error, whatever this call already recorded is released again before the error is
    /// returned, so a failed call leaves no claims behind unless the release fails too.
    pub async fn filter_new(&self, ids: &[MatchId]) -> Result<BTreeSet<MatchId>, DedupError> {
        let mut new_ids = BTreeSet::new();

        for batch in ids.chunks(self.batch_size) {
            match self.claim(batch).await {
                Ok(batch_new) => new_ids.extend(batch_new),
                Err(error) => {
                    self.roll_back(&new_ids).await;
                    return Err(error);
                }
            }
        }

        Ok(new_ids)
    }

    /// Return the ids not yet recorded, without recording anything.
    pub async fn filter_unseen(&self, ids: &[MatchId]) -> Result<BTreeSet<MatchId>, DedupError> {
        let mut unseen = BTreeSet::new();

        for batch in ids.chunks(self.batch_size) {
            unseen.extend(self.unseen_in(batch).await?);
        }

        Ok(unseen)
    }

    pub async fn mark_processed(&self, ids: &[MatchId]) -> Result<(), DedupError> {
        for batch in ids.chunks(self.batch_size) {
            self.add(batch).await?;
        }

        Ok(())
    }

    /// Forget ids, so a later non-forced call sees them as new again.
    pub async fn release(&self, ids: &[MatchId]) -> Result<u64, DedupError> {
        let mut removed = 0;
        for batch in ids.chunks(self.batch_size) {
            removed += self
                .with_retry("srem", || self.client.srem(&self.key, batch))
                .await?;
        }

        Ok(removed)
    }

    pub async fn count(&self) -> Result<u64, DedupError> {
        self.with_retry("scard", || self.client.scard(&self.key))
            .await
    }

    pub async fn clear(&self) -> Result<bool, DedupError> {
        self.with_retry("del", || self.client.del(&self.key)).await
    }

    async fn claim(&self, batch: &[MatchId]) -> Result<Vec<MatchId>, DedupError> {
        let batch_new = self.unseen_in(batch).await?;
        if !batch_new.is_empty() {
            self.add(&batch_new).await?;
        }

        Ok(batch_new)
    }

    async fn roll_back(&self, claimed: &BTreeSet<MatchId>) {
        if claimed.is_empty() {
            return;
        }
        let claimed: Vec<MatchId> = claimed.iter().copied().collect();
        match self.release(&claimed).await {
            Ok(released) => warn!(key = %self.key, released, "rolled back partial claim"),
            Err(error) => error!(
                key = %self.key,
                ids = claimed.len(),
                %error,
                "failed to roll back partial claim"
            ),
        }
    }

    async fn unseen_in(&self, batch: &[MatchId]) -> Result<Vec<MatchId>, DedupError> {
        let flags = self
            .with_retry("smismember", || self.client.smismember(&self.key, batch))
            .await?;

        Ok(batch
            .iter()
            .zip(flags)
            .filter_map(|(id, seen)| (!seen).then_some(*id))
            .collect())
    }

    async fn add(&self, batch: &[MatchId]) -> Result<(), DedupError> {
        self.with_retry("sadd", || {
            self.client
                .sadd_with_expire(&self.key, batch, self.ttl_seconds)
        })
        .await
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, DedupError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CustomRedisError>>,
    {
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        key = %self.key,
                        operation,
                        attempt,
                        %error,
                        "redis operation failed, retrying"
                    );
                    metrics::counter!("reprocess_dedup_retries_total", "operation" => operation)
                        .increment(1);
                    tokio::time::sleep(self.retry_delay * attempt).await;
                    attempt += 1;
                }
                Err(error) => {
                    error!(
                        key = %self.key,
                        operation,
                        attempts = attempt,
                        %error,
                        "redis operation failed after retries"
                    );
                    return Err(DedupError::Unavailable {
                        operation,
                        key: self.key.clone(),
                        attempts: attempt,
                        error,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::{MockRedisCall, MockRedisClient, RedisErrorKind};

    const KEY: &str = "processed:match_ids";

    fn store(mock: &MockRedisClient) -> DedupStore {
        DedupStore::new(Arc::new(mock.clone()), KEY)
    }

    fn io_error() -> CustomRedisError {
        CustomRedisError::from_redis_kind(RedisErrorKind::IoError, "connection reset")
    }

    #[tokio::test]
    async fn test_filter_new_marks_what_it_returns() {
        let mock = MockRedisClient::new().with_members(KEY, &[2]);
        let store = store(&mock);

        let new_ids = store.filter_new(&[1, 2, 3]).await.unwrap();
        assert_eq!(new_ids, BTreeSet::from([1, 3]));
        assert_eq!(mock.members(KEY), [1, 2, 3].into_iter().collect());
        assert_eq!(mock.ttl(KEY), Some(DEFAULT_KEY_TTL_SECONDS));

        let again = store.filter_new(&[1, 2, 3]).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_filter_new_respects_batch_size() {
        let mock = MockRedisClient::new();
        let store = store(&mock).batch_size(2);
        let ids: Vec<MatchId> = (1..=5).collect();

        let new_ids = store.filter_new(&ids).await.unwrap();
        assert_eq!(new_ids.len(), 5);

        let lookups: Vec<Vec<MatchId>> = mock
            .get_calls()
            .into_iter()
            .filter_map(|call| match call {
                MockRedisCall::Smismember { members, .. } => Some(members),
                _ => None,
            })
            .collect();
        assert_eq!(lookups, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[tokio::test]
    async fn test_filter_new_rolls_back_when_a_later_slice_fails() {
        // Calls 1 and 2 claim [1, 2]; the lookup of [3, 4] fails for good.
        let mock = MockRedisClient::new().fail_call(
            3,
            CustomRedisError::from_redis_kind(RedisErrorKind::ResponseError, "LOADING"),
        );
        let store = store(&mock).batch_size(2);

        let err = store.filter_new(&[1, 2, 3, 4]).await.unwrap_err();
        assert!(matches!(
            err,
            DedupError::Unavailable {
                operation: "smismember",
                ..
            }
        ));
        assert!(mock.members(KEY).is_empty());
        assert_eq!(
            mock.get_calls().last(),
            Some(&MockRedisCall::Srem {
                key: KEY.to_owned(),
                members: vec![1, 2],
            })
        );

        let new_ids = store.filter_new(&[1, 2, 3, 4]).await.unwrap();
        assert_eq!(new_ids, BTreeSet::from([1, 2, 3, 4]));
    }

    #[tokio::test]
    async fn test_filter_unseen_is_read_only() {
        let mock = MockRedisClient::new().with_members(KEY, &[10]);
        let store = store(&mock);

        let unseen = store.filter_unseen(&[10, 11]).await.unwrap();
        assert_eq!(unseen, BTreeSet::from([11]));
        assert_eq!(mock.members(KEY), [10].into_iter().collect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let mock = MockRedisClient::new().fail_next(2, io_error());
        let store = store(&mock);

        store.mark_processed(&[42]).await.unwrap();
        assert_eq!(mock.get_calls().len(), 3);
        assert!(mock.members(KEY).contains(&42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_propagates_after_exhaustion() {
        let mock = MockRedisClient::new().fail_next(3, io_error());
        let store = store(&mock);

        let err = store.filter_new(&[1]).await.unwrap_err();
        assert!(matches!(
            err,
            DedupError::Unavailable {
                operation: "smismember",
                attempts: 3,
                ..
            }
        ));
        assert_eq!(mock.get_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let mock = MockRedisClient::new().fail_next(
            1,
            CustomRedisError::from_redis_kind(RedisErrorKind::ResponseError, "WRONGTYPE"),
        );
        let store = store(&mock);

        assert!(store.count().await.is_err());
        assert_eq!(mock.get_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_release_count_and_clear() {
        let mock = MockRedisClient::new();
        let store = store(&mock);

        store.mark_processed(&[1, 2, 3]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 3);

        assert_eq!(store.release(&[2, 9]).await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 2);

        assert!(store.clear().await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(!store.clear().await.unwrap());
    }
}
