use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use reprocess_common::dedup::{DedupError, DedupStore};
use reprocess_common::payload::{
    BatchPayload, MatchId, PublishResult, DEFAULT_CONCURRENCY_HINT, DEFAULT_PRIORITY,
};
use reprocess_common::publisher::ReliablePublisher;

use crate::config::Config;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_MAX_PUBLISH_CONCURRENCY: usize = 10;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("dispatch dedup store unavailable: {0}")]
    Dedup(#[from] DedupError),
}

/// Turns a set of match ids into batches on a queue, skipping ids dispatched within the
/// dedup window unless forced.
pub struct Batcher {
    publisher: Arc<ReliablePublisher>,
    dispatched: DedupStore,
    queue: String,
    batch_size: usize,
    max_publish_concurrency: usize,
    priority: i32,
    concurrency_hint: usize,
}

impl Batcher {
    pub fn new(publisher: ReliablePublisher, dispatched: DedupStore, queue: &str) -> Self {
        Self {
            publisher: Arc::new(publisher),
            dispatched,
            queue: queue.to_owned(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_publish_concurrency: DEFAULT_MAX_PUBLISH_CONCURRENCY,
            priority: DEFAULT_PRIORITY,
            concurrency_hint: DEFAULT_CONCURRENCY_HINT,
        }
    }

    pub fn from_config(
        publisher: ReliablePublisher,
        dispatched: DedupStore,
        config: &Config,
    ) -> Self {
        Self::new(publisher, dispatched, config.queue_name.as_str())
            .batch_size(config.batch_size)
            .max_publish_concurrency(config.max_publish_concurrency)
            .priority(config.batch_priority)
            .concurrency_hint(config.worker_concurrency)
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn max_publish_concurrency(mut self, max_publish_concurrency: usize) -> Self {
        self.max_publish_concurrency = max_publish_concurrency.max(1);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn concurrency_hint(mut self, concurrency_hint: usize) -> Self {
        self.concurrency_hint = concurrency_hint.max(1);
        self
    }

    /// Dispatch `ids` onto the queue.
    ///
    /// Batch publish failures are reported through the returned counts. The only error is
    /// the dispatch store being unreachable, in which case nothing was published.
    ///
    /// Sends that already hold a publish permit run to completion even if this future is
    /// dropped. The claims of batches that never got a permit are released on drop.
    pub async fn schedule(
        &self,
        ids: &[MatchId],
        force: bool,
    ) -> Result<PublishResult, ScheduleError> {
        let start = Instant::now();
        let unique: Vec<MatchId> = ids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let initial_ids = ids.len();
        let unique_ids = unique.len();
        let operation_id = new_operation_id();

        let to_publish: Vec<MatchId> = if force {
            unique
        } else {
            self.dispatched.filter_new(&unique).await?.into_iter().collect()
        };
        let already_processed = unique_ids - to_publish.len();
        let claims = PendingClaims::new(
            (!force).then(|| self.dispatched.clone()),
            &operation_id,
            &to_publish,
        );

        if to_publish.is_empty() {
            info!(
                queue = %self.queue,
                initial_ids,
                already_processed,
                "no new match ids to schedule"
            );
            let mut result = PublishResult::empty(&self.queue, initial_ids, already_processed);
            result.duration_s = start.elapsed().as_secs_f64();
            return Ok(result);
        }

        let slices: Vec<&[MatchId]> = to_publish.chunks(self.batch_size).collect();
        let total_batches = slices.len();
        let payloads: Vec<BatchPayload> = slices
            .iter()
            .enumerate()
            .map(|(index, slice)| {
                BatchPayload::new(
                    &operation_id,
                    slice.to_vec(),
                    force,
                    batch_number(index + 1),
                    batch_number(total_batches),
                )
                .with_priority(self.priority)
                .with_concurrency_hint(self.concurrency_hint)
            })
            .collect();

        info!(
            queue = %self.queue,
            %operation_id,
            initial_ids,
            already_processed,
            ids_to_publish = to_publish.len(),
            batches = total_batches,
            force,
            "scheduling batches"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_publish_concurrency));
        let sends = payloads
            .into_iter()
            .map(|payload| self.publish_shielded(semaphore.clone(), payload, &claims));
        let outcomes = join_all(sends).await;
        claims.release_remaining().await;

        let mut ids_published = 0;
        let mut batches_failed = 0;
        for (slice, published) in slices.iter().zip(outcomes) {
            if published {
                ids_published += slice.len();
            } else {
                batches_failed += 1;
            }
        }

        let result = PublishResult {
            queue: self.queue.clone(),
            initial_ids,
            already_processed,
            ids_to_publish: to_publish.len(),
            ids_published,
            batches_created: total_batches,
            batches_failed,
            duration_s: start.elapsed().as_secs_f64(),
        };

        let labels = [("queue", self.queue.clone())];
        metrics::counter!("reprocess_scheduled_ids_total", &labels)
            .increment(ids_published as u64);
        metrics::counter!("reprocess_scheduled_batches_total", &labels)
            .increment(total_batches as u64);
        metrics::counter!("reprocess_scheduled_batches_failed_total", &labels)
            .increment(batches_failed as u64);
        metrics::histogram!("reprocess_schedule_duration_seconds", &labels)
            .record(result.duration_s);

        if batches_failed > 0 {
            warn!(
                queue = %self.queue,
                %operation_id,
                batches_failed,
                batches_created = total_batches,
                ids_published,
                "scheduling finished with failed batches"
            );
        } else {
            info!(
                queue = %self.queue,
                %operation_id,
                ids_published,
                batches_created = total_batches,
                duration_s = result.duration_s,
                "scheduling finished"
            );
        }

        Ok(result)
    }

    /// Returns whether the batch reached the channel.
    ///
    /// Once the permit is held the send task owns the batch's claims, and releases them
    /// itself if the publish fails.
    async fn publish_shielded(
        &self,
        semaphore: Arc<Semaphore>,
        payload: BatchPayload,
        claims: &PendingClaims,
    ) -> bool {
        let permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(error) => {
                error!(batch_id = %payload.batch_id, %error, "publish semaphore closed");
                return false;
            }
        };

        let store = claims.hand_over(&payload.ids);
        let publisher = self.publisher.clone();
        let queue = self.queue.clone();
        let batch_id = payload.batch_id.clone();
        let ids = payload.ids.clone();
        let task_store = store.clone();
        let handle = tokio::spawn(async move {
            let result = publisher.publish(&payload, &queue).await;
            if result.is_err() {
                if let Some(store) = task_store {
                    release_claims(&store, &payload.batch_id, &payload.ids).await;
                }
            }
            drop(permit);
            result
        });

        match handle.await {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                error!(%batch_id, %error, "batch publish failed");
                false
            }
            Err(error) => {
                error!(%batch_id, %error, "batch publish task did not complete");
                if let Some(store) = store {
                    release_claims(&store, &batch_id, &ids).await;
                }
                false
            }
        }
    }
}

/// Dispatch claims made by one `schedule` call for batches that no send task owns yet.
///
/// Whatever is still pending when this is dropped gets released on a spawned task.
struct PendingClaims {
    store: Option<DedupStore>,
    operation_id: String,
    ids: Mutex<BTreeSet<MatchId>>,
}

impl PendingClaims {
    /// `store` is `None` for forced runs, which claim nothing.
    fn new(store: Option<DedupStore>, operation_id: &str, ids: &[MatchId]) -> Self {
        let ids = match store {
            Some(_) => ids.iter().copied().collect(),
            None => BTreeSet::new(),
        };

        Self {
            store,
            operation_id: operation_id.to_owned(),
            ids: Mutex::new(ids),
        }
    }

    fn lock_ids(&self) -> MutexGuard<'_, BTreeSet<MatchId>> {
        match self.ids.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stop tracking `ids`, returning the store their new owner releases them from.
    fn hand_over(&self, ids: &[MatchId]) -> Option<DedupStore> {
        let mut pending = self.lock_ids();
        for id in ids {
            pending.remove(id);
        }

        self.store.clone()
    }

    fn take(&self) -> Vec<MatchId> {
        std::mem::take(&mut *self.lock_ids()).into_iter().collect()
    }

    async fn release_remaining(&self) {
        let ids = self.take();
        if let (Some(store), false) = (&self.store, ids.is_empty()) {
            release_claims(store, &self.operation_id, &ids).await;
        }
    }
}

impl Drop for PendingClaims {
    fn drop(&mut self) {
        let ids = self.take();
        let Some(store) = self.store.take() else {
            return;
        };
        if ids.is_empty() {
            return;
        }

        warn!(
            operation_id = %self.operation_id,
            ids = ids.len(),
            "scheduling dropped before every batch was sent, releasing unsent claims"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let operation_id = std::mem::take(&mut self.operation_id);
                runtime.spawn(async move {
                    release_claims(&store, &operation_id, &ids).await;
                });
            }
            Err(error) => {
                // Ids stay claimed until the key expires or a forced run dispatches them.
                error!(
                    operation_id = %self.operation_id,
                    ids = ids.len(),
                    %error,
                    "no runtime to release unsent claims on"
                );
            }
        }
    }
}

async fn release_claims(store: &DedupStore, id: &str, ids: &[MatchId]) {
    match store.release(ids).await {
        Ok(released) => {
            info!(id, released, "released dispatch claims of unpublished ids");
        }
        Err(error) => {
            // Ids stay claimed until the key expires or a forced run dispatches them.
            error!(id, ids = ids.len(), %error, "failed to release dispatch claims");
        }
    }
}

fn new_operation_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

fn batch_number(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
