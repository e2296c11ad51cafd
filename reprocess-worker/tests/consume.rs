use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use reprocess_common::channel::{Channel, Delivery, MemoryChannel, Outcome};
use reprocess_common::dedup::DedupStore;
use reprocess_common::payload::{BatchPayload, MatchId};
use reprocess_common::queues::PROCESS_MATCH_BATCH;
use reprocess_common::redis::MockRedisClient;
use reprocess_worker::breaker::{BreakerState, CircuitBreaker};
use reprocess_worker::chunk::ChunkProcessor;
use reprocess_worker::consumer::BatchConsumer;
use reprocess_worker::error::{BatchError, WorkerError};
use reprocess_worker::manager::{ManagerSettings, ManagerState, WorkerManager};
use reprocess_worker::processor::{MatchProcessor, ProcessError};
use reprocess_worker::stats::WorkerMetrics;

const PROCESSED: &str = "processed:match_ids";

#[derive(Default)]
struct FakeProcessor {
    /// Chunks containing any of these ids are always rejected.
    reject: HashSet<MatchId>,
    /// Chunks containing any of these ids are rejected the first time only.
    reject_once: Mutex<HashSet<MatchId>>,
    hang: bool,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: Mutex<Vec<Vec<MatchId>>>,
}

impl FakeProcessor {
    fn rejecting(ids: &[MatchId]) -> Arc<Self> {
        Arc::new(Self {
            reject: ids.iter().copied().collect(),
            ..Default::default()
        })
    }

    fn rejecting_once(ids: &[MatchId]) -> Arc<Self> {
        Arc::new(Self {
            reject_once: Mutex::new(ids.iter().copied().collect()),
            ..Default::default()
        })
    }

    fn hanging() -> Arc<Self> {
        Arc::new(Self {
            hang: true,
            ..Default::default()
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn calls(&self) -> Vec<Vec<MatchId>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MatchProcessor for FakeProcessor {
    async fn process(&self, ids: &[MatchId], _force: bool) -> Result<(), ProcessError> {
        self.calls.lock().unwrap().push(ids.to_vec());
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.delay {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        if ids.iter().any(|id| self.reject.contains(id)) {
            return Err(ProcessError::Validation("rejected".to_owned()));
        }
        let mut once = self.reject_once.lock().unwrap();
        if ids.iter().any(|id| once.contains(id)) {
            once.clear();
            return Err(ProcessError::Validation("rejected once".to_owned()));
        }
        Ok(())
    }
}

fn consumer(processor: Arc<FakeProcessor>, redis: &MockRedisClient, chunk_size: usize) -> BatchConsumer {
    let processed = DedupStore::new(Arc::new(redis.clone()), PROCESSED);
    let chunks = ChunkProcessor::new(processor, processed);
    let breaker = CircuitBreaker::new("test", 5, Duration::from_secs(60));

    BatchConsumer::new(chunks, breaker, Arc::new(WorkerMetrics::new())).chunk_size(chunk_size)
}

fn settings() -> ManagerSettings {
    ManagerSettings {
        queue: PROCESS_MATCH_BATCH.to_owned(),
        connect_max_attempts: 3,
        connect_retry_delay: Duration::from_millis(100),
        graceful_shutdown_timeout: Duration::from_secs(1),
        health_check_interval: Duration::from_secs(30),
        trap_signals: false,
    }
}

fn delivery(payload: &BatchPayload) -> Delivery {
    Delivery {
        queue: PROCESS_MATCH_BATCH.to_owned(),
        payload: payload.encode().unwrap(),
        partition: 0,
        offset: 1,
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition was not reached in time");
}

#[tokio::test]
async fn test_partial_failure_marks_only_successful_chunks() {
    let processor = FakeProcessor::rejecting(&[4]);
    let redis = MockRedisClient::new();
    let consumer = consumer(processor.clone(), &redis, 2);
    let payload = BatchPayload::new("op", vec![1, 2, 3, 4, 5, 6], false, 1, 1);

    let err = consumer.process_batch(&payload).await.unwrap_err();

    assert!(matches!(
        err,
        BatchError::PartialFailure {
            failed: 1,
            total: 3
        }
    ));
    assert_eq!(redis.members(PROCESSED), [1, 2, 5, 6].into_iter().collect());
    assert_eq!(processor.calls().len(), 3);

    let snapshot = consumer.metrics().snapshot();
    assert_eq!(snapshot.batches_failed, 1);
    assert_eq!(snapshot.items_failed, 2);
}

#[tokio::test]
async fn test_partial_failure_nacks_delivery() {
    let processor = FakeProcessor::rejecting(&[1]);
    let consumer = consumer(processor, &MockRedisClient::new(), 100);
    let payload = BatchPayload::new("op", vec![1, 2], false, 1, 1);

    assert_eq!(consumer.handle(&delivery(&payload)).await, Outcome::Nack);
}

#[tokio::test]
async fn test_open_breaker_fails_batch_without_touching_chunks() {
    let processor = FakeProcessor::rejecting(&[]);
    let consumer = consumer(processor.clone(), &MockRedisClient::new(), 2);
    for _ in 0..5 {
        consumer.breaker().acquire().unwrap().failure();
    }
    assert_eq!(consumer.breaker().state().state, BreakerState::Open);

    let payload = BatchPayload::new("op", vec![1, 2, 3], false, 1, 1);
    let err = consumer.process_batch(&payload).await.unwrap_err();

    assert!(matches!(err, BatchError::CircuitOpen(_)));
    assert!(processor.calls().is_empty());
    assert_eq!(consumer.handle(&delivery(&payload)).await, Outcome::Nack);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_hint_bounds_chunks_in_flight() {
    let processor = FakeProcessor::slow(Duration::from_millis(100));
    let redis = MockRedisClient::new();
    let consumer = consumer(processor.clone(), &redis, 1);
    let payload =
        BatchPayload::new("op", vec![1, 2, 3, 4, 5, 6], false, 1, 1).with_concurrency_hint(2);

    let report = consumer.process_batch(&payload).await.unwrap();

    assert_eq!(report.chunks, 6);
    assert_eq!(report.items_processed, 6);
    assert_eq!(processor.calls().len(), 6);
    assert_eq!(processor.peak(), 2);
}

#[tokio::test]
async fn test_repeated_ids_are_processed_once() {
    let processor = FakeProcessor::rejecting(&[]);
    let redis = MockRedisClient::new();
    let consumer = consumer(processor.clone(), &redis, 100);
    let payload = BatchPayload::new("op", vec![8, 9, 8], false, 1, 1);

    assert_eq!(consumer.handle(&delivery(&payload)).await, Outcome::Ack);
    assert_eq!(processor.calls(), vec![vec![8, 9]]);
    assert_eq!(redis.members(PROCESSED), [8, 9].into_iter().collect());
}

#[tokio::test]
async fn test_malformed_and_empty_payloads_are_acked() {
    let processor = FakeProcessor::rejecting(&[]);
    let consumer = consumer(processor.clone(), &MockRedisClient::new(), 2);

    let mut malformed = delivery(&BatchPayload::new("op", vec![1], false, 1, 1));
    malformed.payload = b"{\"ids\": \"nope\"}".to_vec();
    assert_eq!(consumer.handle(&malformed).await, Outcome::Ack);

    let empty = BatchPayload::new("op", vec![], false, 1, 1);
    assert_eq!(consumer.handle(&delivery(&empty)).await, Outcome::Ack);

    assert!(processor.calls().is_empty());
    let snapshot = consumer.metrics().snapshot();
    assert_eq!(snapshot.batches_processed, 1);
    assert_eq!(snapshot.items_processed, 0);
}

#[tokio::test]
async fn test_redelivered_batch_only_processes_what_is_left() {
    let channel = MemoryChannel::new();
    let redis = MockRedisClient::new();
    let processor = FakeProcessor::rejecting_once(&[3]);
    let manager = Arc::new(WorkerManager::new(
        Arc::new(channel.clone()),
        consumer(processor.clone(), &redis, 2),
        settings(),
    ));

    let payload = BatchPayload::new("op", vec![1, 2, 3, 4], false, 1, 1);
    channel.inject(PROCESS_MATCH_BATCH, payload.encode().unwrap());

    let running = manager.clone();
    let handle = tokio::spawn(async move { running.run().await });

    wait_until(|| channel.acked() == 1).await;
    assert_eq!(channel.nacked(), 1);
    assert_eq!(redis.members(PROCESSED), [1, 2, 3, 4].into_iter().collect());

    let mut calls = processor.calls();
    calls.sort();
    // [1, 2] and [3, 4] on the first delivery, then only [3, 4] again.
    assert_eq!(calls, vec![vec![1, 2], vec![3, 4], vec![3, 4]]);

    manager.shutdown_token().cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(manager.state(), ManagerState::Stopped);
    assert!(!channel.is_connected());
}

#[tokio::test]
async fn test_manager_consumes_until_stopped() {
    let channel = MemoryChannel::new();
    let redis = MockRedisClient::new();
    let processor = FakeProcessor::rejecting(&[]);
    let manager = Arc::new(WorkerManager::new(
        Arc::new(channel.clone()),
        consumer(processor.clone(), &redis, 2),
        settings(),
    ));
    assert_eq!(manager.state(), ManagerState::Created);

    let running = manager.clone();
    let handle = tokio::spawn(async move { running.run().await });
    wait_until(|| manager.state() == ManagerState::Running).await;

    for (number, ids) in [vec![10, 11], vec![12, 13]].into_iter().enumerate() {
        let payload = BatchPayload::new("op", ids, false, number as u32 + 1, 2);
        channel.send(PROCESS_MATCH_BATCH, &payload.encode().unwrap()).await.unwrap();
    }

    wait_until(|| channel.acked() == 2).await;
    assert_eq!(redis.members(PROCESSED), [10, 11, 12, 13].into_iter().collect());
    assert_eq!(manager.consumer().metrics().snapshot().items_processed, 4);

    manager.shutdown_token().cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(manager.state(), ManagerState::Stopped);

    // A manager only runs once.
    assert!(matches!(
        manager.run().await,
        Err(WorkerError::InvalidState(ManagerState::Stopped))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_connect_gives_up_after_attempts() {
    let channel = MemoryChannel::new();
    channel.close().await;
    let manager = WorkerManager::new(
        Arc::new(channel.clone()),
        consumer(FakeProcessor::rejecting(&[]), &MockRedisClient::new(), 2),
        settings(),
    );

    let err = manager.run().await.unwrap_err();

    assert!(matches!(err, WorkerError::Connect { attempts: 3, .. }));
    assert_eq!(manager.state(), ManagerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_aborts_after_graceful_timeout() {
    let channel = MemoryChannel::new();
    let processor = FakeProcessor::hanging();
    let manager = Arc::new(WorkerManager::new(
        Arc::new(channel.clone()),
        consumer(processor.clone(), &MockRedisClient::new(), 2),
        settings(),
    ));

    let payload = BatchPayload::new("op", vec![7], false, 1, 1);
    channel.inject(PROCESS_MATCH_BATCH, payload.encode().unwrap());

    let running = manager.clone();
    let handle = tokio::spawn(async move { running.run().await });
    wait_until(|| !processor.calls().is_empty()).await;

    let start = tokio::time::Instant::now();
    manager.shutdown_token().cancel();
    handle.await.unwrap().unwrap();

    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(manager.state(), ManagerState::Stopped);
    assert_eq!(channel.acked() + channel.nacked(), 0);
}
