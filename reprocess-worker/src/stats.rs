use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

#[derive(Default)]
struct Counters {
    batches_processed: u64,
    batches_failed: u64,
    items_processed: u64,
    items_failed: u64,
    total_processing_time: Duration,
    average_batch_size: f64,
    last_activity: Option<DateTime<Utc>>,
}

impl Counters {
    fn update_average(&mut self, size: usize) {
        let total = self.batches_processed + self.batches_failed;
        if total > 0 {
            self.average_batch_size += (size as f64 - self.average_batch_size) / total as f64;
        }
    }
}

/// Process-lifetime totals for the batches this worker consumed.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub batches_processed: u64,
    pub batches_failed: u64,
    pub items_processed: u64,
    pub items_failed: u64,
    pub success_rate_pct: f64,
    pub avg_processing_time_s: f64,
    pub avg_batch_size: f64,
    pub last_activity: Option<DateTime<Utc>>,
    pub uptime_s: f64,
}

pub struct WorkerMetrics {
    started: Instant,
    counters: Mutex<Counters>,
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    fn lock_counters(&self) -> MutexGuard<'_, Counters> {
        match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record_batch_start(&self) {
        self.lock_counters().last_activity = Some(Utc::now());
    }

    pub fn record_success(&self, size: usize, elapsed: Duration) {
        let mut counters = self.lock_counters();
        counters.batches_processed += 1;
        counters.items_processed += size as u64;
        counters.total_processing_time += elapsed;
        counters.update_average(size);
        drop(counters);

        metrics::counter!("reprocess_worker_batches_processed_total").increment(1);
        metrics::counter!("reprocess_worker_items_processed_total").increment(size as u64);
        metrics::histogram!("reprocess_worker_batch_duration_seconds").record(elapsed.as_secs_f64());
    }

    pub fn record_failure(&self, size: usize, failed_items: usize) {
        let mut counters = self.lock_counters();
        counters.batches_failed += 1;
        counters.items_failed += failed_items as u64;
        counters.update_average(size);
        drop(counters);

        metrics::counter!("reprocess_worker_batches_failed_total").increment(1);
        metrics::counter!("reprocess_worker_items_failed_total").increment(failed_items as u64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.lock_counters();
        let total_batches = counters.batches_processed + counters.batches_failed;

        MetricsSnapshot {
            batches_processed: counters.batches_processed,
            batches_failed: counters.batches_failed,
            items_processed: counters.items_processed,
            items_failed: counters.items_failed,
            success_rate_pct: if total_batches > 0 {
                round_to(counters.batches_processed as f64 / total_batches as f64 * 100.0, 2)
            } else {
                100.0
            },
            avg_processing_time_s: if counters.batches_processed > 0 {
                round_to(
                    counters.total_processing_time.as_secs_f64() / counters.batches_processed as f64,
                    3,
                )
            } else {
                0.0
            },
            avg_batch_size: round_to(counters.average_batch_size, 1),
            last_activity: counters.last_activity,
            uptime_s: round_to(self.started.elapsed().as_secs_f64(), 1),
        }
    }
}

fn round_to(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    #[test]
    fn test_empty_snapshot() {
        let snapshot = WorkerMetrics::new().snapshot();

        assert_eq!(snapshot.success_rate_pct, 100.0);
        assert_eq!(snapshot.avg_processing_time_s, 0.0);
        assert_eq!(snapshot.avg_batch_size, 0.0);
        assert!(snapshot.last_activity.is_none());
    }

    #[test]
    fn test_snapshot_aggregates_batches() {
        let metrics = WorkerMetrics::new();
        metrics.record_batch_start();
        metrics.record_success(10, Duration::from_millis(1500));
        metrics.record_success(20, Duration::from_millis(500));
        metrics.record_failure(30, 10);

        let snapshot = metrics.snapshot();
        assert!(snapshot.last_activity.is_some());
        assert_json_include!(
            actual: serde_json::to_value(&snapshot).unwrap(),
            expected: json!({
                "batches_processed": 2,
                "batches_failed": 1,
                "items_processed": 30,
                "items_failed": 10,
                "success_rate_pct": 66.67,
                "avg_processing_time_s": 1.0,
                "avg_batch_size": 20.0
            })
        );
    }
}
