//! Worker counters
//!
//! Each worker owns a `WorkerStats` updated with relaxed atomics; readers
//! take a `WorkerStatsSnapshot` and the supervisor folds snapshots into an
//! aggregate.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct WorkerStats {
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    duplicates: AtomicU64,
    acked: AtomicU64,
    dead_lettered: AtomicU64,
    ack_failures: AtomicU64,
    queue_errors: AtomicU64,
    batches_handled: AtomicU64,
    last_batch_latency_ms: AtomicU64,
    /// Epoch millis, 0 when no batch has completed
    last_batch_at_ms: AtomicI64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, count: usize) {
        self.received.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Written now or already present
    pub fn record_processed(&self, duplicate: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if duplicate {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack_failure(&self) {
        self.ack_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_error(&self) {
        self.queue_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self, latency: Duration) {
        self.batches_handled.fetch_add(1, Ordering::Relaxed);
        self.last_batch_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
        self.last_batch_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        let last_batch_at_ms = self.last_batch_at_ms.load(Ordering::Relaxed);
        WorkerStatsSnapshot {
            received_count: self.received.load(Ordering::Relaxed),
            processed_count: self.processed.load(Ordering::Relaxed),
            failed_count: self.failed.load(Ordering::Relaxed),
            retried_count: self.retried.load(Ordering::Relaxed),
            duplicate_count: self.duplicates.load(Ordering::Relaxed),
            acked_count: self.acked.load(Ordering::Relaxed),
            dead_lettered_count: self.dead_lettered.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            queue_errors: self.queue_errors.load(Ordering::Relaxed),
            batches_handled: self.batches_handled.load(Ordering::Relaxed),
            last_batch_latency_ms: self.last_batch_latency_ms.load(Ordering::Relaxed),
            last_batch_at: (last_batch_at_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_batch_at_ms).single())
                .flatten(),
        }
    }
}

/// Point-in-time copy of `WorkerStats`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub received_count: u64,
    /// `Success` and `AlreadyApplied` outcomes
    pub processed_count: u64,
    /// `PermanentFailure` outcomes
    pub failed_count: u64,
    /// `RetryableFailure` outcomes
    pub retried_count: u64,
    pub duplicate_count: u64,
    pub acked_count: u64,
    pub dead_lettered_count: u64,
    pub ack_failures: u64,
    pub queue_errors: u64,
    pub batches_handled: u64,
    pub last_batch_latency_ms: u64,
    pub last_batch_at: Option<DateTime<Utc>>,
}

impl WorkerStatsSnapshot {
    /// Fold `other` in: counters add up, latency keeps the max, timestamp the latest
    pub fn merge(&mut self, other: &WorkerStatsSnapshot) {
        self.received_count += other.received_count;
        self.processed_count += other.processed_count;
        self.failed_count += other.failed_count;
        self.retried_count += other.retried_count;
        self.duplicate_count += other.duplicate_count;
        self.acked_count += other.acked_count;
        self.dead_lettered_count += other.dead_lettered_count;
        self.ack_failures += other.ack_failures;
        self.queue_errors += other.queue_errors;
        self.batches_handled += other.batches_handled;
        self.last_batch_latency_ms = self.last_batch_latency_ms.max(other.last_batch_latency_ms);
        self.last_batch_at = self.last_batch_at.max(other.last_batch_at);
    }

    pub fn aggregate<'a>(snapshots: impl IntoIterator<Item = &'a WorkerStatsSnapshot>) -> Self {
        let mut total = Self::default();
        for snapshot in snapshots {
            total.merge(snapshot);
        }
        total
    }
}
