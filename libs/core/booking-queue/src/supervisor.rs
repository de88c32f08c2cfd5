//! Worker pool lifecycle.
//!
//! The supervisor spawns N `BookingWorker`s over one queue client, shares a
//! single shutdown signal between them, and aggregates their stats.

use crate::client::QueueClient;
use crate::config::QueueConfig;
use crate::dlq::DeadLetterSink;
use crate::error::SupervisorError;
use crate::metrics::QueueMetrics;
use crate::processor::BookingProcessor;
use crate::stats::{WorkerStats, WorkerStatsSnapshot};
use crate::worker::{BookingWorker, WorkerState};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct WorkerHandle {
    worker_id: String,
    task: JoinHandle<()>,
    stats: Arc<WorkerStats>,
    state: watch::Receiver<WorkerState>,
}

struct Pool {
    workers: Vec<WorkerHandle>,
    shutdown: Option<watch::Sender<bool>>,
}

/// Per-worker entry of `SupervisorStats`
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub state: WorkerState,
    pub stats: WorkerStatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStats {
    pub running: bool,
    pub worker_count: usize,
    pub total: WorkerStatsSnapshot,
    pub workers: Vec<WorkerSnapshot>,
}

/// Outcome of `Supervisor::stop`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Workers that finished their batch and exited in time
    pub stopped: usize,
    /// Workers aborted after the timeout
    pub forced: usize,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.forced == 0
    }
}

pub struct Supervisor {
    config: QueueConfig,
    queue: Arc<dyn QueueClient>,
    processor: Arc<dyn BookingProcessor>,
    dead_letters: Arc<dyn DeadLetterSink>,
    metrics: QueueMetrics,
    pool: Mutex<Pool>,
}

impl Supervisor {
    pub fn new(
        config: QueueConfig,
        queue: Arc<dyn QueueClient>,
        processor: Arc<dyn BookingProcessor>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        let metrics = QueueMetrics::new(processor.name());
        Self {
            config,
            queue,
            processor,
            dead_letters,
            metrics,
            pool: Mutex::new(Pool {
                workers: Vec::new(),
                shutdown: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Spawn `count` workers on the current runtime.
    pub fn start(&self, count: usize) -> Result<(), SupervisorError> {
        if count == 0 {
            return Err(SupervisorError::NoWorkers);
        }

        let mut pool = self.lock();
        if pool.shutdown.is_some() {
            return Err(SupervisorError::AlreadyRunning(pool.workers.len()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for index in 0..count {
            let worker = BookingWorker::new(
                format!("worker-{index}"),
                self.config.clone(),
                Arc::clone(&self.queue),
                Arc::clone(&self.processor),
                Arc::clone(&self.dead_letters),
            );
            let worker_id = worker.worker_id().to_string();
            let stats = worker.stats();
            let state = worker.subscribe_state();
            let rx = shutdown_rx.clone();
            let task = tokio::spawn(async move { worker.run(rx).await });

            pool.workers.push(WorkerHandle {
                worker_id,
                task,
                stats,
                state,
            });
        }
        pool.shutdown = Some(shutdown_tx);
        self.metrics.workers_running(count);

        info!(
            workers = count,
            processor = %self.processor.name(),
            queue_url = %self.config.queue_url,
            "Booking workers started"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock().shutdown.is_some()
    }

    /// Signal every worker, wait up to `timeout` for in-flight batches, then
    /// abort what is left. Stopping an idle supervisor is a no-op.
    pub async fn stop(&self, timeout: Duration) -> ShutdownReport {
        let (workers, shutdown) = {
            let mut pool = self.lock();
            (std::mem::take(&mut pool.workers), pool.shutdown.take())
        };

        let Some(shutdown) = shutdown else {
            return ShutdownReport::default();
        };
        let _ = shutdown.send(true);
        info!(workers = workers.len(), timeout_secs = timeout.as_secs(), "Stopping booking workers");

        let deadline = tokio::time::Instant::now() + timeout;
        let mut report = ShutdownReport::default();

        for mut handle in workers {
            match tokio::time::timeout_at(deadline, &mut handle.task).await {
                Ok(Ok(())) => report.stopped += 1,
                Ok(Err(e)) => {
                    warn!(worker_id = %handle.worker_id, error = %e, "Worker task failed");
                    report.stopped += 1;
                }
                Err(_) => {
                    warn!(
                        worker_id = %handle.worker_id,
                        state = %*handle.state.borrow(),
                        "Worker did not drain in time, aborting"
                    );
                    handle.task.abort();
                    report.forced += 1;
                }
            }
        }

        self.metrics.workers_running(0);
        info!(stopped = report.stopped, forced = report.forced, "Booking workers stopped");
        report
    }

    pub fn get_stats(&self) -> SupervisorStats {
        let pool = self.lock();
        let workers: Vec<WorkerSnapshot> = pool
            .workers
            .iter()
            .map(|w| WorkerSnapshot {
                worker_id: w.worker_id.clone(),
                state: *w.state.borrow(),
                stats: w.stats.snapshot(),
            })
            .collect();

        SupervisorStats {
            running: pool.shutdown.is_some(),
            worker_count: workers.len(),
            total: WorkerStatsSnapshot::aggregate(workers.iter().map(|w| &w.stats)),
            workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LocalQueueClient;
    use crate::dlq::InMemoryDeadLetterSink;
    use crate::message::BookingMessage;
    use crate::processor::{DatabaseBookingProcessor, ProcessResult};
    use crate::store::InMemoryBookingStore;
    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    fn config() -> QueueConfig {
        QueueConfig::local()
            .with_poll_wait_seconds(0)
            .with_empty_backoff_ms(5, 20)
    }

    fn supervisor(store: InMemoryBookingStore) -> (Supervisor, Arc<LocalQueueClient>) {
        let queue = Arc::new(LocalQueueClient::new(&config()));
        let supervisor = Supervisor::new(
            config(),
            queue.clone(),
            Arc::new(DatabaseBookingProcessor::new(store)),
            Arc::new(InMemoryDeadLetterSink::new()),
        );
        (supervisor, queue)
    }

    fn booking(group: &str) -> BookingMessage {
        let id = Uuid::new_v4();
        BookingMessage::new(
            id.to_string(),
            group,
            json!({
                "booking_id": id,
                "user_id": "u",
                "service_id": "s",
                "booking_time": "2026-10-20T09:00:00Z"
            }),
        )
    }

    #[tokio::test]
    async fn test_start_rejects_zero_workers() {
        let (supervisor, _) = supervisor(InMemoryBookingStore::new());
        assert_eq!(supervisor.start(0), Err(SupervisorError::NoWorkers));
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (supervisor, _) = supervisor(InMemoryBookingStore::new());
        supervisor.start(2).unwrap();
        assert_eq!(supervisor.start(1), Err(SupervisorError::AlreadyRunning(2)));

        let report = supervisor.stop(Duration::from_secs(2)).await;
        assert_eq!(report, ShutdownReport { stopped: 2, forced: 0 });
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let (supervisor, _) = supervisor(InMemoryBookingStore::new());
        assert_eq!(supervisor.stop(Duration::from_millis(10)).await, ShutdownReport::default());
    }

    #[tokio::test]
    async fn test_stats_aggregate_across_workers() {
        let store = InMemoryBookingStore::new();
        let (supervisor, queue) = supervisor(store.clone());
        let batch: Vec<_> = (0..40).map(|i| booking(&format!("g{}", i % 8))).collect();
        queue.enqueue(batch).await.unwrap();

        supervisor.start(3).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.len() < 40 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let stats = supervisor.get_stats();
        assert!(stats.running);
        assert_eq!(stats.worker_count, 3);
        assert_eq!(stats.total.processed_count, 40);
        assert_eq!(
            stats.total.processed_count,
            stats.workers.iter().map(|w| w.stats.processed_count).sum::<u64>()
        );

        supervisor.stop(Duration::from_secs(2)).await;
        // Restart after stop is allowed
        supervisor.start(1).unwrap();
        supervisor.stop(Duration::from_secs(2)).await;
    }

    struct StuckProcessor;

    #[async_trait]
    impl BookingProcessor for StuckProcessor {
        async fn process_batch(&self, messages: &[BookingMessage]) -> Vec<ProcessResult> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            messages.iter().cloned().map(ProcessResult::success).collect()
        }

        fn name(&self) -> &'static str {
            "stuck"
        }
    }

    #[tokio::test]
    async fn test_stop_aborts_worker_past_timeout() {
        let queue = Arc::new(LocalQueueClient::new(&config()));
        let supervisor = Supervisor::new(
            config(),
            queue.clone(),
            Arc::new(StuckProcessor),
            Arc::new(InMemoryDeadLetterSink::new()),
        );
        queue.enqueue(vec![booking("a")]).await.unwrap();
        supervisor.start(2).unwrap();

        while queue.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let report = supervisor.stop(Duration::from_millis(200)).await;
        assert_eq!(report, ShutdownReport { stopped: 1, forced: 1 });
        assert!(!report.is_clean());
        // Unacked message stays in the queue for redelivery
        assert_eq!(queue.len(), 1);
    }
}
