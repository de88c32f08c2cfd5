//! The booking worker loop.
//!
//! ```text
//! Idle -> Polling -> Processing -> Acking -> Idle
//!            \            \
//!             \----------- Draining -> Stopped   (shutdown signal)
//! ```
//!
//! Each iteration makes one blocking `receive_batch` call, processes the
//! batch while renewing its visibility lease, then settles every message:
//! ack what was persisted, nack (or let expire) what can be retried, and
//! dead-letter what never will be. A message is acked only after its row is
//! durable or its dead-letter entry is stored.

use crate::client::QueueClient;
use crate::config::QueueConfig;
use crate::dlq::{DeadLetterEntry, DeadLetterReason, DeadLetterSink};
use crate::error::{exponential_backoff_ms, ErrorCategory, ProcessError};
use crate::message::BookingMessage;
use crate::metrics::QueueMetrics;
use crate::processor::{BookingProcessor, Outcome, ProcessResult};
use crate::stats::WorkerStats;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Polling,
    Processing,
    Acking,
    /// Shutdown requested; finishing the in-flight batch
    Draining,
    Stopped,
}

/// One worker loop over a shared queue, processor and dead-letter sink
pub struct BookingWorker {
    worker_id: String,
    config: QueueConfig,
    queue: Arc<dyn QueueClient>,
    processor: Arc<dyn BookingProcessor>,
    dead_letters: Arc<dyn DeadLetterSink>,
    stats: Arc<WorkerStats>,
    metrics: QueueMetrics,
    state: watch::Sender<WorkerState>,
}

impl BookingWorker {
    pub fn new(
        worker_id: impl Into<String>,
        config: QueueConfig,
        queue: Arc<dyn QueueClient>,
        processor: Arc<dyn BookingProcessor>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        let metrics = QueueMetrics::new(processor.name());
        let (state, _) = watch::channel(WorkerState::Idle);

        Self {
            worker_id: worker_id.into(),
            config,
            queue,
            processor,
            dead_letters,
            stats: Arc::new(WorkerStats::new()),
            metrics,
            state,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Follow state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_if_modified(|current| {
            // Draining only leads to Stopped
            if *current == state || (*current == WorkerState::Draining && state != WorkerState::Stopped) {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Run until `shutdown` becomes `true` (or its sender is dropped).
    ///
    /// Receive errors are retried forever with exponential backoff; an
    /// in-flight batch is always finished before the worker stops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.worker_id,
            processor = %self.processor.name(),
            batch_size = self.config.batch_size,
            visibility_timeout_secs = self.config.visibility_timeout_seconds,
            max_receive_count = self.config.max_receive_count,
            "Starting booking worker"
        );

        let mut consecutive_errors: u32 = 0;
        let mut empty_polls: u32 = 0;
        let mut store_outages: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(WorkerState::Polling);
            let received = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                received = self.queue.receive_batch(self.config.batch_size, self.config.poll_wait()) => received,
            };

            match received {
                Ok(batch) if batch.is_empty() => {
                    consecutive_errors = 0;
                    let delay = Duration::from_millis(exponential_backoff_ms(
                        self.config.empty_backoff_initial_ms,
                        self.config.empty_backoff_max_ms,
                        empty_polls,
                    ));
                    empty_polls = empty_polls.saturating_add(1);
                    debug!(worker_id = %self.worker_id, backoff_ms = delay.as_millis() as u64, "No messages");

                    self.set_state(WorkerState::Idle);
                    if self.sleep_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                }
                Ok(batch) => {
                    if consecutive_errors > 0 {
                        info!(
                            worker_id = %self.worker_id,
                            consecutive_errors,
                            "Queue recovered"
                        );
                    }
                    consecutive_errors = 0;
                    empty_polls = 0;

                    let store_down = self.handle_batch(batch, &mut shutdown).await;
                    self.set_state(WorkerState::Idle);

                    if store_down {
                        let delay = Duration::from_millis(exponential_backoff_ms(
                            self.config.store_backoff_initial_ms,
                            self.config.store_backoff_max_ms,
                            store_outages,
                        ));
                        store_outages = store_outages.saturating_add(1);
                        warn!(
                            worker_id = %self.worker_id,
                            store_outages,
                            backoff_ms = delay.as_millis() as u64,
                            "Store unavailable, backing off"
                        );
                        if self.sleep_or_shutdown(delay, &mut shutdown).await {
                            break;
                        }
                    } else if store_outages > 0 {
                        info!(worker_id = %self.worker_id, store_outages, "Store recovered");
                        store_outages = 0;
                    }
                }
                Err(e) => {
                    let delay = ErrorCategory::Transient.backoff_delay(consecutive_errors);
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    self.stats.record_queue_error();
                    self.metrics.queue_error("receive");
                    warn!(
                        worker_id = %self.worker_id,
                        error = %e,
                        consecutive_errors,
                        backoff_ms = delay.as_millis() as u64,
                        "Receive failed, backing off"
                    );

                    self.set_state(WorkerState::Idle);
                    if self.sleep_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        self.set_state(WorkerState::Draining);
        self.set_state(WorkerState::Stopped);
        info!(worker_id = %self.worker_id, "Booking worker stopped");
    }

    /// Returns `true` if shutdown was requested during the sleep
    async fn sleep_or_shutdown(&self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = wait_for_shutdown(shutdown) => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    /// Process and settle one received batch.
    ///
    /// Returns `true` when every processed message failed only because the
    /// store was unreachable.
    pub async fn handle_batch(&self, batch: Vec<BookingMessage>, shutdown: &mut watch::Receiver<bool>) -> bool {
        let started = Instant::now();
        let received = batch.len() as i64;
        self.stats.record_received(batch.len());
        self.metrics.batch_received(batch.len());
        self.metrics.in_flight(received);
        self.set_state(WorkerState::Processing);

        let (expired, live): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .partition(|m| m.exceeded_max_receives(self.config.max_receive_count));

        for message in &expired {
            warn!(
                worker_id = %self.worker_id,
                message_id = %message.message_id,
                receive_count = message.receive_count,
                "Receive limit exceeded"
            );
            let error = format!(
                "received {} times, limit is {}",
                message.receive_count, self.config.max_receive_count
            );
            self.dead_letter(message, DeadLetterReason::MaxReceivesExceeded, error)
                .await;
        }

        let mut store_down = false;
        if !live.is_empty() {
            let processed = self.process_with_lease(&live, shutdown).await;
            let results = match_results(live, processed);
            store_down = results.iter().all(ProcessResult::is_store_outage);
            self.set_state(WorkerState::Acking);

            for result in results {
                self.settle(result).await;
            }
        }

        let elapsed = started.elapsed();
        self.metrics.in_flight(-received);
        self.stats.record_batch(elapsed);
        self.metrics.batch_processed(elapsed);
        store_down
    }

    /// Run the processor, extending visibility every half window until it returns.
    async fn process_with_lease(
        &self,
        messages: &[BookingMessage],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Vec<ProcessResult> {
        let processing = AssertUnwindSafe(self.processor.process_batch(messages)).catch_unwind();
        tokio::pin!(processing);

        let interval = self.config.visibility_extend_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        let mut draining = *shutdown.borrow();

        loop {
            tokio::select! {
                outcome = &mut processing => {
                    return match outcome {
                        Ok(results) => results,
                        Err(_) => {
                            error!(
                                worker_id = %self.worker_id,
                                batch_size = messages.len(),
                                "Processor panicked, batch will be retried"
                            );
                            messages
                                .iter()
                                .map(|m| ProcessResult::from_error(
                                    m.clone(),
                                    ProcessError::Internal("processor panicked".into()),
                                ))
                                .collect()
                        }
                    };
                }
                _ = ticker.tick() => self.extend_leases(messages).await,
                _ = shutdown.changed(), if !draining => {
                    draining = true;
                    info!(worker_id = %self.worker_id, "Shutdown requested, draining in-flight batch");
                    self.set_state(WorkerState::Draining);
                }
            }
        }
    }

    async fn extend_leases(&self, messages: &[BookingMessage]) {
        for message in messages {
            let Some(handle) = &message.receipt_handle else {
                continue;
            };
            if let Err(e) = self
                .queue
                .extend_visibility(handle, self.config.visibility_timeout_seconds)
                .await
            {
                // The message may be redelivered; its write stays idempotent
                debug!(message_id = %message.message_id, error = %e, "Visibility extension failed");
            }
        }
    }

    async fn settle(&self, result: ProcessResult) {
        self.metrics.outcome(result.outcome);

        if result.outcome.should_ack() {
            self.stats
                .record_processed(result.outcome == Outcome::AlreadyApplied);
            self.ack(&result.message).await;
        } else if result.outcome == Outcome::RetryableFailure {
            self.stats.record_retried();
            debug!(
                message_id = %result.message.message_id,
                receive_count = result.message.receive_count,
                error = %result.error_message(),
                "Retryable failure"
            );
            // Without a nack the message reappears once its lease expires
            if self.config.nack_on_retryable {
                if let Some(handle) = &result.message.receipt_handle {
                    if let Err(e) = self.queue.nack(handle).await {
                        debug!(message_id = %result.message.message_id, error = %e, "Nack failed, waiting for visibility timeout");
                    }
                }
            }
        } else {
            self.stats.record_failed();
            let reason = match result.error {
                Some(ProcessError::Validation(_)) => DeadLetterReason::ValidationFailed,
                _ => DeadLetterReason::Rejected,
            };
            let error = result.error_message();
            self.dead_letter(&result.message, reason, error).await;
        }
    }

    /// Dead-letter then ack. A failed dead-letter write leaves the message for redelivery.
    async fn dead_letter(&self, message: &BookingMessage, reason: DeadLetterReason, error: String) {
        let entry = DeadLetterEntry::new(message, reason, error);

        match self.dead_letters.send(&entry).await {
            Ok(()) => {
                self.stats.record_dead_lettered();
                self.metrics.dead_lettered(reason.as_ref());
                info!(
                    worker_id = %self.worker_id,
                    message_id = %message.message_id,
                    dedup_id = %message.dedup_id,
                    reason = %reason,
                    "Message dead-lettered"
                );
                self.ack(message).await;
            }
            Err(e) => {
                error!(
                    worker_id = %self.worker_id,
                    message_id = %message.message_id,
                    error = %e,
                    "Dead-letter write failed, message left for redelivery"
                );
            }
        }
    }

    async fn ack(&self, message: &BookingMessage) {
        let Some(handle) = &message.receipt_handle else {
            warn!(message_id = %message.message_id, "Message without receipt handle, cannot ack");
            return;
        };

        match self.queue.ack(handle).await {
            Ok(()) => {
                self.stats.record_acked();
                self.metrics.acked(1);
            }
            Err(e) => {
                self.stats.record_ack_failure();
                self.metrics.ack_failed();
                warn!(
                    message_id = %message.message_id,
                    error = %e,
                    "Ack failed, message may be redelivered"
                );
            }
        }
    }
}

/// Resolves once shutdown is `true` or the sender is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Pair each message with its result; messages the processor skipped are retryable.
fn match_results(messages: Vec<BookingMessage>, results: Vec<ProcessResult>) -> Vec<ProcessResult> {
    let mut by_id: HashMap<String, ProcessResult> = results
        .into_iter()
        .map(|r| (r.message.message_id.clone(), r))
        .collect();

    messages
        .into_iter()
        .map(|message| match by_id.remove(&message.message_id) {
            // Keep the delivered copy so its receipt handle is the one settled
            Some(result) => ProcessResult { message, ..result },
            None => ProcessResult::from_error(
                message,
                ProcessError::Internal("processor returned no result".into()),
            ),
        })
        .collect()
}
