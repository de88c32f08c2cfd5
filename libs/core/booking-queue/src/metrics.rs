//! Prometheus metrics for booking workers
//!
//! Provides observability into queue throughput, outcomes and latency.

use crate::processor::Outcome;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops. If another
/// recorder is already installed the exporter stays disabled and
/// `render_metrics` returns an empty string.
pub fn init_metrics() {
    let result = PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
    });

    if let Err(e) = result {
        warn!(error = %e, "Failed to install Prometheus recorder");
    }
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Booking worker metrics helper
#[derive(Clone)]
pub struct QueueMetrics {
    /// Processor name for labeling
    processor_name: String,
}

impl QueueMetrics {
    pub fn new(processor_name: impl Into<String>) -> Self {
        Self {
            processor_name: processor_name.into(),
        }
    }

    /// Record a received batch
    pub fn batch_received(&self, size: usize) {
        counter!(
            "booking_worker_messages_received_total",
            "processor" => self.processor_name.clone()
        )
        .increment(size as u64);

        histogram!(
            "booking_worker_batch_size",
            "processor" => self.processor_name.clone()
        )
        .record(size as f64);
    }

    /// Record the outcome of one message
    pub fn outcome(&self, outcome: Outcome) {
        counter!(
            "booking_worker_messages_processed_total",
            "processor" => self.processor_name.clone(),
            "outcome" => outcome.as_ref().to_string()
        )
        .increment(1);
    }

    /// Record the wall time of processing one batch
    pub fn batch_processed(&self, duration: Duration) {
        histogram!(
            "booking_worker_batch_duration_seconds",
            "processor" => self.processor_name.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record acknowledged messages
    pub fn acked(&self, count: usize) {
        counter!(
            "booking_worker_messages_acked_total",
            "processor" => self.processor_name.clone()
        )
        .increment(count as u64);
    }

    /// Record an ack that failed (the message will be redelivered)
    pub fn ack_failed(&self) {
        counter!(
            "booking_worker_ack_failures_total",
            "processor" => self.processor_name.clone()
        )
        .increment(1);
    }

    /// Record a message moved to the dead-letter sink
    pub fn dead_lettered(&self, reason: &str) {
        counter!(
            "booking_worker_messages_dead_lettered_total",
            "processor" => self.processor_name.clone(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    /// Record a failed queue call
    pub fn queue_error(&self, operation: &'static str) {
        counter!(
            "booking_worker_queue_errors_total",
            "processor" => self.processor_name.clone(),
            "operation" => operation
        )
        .increment(1);
    }

    /// Messages received and not yet settled
    pub fn in_flight(&self, delta: i64) {
        let gauge = gauge!(
            "booking_worker_messages_in_flight",
            "processor" => self.processor_name.clone()
        );
        if delta >= 0 {
            gauge.increment(delta as f64);
        } else {
            gauge.decrement(delta.unsigned_abs() as f64);
        }
    }

    /// Update the running workers gauge
    pub fn workers_running(&self, count: usize) {
        gauge!(
            "booking_worker_workers_running",
            "processor" => self.processor_name.clone()
        )
        .set(count as f64);
    }
}
