//! Booking Queue Worker
//!
//! Consumes booking requests from a FIFO queue and persists them into
//! Postgres with at-least-once delivery and idempotent writes.
//!
//! ## Features
//!
//! - **Queue clients**: managed SQS FIFO (`sqs` feature) or an in-process
//!   FIFO with the same group and visibility semantics
//! - **Batch processing**: chunked inserts keyed by `dedup_id`, poison rows
//!   isolated by bisection
//! - **Per-group ordering**: a group is never persisted out of order
//! - **Dead letters**: invalid, rejected and over-delivered messages
//! - **Worker pool**: N workers with graceful, time-bounded shutdown
//! - **Prometheus metrics** and health endpoints
//!
//! ## Example
//!
//! ```ignore
//! use booking_queue::{
//!     DatabaseBookingProcessor, InMemoryDeadLetterSink, LocalQueueClient, QueueConfig,
//!     Supervisor,
//! };
//!
//! let config = QueueConfig::local();
//! let queue = Arc::new(LocalQueueClient::new(&config));
//! let processor = Arc::new(DatabaseBookingProcessor::new(store));
//! let supervisor = Supervisor::new(config, queue, processor, Arc::new(InMemoryDeadLetterSink::new()));
//!
//! supervisor.start(4)?;
//! // ...
//! let report = supervisor.stop(Duration::from_secs(30)).await;
//! ```

pub mod client;
mod config;
mod dlq;
mod error;
mod health;
mod message;
pub mod metrics;
pub mod processor;
mod retry;
mod stats;
pub mod store;
mod supervisor;
mod worker;

pub use client::{EnqueueFailure, EnqueueReport, LocalQueueClient, ManagedQueueClient, QueueClient};
pub use config::{QueueConfig, MAX_RECEIVE_BATCH, MAX_VISIBILITY_TIMEOUT_SECS};
pub use dlq::{DeadLetterEntry, DeadLetterReason, DeadLetterSink, DeadLetterStats, InMemoryDeadLetterSink};
pub use error::{
    exponential_backoff_ms, ErrorCategory, ProcessError, QueueError, StoreError, SupervisorError,
};
pub use health::{health_router, HealthResponse, HealthState};
pub use message::{BookingMessage, BookingRequest, BookingStatus, ReceiptHandle};
pub use metrics::{init_metrics, QueueMetrics};
pub use processor::{BookingProcessor, DatabaseBookingProcessor, Outcome, ProcessResult};
pub use retry::{retry_with_backoff, RetryConfig};
pub use stats::{WorkerStats, WorkerStatsSnapshot};
pub use store::{BookingRow, BookingStore, InMemoryBookingStore, InsertReport};
pub use supervisor::{ShutdownReport, Supervisor, SupervisorStats, WorkerSnapshot};
pub use worker::{BookingWorker, WorkerState};

#[cfg(feature = "postgres")]
pub use dlq::PgDeadLetterSink;
#[cfg(feature = "postgres")]
pub use store::{connect, connect_with_retry, PgBookingStore};
#[cfg(feature = "sqs")]
pub use client::AwsSqsApi;
