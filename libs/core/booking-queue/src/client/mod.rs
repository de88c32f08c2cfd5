//! Queue client abstraction
//!
//! A `QueueClient` is a FIFO queue partitioned by `group_key` with
//! at-least-once delivery:
//!
//! - within a group, messages are delivered in enqueue order and a second
//!   message of a group is not delivered while an earlier one is in flight;
//! - a received message stays hidden for the visibility timeout and becomes
//!   deliverable again (with `receive_count + 1`) unless acked;
//! - each `dedup_id` is accepted once per deduplication window.
//!
//! Two implementations exist: [`LocalQueueClient`] for in-process use and
//! tests, and [`ManagedQueueClient`] on top of a managed FIFO queue service.

mod local;
mod managed;

pub use local::LocalQueueClient;
pub use managed::{ManagedQueueClient, SqsApi, SqsReceivedMessage, SqsSendEntry, SqsSendResult};

#[cfg(test)]
pub use managed::MockSqsApi;

#[cfg(feature = "sqs")]
pub use managed::AwsSqsApi;

use crate::error::QueueError;
use crate::message::{BookingMessage, ReceiptHandle};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Result of an `enqueue` call.
///
/// Partial success is normal: accepted messages are listed in
/// `message_ids` while rejected entries land in `failures`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnqueueReport {
    /// Ids assigned to accepted messages, in input order
    pub message_ids: Vec<String>,
    /// Entries the queue refused
    pub failures: Vec<EnqueueFailure>,
}

impl EnqueueReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnqueueFailure {
    pub dedup_id: String,
    pub reason: String,
}

/// FIFO queue operations used by producers and workers.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Enqueue messages. A message whose `dedup_id` was seen within the
    /// deduplication window is accepted but not enqueued again.
    async fn enqueue(&self, messages: Vec<BookingMessage>) -> Result<EnqueueReport, QueueError>;

    /// Receive up to `max_messages` (1..=10), long-polling for at most `wait`.
    ///
    /// Returns an empty vector when nothing became available in time.
    async fn receive_batch(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<BookingMessage>, QueueError>;

    /// Permanently remove a delivered message.
    async fn ack(&self, handle: &ReceiptHandle) -> Result<(), QueueError>;

    /// Reset the visibility deadline of a delivery to now + `timeout_seconds`.
    async fn extend_visibility(
        &self,
        handle: &ReceiptHandle,
        timeout_seconds: u64,
    ) -> Result<(), QueueError>;

    /// Make a delivered message visible again immediately.
    async fn nack(&self, handle: &ReceiptHandle) -> Result<(), QueueError>;

    /// Check that the queue is reachable.
    async fn health_check(&self) -> Result<(), QueueError>;
}
