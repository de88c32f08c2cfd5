//! Booking message envelope and the booking data model.
//!
//! A `BookingMessage` is created by the producer, mutated only by the queue
//! client on each delivery (`receive_count`, `receipt_handle`) and removed by
//! an ack once its row is durably written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;
use validator::Validate;

/// Lifecycle status of a booking message.
///
/// ```text
/// PENDING -> PROCESSING -> COMPLETED
///                     \-> FAILED -> PROCESSING (redelivery)
///                               \-> DEAD_LETTER
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    /// Enqueued, not yet delivered.
    Pending,
    /// Delivered to a worker and under visibility lease.
    Processing,
    /// Persisted and acked.
    Completed,
    /// Last attempt failed; will be redelivered or dead-lettered.
    Failed,
    /// Moved to the dead-letter sink.
    DeadLetter,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::DeadLetter)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;

        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                // Validation failures and exhausted receives go straight to the sink
                | (Processing, DeadLetter)
                | (Failed, Processing)
                | (Failed, DeadLetter)
        )
    }
}

/// Opaque token identifying one delivery attempt of a message.
///
/// Valid only until the visibility deadline of that delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A booking message as seen by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingMessage {
    /// Queue-unique message id
    pub message_id: String,

    /// Producer-supplied idempotency key
    pub dedup_id: String,

    /// Ordering partition (venue, resource, ...)
    pub group_key: String,

    /// Opaque booking fields, validated by the processor
    pub payload: serde_json::Value,

    /// Number of deliveries so far, including the current one
    pub receive_count: u32,

    pub enqueued_at: DateTime<Utc>,

    /// Set by the queue client on receive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_handle: Option<ReceiptHandle>,
}

impl BookingMessage {
    /// Create a new message ready for `enqueue`.
    pub fn new(
        dedup_id: impl Into<String>,
        group_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id: Uuid::now_v7().to_string(),
            dedup_id: dedup_id.into(),
            group_key: group_key.into(),
            payload,
            receive_count: 0,
            enqueued_at: Utc::now(),
            receipt_handle: None,
        }
    }

    /// Build a message from a typed booking, keyed by its booking id.
    pub fn from_request(
        group_key: impl Into<String>,
        request: &BookingRequest,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            request.booking_id.to_string(),
            group_key,
            serde_json::to_value(request)?,
        ))
    }

    /// Check if this is a redelivery
    pub fn is_redelivery(&self) -> bool {
        self.receive_count > 1
    }

    /// Whether this delivery exceeds the allowed number of receives.
    pub fn exceeded_max_receives(&self, max_receive_count: u32) -> bool {
        self.receive_count > max_receive_count
    }

    /// How long ago the message was enqueued
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.enqueued_at
    }
}

/// The booking schema a payload must satisfy to be persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct BookingRequest {
    pub booking_id: Uuid,

    #[validate(length(min = 1, max = 255))]
    pub user_id: String,

    #[validate(length(min = 1, max = 255))]
    pub service_id: String,

    pub booking_time: DateTime<Utc>,

    #[serde(default = "empty_metadata")]
    pub metadata: serde_json::Value,
}

fn empty_metadata() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl BookingRequest {
    /// Parse and validate a raw payload.
    pub fn parse(payload: &serde_json::Value) -> Result<Self, String> {
        let request: BookingRequest =
            serde_json::from_value(payload.clone()).map_err(|e| format!("malformed payload: {e}"))?;

        request.validate().map_err(|e| e.to_string())?;

        if !request.metadata.is_object() {
            return Err("metadata must be a JSON object".to_string());
        }

        Ok(request)
    }
}
