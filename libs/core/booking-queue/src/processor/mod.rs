//! Batch processors
//!
//! A `BookingProcessor` turns a received batch into exactly one
//! `ProcessResult` per message. Processors never return errors: every
//! failure is classified into an `Outcome` the worker acts on.

mod database;

pub use database::{DatabaseBookingProcessor, DEFAULT_CHUNK_SIZE};

use crate::error::{ErrorCategory, ProcessError, StoreError};
use crate::message::BookingMessage;
use async_trait::async_trait;
use serde::Serialize;
use strum::{AsRefStr, Display};

/// Classification of one message after processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Row written
    Success,
    /// Row for this `dedup_id` already existed
    AlreadyApplied,
    /// Try again on redelivery
    RetryableFailure,
    /// Will never succeed; dead-letter
    PermanentFailure,
}

impl Outcome {
    /// Whether the message can be removed from the queue
    pub fn should_ack(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::AlreadyApplied)
    }
}

/// Result for one message of a batch
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub message: BookingMessage,
    pub outcome: Outcome,
    pub error: Option<ProcessError>,
}

impl ProcessResult {
    pub fn success(message: BookingMessage) -> Self {
        Self {
            message,
            outcome: Outcome::Success,
            error: None,
        }
    }

    pub fn already_applied(message: BookingMessage) -> Self {
        Self {
            message,
            outcome: Outcome::AlreadyApplied,
            error: None,
        }
    }

    pub fn retryable(message: BookingMessage, error: ProcessError) -> Self {
        Self {
            message,
            outcome: Outcome::RetryableFailure,
            error: Some(error),
        }
    }

    pub fn permanent(message: BookingMessage, error: ProcessError) -> Self {
        Self {
            message,
            outcome: Outcome::PermanentFailure,
            error: Some(error),
        }
    }

    /// Classify a processing error by its category
    pub fn from_error(message: BookingMessage, error: ProcessError) -> Self {
        match error.category() {
            ErrorCategory::Transient => Self::retryable(message, error),
            ErrorCategory::Permanent => Self::permanent(message, error),
        }
    }

    /// Failed only because the store could not be reached
    pub fn is_store_outage(&self) -> bool {
        matches!(
            self.error,
            Some(ProcessError::Storage(StoreError::Unavailable(_)) | ProcessError::GroupBlocked(_))
        )
    }

    /// Error text for logs and dead-letter entries
    pub fn error_message(&self) -> String {
        self.error.as_ref().map(ToString::to_string).unwrap_or_default()
    }
}

/// Converts a batch of messages into durable side effects.
///
/// Implementations must return one result per input message. Results may
/// come back in any order; the worker matches them by `message_id`.
#[async_trait]
pub trait BookingProcessor: Send + Sync {
    async fn process_batch(&self, messages: &[BookingMessage]) -> Vec<ProcessResult>;

    /// Processor name for metrics and logs
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_ack_rules() {
        assert!(Outcome::Success.should_ack());
        assert!(Outcome::AlreadyApplied.should_ack());
        assert!(!Outcome::RetryableFailure.should_ack());
        assert!(!Outcome::PermanentFailure.should_ack());
        assert_eq!(Outcome::AlreadyApplied.as_ref(), "already_applied");
    }

    #[test]
    fn test_from_error_classification() {
        let msg = BookingMessage::new("d", "g", json!({}));

        let down = ProcessResult::from_error(
            msg.clone(),
            ProcessError::Storage(StoreError::Unavailable("timeout".into())),
        );
        assert_eq!(down.outcome, Outcome::RetryableFailure);
        assert!(down.error_message().contains("timeout"));
        assert!(down.is_store_outage());

        let rejected = ProcessResult::from_error(
            msg.clone(),
            ProcessError::Storage(StoreError::RowRejected("check".into())),
        );
        assert_eq!(rejected.outcome, Outcome::PermanentFailure);
        assert!(!rejected.is_store_outage());

        let panicked = ProcessResult::from_error(msg.clone(), ProcessError::Internal("panic".into()));
        assert_eq!(panicked.outcome, Outcome::RetryableFailure);
        assert!(!panicked.is_store_outage());

        let invalid = ProcessResult::from_error(msg, ProcessError::Validation("bad".into()));
        assert_eq!(invalid.outcome, Outcome::PermanentFailure);
    }
}
