//! Error types and error categorization
//!
//! Errors are categorized to determine retry behavior:
//! - **Transient**: Temporary failures (queue or storage unavailable); the
//!   message is retried through redelivery, the worker backs off
//! - **Permanent**: Unrecoverable for this message; dead-lettered immediately

use std::time::Duration;
use thiserror::Error;

/// Category of error for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure - retry with exponential backoff (1s-30s)
    Transient,
    /// Unrecoverable error - dead-letter immediately
    Permanent,
}

impl ErrorCategory {
    /// Base delay in milliseconds for this category
    pub fn base_delay_ms(&self) -> u64 {
        match self {
            ErrorCategory::Transient => 1000,
            ErrorCategory::Permanent => 0,
        }
    }

    /// Maximum delay in milliseconds for this category
    pub fn max_delay_ms(&self) -> u64 {
        match self {
            ErrorCategory::Transient => 30_000,
            ErrorCategory::Permanent => 0,
        }
    }

    /// Exponential backoff for the given attempt (0-based), capped at the max
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(exponential_backoff_ms(
            self.base_delay_ms(),
            self.max_delay_ms(),
            attempt,
        ))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

/// `base * 2^attempt`, saturating, capped at `max`.
pub fn exponential_backoff_ms(base: u64, max: u64, attempt: u32) -> u64 {
    base.saturating_mul(2u64.saturating_pow(attempt)).min(max)
}

/// Queue client errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Queue service unreachable or refusing requests
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    /// Receipt handle expired, already used, or unknown
    #[error("Stale receipt handle: {0}")]
    StaleReceipt(String),

    /// Message could not be encoded for the queue
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Request rejected as malformed by the queue
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl QueueError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        QueueError::Unavailable(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            QueueError::Unavailable(_) => ErrorCategory::Transient,
            QueueError::StaleReceipt(_) => ErrorCategory::Transient,
            QueueError::Serialization(_) => ErrorCategory::Permanent,
            QueueError::InvalidRequest(_) => ErrorCategory::Permanent,
        }
    }

    pub fn is_stale_receipt(&self) -> bool {
        matches!(self, QueueError::StaleReceipt(_))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

/// Storage errors (booking table and dead-letter sink)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Database unavailable, timed out, or pool exhausted
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// A row violated a constraint other than the dedup key
    #[error("Row rejected: {0}")]
    RowRejected(String),
}

impl StoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StoreError::Unavailable(_) => ErrorCategory::Transient,
            StoreError::RowRejected(_) => ErrorCategory::Permanent,
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sea_orm::DbErr> for StoreError {
    fn from(err: sea_orm::DbErr) -> Self {
        use sea_orm::SqlErr;

        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(msg))
            | Some(SqlErr::ForeignKeyConstraintViolation(msg)) => StoreError::RowRejected(msg),
            _ => {
                let message = err.to_string();
                // Check/not-null violations and bad input are row-level, everything else is treated as transient
                if ["violates", "invalid input", "value too long"]
                    .iter()
                    .any(|needle| message.contains(needle))
                {
                    StoreError::RowRejected(message)
                } else {
                    StoreError::Unavailable(message)
                }
            }
        }
    }
}

/// Per-message processing errors, converted into outcomes by the processor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// Payload does not match the booking schema
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    /// An earlier message of the same group was not persisted in this batch
    #[error("Group blocked: {0}")]
    GroupBlocked(String),

    /// Processor panicked or returned no result for the message
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProcessError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProcessError::Validation(_) => ErrorCategory::Permanent,
            ProcessError::Storage(e) => e.category(),
            ProcessError::GroupBlocked(_) => ErrorCategory::Transient,
            ProcessError::Internal(_) => ErrorCategory::Transient,
        }
    }
}

/// Supervisor lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Worker pool is already running with {0} workers")]
    AlreadyRunning(usize),

    #[error("Worker count must be at least 1")]
    NoWorkers,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        // Transient: 1s, 2s, 4s, 8s, 16s, 30s (max)
        let t = ErrorCategory::Transient;
        assert_eq!(t.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(t.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(t.backoff_delay(4), Duration::from_secs(16));
        assert_eq!(t.backoff_delay(5), Duration::from_secs(30));
        assert_eq!(t.backoff_delay(63), Duration::from_secs(30));

        assert_eq!(ErrorCategory::Permanent.backoff_delay(3), Duration::ZERO);
    }

    #[test]
    fn test_exponential_backoff_saturates() {
        assert_eq!(exponential_backoff_ms(u64::MAX, 500, 10), 500);
        assert_eq!(exponential_backoff_ms(10, 1000, 200), 1000);
    }

    #[test]
    fn test_queue_error_categories() {
        assert!(QueueError::unavailable("down").category().is_retryable());
        assert!(QueueError::StaleReceipt("h".into()).is_stale_receipt());
        assert_eq!(
            QueueError::InvalidRequest("bad".into()).category(),
            ErrorCategory::Permanent
        );
    }

    #[test]
    fn test_process_error_categories() {
        assert_eq!(
            ProcessError::Validation("missing user_id".into()).category(),
            ErrorCategory::Permanent
        );
        assert_eq!(
            ProcessError::Storage(StoreError::Unavailable("timeout".into())).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            ProcessError::Storage(StoreError::RowRejected("check".into())).category(),
            ErrorCategory::Permanent
        );
    }
}
