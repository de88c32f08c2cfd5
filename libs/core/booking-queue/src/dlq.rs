//! Dead-letter sink
//!
//! Holds messages that will never be persisted: invalid payloads, rows the
//! store rejects, and messages redelivered more than `max_receive_count`
//! times. Writes are idempotent per `message_id`, so a message the worker
//! failed to ack after dead-lettering can be sent again safely.

use crate::error::StoreError;
use crate::message::BookingMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use strum::{AsRefStr, Display, EnumString};

/// Why a message was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Payload failed schema validation
    ValidationFailed,
    /// Store refused the row
    Rejected,
    /// Redelivered more than the allowed number of times
    MaxReceivesExceeded,
}

/// Dead-letter entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub message_id: String,
    pub dedup_id: String,
    pub group_key: String,
    pub payload: serde_json::Value,
    pub receive_count: u32,
    pub reason: DeadLetterReason,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(message: &BookingMessage, reason: DeadLetterReason, error: impl Into<String>) -> Self {
        Self {
            message_id: message.message_id.clone(),
            dedup_id: message.dedup_id.clone(),
            group_key: message.group_key.clone(),
            payload: message.payload.clone(),
            receive_count: message.receive_count,
            reason,
            error: error.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Dead-letter statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeadLetterStats {
    pub length: u64,
    pub by_reason: HashMap<String, u64>,
    pub oldest_failed_at: Option<DateTime<Utc>>,
    pub newest_failed_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Store `entry`. Sending the same `message_id` twice keeps the first entry.
    async fn send(&self, entry: &DeadLetterEntry) -> Result<(), StoreError>;

    async fn stats(&self) -> Result<DeadLetterStats, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    entries: Vec<DeadLetterEntry>,
    unavailable: bool,
}

/// Dead-letter sink held in memory
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterSink {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn send(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(StoreError::Unavailable("dead-letter sink marked unavailable".into()));
        }
        if !state.entries.iter().any(|e| e.message_id == entry.message_id) {
            state.entries.push(entry.clone());
        }
        Ok(())
    }

    async fn stats(&self) -> Result<DeadLetterStats, StoreError> {
        let state = self.lock();
        let mut stats = DeadLetterStats {
            length: state.entries.len() as u64,
            ..Default::default()
        };
        for entry in &state.entries {
            *stats.by_reason.entry(entry.reason.to_string()).or_default() += 1;
        }
        stats.oldest_failed_at = state.entries.iter().map(|e| e.failed_at).min();
        stats.newest_failed_at = state.entries.iter().map(|e| e.failed_at).max();
        Ok(stats)
    }
}

#[cfg(feature = "postgres")]
pub use pg::PgDeadLetterSink;

#[cfg(feature = "postgres")]
mod pg {
    use super::*;
    use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, FromQueryResult, Statement};
    use tracing::info;

    #[derive(Debug, FromQueryResult)]
    struct DeadLetterRow {
        message_id: String,
        dedup_id: String,
        group_key: String,
        payload: serde_json::Value,
        receive_count: i32,
        reason: String,
        error: String,
        failed_at: DateTime<Utc>,
    }

    impl DeadLetterRow {
        fn into_entry(self) -> Result<DeadLetterEntry, StoreError> {
            Ok(DeadLetterEntry {
                reason: self.reason.parse().map_err(|_| {
                    StoreError::RowRejected(format!("unknown dead-letter reason '{}'", self.reason))
                })?,
                message_id: self.message_id,
                dedup_id: self.dedup_id,
                group_key: self.group_key,
                payload: self.payload,
                receive_count: u32::try_from(self.receive_count).unwrap_or_default(),
                error: self.error,
                failed_at: self.failed_at,
            })
        }
    }

    #[derive(Debug, FromQueryResult)]
    struct ReasonCount {
        reason: String,
        count: i64,
        oldest: Option<DateTime<Utc>>,
        newest: Option<DateTime<Utc>>,
    }

    /// Dead-letter table `booking_dead_letters`
    #[derive(Clone)]
    pub struct PgDeadLetterSink {
        db: DatabaseConnection,
    }

    impl PgDeadLetterSink {
        pub fn new(db: DatabaseConnection) -> Self {
            Self { db }
        }

        /// List entries, oldest first
        pub async fn list(&self, limit: u64, offset: u64) -> Result<Vec<DeadLetterEntry>, StoreError> {
            let sql = r#"
                SELECT message_id, dedup_id, group_key, payload, receive_count, reason, error, failed_at
                FROM booking_dead_letters
                ORDER BY failed_at ASC, message_id ASC
                LIMIT $1 OFFSET $2
            "#;
            let stmt = Statement::from_sql_and_values(
                DbBackend::Postgres,
                sql,
                [(limit as i64).into(), (offset as i64).into()],
            );

            DeadLetterRow::find_by_statement(stmt)
                .all(&self.db)
                .await?
                .into_iter()
                .map(DeadLetterRow::into_entry)
                .collect()
        }

        /// Remove an entry after it was replayed or discarded
        pub async fn delete(&self, message_id: &str) -> Result<bool, StoreError> {
            let stmt = Statement::from_sql_and_values(
                DbBackend::Postgres,
                "DELETE FROM booking_dead_letters WHERE message_id = $1",
                [message_id.into()],
            );
            let result = self.db.execute_raw(stmt).await?;
            Ok(result.rows_affected() > 0)
        }
    }

    #[async_trait]
    impl DeadLetterSink for PgDeadLetterSink {
        async fn send(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
            let sql = r#"
                INSERT INTO booking_dead_letters
                    (message_id, dedup_id, group_key, payload, receive_count, reason, error, failed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (message_id) DO NOTHING
            "#;
            let stmt = Statement::from_sql_and_values(
                DbBackend::Postgres,
                sql,
                [
                    entry.message_id.clone().into(),
                    entry.dedup_id.clone().into(),
                    entry.group_key.clone().into(),
                    entry.payload.clone().into(),
                    i32::try_from(entry.receive_count).unwrap_or(i32::MAX).into(),
                    entry.reason.to_string().into(),
                    entry.error.clone().into(),
                    entry.failed_at.into(),
                ],
            );

            let result = self.db.execute_raw(stmt).await?;
            if result.rows_affected() > 0 {
                info!(
                    message_id = %entry.message_id,
                    dedup_id = %entry.dedup_id,
                    reason = %entry.reason,
                    receive_count = entry.receive_count,
                    "Moved message to dead-letter table"
                );
            }
            Ok(())
        }

        async fn stats(&self) -> Result<DeadLetterStats, StoreError> {
            let sql = r#"
                SELECT reason, COUNT(*) AS count, MIN(failed_at) AS oldest, MAX(failed_at) AS newest
                FROM booking_dead_letters
                GROUP BY reason
            "#;
            let rows = ReasonCount::find_by_statement(Statement::from_string(DbBackend::Postgres, sql))
                .all(&self.db)
                .await?;

            let mut stats = DeadLetterStats::default();
            for row in rows {
                stats.length += row.count as u64;
                stats.by_reason.insert(row.reason, row.count as u64);
                stats.oldest_failed_at = match (stats.oldest_failed_at, row.oldest) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                stats.newest_failed_at = match (stats.newest_failed_at, row.newest) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
            }
            Ok(stats)
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_sink_is_idempotent_per_message() {
        let sink = InMemoryDeadLetterSink::new();
        let message = BookingMessage::new("d1", "g", json!({"bad": true}));
        let entry = DeadLetterEntry::new(&message, DeadLetterReason::ValidationFailed, "missing user_id");

        sink.send(&entry).await.unwrap();
        sink.send(&entry).await.unwrap();

        assert_eq!(sink.len(), 1);
        let stats = sink.stats().await.unwrap();
        assert_eq!(stats.length, 1);
        assert_eq!(stats.by_reason["validation_failed"], 1);
    }

    #[tokio::test]
    async fn test_memory_sink_unavailable() {
        let sink = InMemoryDeadLetterSink::new();
        sink.set_unavailable(true);
        let message = BookingMessage::new("d1", "g", json!({}));
        let entry = DeadLetterEntry::new(&message, DeadLetterReason::Rejected, "check");
        assert!(sink.send(&entry).await.is_err());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(DeadLetterReason::MaxReceivesExceeded.to_string(), "max_receives_exceeded");
        let parsed: DeadLetterReason = "rejected".parse().unwrap();
        assert_eq!(parsed, DeadLetterReason::Rejected);
    }
}
