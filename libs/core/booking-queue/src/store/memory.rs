use super::{BookingRow, BookingStore, InsertReport};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

type RejectFn = Arc<dyn Fn(&BookingRow) -> bool + Send + Sync>;

#[derive(Default)]
struct State {
    rows: Vec<BookingRow>,
    keys: HashSet<String>,
    calls: u64,
    fail_next: u64,
    unavailable: bool,
}

/// In-memory booking table with failure injection for tests
///
/// Rows are kept in insertion order, which makes per-group ordering
/// observable.
#[derive(Clone, Default)]
pub struct InMemoryBookingStore {
    state: Arc<Mutex<State>>,
    fail_every: Option<u64>,
    reject: Option<RejectFn>,
    latency: Option<Duration>,
}

impl InMemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every `n`th `insert_chunk` call with `Unavailable`
    pub fn with_failure_every(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    /// Reject any chunk containing a row matching `predicate`
    pub fn with_rejection<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&BookingRow) -> bool + Send + Sync + 'static,
    {
        self.reject = Some(Arc::new(predicate));
        self
    }

    /// Delay every insert
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `n` inserts with `Unavailable`
    pub fn fail_next(&self, n: u64) {
        self.lock().fail_next = n;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Persisted rows in write order
    pub fn rows(&self) -> Vec<BookingRow> {
        self.lock().rows.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, dedup_id: &str) -> bool {
        self.lock().keys.contains(dedup_id)
    }

    /// Number of `insert_chunk` calls so far
    pub fn calls(&self) -> u64 {
        self.lock().calls
    }
}

#[async_trait]
impl BookingStore for InMemoryBookingStore {
    async fn insert_chunk(&self, rows: &[BookingRow]) -> Result<InsertReport, StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        state.calls += 1;

        if state.unavailable {
            return Err(StoreError::Unavailable("store marked unavailable".into()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        if self.fail_every.is_some_and(|n| state.calls % n == 0) {
            return Err(StoreError::Unavailable(format!(
                "injected failure on call {}",
                state.calls
            )));
        }
        if let Some(row) = self.reject.as_ref().and_then(|r| rows.iter().find(|row| r(*row))) {
            return Err(StoreError::RowRejected(format!(
                "row {} violates check constraint",
                row.dedup_id
            )));
        }

        let mut report = InsertReport::default();
        for row in rows {
            if state.keys.insert(row.dedup_id.clone()) {
                state.rows.push(row.clone());
                report.inserted.push(row.dedup_id.clone());
            } else {
                report.duplicates.push(row.dedup_id.clone());
            }
        }
        Ok(report)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        if self.lock().unavailable {
            Err(StoreError::Unavailable("store marked unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BookingStatus;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn row(dedup: &str) -> BookingRow {
        BookingRow {
            dedup_id: dedup.to_string(),
            group_key: "g".to_string(),
            booking_id: Uuid::new_v4(),
            user_id: "u".to_string(),
            service_id: "s".to_string(),
            booking_time: Utc::now(),
            payload: json!({}),
            status: BookingStatus::Completed,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_reports_duplicates() {
        let store = InMemoryBookingStore::new();
        store.insert_chunk(&[row("a"), row("b")]).await.unwrap();

        let report = store.insert_chunk(&[row("b"), row("c"), row("c")]).await.unwrap();
        assert_eq!(report.inserted, vec!["c"]);
        assert_eq!(report.duplicates, vec!["b", "c"]);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_rejected_chunk_writes_nothing() {
        let store = InMemoryBookingStore::new().with_rejection(|r| r.dedup_id == "bad");

        let err = store
            .insert_chunk(&[row("ok"), row("bad")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RowRejected(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = InMemoryBookingStore::new().with_failure_every(2);
        assert!(store.insert_chunk(&[row("a")]).await.is_ok());
        assert!(store.insert_chunk(&[row("b")]).await.is_err());
        assert!(store.insert_chunk(&[row("b")]).await.is_ok());

        store.fail_next(1);
        assert!(store.insert_chunk(&[row("c")]).await.is_err());
        assert!(!store.contains("c"));
        assert_eq!(store.calls(), 4);
    }

    #[tokio::test]
    async fn test_unavailable_health() {
        let store = InMemoryBookingStore::new();
        assert!(store.health_check().await.is_ok());
        store.set_unavailable(true);
        assert!(store.health_check().await.is_err());
    }
}
