//! Processor that persists bookings into a `BookingStore`.
//!
//! Batch flow:
//! 1. Each payload is validated into a `BookingRequest`; invalid payloads
//!    are `PermanentFailure`.
//! 2. Valid rows are written in enqueue order, `chunk_size` rows per
//!    transaction.
//! 3. A chunk the store rejects is bisected until the offending row is
//!    isolated; only that row fails permanently.
//! 4. A transient store error fails the chunk's rows as retryable and blocks
//!    their groups: later rows of those groups in the batch are not written,
//!    so a group is never persisted out of order.

use super::{BookingProcessor, ProcessResult};
use crate::error::{ProcessError, StoreError};
use crate::message::{BookingMessage, BookingRequest};
use crate::store::{BookingRow, BookingStore};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 100;

pub struct DatabaseBookingProcessor<S: BookingStore> {
    store: S,
    chunk_size: usize,
}

impl<S: BookingStore> DatabaseBookingProcessor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set rows per transaction (at least 1)
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Write `pending` rows, recording an outcome for each into `results`.
    async fn write_rows(
        &self,
        messages: &[BookingMessage],
        pending: &[(usize, BookingRow)],
        results: &mut [Option<ProcessResult>],
    ) {
        let mut blocked: HashSet<String> = HashSet::new();

        // Ranges into `pending`, processed left to right
        let mut stack: Vec<(usize, usize)> = pending
            .chunks(self.chunk_size)
            .scan(0, |start, chunk| {
                let range = (*start, *start + chunk.len());
                *start += chunk.len();
                Some(range)
            })
            .collect();
        stack.reverse();

        while let Some((start, end)) = stack.pop() {
            let mut live: Vec<&(usize, BookingRow)> = Vec::with_capacity(end - start);
            for entry in &pending[start..end] {
                let (index, row) = entry;
                if blocked.contains(&row.group_key) {
                    results[*index] = Some(ProcessResult::retryable(
                        messages[*index].clone(),
                        ProcessError::GroupBlocked(row.group_key.clone()),
                    ));
                } else {
                    live.push(entry);
                }
            }
            if live.is_empty() {
                continue;
            }

            let rows: Vec<BookingRow> = live.iter().map(|(_, row)| row.clone()).collect();
            match self.store.insert_chunk(&rows).await {
                Ok(report) => {
                    let mut inserted: HashMap<&str, usize> = HashMap::new();
                    for key in &report.inserted {
                        *inserted.entry(key.as_str()).or_default() += 1;
                    }
                    for (index, row) in live {
                        let message = messages[*index].clone();
                        let result = match inserted.get_mut(row.dedup_id.as_str()) {
                            Some(n) if *n > 0 => {
                                *n -= 1;
                                ProcessResult::success(message)
                            }
                            _ => {
                                debug!(dedup_id = %row.dedup_id, "Booking already persisted");
                                ProcessResult::already_applied(message)
                            }
                        };
                        results[*index] = Some(result);
                    }
                }
                Err(StoreError::RowRejected(reason)) if live.len() == 1 => {
                    let (index, row) = live[0];
                    warn!(dedup_id = %row.dedup_id, reason = %reason, "Booking rejected by store");
                    results[*index] = Some(ProcessResult::from_error(
                        messages[*index].clone(),
                        StoreError::RowRejected(reason).into(),
                    ));
                }
                Err(StoreError::RowRejected(_)) => {
                    // Blocked rows were already settled, so bisect the original range
                    let mid = start + (end - start) / 2;
                    debug!(start, end, "Chunk rejected, bisecting");
                    stack.push((mid, end));
                    stack.push((start, mid));
                }
                Err(e @ StoreError::Unavailable(_)) => {
                    warn!(rows = live.len(), error = %e, "Store unavailable, rows will be retried");
                    for (index, row) in live {
                        blocked.insert(row.group_key.clone());
                        results[*index] = Some(ProcessResult::from_error(
                            messages[*index].clone(),
                            e.clone().into(),
                        ));
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<S: BookingStore> BookingProcessor for DatabaseBookingProcessor<S> {
    async fn process_batch(&self, messages: &[BookingMessage]) -> Vec<ProcessResult> {
        let mut results: Vec<Option<ProcessResult>> = vec![None; messages.len()];
        let mut pending = Vec::with_capacity(messages.len());

        for (index, message) in messages.iter().enumerate() {
            match BookingRequest::parse(&message.payload) {
                Ok(request) => pending.push((index, BookingRow::from_request(message, request))),
                Err(reason) => {
                    debug!(message_id = %message.message_id, reason = %reason, "Invalid booking payload");
                    results[index] = Some(ProcessResult::from_error(
                        message.clone(),
                        ProcessError::Validation(reason),
                    ));
                }
            }
        }

        self.write_rows(messages, &pending, &mut results).await;

        results
            .into_iter()
            .zip(messages)
            .map(|(result, message)| {
                result.unwrap_or_else(|| {
                    ProcessResult::retryable(
                        message.clone(),
                        ProcessError::Internal("no outcome recorded".into()),
                    )
                })
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "database"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Outcome;
    use crate::store::InMemoryBookingStore;
    use serde_json::json;
    use uuid::Uuid;

    fn booking(group: &str, user: &str) -> BookingMessage {
        let booking_id = Uuid::new_v4();
        BookingMessage::new(
            booking_id.to_string(),
            group,
            json!({
                "booking_id": booking_id,
                "user_id": user,
                "service_id": "court-1",
                "booking_time": "2026-11-01T10:00:00Z"
            }),
        )
    }

    fn outcomes(results: &[ProcessResult]) -> Vec<Outcome> {
        results.iter().map(|r| r.outcome).collect()
    }

    #[tokio::test]
    async fn test_valid_batch_is_persisted_in_order() {
        let processor = DatabaseBookingProcessor::new(InMemoryBookingStore::new());
        let batch: Vec<_> = (0..5).map(|i| booking("g", &format!("u{i}"))).collect();

        let results = processor.process_batch(&batch).await;

        assert_eq!(outcomes(&results), vec![Outcome::Success; 5]);
        let users: Vec<_> = processor.store().rows().into_iter().map(|r| r.user_id).collect();
        assert_eq!(users, vec!["u0", "u1", "u2", "u3", "u4"]);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_permanent() {
        let processor = DatabaseBookingProcessor::new(InMemoryBookingStore::new());
        let batch = vec![
            booking("g", "u1"),
            BookingMessage::new("bad", "g", json!({ "user_id": "" })),
        ];

        let results = processor.process_batch(&batch).await;

        assert_eq!(outcomes(&results), vec![Outcome::Success, Outcome::PermanentFailure]);
        assert!(matches!(results[1].error, Some(ProcessError::Validation(_))));
        assert_eq!(processor.store().len(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_is_already_applied() {
        let processor = DatabaseBookingProcessor::new(InMemoryBookingStore::new());
        let batch = vec![booking("g", "u1")];

        processor.process_batch(&batch).await;
        let again = processor.process_batch(&batch).await;

        assert_eq!(outcomes(&again), vec![Outcome::AlreadyApplied]);
        assert_eq!(processor.store().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_within_batch() {
        let processor = DatabaseBookingProcessor::new(InMemoryBookingStore::new());
        let first = booking("g", "u1");
        let mut second = first.clone();
        second.message_id = "other".into();

        let results = processor.process_batch(&[first, second]).await;
        assert_eq!(outcomes(&results), vec![Outcome::Success, Outcome::AlreadyApplied]);
    }

    #[tokio::test]
    async fn test_rejected_row_is_isolated_by_bisection() {
        let store = InMemoryBookingStore::new().with_rejection(|r| r.user_id == "poison");
        let processor = DatabaseBookingProcessor::new(store).with_chunk_size(8);
        let batch: Vec<_> = (0..8)
            .map(|i| booking(&format!("g{}", i % 3), if i == 5 { "poison" } else { "ok" }))
            .collect();

        let results = processor.process_batch(&batch).await;

        for (i, result) in results.iter().enumerate() {
            let expected = if i == 5 { Outcome::PermanentFailure } else { Outcome::Success };
            assert_eq!(result.outcome, expected, "message {i}");
        }
        assert!(matches!(
            results[5].error,
            Some(ProcessError::Storage(StoreError::RowRejected(_)))
        ));
        assert_eq!(processor.store().len(), 7);
    }

    #[tokio::test]
    async fn test_one_bad_row_in_full_chunk() {
        let store = InMemoryBookingStore::new().with_rejection(|r| r.user_id == "poison");
        let processor = DatabaseBookingProcessor::new(store);
        let batch: Vec<_> = (0..100)
            .map(|i| booking(&format!("g{}", i % 7), if i == 61 { "poison" } else { "ok" }))
            .collect();

        let results = processor.process_batch(&batch).await;

        let failed: Vec<_> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.outcome == Outcome::PermanentFailure)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(failed, vec![61]);
        assert_eq!(processor.store().len(), 99);
    }

    #[tokio::test]
    async fn test_unavailable_store_blocks_group_for_rest_of_batch() {
        // Second chunk fails
        let store = InMemoryBookingStore::new().with_failure_every(2);
        let processor = DatabaseBookingProcessor::new(store).with_chunk_size(2);

        // chunks: [a1, b1] ok, [a2, c1] fail, [a3, c2] -> a3 and c2 blocked
        let batch = vec![
            booking("a", "a1"),
            booking("b", "b1"),
            booking("a", "a2"),
            booking("c", "c1"),
            booking("a", "a3"),
            booking("c", "c2"),
        ];

        let results = processor.process_batch(&batch).await;

        assert_eq!(
            outcomes(&results),
            vec![
                Outcome::Success,
                Outcome::Success,
                Outcome::RetryableFailure,
                Outcome::RetryableFailure,
                Outcome::RetryableFailure,
                Outcome::RetryableFailure,
            ]
        );
        assert!(matches!(results[4].error, Some(ProcessError::GroupBlocked(_))));
        // Blocked rows were never sent to the store
        assert_eq!(processor.store().calls(), 2);
    }

    #[tokio::test]
    async fn test_unrelated_group_written_after_failure() {
        let store = InMemoryBookingStore::new().with_failure_every(1);
        let processor = DatabaseBookingProcessor::new(store).with_chunk_size(1);

        let results = processor
            .process_batch(&[booking("a", "a1"), booking("b", "b1")])
            .await;

        // Every call fails, but b1 is attempted rather than blocked
        assert!(matches!(results[1].error, Some(ProcessError::Storage(_))));
        assert_eq!(processor.store().calls(), 2);
    }
}
