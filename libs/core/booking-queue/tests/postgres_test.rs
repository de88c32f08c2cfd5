//! Integration tests against a real Postgres (testcontainers)
//!
//! Requires Docker. Each test starts its own container with migrations applied.
//! Run with `cargo test -p booking-queue --test postgres_test -- --ignored`.

#![cfg(feature = "postgres")]

use booking_queue::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_utils::{TestDatabase, TestDataBuilder};

fn booking(builder: &TestDataBuilder, index: u64, group: &str) -> BookingMessage {
    let booking_id = builder.booking_id(index);
    BookingMessage::new(
        booking_id.to_string(),
        group,
        json!({
            "booking_id": booking_id,
            "user_id": "user-42",
            "service_id": "massage-60",
            "booking_time": "2026-12-24T15:00:00Z",
            "metadata": { "seq": index }
        }),
    )
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_insert_chunk_is_idempotent() {
    let db = TestDatabase::new().await;
    let store = PgBookingStore::new(db.connection());
    let processor = DatabaseBookingProcessor::new(store);
    let builder = TestDataBuilder::from_test_name("pg_idempotent");

    let batch: Vec<_> = (0..3).map(|i| booking(&builder, i, "g1")).collect();

    let first = processor.process_batch(&batch).await;
    assert!(first.iter().all(|r| r.outcome == Outcome::Success));

    let second = processor.process_batch(&batch).await;
    assert!(second.iter().all(|r| r.outcome == Outcome::AlreadyApplied));

    assert_eq!(db.count("bookings").await, 3);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_oversized_row_is_isolated() {
    let db = TestDatabase::new().await;
    let processor = DatabaseBookingProcessor::new(PgBookingStore::new(db.connection()));
    let builder = TestDataBuilder::from_test_name("pg_oversized");

    let mut batch: Vec<_> = (0..6).map(|i| booking(&builder, i, "g1")).collect();
    // group_key column is varchar(128)
    batch[4].group_key = "x".repeat(300);

    let results = processor.process_batch(&batch).await;

    assert_eq!(results[4].outcome, Outcome::PermanentFailure);
    assert!(matches!(
        results[4].error,
        Some(ProcessError::Storage(StoreError::RowRejected(_)))
    ));
    assert!(results
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != 4)
        .all(|(_, r)| r.outcome == Outcome::Success));
    assert_eq!(db.count("bookings").await, 5);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_dead_letter_sink_roundtrip() {
    let db = TestDatabase::new().await;
    let sink = PgDeadLetterSink::new(db.connection());
    let builder = TestDataBuilder::from_test_name("pg_dlq");
    let message = booking(&builder, 0, "g1");

    let entry = DeadLetterEntry::new(&message, DeadLetterReason::ValidationFailed, "bad user");
    sink.send(&entry).await.unwrap();
    // Second send of the same message is ignored
    sink.send(&entry).await.unwrap();

    let stats = sink.stats().await.unwrap();
    assert_eq!(stats.length, 1);
    assert_eq!(stats.by_reason.get("validation_failed"), Some(&1));

    let listed = sink.list(10, 0).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].message_id, message.message_id);
    assert_eq!(listed[0].reason, DeadLetterReason::ValidationFailed);

    assert!(sink.delete(&message.message_id).await.unwrap());
    assert!(!sink.delete(&message.message_id).await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_pipeline_into_postgres() {
    let db = TestDatabase::new().await;
    let builder = TestDataBuilder::from_test_name("pg_pipeline");
    let config = QueueConfig::local()
        .with_poll_wait_seconds(0)
        .with_empty_backoff_ms(1, 10);

    let queue = Arc::new(LocalQueueClient::new(&config));
    let supervisor = Supervisor::new(
        config,
        queue.clone(),
        Arc::new(DatabaseBookingProcessor::new(PgBookingStore::new(db.connection()))),
        Arc::new(PgDeadLetterSink::new(db.connection())),
    );

    let mut messages: Vec<_> = (0..200)
        .map(|i| booking(&builder, i, &builder.group_key((i % 8) as usize)))
        .collect();
    messages.push(BookingMessage::new("broken", "g-broken", json!({ "user_id": "" })));
    queue.enqueue(messages).await.unwrap();

    supervisor.start(4).unwrap();
    tokio::time::timeout(Duration::from_secs(30), async {
        while !queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("queue not drained");
    supervisor.stop(Duration::from_secs(5)).await;

    assert_eq!(db.count("bookings").await, 200);
    assert_eq!(db.count("booking_dead_letters").await, 1);
}
