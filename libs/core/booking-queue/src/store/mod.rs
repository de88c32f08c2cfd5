//! Booking persistence
//!
//! `BookingStore` writes validated booking rows in atomic chunks. The
//! unique `dedup_id` is the idempotency backstop: re-inserting an existing
//! key is reported as a duplicate, never as an error.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::InMemoryBookingStore;
#[cfg(feature = "postgres")]
pub use postgres::{connect, connect_with_retry, PgBookingStore};

use crate::error::StoreError;
use crate::message::{BookingMessage, BookingRequest, BookingStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A booking ready to be persisted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookingRow {
    pub dedup_id: String,
    pub group_key: String,
    pub booking_id: Uuid,
    pub user_id: String,
    pub service_id: String,
    pub booking_time: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
}

impl BookingRow {
    pub fn from_request(message: &BookingMessage, request: BookingRequest) -> Self {
        Self {
            dedup_id: message.dedup_id.clone(),
            group_key: message.group_key.clone(),
            booking_id: request.booking_id,
            user_id: request.user_id,
            service_id: request.service_id,
            booking_time: request.booking_time,
            payload: message.payload.clone(),
            status: BookingStatus::Completed,
            created_at: Utc::now(),
        }
    }
}

/// Which rows of a chunk were written and which already existed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertReport {
    pub inserted: Vec<String>,
    pub duplicates: Vec<String>,
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Insert all rows in one transaction.
    ///
    /// On `Ok`, every row is either inserted or reported as a duplicate.
    /// On `Err`, nothing from the chunk was written.
    async fn insert_chunk(&self, rows: &[BookingRow]) -> Result<InsertReport, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}
