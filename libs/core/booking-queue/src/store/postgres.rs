//! PostgreSQL booking table
//!
//! Each chunk is one transaction around a single multi-row
//! `INSERT ... ON CONFLICT (dedup_id) DO NOTHING RETURNING dedup_id`. A chunk
//! is written entirely or not at all, and existing keys come back as
//! duplicates.

use super::{BookingRow, BookingStore, InsertReport};
use crate::error::StoreError;
use crate::retry::{retry_with_backoff, RetryConfig};
use async_trait::async_trait;
use core_config::database::DatabaseConfig;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr,
    FromQueryResult, Statement, TransactionTrait, Value,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument};

const COLUMNS: usize = 9;

#[derive(Debug, FromQueryResult)]
struct InsertedKey {
    dedup_id: String,
}

/// Open a pool sized from `config`
pub async fn connect(config: &DatabaseConfig) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;
    info!(
        max_connections = config.max_connections,
        "Connected to PostgreSQL"
    );
    Ok(db)
}

/// `connect` with exponential backoff, for startup ordering against the database
pub async fn connect_with_retry(
    config: &DatabaseConfig,
    retry: &RetryConfig,
) -> Result<DatabaseConnection, DbErr> {
    retry_with_backoff(|| connect(config), retry).await
}

#[derive(Clone)]
pub struct PgBookingStore {
    db: DatabaseConnection,
}

impl PgBookingStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    fn insert_statement(rows: &[BookingRow]) -> Statement {
        let mut placeholders = Vec::with_capacity(rows.len());
        let mut values: Vec<Value> = Vec::with_capacity(rows.len() * COLUMNS);

        for (i, row) in rows.iter().enumerate() {
            let base = i * COLUMNS;
            let params: Vec<String> = (1..=COLUMNS).map(|n| format!("${}", base + n)).collect();
            placeholders.push(format!("({})", params.join(", ")));

            values.extend([
                row.dedup_id.clone().into(),
                row.group_key.clone().into(),
                row.booking_id.into(),
                row.user_id.clone().into(),
                row.service_id.clone().into(),
                row.booking_time.into(),
                row.payload.clone().into(),
                row.status.to_string().into(),
                row.created_at.into(),
            ]);
        }

        let sql = format!(
            r#"
            INSERT INTO bookings
                (dedup_id, group_key, booking_id, user_id, service_id, booking_time, payload, status, created_at)
            VALUES {}
            ON CONFLICT (dedup_id) DO NOTHING
            RETURNING dedup_id
            "#,
            placeholders.join(", ")
        );

        Statement::from_sql_and_values(DbBackend::Postgres, sql, values)
    }
}

/// Split `rows` into inserted and duplicate keys given the keys the insert returned.
///
/// A key repeated within the chunk is inserted once and reported as a
/// duplicate for every later occurrence.
fn classify(rows: &[BookingRow], returned: Vec<String>) -> InsertReport {
    let mut unclaimed: HashMap<String, usize> = HashMap::new();
    for key in returned {
        *unclaimed.entry(key).or_default() += 1;
    }

    let mut report = InsertReport::default();
    for row in rows {
        match unclaimed.get_mut(&row.dedup_id) {
            Some(n) if *n > 0 => {
                *n -= 1;
                report.inserted.push(row.dedup_id.clone());
            }
            _ => report.duplicates.push(row.dedup_id.clone()),
        }
    }
    report
}

#[async_trait]
impl BookingStore for PgBookingStore {
    #[instrument(level = "debug", skip(self, rows), fields(rows = rows.len()))]
    async fn insert_chunk(&self, rows: &[BookingRow]) -> Result<InsertReport, StoreError> {
        if rows.is_empty() {
            return Ok(InsertReport::default());
        }

        let txn = self.db.begin().await?;
        let returned = InsertedKey::find_by_statement(Self::insert_statement(rows))
            .all(&txn)
            .await?
            .into_iter()
            .map(|k| k.dedup_id)
            .collect();
        txn.commit().await?;

        let report = classify(rows, returned);
        debug!(
            inserted = report.inserted.len(),
            duplicates = report.duplicates.len(),
            "Chunk written"
        );
        Ok(report)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.db
            .execute_raw(Statement::from_string(DbBackend::Postgres, "SELECT 1"))
            .await?;
        Ok(())
    }
}
