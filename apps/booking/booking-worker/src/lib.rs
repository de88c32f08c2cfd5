//! Booking Worker Service
//!
//! Drains booking requests from a FIFO queue into PostgreSQL.
//!
//! ## Architecture
//!
//! ```text
//! SQS FIFO queue (MessageGroupId = group_key)
//!   ↓ (N workers, one receive_batch each)
//! Supervisor -> BookingWorker
//!   ↓ (validate, chunked idempotent insert)
//! DatabaseBookingProcessor<PgBookingStore>
//!   ↓
//! PostgreSQL: bookings / booking_dead_letters
//! ```
//!
//! Without `BOOKING_QUEUE_URL` (or without the `sqs` feature) the worker
//! runs against the in-process queue, which is only useful for local
//! development.

use axum::Router;
use booking_queue::{
    connect_with_retry, health_router, metrics, DatabaseBookingProcessor, HealthState,
    LocalQueueClient, PgBookingStore, PgDeadLetterSink, QueueClient, QueueConfig, RetryConfig,
    Supervisor,
};
use core_config::database::DatabaseConfig;
use core_config::{env_parse, Environment, FromEnv};
use eyre::{Result, WrapErr};
use migration::{Migrator, MigratorTrait};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Start the health and admin HTTP server
async fn start_health_server(health_state: HealthState, port: u16) -> Result<()> {
    let app: Router = health_router(health_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Pick the managed queue when a URL is configured, the in-process one otherwise
async fn build_queue(config: &QueueConfig) -> Result<Arc<dyn QueueClient>> {
    #[cfg(feature = "sqs")]
    if config.uses_managed_queue() {
        let api = booking_queue::AwsSqsApi::from_region(config.region.clone()).await;
        info!(queue_url = %config.queue_url, region = %config.region, "Using SQS FIFO queue");
        return Ok(Arc::new(booking_queue::ManagedQueueClient::new(api, config)));
    }

    #[cfg(not(feature = "sqs"))]
    if config.uses_managed_queue() {
        eyre::bail!("BOOKING_QUEUE_URL is set but this build has no `sqs` feature");
    }

    warn!("BOOKING_QUEUE_URL not set, using the in-process queue");
    Ok(Arc::new(LocalQueueClient::new(config)))
}

/// Run the booking worker
///
/// 1. Sets up error reports, structured logging and metrics
/// 2. Connects to PostgreSQL (with retry) and applies migrations
/// 3. Starts `worker_count` workers plus the health server
/// 4. On SIGINT/SIGTERM drains in-flight batches within the shutdown timeout
///
/// # Errors
///
/// Returns an error if configuration is invalid, the database is
/// unreachable after retries, migrations fail, or the health port cannot
/// be bound at startup.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    metrics::init_metrics();

    info!(name = APP_NAME, version = APP_VERSION, "Starting booking worker service");
    info!("Environment: {:?}", environment);

    // BOOKING_WORKER_HEALTH_PORT first, then HEALTH_PORT, then 8083
    let default_port: u16 = env_parse("HEALTH_PORT", 8083)?;
    let health_port: u16 = env_parse("BOOKING_WORKER_HEALTH_PORT", default_port)?;
    let run_migrations: bool = env_parse("BOOKING_RUN_MIGRATIONS", true)?;
    let chunk_size: usize = env_parse("BOOKING_CHUNK_SIZE", booking_queue::processor::DEFAULT_CHUNK_SIZE)?;

    let queue_config = QueueConfig::from_env().wrap_err("Failed to load queue configuration")?;
    info!(
        queue_url = %queue_config.queue_url,
        batch_size = queue_config.batch_size,
        workers = queue_config.worker_count,
        visibility_timeout_secs = queue_config.visibility_timeout_seconds,
        max_receive_count = queue_config.max_receive_count,
        "Queue configuration loaded"
    );

    let db_config = DatabaseConfig::from_env().wrap_err("Failed to load database configuration")?;

    info!("Connecting to PostgreSQL...");
    let db = connect_with_retry(&db_config, &RetryConfig::default())
        .await
        .wrap_err("Failed to connect to PostgreSQL")?;
    info!("Connected to PostgreSQL successfully");

    if run_migrations {
        Migrator::up(&db, None)
            .await
            .wrap_err("Failed to apply migrations")?;
        info!("Migrations applied");
    }

    let queue = build_queue(&queue_config).await?;
    let store = PgBookingStore::new(db.clone());
    let dead_letters = Arc::new(PgDeadLetterSink::new(db));
    let processor = Arc::new(DatabaseBookingProcessor::new(store.clone()).with_chunk_size(chunk_size));

    let supervisor = Arc::new(Supervisor::new(
        queue_config.clone(),
        queue.clone(),
        processor,
        dead_letters.clone(),
    ));
    supervisor
        .start(queue_config.worker_count)
        .wrap_err("Failed to start workers")?;

    let health_state = HealthState {
        supervisor: supervisor.clone(),
        queue,
        store: Arc::new(store),
        dead_letters,
        app_name: APP_NAME.to_string(),
        app_version: APP_VERSION.to_string(),
    };
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    if let Err(e) = shutdown_signal().await {
        error!("Error waiting for shutdown signal: {}", e);
    }

    let report = supervisor.stop(queue_config.shutdown_timeout()).await;
    if report.is_clean() {
        info!(stopped = report.stopped, "Booking worker service stopped");
    } else {
        warn!(
            stopped = report.stopped,
            forced = report.forced,
            "Booking worker service stopped with aborted workers; their messages will be redelivered"
        );
    }

    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?;
        term.recv().await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
