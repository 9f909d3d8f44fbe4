//! MCM Job Worker Service
//!
//! Consumes jobs from a Redis list and runs them one at a time:
//!
//! - `contribution-created`: email the faculty's marketing coordinators
//! - `article-uploaded`: convert the uploaded document to PDF
//! - `export-contribute-session`: zip a session's accepted contributions
//!
//! Configuration comes from the environment, see [`mcm_worker::config`].
//! `RUST_LOG` sets the log level (default: info).

use anyhow::{Context, Result};
use mcm_worker::api_client::ApiClient;
use mcm_worker::config::WorkerConfig;
use mcm_worker::converter::ArticleConverter;
use mcm_worker::export::SessionExporter;
use mcm_worker::lock::RedisLockManager;
use mcm_worker::notification::ContributionNotifier;
use mcm_worker::queue::RedisQueue;
use mcm_worker::telemetry;
use mcm_worker::{Topic, Worker};
use redis::Client;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env();

    // Initialize OpenTelemetry
    if let Err(e) = telemetry::init_telemetry(&config.otel_endpoint, &config.otel_service_name) {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!("Starting job worker service");
    info!(
        "Configuration: redis_url={}, queue={}, api={}, job_timeout={:?}, export_concurrency={}",
        config.redis_url,
        config.queue_name,
        config.api_base_url,
        config.job_timeout,
        config.export_concurrency
    );

    // Connect to Redis. The queue's blocking pop gets its own connection so
    // lock traffic is never stuck behind it.
    let client = Client::open(config.redis_url.as_str()).context("Failed to create Redis client")?;
    let queue_conn = redis::aio::ConnectionManager::new(client.clone())
        .await
        .context("Failed to connect to Redis")?;
    let lock_conn = redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    info!("Connected to Redis");

    let queue = Arc::new(RedisQueue::new(
        queue_conn,
        config.queue_name.clone(),
        config.poll_timeout,
    ));
    let locks = Arc::new(RedisLockManager::new(lock_conn));
    let api = Arc::new(ApiClient::new(config.api_base_url.clone())?);

    let exporter = SessionExporter::new(
        api.clone(),
        api.clone(),
        api.clone(),
        api.clone(),
        locks,
        config.export_settings(),
    );
    let notifier = ContributionNotifier::new(api.clone(), api.clone(), config.web_app_url.clone());
    let converter = ArticleConverter::new(api.clone(), api);

    let worker = Worker::new(queue, config.job_timeout)
        .with_handler(Topic::ContributionCreated, Arc::new(notifier))
        .with_handler(Topic::ArticleUploaded, Arc::new(converter))
        .with_handler(Topic::ExportContributeSession, Arc::new(exporter));

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal, finishing current job..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        trigger.cancel();
    });

    info!("Worker service ready, press Ctrl+C to shutdown");
    worker.run(shutdown).await;

    info!("Worker service shutdown complete");
    Ok(())
}
