//! Telemetry and structured logging for the job worker.

use crate::error::JobError;
use crate::message::Topic;
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use std::time::Duration;
use tracing::{info, warn};

const TRACER_NAME: &str = "mcm-worker";

/// Jobs slower than this are flagged in the logs.
const SLOW_JOB_THRESHOLD: Duration = Duration::from_secs(60);

/// Records telemetry for a completed or failed job.
///
/// Emits one OpenTelemetry span per job so queue health can be followed
/// from the collector. Attributes include:
/// - Topic
/// - Success/failure status
/// - Job duration (ms)
/// - Error message and lock contention flag (if failed)
///
/// Jobs slower than a minute are also logged as a warning.
///
/// # Arguments
///
/// * `topic` - Topic of the processed message
/// * `result` - Outcome returned by the handler
/// * `duration` - Wall-clock time the job took
pub fn record_job_telemetry(topic: Topic, result: &Result<(), JobError>, duration: Duration) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("worker_job");

    let duration_ms = duration.as_millis() as i64;
    let status = if result.is_ok() { "complete" } else { "failed" };

    span.set_attribute(KeyValue::new("topic", topic.as_str()));
    span.set_attribute(KeyValue::new("status", status));
    span.set_attribute(KeyValue::new("duration_ms", duration_ms));

    if duration > SLOW_JOB_THRESHOLD {
        warn!(
            topic = %topic,
            duration_ms,
            "Job exceeded performance threshold ({}ms)",
            SLOW_JOB_THRESHOLD.as_millis()
        );
    }

    if let Err(error) = result {
        span.set_attribute(KeyValue::new("error", error.to_string()));
        span.set_attribute(KeyValue::new("lock_contention", error.is_lock_contention()));
    }

    span.end();
}

/// Records a worker heartbeat while the worker waits for work.
///
/// # Arguments
///
/// * `queue_length` - Number of messages waiting in the queue
pub fn record_worker_heartbeat(queue_length: usize) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("worker_heartbeat");

    span.set_attribute(KeyValue::new("queue_length", queue_length as i64));
    span.end();

    info!(queue_length, "Worker heartbeat");
}

/// Initializes OpenTelemetry with an OTLP exporter.
///
/// Installs a batch span exporter on the Tokio runtime and makes it the
/// global tracer provider. Should be called once at worker startup.
///
/// # Arguments
///
/// * `endpoint` - OTLP collector endpoint (e.g., "http://localhost:4317")
/// * `service_name` - Value of the `service.name` resource attribute
///
/// # Returns
///
/// An error when the exporter pipeline cannot be built. The worker runs
/// without telemetry in that case.
pub fn init_telemetry(endpoint: &str, service_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name.to_string()),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!(endpoint = %endpoint, "Telemetry initialized");
    Ok(())
}
