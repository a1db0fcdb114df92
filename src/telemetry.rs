//! Telemetry and structured logging for dispatchers and workers.

use crate::dispatcher::BatchSummary;
use crate::message::Message;
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{info, warn};

const TRACER_NAME: &str = "convert-dispatch";

/// Batches slower than this are logged as a warning.
const SLOW_BATCH_MS: i64 = 60_000;

/// Records telemetry for a finished batch, complete or timed out.
///
/// Emits an OpenTelemetry span plus a structured log line carrying:
/// - Batch size and number of responses received
/// - Number of failed conversions
/// - Wall-clock duration (ms)
/// - Whether the batch timed out
pub fn record_batch_telemetry(summary: &BatchSummary) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("dispatch_batch");

    let duration_ms = summary.duration_ms();
    span.set_attribute(KeyValue::new("batch_token", summary.batch_token.clone()));
    span.set_attribute(KeyValue::new("batch_size", summary.batch_size as i64));
    span.set_attribute(KeyValue::new("received", summary.received as i64));
    span.set_attribute(KeyValue::new("failed", summary.failed as i64));
    span.set_attribute(KeyValue::new("timed_out", summary.timed_out));
    span.set_attribute(KeyValue::new("duration_ms", duration_ms));

    if summary.timed_out {
        warn!(
            batch_token = %summary.batch_token,
            batch_size = summary.batch_size,
            received = summary.received,
            duration_ms = duration_ms,
            "Batch timed out"
        );
    } else {
        info!(
            batch_token = %summary.batch_token,
            batch_size = summary.batch_size,
            failed = summary.failed,
            duration_ms = duration_ms,
            "Batch completed"
        );
    }

    if duration_ms > SLOW_BATCH_MS {
        warn!(
            batch_token = %summary.batch_token,
            duration_ms = duration_ms,
            "Batch exceeded performance threshold ({}ms)",
            SLOW_BATCH_MS
        );
    }

    span.end();
}

/// Records telemetry for one request answered by a worker.
pub fn record_request_telemetry(worker_id: usize, response: &Message, duration_ms: i64) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("convert_request");

    span.set_attribute(KeyValue::new("worker_id", worker_id as i64));
    span.set_attribute(KeyValue::new("callback", response.callback_ref.to_string()));
    span.set_attribute(KeyValue::new("sequence", response.sequence as i64));
    span.set_attribute(KeyValue::new("batch_size", response.batch_size as i64));
    span.set_attribute(KeyValue::new("success", response.is_success()));
    span.set_attribute(KeyValue::new("duration_ms", duration_ms));

    if let Some(result) = response.result.as_deref().filter(|_| !response.is_success()) {
        span.set_attribute(KeyValue::new("error", result.to_string()));
    }

    span.end();
}

/// Records a worker heartbeat for monitoring worker health.
///
/// # Arguments
///
/// * `worker_id` - Index of the worker loop
/// * `handled` - Messages handled by this loop since start
pub fn record_worker_heartbeat(worker_id: usize, handled: u64) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("worker_heartbeat");

    span.set_attribute(KeyValue::new("worker_id", worker_id as i64));
    span.set_attribute(KeyValue::new("handled", handled as i64));
    span.end();

    info!(worker_id = worker_id, handled = handled, "Worker heartbeat");
}

/// Initializes OpenTelemetry with OTLP exporter.
///
/// This should be called once at startup. Reads configuration
/// from environment variables:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` - Collector endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME` - Service name (default: the given `default_service`)
pub fn init_telemetry(default_service: &str) -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| default_service.to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    global::set_tracer_provider(tracer.provider().ok_or("tracer has no provider")?);

    info!("Telemetry initialized: endpoint={}", endpoint);
    Ok(())
}
