//! Conversion Worker Service
//!
//! This worker consumes conversion requests from the shared processing queue,
//! converts each referenced SVG to PDF and answers on the callback queue named
//! in the request.
//!
//! ## Architecture
//!
//! - **Queue**: Redis-backed transport (`<namespace>:queue:<name>:*` keys)
//! - **Converter**: svg2pdf-based SVG→PDF pipeline
//! - **Telemetry**: OpenTelemetry OTLP export
//!
//! ## Configuration
//!
//! See [`convert_dispatch::config`] for the environment variables; `RUST_LOG`
//! sets the log level (default: info).

use anyhow::{Context, Result};
use convert_dispatch::config::Settings;
use convert_dispatch::converter::{Converter, SvgToPdfConverter};
use convert_dispatch::queue::{QueueService, RedisQueueService};
use convert_dispatch::telemetry;
use convert_dispatch::worker::Worker;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
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

    // Initialize OpenTelemetry
    if let Err(e) = telemetry::init_telemetry("convert-worker") {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!("Starting conversion worker service");

    let settings = Settings::from_env().context("Failed to load configuration")?;
    info!(
        "Configuration: redis_url={}, processing_queue={}, concurrency={}",
        settings.redis_url, settings.processing_queue, settings.worker_concurrency
    );

    let queues: Arc<dyn QueueService> = Arc::new(
        RedisQueueService::connect(
            &settings.redis_url,
            settings.queue_namespace.clone(),
            settings.visibility_timeout,
            settings.dedup_window,
        )
        .await
        .context("Failed to connect to Redis")?,
    );

    let processing_queue = queues
        .create_queue(&settings.processing_queue)
        .await
        .context("Failed to create processing queue")?;

    let converter: Arc<dyn Converter> = Arc::new(match &settings.output_dir {
        Some(dir) => SvgToPdfConverter::with_output_dir(dir),
        None => SvgToPdfConverter::new(),
    });

    // Spawn worker loops
    let stop = CancellationToken::new();
    let mut handles = vec![];
    for worker_id in 0..settings.worker_concurrency {
        let worker = Worker::new(
            worker_id,
            queues.clone(),
            converter.clone(),
            processing_queue.clone(),
            settings.worker_config(),
        );
        let token = stop.child_token();
        handles.push(tokio::spawn(async move { worker.run(token).await }));
    }

    // Wait for shutdown signal
    info!("Worker service ready, press Ctrl+C to shutdown");
    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;

    info!("Received shutdown signal, waiting for workers to finish...");
    stop.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Worker task failed: {}", e);
        }
    }

    info!("Worker service shutdown complete");
    Ok(())
}
