//! Batch submission CLI.
//!
//! Usage: `convert-submit <objectRef>...`
//!
//! Submits every object reference as one batch, waits for all responses
//! (up to `BATCH_TIMEOUT_SECONDS`) and logs them in sequence order. Exits
//! with an error when the batch times out.

use anyhow::{bail, Context, Result};
use convert_dispatch::config::Settings;
use convert_dispatch::dispatcher::Dispatcher;
use convert_dispatch::queue::{QueueService, RedisQueueService};
use convert_dispatch::{telemetry, DispatchError};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = telemetry::init_telemetry("convert-submit") {
        warn!("Failed to initialize telemetry: {}", e);
    }

    let object_refs: Vec<String> = std::env::args().skip(1).collect();
    if object_refs.is_empty() {
        bail!("usage: convert-submit <objectRef>...");
    }

    let settings = Settings::from_env().context("Failed to load configuration")?;
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

    let dispatcher = Dispatcher::new(queues, processing_queue, settings.dispatcher_config());

    info!("Submitting batch of {} objects", object_refs.len());
    match dispatcher.run_batch(&object_refs, settings.batch_timeout).await {
        Ok(responses) => {
            for response in &responses {
                match response.artifact() {
                    Ok(artifact) => {
                        info!(sequence = response.sequence, artifact = %artifact, "Converted")
                    }
                    Err(e) => warn!(sequence = response.sequence, "{}", e),
                }
            }
            let failed = responses.iter().filter(|r| !r.is_success()).count();
            info!("Batch complete: {} converted, {} failed", responses.len() - failed, failed);
            Ok(())
        }
        Err(DispatchError::Timeout { batch_token, missing }) => {
            error!(batch_token = %batch_token, missing = ?missing, "Batch timed out");
            bail!("batch {batch_token} timed out with {} missing responses", missing.len())
        }
        Err(e) => Err(e).context("Batch failed"),
    }
}
