use std::path::Path;
use std::sync::Arc;

use roadmask_config::{RoadmaskConfig, load_from_path, validate};
use roadmask_core::{InferenceClient, MetadataExtractor};
use roadmask_events::{EventBus, EventEnvelope};
use roadmask_telemetry::{LogFormat, LoggingConfig, Metrics, build_sha, init_logging};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::metadata::FileSystemMetadata;
use crate::orchestrator::Orchestrator;
use crate::summary::RunSummary;

/// Load the configuration at `config_path`, install logging, and run the
/// pipeline until every file is accounted for or Ctrl-C is pressed.
///
/// The filesystem fallback is used when no metadata extractor is supplied.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, logging cannot be
/// installed, or the run fails fatally.
pub async fn run_pipeline(
    config_path: &Path,
    inference: Box<dyn InferenceClient>,
    metadata: Option<Arc<dyn MetadataExtractor>>,
) -> AppResult<RunSummary> {
    let config =
        load_from_path(config_path).map_err(|err| AppError::config("config.load", err))?;
    init_logging(&LoggingConfig {
        level: &config.telemetry.log_level,
        format: LogFormat::from_name(config.telemetry.log_format.as_deref()),
        build_sha: build_sha(),
    })
    .map_err(|err| AppError::telemetry("telemetry.init", err))?;
    info!(config = %config_path.display(), "roadmask starting");

    let shutdown = shutdown_on_ctrl_c();
    let metadata = metadata.unwrap_or_else(|| Arc::new(FileSystemMetadata));
    run_with_config(&config, inference, metadata, &shutdown).await
}

/// Run the pipeline with an already loaded configuration.
///
/// Logging is left to the caller. Events are logged through a subscriber
/// that is drained before returning.
///
/// # Errors
///
/// Returns [`AppError::Config`] when `config` fails validation; otherwise see
/// [`Orchestrator::run`].
pub async fn run_with_config(
    config: &RoadmaskConfig,
    inference: Box<dyn InferenceClient>,
    metadata: Arc<dyn MetadataExtractor>,
    shutdown: &watch::Receiver<bool>,
) -> AppResult<RunSummary> {
    validate(config).map_err(|err| AppError::config("config.validate", err))?;
    let events = EventBus::new();
    let metrics =
        Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;
    let logger = spawn_event_logger(&events);
    let orchestrator = Orchestrator::new(config, inference, metadata, events, metrics.clone())?;

    let outcome = orchestrator.run(shutdown).await;
    drop(orchestrator);
    if let Err(err) = logger.await {
        warn!(error = %err, "event logger join failed");
    }

    let snapshot = metrics.snapshot();
    debug!(
        files_processed = snapshot.files_processed,
        files_skipped = snapshot.files_skipped,
        files_failed = snapshot.files_failed,
        inference_latency_ms = snapshot.inference_latency_ms,
        "final metrics"
    );
    outcome
}

/// Log every event published on `events` until the last publisher is dropped.
#[must_use]
pub fn spawn_event_logger(events: &EventBus) -> JoinHandle<()> {
    let mut stream = events.subscribe(None);
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(envelope) => log_event(&envelope),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event logger lagged behind the bus");
                }
            }
        }
    })
}

fn log_event(envelope: &EventEnvelope) {
    if envelope.event.is_alert() {
        warn!(
            event_id = envelope.id,
            kind = envelope.event.kind(),
            event = ?envelope.event,
            "run event"
        );
    } else {
        debug!(
            event_id = envelope.id,
            kind = envelope.event.kind(),
            event = ?envelope.event,
            "run event"
        );
    }
}

/// Shutdown signal that flips to `true` on Ctrl-C.
///
/// Must be called from within a Tokio runtime.
#[must_use]
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (sender, receiver) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received; finishing in-flight work");
                let _ = sender.send(true);
            }
            Err(err) => warn!(error = %err, "failed to listen for interrupt"),
        }
    });
    receiver
}
