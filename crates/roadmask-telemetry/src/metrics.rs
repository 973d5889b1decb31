//! Prometheus-backed metrics registry and snapshot helpers.

use std::sync::Arc;
use std::time::Duration;

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Terminal outcome of one input file within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// All artifacts written.
    Processed,
    /// Done-check found every artifact already present.
    Skipped,
    /// Task failed at some stage.
    Failed,
}

impl FileOutcome {
    /// Label value used for the `outcome` dimension.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

/// Prometheus-backed metrics registry shared across the pipeline.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    files_total: IntCounterVec,
    file_retries_total: IntCounterVec,
    events_emitted_total: IntCounterVec,
    inference_latency_ms: IntGauge,
    workers_busy: IntGauge,
}

/// Snapshot of selected gauges and counters for run summaries.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Files that completed every stage.
    pub files_processed: u64,
    /// Files skipped by the done-check.
    pub files_skipped: u64,
    /// Files that failed.
    pub files_failed: u64,
    /// Latest inference call latency in milliseconds.
    pub inference_latency_ms: i64,
    /// Post-processing workers currently busy.
    pub workers_busy: i64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// built or registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let files_total = IntCounterVec::new(
            Opts::new("files_total", "Input files resolved by outcome"),
            &["outcome"],
        )
        .map_err(|source| collector("files_total", source))?;
        let file_retries_total = IntCounterVec::new(
            Opts::new(
                "file_retries_total",
                "Transient filesystem errors retried by operation",
            ),
            &["operation"],
        )
        .map_err(|source| collector("file_retries_total", source))?;
        let events_emitted_total = IntCounterVec::new(
            Opts::new("events_emitted_total", "Run events emitted by type"),
            &["type"],
        )
        .map_err(|source| collector("events_emitted_total", source))?;
        let inference_latency_ms = IntGauge::with_opts(Opts::new(
            "inference_latency_ms",
            "Latency of the most recent inference call (ms)",
        ))
        .map_err(|source| collector("inference_latency_ms", source))?;
        let workers_busy = IntGauge::with_opts(Opts::new(
            "workers_busy",
            "Post-processing workers currently running",
        ))
        .map_err(|source| collector("workers_busy", source))?;

        register(&registry, "files_total", files_total.clone())?;
        register(&registry, "file_retries_total", file_retries_total.clone())?;
        register(&registry, "events_emitted_total", events_emitted_total.clone())?;
        register(&registry, "inference_latency_ms", inference_latency_ms.clone())?;
        register(&registry, "workers_busy", workers_busy.clone())?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                files_total,
                file_retries_total,
                events_emitted_total,
                inference_latency_ms,
                workers_busy,
            }),
        })
    }

    /// Count a resolved input file.
    pub fn inc_file(&self, outcome: FileOutcome) {
        self.inner
            .files_total
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    /// Count a retried filesystem operation.
    pub fn inc_retry(&self, operation: &str) {
        self.inner
            .file_retries_total
            .with_label_values(&[operation])
            .inc();
    }

    /// Increment the emitted event counter for the specific event type.
    pub fn inc_event(&self, event_type: &str) {
        self.inner
            .events_emitted_total
            .with_label_values(&[event_type])
            .inc();
    }

    /// Record the latency of an inference call.
    pub fn observe_inference_latency(&self, duration: Duration) {
        self.inner
            .inference_latency_ms
            .set(Self::duration_to_ms(duration));
    }

    /// Mark a post-processing worker as started.
    pub fn worker_started(&self) {
        self.inner.workers_busy.inc();
    }

    /// Mark a post-processing worker as finished.
    pub fn worker_finished(&self) {
        self.inner.workers_busy.dec();
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::MetricsEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
    }

    /// Take a point-in-time snapshot of the run-level counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let files = |outcome: FileOutcome| {
            self.inner
                .files_total
                .with_label_values(&[outcome.as_str()])
                .get()
        };
        MetricsSnapshot {
            files_processed: files(FileOutcome::Processed),
            files_skipped: files(FileOutcome::Skipped),
            files_failed: files(FileOutcome::Failed),
            inference_latency_ms: self.inner.inference_latency_ms.get(),
            workers_busy: self.inner.workers_busy.get(),
        }
    }

    /// Convert a duration to milliseconds saturating at `i64::MAX`.
    pub(crate) fn duration_to_ms(duration: Duration) -> i64 {
        i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
    }
}

const fn collector(name: &'static str, source: prometheus::Error) -> TelemetryError {
    TelemetryError::MetricsCollector { name, source }
}

fn register<C>(registry: &Registry, name: &'static str, collector: C) -> Result<()>
where
    C: prometheus::core::Collector + 'static,
{
    registry
        .register(Box::new(collector))
        .map_err(|source| TelemetryError::MetricsRegister { name, source })
}
