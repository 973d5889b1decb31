//! Event payload types emitted during a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier assigned to each event emitted by the bus.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Pipeline stage a task was in when it failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Reading bytes, decoding pixels, or reading metadata.
    Load,
    /// Detection call on the inference collaborator.
    Inference,
    /// Mask dilation and compositing.
    PostProcess,
    /// Writing the masked image or preview.
    Save,
    /// Copying the original and record into archive trees.
    Archive,
}

impl FailureStage {
    /// Stable label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Inference => "inference",
            Self::PostProcess => "post_process",
            Self::Save => "save",
            Self::Archive => "archive",
        }
    }
}

/// Typed run events surfaced to the report sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A run began walking the input tree.
    RunStarted {
        /// Identifier for this run.
        run_id: Uuid,
        /// Root of the input tree.
        input_root: String,
        /// Number of candidates when discovery was precomputed.
        total: Option<u64>,
    },
    /// Periodic progress update.
    Progress {
        /// Identifier for this run.
        run_id: Uuid,
        /// Files that reached `Done` so far.
        processed: u64,
        /// Files skipped by the done-check so far.
        skipped: u64,
        /// Files that failed so far.
        failed: u64,
        /// Number of candidates when known.
        total: Option<u64>,
        /// Rolling mean per-file duration in milliseconds.
        mean_file_ms: u64,
        /// Estimated completion time when the total is known.
        eta: Option<DateTime<Utc>>,
    },
    /// A transient filesystem error is being retried.
    RetryScheduled {
        /// Filesystem operation being retried.
        operation: String,
        /// Path involved in the operation.
        path: String,
        /// Attempt number that just failed, starting at 1.
        attempt: u32,
        /// Time spent on the operation so far.
        elapsed_ms: u64,
        /// Rendered cause.
        cause: String,
    },
    /// A filesystem operation gave up after its retry budget elapsed.
    RetryExhausted {
        /// Filesystem operation that failed.
        operation: String,
        /// Path involved in the operation.
        path: String,
        /// Number of attempts made.
        attempts: u32,
        /// Total elapsed time.
        elapsed_ms: u64,
        /// Rendered final cause.
        cause: String,
    },
    /// One file failed; the run continues.
    TaskFailed {
        /// Input path of the failed file.
        path: String,
        /// Stage where the failure occurred.
        stage: FailureStage,
        /// Failure classification label.
        kind: String,
        /// Human-readable detail.
        message: String,
    },
    /// The run stopped early on a fatal condition.
    RunAborted {
        /// Identifier for this run.
        run_id: Uuid,
        /// Reason for the abort.
        reason: String,
    },
    /// The run finished (normally or after an interrupt).
    RunFinished {
        /// Identifier for this run.
        run_id: Uuid,
        /// Files that reached `Done`.
        processed: u64,
        /// Files skipped by the done-check.
        skipped: u64,
        /// Files that failed.
        failed: u64,
        /// Wall-clock duration of the run.
        elapsed_ms: u64,
        /// Whether discovery was cut short by a shutdown request.
        interrupted: bool,
    },
}

impl Event {
    /// Machine-friendly discriminator for log forwarders.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::Progress { .. } => "progress",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::TaskFailed { .. } => "task_failed",
            Self::RunAborted { .. } => "run_aborted",
            Self::RunFinished { .. } => "run_finished",
        }
    }

    /// Whether the event should page an operator.
    #[must_use]
    pub const fn is_alert(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. } | Self::RunAborted { .. })
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id and emission timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Monotonic identifier assigned to the wrapped event.
    pub id: EventId,
    /// Timestamp recording when the envelope was produced.
    pub timestamp: DateTime<Utc>,
    /// Wrapped event payload.
    pub event: Event,
}
