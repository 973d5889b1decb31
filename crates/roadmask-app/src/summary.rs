//! Per-run statistics.
//!
//! A [`RunSummary`] is created fresh for every run and mutated only by the
//! orchestrating task. Progress estimates use a rolling mean over the most
//! recent per-file durations so early outliers (cold caches, model warm-up)
//! wash out.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use roadmask_core::{FailureKind, TaskFailure, TaskStage};
use roadmask_events::{Event, FailureStage};
use uuid::Uuid;

/// One failed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEntry {
    /// Input file.
    pub path: PathBuf,
    /// Last stage the task completed.
    pub stage: TaskStage,
    /// Classification.
    pub kind: FailureKind,
    /// Rendered cause.
    pub cause: String,
}

impl FailureEntry {
    /// Pipeline stage reported to the event sink.
    #[must_use]
    pub const fn failure_stage(&self) -> FailureStage {
        failure_stage(self.kind)
    }
}

/// Map a failure kind to the stage reported in events.
#[must_use]
pub const fn failure_stage(kind: FailureKind) -> FailureStage {
    match kind {
        FailureKind::Io | FailureKind::Malformed => FailureStage::Load,
        FailureKind::Inference => FailureStage::Inference,
        FailureKind::Processing => FailureStage::PostProcess,
        FailureKind::Save => FailureStage::Save,
        FailureKind::Archive => FailureStage::Archive,
    }
}

/// Aggregate statistics for one run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    total: Option<u64>,
    processed: u64,
    skipped: u64,
    failed: u64,
    window: VecDeque<Duration>,
    window_size: usize,
    failures: Vec<FailureEntry>,
    interrupted: bool,
}

impl RunSummary {
    /// Start a summary. `window_size` bounds the rolling mean.
    #[must_use]
    pub fn new(run_id: Uuid, total: Option<u64>, window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            run_id,
            started_at: Utc::now(),
            total,
            processed: 0,
            skipped: 0,
            failed: 0,
            window: VecDeque::with_capacity(window_size),
            window_size,
            failures: Vec::new(),
            interrupted: false,
        }
    }

    /// Count a file that reached `Done`.
    pub fn record_processed(&mut self, duration: Duration) {
        self.processed += 1;
        self.push_duration(duration);
    }

    /// Count a file skipped by the done-check.
    pub const fn record_skipped(&mut self) {
        self.skipped += 1;
    }

    /// Count a failed file.
    pub fn record_failure(&mut self, path: &Path, failure: &TaskFailure, duration: Duration) {
        self.failed += 1;
        self.push_duration(duration);
        self.failures.push(FailureEntry {
            path: path.to_path_buf(),
            stage: failure.stage,
            kind: failure.kind,
            cause: failure.detail.clone(),
        });
    }

    /// Note that the run stopped before discovery finished.
    pub const fn mark_interrupted(&mut self) {
        self.interrupted = true;
    }

    fn push_duration(&mut self, duration: Duration) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(duration);
    }

    /// Run identifier.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// When the run started.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Number of candidates when discovery was precomputed.
    #[must_use]
    pub const fn total(&self) -> Option<u64> {
        self.total
    }

    /// Files that reached `Done`.
    #[must_use]
    pub const fn processed(&self) -> u64 {
        self.processed
    }

    /// Files skipped by the done-check.
    #[must_use]
    pub const fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Files that failed.
    #[must_use]
    pub const fn failed(&self) -> u64 {
        self.failed
    }

    /// Files accounted for so far.
    #[must_use]
    pub const fn completed(&self) -> u64 {
        self.processed + self.skipped + self.failed
    }

    /// Failed tasks in completion order.
    #[must_use]
    pub fn failures(&self) -> &[FailureEntry] {
        &self.failures
    }

    /// Whether the run was interrupted by a shutdown request.
    #[must_use]
    pub const fn interrupted(&self) -> bool {
        self.interrupted
    }

    /// Rolling mean of recent per-file durations.
    #[must_use]
    pub fn mean_file_duration(&self) -> Option<Duration> {
        if self.window.is_empty() {
            return None;
        }
        let sum: Duration = self.window.iter().sum();
        let count = u32::try_from(self.window.len()).unwrap_or(u32::MAX);
        Some(sum / count)
    }

    /// Estimated completion time, when the total is known.
    #[must_use]
    pub fn eta(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let total = self.total?;
        let mean = self.mean_file_duration()?;
        let remaining = u32::try_from(total.saturating_sub(self.completed())).ok()?;
        let left = chrono::Duration::from_std(mean.checked_mul(remaining)?).ok()?;
        now.checked_add_signed(left)
    }

    /// Progress snapshot for the event sink.
    #[must_use]
    pub fn progress_event(&self) -> Event {
        Event::Progress {
            run_id: self.run_id,
            processed: self.processed,
            skipped: self.skipped,
            failed: self.failed,
            total: self.total,
            mean_file_ms: self
                .mean_file_duration()
                .map_or(0, |mean| u64::try_from(mean.as_millis()).unwrap_or(u64::MAX)),
            eta: self.eta(Utc::now()),
        }
    }

    /// Final event for a run that was not aborted.
    #[must_use]
    pub fn finished_event(&self) -> Event {
        let elapsed = Utc::now() - self.started_at;
        Event::RunFinished {
            run_id: self.run_id,
            processed: self.processed,
            skipped: self.skipped,
            failed: self.failed,
            elapsed_ms: u64::try_from(elapsed.num_milliseconds()).unwrap_or(0),
            interrupted: self.interrupted,
        }
    }
}
