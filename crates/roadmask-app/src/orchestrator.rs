//! Per-file pipeline controller.
//!
//! Loading and inference run one file at a time on the orchestrating task, so
//! the inference collaborator never sees overlapping calls. Masking, saving,
//! and archiving are handed to blocking workers bounded by a semaphore;
//! results come back over one channel and are accounted for here.
#![allow(clippy::redundant_pub_crate)]

use std::error::Error;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use image::RgbImage;
use roadmask_config::RoadmaskConfig;
use roadmask_core::{
    DetectionSet, FailureKind, InferenceClient, Metadata, MetadataError, MetadataExtractor,
    MetadataRecord, PIPELINE_VERSION, ProcessingResult, StageTimestamps, TaskFailure, TaskStage,
};
use roadmask_events::{Event, EventBus};
use roadmask_fsops::{
    Archiver, Candidate, CandidateStatus, DiscoveryOptions, ErrorClass, FileTask, MirrorLayout,
    PathIndex, RetryPolicy, RetryingFileIo, classify_io_error, sha256_hex,
};
use roadmask_masking::{MaskApplier, MaskArtifacts};
use roadmask_telemetry::{FileOutcome, Metrics};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, describe};
use crate::summary::{RunSummary, failure_stage};

/// Candidates buffered ahead of the orchestrator in lazy discovery.
const LAZY_DISCOVERY_BUFFER: usize = 64;

type SharedInference = Arc<Mutex<Box<dyn InferenceClient>>>;

/// Decoded original plus what the metadata record needs from it.
struct LoadedImage {
    image: RgbImage,
    sha256: String,
    metadata: Metadata,
}

/// Inputs for one post-processing worker.
struct WorkItem {
    task: FileTask,
    loaded: LoadedImage,
    detections: DetectionSet,
    timestamps: StageTimestamps,
    clock: Instant,
}

enum InferenceFailure {
    /// Only this image is affected.
    Rejected(TaskFailure),
    /// The model is unusable; stop the run.
    Fatal(String),
}

enum Prepared {
    Ready(WorkItem),
    Failed(ProcessingResult),
    Fatal(String),
}

enum CandidateSource {
    Eager(std::vec::IntoIter<Candidate>),
    Lazy(mpsc::Receiver<Candidate>),
}

impl CandidateSource {
    async fn next(&mut self) -> Option<Candidate> {
        match self {
            Self::Eager(candidates) => candidates.next(),
            Self::Lazy(receiver) => receiver.recv().await,
        }
    }
}

/// Drives every discovered file through load, inference, masking, and archiving.
pub struct Orchestrator {
    index: PathIndex,
    archiver: Archiver,
    io: RetryingFileIo,
    applier: Arc<MaskApplier>,
    inference: SharedInference,
    metadata: Arc<dyn MetadataExtractor>,
    events: EventBus,
    metrics: Metrics,
    workers: usize,
    progress_every: u64,
    eta_window: usize,
    lazy_paths: bool,
}

impl Orchestrator {
    /// Wire an orchestrator from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::FsOps`] when the discovery globs do not compile.
    pub fn new(
        config: &RoadmaskConfig,
        inference: Box<dyn InferenceClient>,
        metadata: Arc<dyn MetadataExtractor>,
        events: EventBus,
        metrics: Metrics,
    ) -> AppResult<Self> {
        let options = DiscoveryOptions::from_config(&config.discovery)
            .map_err(|err| AppError::fsops("discovery.options", err))?;
        let io = RetryingFileIo::new(
            RetryPolicy::from_config(&config.io),
            events.clone(),
            metrics.clone(),
        );
        Ok(Self {
            index: PathIndex::new(MirrorLayout::from_config(config), options),
            archiver: Archiver::new(io.clone(), config.pipeline.delete_input_after_archive),
            io,
            applier: Arc::new(MaskApplier::new(&config.masking)),
            inference: Arc::new(Mutex::new(inference)),
            metadata,
            events,
            metrics,
            workers: config.pipeline.workers.max(1),
            progress_every: config.pipeline.progress_every.max(1),
            eta_window: config.pipeline.eta_window,
            lazy_paths: config.discovery.lazy_paths,
        })
    }

    /// Replace the mask applier built from configuration.
    #[must_use]
    pub fn with_mask_applier(mut self, applier: MaskApplier) -> Self {
        self.applier = Arc::new(applier);
        self
    }

    /// Path index used for discovery.
    #[must_use]
    pub const fn index(&self) -> &PathIndex {
        &self.index
    }

    /// Process every pending file under the input root.
    ///
    /// Setting `shutdown` to `true` stops discovery; work already handed to
    /// the pool finishes and is accounted for before returning.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::FsOps`] when the input root is missing and
    /// [`AppError::Aborted`] when the inference resource fails. Task-local
    /// failures are recorded in the returned summary instead.
    pub async fn run(&self, shutdown: &watch::Receiver<bool>) -> AppResult<RunSummary> {
        let run_id = Uuid::new_v4();
        let (mut source, total) = self.start_discovery().await?;
        let mut summary = RunSummary::new(run_id, total, self.eta_window);
        let input_root = self.index.layout().input_root().display().to_string();
        info!(
            %run_id,
            input_root = %input_root,
            total,
            workers = self.workers,
            strategy = self.applier.strategy_name(),
            "run started"
        );
        self.publish(Event::RunStarted {
            run_id,
            input_root,
            total,
        });

        let permits = Arc::new(Semaphore::new(self.workers));
        let (results_tx, mut results) = mpsc::channel(self.workers);
        let mut in_flight = 0_usize;
        let mut abort: Option<String> = None;

        loop {
            if *shutdown.borrow() {
                info!(%run_id, "shutdown requested; stopping discovery");
                summary.mark_interrupted();
                break;
            }
            let Some(Candidate { task, status }) = source.next().await else {
                break;
            };
            if status == CandidateStatus::AlreadyDone {
                debug!(path = %task.input().display(), "outputs present; skipping");
                summary.record_skipped();
                self.metrics.inc_file(FileOutcome::Skipped);
                self.maybe_report(&summary);
                continue;
            }

            match self.prepare(task).await {
                Prepared::Failed(result) => self.account(&mut summary, result).await,
                Prepared::Fatal(reason) => {
                    abort = Some(reason);
                    break;
                }
                Prepared::Ready(item) => {
                    let Some(permit) = self
                        .acquire_worker(&permits, &mut results, &mut in_flight, &mut summary)
                        .await
                    else {
                        warn!(%run_id, "worker pool closed; stopping discovery");
                        break;
                    };
                    in_flight += 1;
                    self.spawn_worker(permit, item, results_tx.clone());
                }
            }
        }

        drop(source);
        while in_flight > 0 {
            let Some(result) = results.recv().await else {
                break;
            };
            in_flight -= 1;
            self.account(&mut summary, result).await;
        }

        self.finish(summary, abort)
    }

    /// Flush the summary and publish the closing events.
    fn finish(&self, summary: RunSummary, abort: Option<String>) -> AppResult<RunSummary> {
        let run_id = summary.run_id();
        self.publish(summary.progress_event());
        if let Some(reason) = abort {
            error!(
                %run_id,
                reason = %reason,
                processed = summary.processed(),
                failed = summary.failed(),
                "run aborted"
            );
            self.publish(Event::RunAborted {
                run_id,
                reason: reason.clone(),
            });
            return Err(AppError::Aborted {
                reason,
                summary: Box::new(summary),
            });
        }

        info!(
            %run_id,
            processed = summary.processed(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            interrupted = summary.interrupted(),
            "run finished"
        );
        self.publish(summary.finished_event());
        Ok(summary)
    }

    /// Load and run inference for one pending file.
    async fn prepare(&self, task: FileTask) -> Prepared {
        let mut timestamps = StageTimestamps::started();
        let clock = Instant::now();
        let failed = |failure| {
            Prepared::Failed(ProcessingResult::failed(
                task.input().to_path_buf(),
                failure,
                timestamps,
                clock.elapsed(),
            ))
        };
        let loaded = match self.load(&task).await {
            Ok(loaded) => loaded,
            Err(failure) => return failed(failure),
        };
        let (loaded, detections) = match self.infer(loaded).await {
            Ok(inferred) => inferred,
            Err(InferenceFailure::Rejected(failure)) => return failed(failure),
            Err(InferenceFailure::Fatal(reason)) => return Prepared::Fatal(reason),
        };
        timestamps.inference_done = Some(Utc::now());
        Prepared::Ready(WorkItem {
            task,
            loaded,
            detections,
            timestamps,
            clock,
        })
    }

    async fn start_discovery(&self) -> AppResult<(CandidateSource, Option<u64>)> {
        if self.lazy_paths {
            let discovery = self
                .index
                .discover()
                .map_err(|err| AppError::fsops("discovery.start", err))?;
            let (sender, receiver) = mpsc::channel(LAZY_DISCOVERY_BUFFER);
            tokio::task::spawn_blocking(move || {
                for candidate in discovery {
                    if sender.blocking_send(candidate).is_err() {
                        break;
                    }
                }
            });
            return Ok((CandidateSource::Lazy(receiver), None));
        }

        let index = self.index.clone();
        let candidates = tokio::task::spawn_blocking(move || index.discover_all())
            .await
            .map_err(|err| AppError::join("discovery.join", err))?
            .map_err(|err| AppError::fsops("discovery.discover_all", err))?;
        let total = u64::try_from(candidates.len()).ok();
        Ok((CandidateSource::Eager(candidates.into_iter()), total))
    }

    async fn load(&self, task: &FileTask) -> Result<LoadedImage, TaskFailure> {
        let io = self.io.clone();
        let extractor = Arc::clone(&self.metadata);
        let path = task.input().to_path_buf();
        tokio::task::spawn_blocking(move || load_blocking(&io, extractor.as_ref(), &path))
            .await
            .unwrap_or_else(|err| Err(load_failure(FailureKind::Io, &err)))
    }

    async fn infer(
        &self,
        loaded: LoadedImage,
    ) -> Result<(LoadedImage, DetectionSet), InferenceFailure> {
        let client = Arc::clone(&self.inference);
        let started = Instant::now();
        let joined = tokio::task::spawn_blocking(move || {
            let (outcome, model) = {
                let mut client = client.lock().unwrap_or_else(PoisonError::into_inner);
                (client.infer(&loaded.image), client.name())
            };
            (loaded, outcome, model)
        })
        .await;
        let latency = started.elapsed();
        self.metrics.observe_inference_latency(latency);

        let (loaded, outcome, model) =
            joined.map_err(|err| InferenceFailure::Fatal(describe(&err)))?;
        match outcome {
            Ok(detections) => {
                debug!(
                    model,
                    detections = detections.len(),
                    latency_ms = duration_ms(latency),
                    "inference complete"
                );
                Ok((loaded, detections))
            }
            Err(err) if err.is_fatal() => {
                Err(InferenceFailure::Fatal(format!("{err}: {}", err.detail())))
            }
            Err(err) => Err(InferenceFailure::Rejected(TaskFailure::new(
                TaskStage::Loaded,
                FailureKind::Inference,
                format!("{err}: {}", err.detail()),
            ))),
        }
    }

    /// Wait for a pool slot, accounting for results that arrive meanwhile.
    async fn acquire_worker(
        &self,
        permits: &Arc<Semaphore>,
        results: &mut mpsc::Receiver<ProcessingResult>,
        in_flight: &mut usize,
        summary: &mut RunSummary,
    ) -> Option<OwnedSemaphorePermit> {
        loop {
            tokio::select! {
                acquired = Arc::clone(permits).acquire_owned() => return acquired.ok(),
                Some(result) = results.recv(), if *in_flight > 0 => {
                    *in_flight -= 1;
                    self.account(summary, result).await;
                }
            }
        }
    }

    fn spawn_worker(
        &self,
        permit: OwnedSemaphorePermit,
        item: WorkItem,
        results: mpsc::Sender<ProcessingResult>,
    ) {
        let applier = Arc::clone(&self.applier);
        let archiver = self.archiver.clone();
        let metrics = self.metrics.clone();
        let input = item.task.input().to_path_buf();
        let timestamps = item.timestamps;
        let clock = item.clock;
        tokio::spawn(async move {
            let _permit = permit;
            metrics.worker_started();
            let joined =
                tokio::task::spawn_blocking(move || post_process(&applier, &archiver, item)).await;
            metrics.worker_finished();
            let result = joined.unwrap_or_else(|err| {
                ProcessingResult::failed(
                    input,
                    TaskFailure::new(TaskStage::Inferred, FailureKind::Processing, describe(&err)),
                    timestamps,
                    clock.elapsed(),
                )
            });
            if results.send(result).await.is_err() {
                warn!("result channel closed before a worker finished");
            }
        });
    }

    async fn account(&self, summary: &mut RunSummary, result: ProcessingResult) {
        match result.failure() {
            None => {
                summary.record_processed(result.duration());
                self.metrics.inc_file(FileOutcome::Processed);
                info!(
                    path = %result.input().display(),
                    stage = result.stage().as_str(),
                    detections = result.detection_count(),
                    elapsed_ms = duration_ms(result.duration()),
                    "file processed"
                );
            }
            Some(failure) => {
                summary.record_failure(result.input(), failure, result.duration());
                self.metrics.inc_file(FileOutcome::Failed);
                warn!(
                    path = %result.input().display(),
                    stage = failure.stage.as_str(),
                    kind = failure.kind.as_str(),
                    error = %failure.detail,
                    "file failed"
                );
                self.publish(Event::TaskFailed {
                    path: result.input().display().to_string(),
                    stage: failure_stage(failure.kind),
                    kind: failure.kind.as_str().to_string(),
                    message: failure.detail.clone(),
                });
                self.mirror_failure(result.input(), failure).await;
            }
        }
        self.maybe_report(summary);
    }

    /// Copy a failed input and its cause into the error tree, when enabled.
    /// Mirror failures are logged and never change the task outcome.
    async fn mirror_failure(&self, input: &Path, failure: &TaskFailure) {
        if !self.index.layout().has_error_root() {
            return;
        }
        let task = match self.index.layout().task_for(input) {
            Ok(task) => task,
            Err(err) => {
                warn!(path = %input.display(), error = %describe(&err), "could not derive error mirror paths");
                return;
            }
        };
        let archiver = self.archiver.clone();
        let failure = failure.clone();
        let mirrored =
            tokio::task::spawn_blocking(move || archiver.mirror_failure(&task, &failure)).await;
        match mirrored {
            Ok(Ok(_)) => debug!(path = %input.display(), "failed input mirrored"),
            Ok(Err(err)) => {
                warn!(path = %input.display(), error = %describe(&err), "could not mirror failed input");
            }
            Err(err) => {
                warn!(path = %input.display(), error = %describe(&err), "error mirror worker panicked");
            }
        }
    }

    fn maybe_report(&self, summary: &RunSummary) {
        if summary.completed() % self.progress_every == 0 {
            self.publish(summary.progress_event());
        }
    }

    fn publish(&self, event: Event) {
        self.metrics.inc_event(event.kind());
        let _ = self.events.publish(event);
    }
}

fn load_blocking(
    io: &RetryingFileIo,
    extractor: &dyn MetadataExtractor,
    path: &Path,
) -> Result<LoadedImage, TaskFailure> {
    let bytes = io
        .read(path)
        .map_err(|err| load_failure(FailureKind::Io, &err))?;
    let sha256 = sha256_hex(&bytes);
    let image = image::load_from_memory(&bytes)
        .map_err(|err| load_failure(FailureKind::Malformed, &err))?
        .to_rgb8();
    let metadata = io
        .retry("metadata.read", path, classify_metadata_error, || {
            extractor.read_metadata(path)
        })
        .map_err(|err| {
            let cause = err.into_cause();
            let kind = match cause {
                MetadataError::Io { .. } => FailureKind::Io,
                MetadataError::Malformed { .. } => FailureKind::Malformed,
            };
            load_failure(kind, &cause)
        })?;
    Ok(LoadedImage {
        image,
        sha256,
        metadata: extractor.sanitize(metadata),
    })
}

fn load_failure(kind: FailureKind, err: &(dyn Error + 'static)) -> TaskFailure {
    TaskFailure::new(TaskStage::Discovered, kind, describe(err))
}

fn classify_metadata_error(err: &MetadataError) -> ErrorClass {
    match err {
        MetadataError::Io { source, .. } => classify_io_error(source),
        MetadataError::Malformed { .. } => ErrorClass::Terminal,
    }
}

fn post_process(applier: &MaskApplier, archiver: &Archiver, item: WorkItem) -> ProcessingResult {
    let WorkItem {
        task,
        loaded,
        detections,
        mut timestamps,
        clock,
    } = item;
    let input = task.input().to_path_buf();
    let failed = |stage, kind, detail: String, timestamps| {
        ProcessingResult::failed(
            task.input().to_path_buf(),
            TaskFailure::new(stage, kind, detail),
            timestamps,
            clock.elapsed(),
        )
    };

    let mut stage = TaskStage::Inferred;
    let artifacts = match applier.apply(&loaded.image, &detections) {
        Ok(artifacts) => artifacts,
        Err(err) => {
            return failed(stage, FailureKind::Processing, describe(&err), timestamps);
        }
    };
    stage = stage.next();

    let preview = task.output().preview.as_ref().map(|_| &artifacts.preview);
    if let Err(err) = archiver.save(&task, &artifacts.masked, preview) {
        return failed(stage, FailureKind::Save, describe(&err), timestamps);
    }
    timestamps.save_done = Some(Utc::now());

    let record = build_record(&task, loaded, &artifacts, timestamps);
    let report = match archiver.archive(&task, &record) {
        Ok(report) => report,
        Err(err) => {
            return failed(stage, FailureKind::Archive, describe(&err), timestamps);
        }
    };
    stage = stage.next();
    debug!(
        path = %input.display(),
        stage = stage.as_str(),
        destinations = report.destinations,
        input_deleted = report.input_deleted,
        "archived"
    );
    ProcessingResult::succeeded(input, artifacts.instances, timestamps, clock.elapsed())
}

fn build_record(
    task: &FileTask,
    loaded: LoadedImage,
    artifacts: &MaskArtifacts,
    processed: StageTimestamps,
) -> MetadataRecord {
    let LoadedImage {
        image,
        sha256,
        metadata,
    } = loaded;
    MetadataRecord {
        record_id: Uuid::new_v4(),
        original_filename: task.file_name().to_string(),
        relative_path: task.relative().display().to_string(),
        original_sha256: sha256,
        width: image.width(),
        height: image.height(),
        captured_at: metadata.captured_at,
        location: metadata.location,
        attributes: metadata.attributes,
        detections: artifacts.instances.clone(),
        detection_counts: MetadataRecord::count_labels(&artifacts.instances),
        mask_preview: task
            .output()
            .preview
            .as_ref()
            .and_then(|path| path.file_name())
            .map(|name| name.to_string_lossy().into_owned()),
        processed,
        pipeline_version: PIPELINE_VERSION.to_string(),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
