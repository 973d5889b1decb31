use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use image::{GrayImage, RgbImage};
use roadmask_app::{AppError, Orchestrator, RunSummary};
use roadmask_config::RoadmaskConfig;
use roadmask_core::{
    Detection, DetectionSet, FailureKind, InferenceClient, InferenceError, MetadataRecord,
    TaskStage,
};
use roadmask_events::{Event, EventBus};
use roadmask_fsops::sha256_hex;
use roadmask_masking::MaskApplier;
use roadmask_telemetry::Metrics;
use roadmask_test_support::fixtures::SurveyTree;
use roadmask_test_support::mocks::{SlowFillStrategy, StubInference, StubMetadata};
use tokio::sync::watch;

fn orchestrator(
    config: &RoadmaskConfig,
    inference: impl InferenceClient + 'static,
    events: &EventBus,
) -> Result<Orchestrator> {
    Ok(Orchestrator::new(
        config,
        Box::new(inference),
        Arc::new(StubMetadata::new()),
        events.clone(),
        Metrics::new()?,
    )?)
}

async fn run_once(config: &RoadmaskConfig, inference: StubInference) -> Result<RunSummary> {
    let (_sender, shutdown) = watch::channel(false);
    let summary = orchestrator(config, inference, &EventBus::new())?
        .run(&shutdown)
        .await?;
    Ok(summary)
}

fn counts(summary: &RunSummary) -> (u64, u64, u64) {
    (summary.processed(), summary.failed(), summary.skipped())
}

fn read_record(path: &std::path::Path) -> Result<MetadataRecord> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[tokio::test]
async fn second_run_skips_completed_files() -> Result<()> {
    let tree = SurveyTree::new()?;
    tree.add_image("a.jpg", 32, 32)?;
    tree.add_image("b.png", 32, 32)?;
    let config = tree.config();

    let first = run_once(&config, StubInference::new()).await?;
    assert_eq!(counts(&first), (2, 0, 0));
    assert_eq!(first.total(), Some(2));

    let second = run_once(&config, StubInference::new()).await?;
    assert_eq!(counts(&second), (0, 0, 2));
    Ok(())
}

#[tokio::test]
async fn missing_record_triggers_reprocessing() -> Result<()> {
    let tree = SurveyTree::new()?;
    tree.add_image("a.jpg", 32, 32)?;
    tree.add_image("b.jpg", 32, 32)?;
    let config = tree.config();
    run_once(&config, StubInference::new()).await?;

    // Simulate a crash between saving the image and writing the record.
    fs::remove_file(tree.output.join("b.jpg.json"))?;
    assert!(tree.output.join("b.jpg").is_file());

    let rerun = run_once(&config, StubInference::new()).await?;
    assert_eq!(counts(&rerun), (1, 0, 1));
    assert!(tree.output.join("b.jpg.json").is_file());
    Ok(())
}

#[tokio::test]
async fn outputs_and_archives_mirror_the_input_tree() -> Result<()> {
    let tree = SurveyTree::new()?;
    let root_file = tree.add_image("a.jpg", 40, 20)?;
    let nested = tree.add_image("route-7/2024/05/b.jpg", 40, 20)?;
    let config = tree.config_with_archive();

    let summary = run_once(&config, StubInference::new()).await?;
    assert_eq!(counts(&summary), (2, 0, 0));

    for relative in ["a.jpg", "route-7/2024/05/b.jpg"] {
        assert!(tree.output.join(relative).is_file());
        assert!(tree.output.join(format!("{relative}.json")).is_file());
        assert!(tree.output.join(format!("{relative}.mask.png")).is_file());
        assert!(tree.archive.join(relative).is_file());
        assert!(tree.archive.join(format!("{relative}.json")).is_file());
    }
    assert!(root_file.is_file(), "inputs are kept by default");

    let record = read_record(&tree.output.join("route-7/2024/05/b.jpg.json"))?;
    assert_eq!(record.original_filename, "b.jpg");
    assert_eq!(
        std::path::Path::new(&record.relative_path),
        std::path::Path::new("route-7/2024/05/b.jpg")
    );
    assert_eq!(record.original_sha256, sha256_hex(&fs::read(&nested)?));
    assert_eq!((record.width, record.height), (40, 20));
    assert_eq!(record.detection_counts.get("car"), Some(&1));
    assert_eq!(record.mask_preview.as_deref(), Some("b.jpg.mask.png"));
    assert!(record.detections.iter().all(|instance| instance.masked));
    assert!(record.processed.save_done.is_some());

    let archived = read_record(&tree.archive.join("route-7/2024/05/b.jpg.json"))?;
    assert_eq!(archived.record_id, record.record_id);
    Ok(())
}

#[tokio::test]
async fn corrupt_image_fails_alone_and_fails_again_on_rerun() -> Result<()> {
    let tree = SurveyTree::new()?;
    tree.add_image("a.jpg", 24, 24)?;
    tree.add_corrupt("b.jpg")?;
    tree.add_image("c.jpg", 24, 24)?;
    let config = tree.config();

    let first = run_once(&config, StubInference::new()).await?;
    assert_eq!(counts(&first), (2, 1, 0));
    let failure = &first.failures()[0];
    assert!(failure.path.ends_with("b.jpg"));
    assert_eq!(failure.kind, FailureKind::Malformed);

    let second = run_once(&config, StubInference::new()).await?;
    assert_eq!(counts(&second), (0, 1, 2));
    Ok(())
}

#[tokio::test]
async fn failed_inputs_are_copied_to_the_error_tree() -> Result<()> {
    let tree = SurveyTree::new()?;
    tree.add_image("a.jpg", 24, 24)?;
    let corrupt = tree.add_corrupt("day1/b.jpg")?;
    let config = tree.config_with_error_mirror();

    let summary = run_once(&config, StubInference::new()).await?;
    assert_eq!(counts(&summary), (1, 1, 0));

    assert_eq!(fs::read(tree.errors.join("day1/b.jpg"))?, fs::read(&corrupt)?);
    let note = fs::read_to_string(tree.errors.join("day1/b.jpg.error.txt"))?;
    assert!(note.contains("kind: malformed"));
    assert!(note.contains("stage: discovered"));
    assert!(corrupt.is_file(), "the failed input stays in place");
    assert!(!tree.errors.join("a.jpg").exists());
    assert!(!tree.output.join("day1/b.jpg").exists());
    Ok(())
}

#[tokio::test]
async fn error_tree_stays_empty_when_not_configured() -> Result<()> {
    let tree = SurveyTree::new()?;
    tree.add_corrupt("b.jpg")?;

    let summary = run_once(&tree.config(), StubInference::new()).await?;
    assert_eq!(counts(&summary), (0, 1, 0));
    assert!(!tree.errors.exists());
    Ok(())
}

#[tokio::test]
async fn same_stem_inputs_get_separate_records() -> Result<()> {
    let tree = SurveyTree::new()?;
    tree.add_image("a.jpg", 24, 24)?;
    tree.add_image("a.png", 32, 16)?;
    let config = tree.config();

    let first = run_once(&config, StubInference::new()).await?;
    assert_eq!(counts(&first), (2, 0, 0));
    let jpg = read_record(&tree.output.join("a.jpg.json"))?;
    let png = read_record(&tree.output.join("a.png.json"))?;
    assert_eq!(jpg.original_filename, "a.jpg");
    assert_eq!((png.original_filename.as_str(), png.width), ("a.png", 32));

    // Removing one record reprocesses only its own input.
    fs::remove_file(tree.output.join("a.png.json"))?;
    let rerun = run_once(&config, StubInference::new()).await?;
    assert_eq!(counts(&rerun), (1, 0, 1));
    Ok(())
}

#[tokio::test]
async fn mixed_case_extensions_set_in_code_are_discovered() -> Result<()> {
    let tree = SurveyTree::new()?;
    tree.add_image("a.jpg", 24, 24)?;
    tree.add_image("b.jpeg", 24, 24)?;
    let mut config = tree.config();
    config.discovery.supported_extensions = vec![".JPG".into(), "Jpeg".into()];

    let summary = run_once(&config, StubInference::new()).await?;
    assert_eq!(counts(&summary), (2, 0, 0));
    Ok(())
}

#[tokio::test]
async fn archive_failure_leaves_the_task_uncommitted_until_rerun() -> Result<()> {
    let tree = SurveyTree::new()?;
    tree.add_image("a.jpg", 24, 24)?;
    let config = tree.config_with_archive();
    // A plain file where the archive tree belongs makes every archive write fail.
    fs::write(&tree.archive, b"not a directory")?;

    let first = run_once(&config, StubInference::new()).await?;
    assert_eq!(counts(&first), (0, 1, 0));
    let failure = &first.failures()[0];
    assert_eq!(failure.kind, FailureKind::Archive);
    assert_eq!(failure.stage, TaskStage::PostProcessed);
    assert!(tree.output.join("a.jpg").is_file(), "saved output stays");
    assert!(!tree.output.join("a.jpg.json").exists(), "record is the commit marker");

    fs::remove_file(&tree.archive)?;
    let rerun = run_once(&config, StubInference::new()).await?;
    assert_eq!(counts(&rerun), (1, 0, 0));
    assert!(tree.output.join("a.jpg.json").is_file());
    assert!(tree.archive.join("a.jpg").is_file());
    assert!(tree.archive.join("a.jpg.json").is_file());
    Ok(())
}

#[tokio::test]
async fn inference_is_single_flight_while_workers_overlap() -> Result<()> {
    let tree = SurveyTree::new()?;
    for name in ["a.jpg", "b.jpg", "c.jpg", "d.jpg", "e.jpg"] {
        tree.add_image(name, 64, 64)?;
    }
    let mut config = tree.config();
    config.pipeline.workers = 2;

    let inference = StubInference::new().with_delay(Duration::from_millis(20));
    let inference_tracker = inference.tracker();
    let strategy = SlowFillStrategy::new(Duration::from_millis(250));
    let strategy_tracker = strategy.tracker();
    let applier = MaskApplier::with_strategy(Box::new(strategy), &config.masking);

    let (_sender, shutdown) = watch::channel(false);
    let summary = orchestrator(&config, inference, &EventBus::new())?
        .with_mask_applier(applier)
        .run(&shutdown)
        .await?;

    assert_eq!(counts(&summary), (5, 0, 0));
    assert_eq!(inference_tracker.calls(), 5);
    assert_eq!(inference_tracker.max_in_flight(), 1);
    assert_eq!(strategy_tracker.calls(), 5);
    assert_eq!(strategy_tracker.max_in_flight(), 2);
    Ok(())
}

#[tokio::test]
async fn rejected_image_is_task_local() -> Result<()> {
    let tree = SurveyTree::new()?;
    tree.add_image("a.jpg", 24, 24)?;
    tree.add_image("odd.jpg", 13, 24)?;
    let config = tree.config();
    let events = EventBus::new();

    let inference = StubInference::new().reject_when(|image| image.width() == 13);
    let (_sender, shutdown) = watch::channel(false);
    let summary = orchestrator(&config, inference, &events)?
        .run(&shutdown)
        .await?;

    assert_eq!(counts(&summary), (1, 1, 0));
    assert_eq!(summary.failures()[0].kind, FailureKind::Inference);
    let failed_events = events
        .backlog_since(0)
        .into_iter()
        .filter(|envelope| matches!(envelope.event, Event::TaskFailed { .. }))
        .count();
    assert_eq!(failed_events, 1);
    Ok(())
}

#[tokio::test]
async fn resource_exhaustion_aborts_after_draining_workers() -> Result<()> {
    let tree = SurveyTree::new()?;
    for name in ["a.jpg", "b.jpg", "c.jpg"] {
        tree.add_image(name, 24, 24)?;
    }
    let mut config = tree.config();
    config.pipeline.workers = 1;
    let events = EventBus::new();

    let (_sender, shutdown) = watch::channel(false);
    let outcome = orchestrator(&config, StubInference::new().fatal_after(1), &events)?
        .run(&shutdown)
        .await;

    let Err(AppError::Aborted { reason, summary }) = outcome else {
        bail!("expected the run to abort");
    };
    assert!(reason.contains("out of device memory"));
    assert_eq!(counts(&summary), (1, 0, 0));
    assert!(tree.output.join("a.jpg.json").is_file());
    assert!(!tree.output.join("c.jpg").exists());

    let kinds: Vec<&str> = events
        .backlog_since(0)
        .iter()
        .map(|envelope| envelope.event.kind())
        .collect();
    assert!(kinds.contains(&"run_aborted"));
    assert!(!kinds.contains(&"run_finished"));
    Ok(())
}

#[tokio::test]
async fn shutdown_stops_discovery() -> Result<()> {
    let tree = SurveyTree::new()?;
    tree.add_image("a.jpg", 24, 24)?;
    let config = tree.config();
    let events = EventBus::new();

    let (sender, shutdown) = watch::channel(false);
    sender.send(true)?;
    let summary = orchestrator(&config, StubInference::new(), &events)?
        .run(&shutdown)
        .await?;

    assert_eq!(counts(&summary), (0, 0, 0));
    assert!(summary.interrupted());
    let finished = events
        .backlog_since(0)
        .into_iter()
        .find_map(|envelope| match envelope.event {
            Event::RunFinished { interrupted, .. } => Some(interrupted),
            _ => None,
        });
    assert_eq!(finished, Some(true));
    Ok(())
}

#[tokio::test]
async fn shutdown_drains_work_already_in_flight() -> Result<()> {
    let tree = SurveyTree::new()?;
    let names = ["a.jpg", "b.jpg", "c.jpg", "d.jpg", "e.jpg"];
    for name in names {
        tree.add_image(name, 32, 32)?;
    }
    let mut config = tree.config();
    config.pipeline.workers = 2;

    let strategy = SlowFillStrategy::new(Duration::from_millis(250));
    let strategy_tracker = strategy.tracker();
    let applier = MaskApplier::with_strategy(Box::new(strategy), &config.masking);
    let orchestrator =
        orchestrator(&config, StubInference::new(), &EventBus::new())?.with_mask_applier(applier);

    let (sender, shutdown) = watch::channel(false);
    let (outcome, sent) = tokio::join!(orchestrator.run(&shutdown), async {
        while strategy_tracker.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sender.send(true)
    });
    sent?;
    let summary = outcome?;

    assert!(summary.interrupted());
    assert_eq!(summary.failed(), 0);
    assert!(summary.processed() >= 1, "work handed to the pool completes");
    assert!(summary.processed() < 5, "discovery stops early");
    let committed = names
        .iter()
        .filter(|name| tree.output.join(format!("{name}.json")).is_file())
        .count();
    assert_eq!(u64::try_from(committed)?, summary.processed());
    Ok(())
}

#[tokio::test]
async fn missing_input_root_is_fatal_before_any_task() -> Result<()> {
    let tree = SurveyTree::new()?;
    let mut config = tree.config();
    config.paths.input_root = tree.root().join("not-mounted");

    let (_sender, shutdown) = watch::channel(false);
    let outcome = orchestrator(&config, StubInference::new(), &EventBus::new())?
        .run(&shutdown)
        .await;
    assert!(matches!(outcome, Err(AppError::FsOps { .. })));
    Ok(())
}

#[tokio::test]
async fn lazy_discovery_streams_without_a_total() -> Result<()> {
    let tree = SurveyTree::new()?;
    tree.add_image("a.jpg", 24, 24)?;
    tree.add_image("deep/b.jpg", 24, 24)?;
    let mut config = tree.config();
    config.discovery.lazy_paths = true;

    let summary = run_once(&config, StubInference::new()).await?;
    assert_eq!(counts(&summary), (2, 0, 0));
    assert_eq!(summary.total(), None);
    Ok(())
}

#[tokio::test]
async fn records_carry_sanitized_metadata() -> Result<()> {
    let tree = SurveyTree::new()?;
    tree.add_image("a.jpg", 24, 24)?;
    run_once(&tree.config(), StubInference::empty()).await?;

    let record = read_record(&tree.output.join("a.jpg.json"))?;
    assert!(record.detections.is_empty());
    assert!(record.location.is_some());
    assert!(record.captured_at.is_some());
    assert!(record.attributes.contains_key("camera_model"));
    assert!(!record.attributes.contains_key("camera_serial"));
    Ok(())
}

#[tokio::test]
async fn malformed_metadata_fails_the_task() -> Result<()> {
    let tree = SurveyTree::new()?;
    tree.add_image("bad-exif.jpg", 24, 24)?;
    tree.add_image("good.jpg", 24, 24)?;
    let config = tree.config();

    let (_sender, shutdown) = watch::channel(false);
    let summary = Orchestrator::new(
        &config,
        Box::new(StubInference::new()),
        Arc::new(StubMetadata::malformed_for("bad")),
        EventBus::new(),
        Metrics::new()?,
    )?
    .run(&shutdown)
    .await?;

    assert_eq!(counts(&summary), (1, 1, 0));
    assert_eq!(summary.failures()[0].kind, FailureKind::Malformed);
    Ok(())
}

#[tokio::test]
async fn input_is_deleted_only_when_opted_in() -> Result<()> {
    let tree = SurveyTree::new()?;
    let input = tree.add_image("a.jpg", 24, 24)?;
    let mut config = tree.config_with_archive();
    config.pipeline.delete_input_after_archive = true;

    let summary = run_once(&config, StubInference::new()).await?;
    assert_eq!(counts(&summary), (1, 0, 0));
    assert!(!input.exists());
    assert!(tree.archive.join("a.jpg").is_file());
    assert!(tree.output.join("a.jpg").is_file());
    Ok(())
}

/// Returns a mask that does not match the image size.
struct MismatchedMasks;

impl InferenceClient for MismatchedMasks {
    fn infer(&mut self, image: &RgbImage) -> Result<DetectionSet, InferenceError> {
        let mask = GrayImage::from_pixel(image.width() + 1, image.height(), image::Luma([255]));
        Ok(DetectionSet::new(vec![Detection::from_mask(
            0, "person", 0.8, mask,
        )]))
    }
}

#[tokio::test]
async fn mask_size_mismatch_fails_post_processing() -> Result<()> {
    let tree = SurveyTree::new()?;
    tree.add_image("a.jpg", 24, 24)?;
    let config = tree.config();

    let (_sender, shutdown) = watch::channel(false);
    let summary = orchestrator(&config, MismatchedMasks, &EventBus::new())?
        .run(&shutdown)
        .await?;

    assert_eq!(counts(&summary), (0, 1, 0));
    assert_eq!(summary.failures()[0].kind, FailureKind::Processing);
    assert!(!tree.output.join("a.jpg").exists());
    Ok(())
}

#[tokio::test]
async fn progress_is_reported_every_n_files() -> Result<()> {
    let tree = SurveyTree::new()?;
    for name in ["a.jpg", "b.jpg", "c.jpg", "d.jpg"] {
        tree.add_image(name, 16, 16)?;
    }
    let mut config = tree.config();
    config.pipeline.progress_every = 2;
    let events = EventBus::new();

    let (_sender, shutdown) = watch::channel(false);
    orchestrator(&config, StubInference::new(), &events)?
        .run(&shutdown)
        .await?;

    let progress: Vec<u64> = events
        .backlog_since(0)
        .into_iter()
        .filter_map(|envelope| match envelope.event {
            Event::Progress { processed, .. } => Some(processed),
            _ => None,
        })
        .collect();
    // Two periodic reports plus the final flush.
    assert_eq!(progress, vec![2, 4, 4]);
    Ok(())
}
