//! Values exchanged between pipeline stages.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version stamped into every metadata record.
pub const PIPELINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BoundingBox {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl BoundingBox {
    /// Tightest box around the non-zero pixels of `mask`.
    #[must_use]
    pub fn from_mask(mask: &GrayImage) -> Option<Self> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (x, y, pixel) in mask.enumerate_pixels() {
            if pixel.0[0] == 0 {
                continue;
            }
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
        bounds.map(|(x0, y0, x1, y1)| Self {
            x: x0,
            y: y0,
            width: x1 - x0 + 1,
            height: y1 - y0 + 1,
        })
    }

    /// Pixel area.
    #[must_use]
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// One detected instance.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Model class index.
    pub class_id: u32,
    /// Human-readable class label.
    pub label: String,
    /// Confidence in `0.0..=1.0`.
    pub score: f32,
    /// Bounding box reported by the model.
    pub bbox: BoundingBox,
    /// Full-frame binary mask; non-zero pixels belong to the instance.
    pub mask: GrayImage,
}

impl Detection {
    /// Build a detection whose bounding box is derived from its mask.
    #[must_use]
    pub fn from_mask(class_id: u32, label: impl Into<String>, score: f32, mask: GrayImage) -> Self {
        let bbox = BoundingBox::from_mask(&mask).unwrap_or(BoundingBox {
            x: 0,
            y: 0,
            width: 0,
            height: 0,
        });
        Self {
            class_id,
            label: label.into(),
            score,
            bbox,
            mask,
        }
    }
}

/// Detections returned for one image.
#[derive(Debug, Clone, Default)]
pub struct DetectionSet {
    detections: Vec<Detection>,
}

impl DetectionSet {
    /// Wrap a list of detections.
    #[must_use]
    pub const fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    /// Number of detections.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.detections.len()
    }

    /// Whether nothing was detected.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Iterate detections in model order.
    pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
        self.detections.iter()
    }
}

impl<'a> IntoIterator for &'a DetectionSet {
    type Item = &'a Detection;
    type IntoIter = std::slice::Iter<'a, Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.detections.iter()
    }
}

/// WGS84 position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Altitude in metres when known.
    pub altitude: Option<f64>,
}

/// Image metadata as reported by the extractor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    /// When the photo was taken.
    pub captured_at: Option<DateTime<Utc>>,
    /// Where the photo was taken.
    pub location: Option<GeoPoint>,
    /// Remaining key/value tags.
    pub attributes: BTreeMap<String, String>,
}

/// Per-instance entry in a metadata record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    /// Position in the detection set.
    pub index: usize,
    /// Model class index.
    pub class_id: u32,
    /// Class label.
    pub label: String,
    /// Confidence.
    pub score: f32,
    /// Bounding box of the raw detection.
    pub bbox: BoundingBox,
    /// Whether this instance was masked or only recorded.
    pub masked: bool,
    /// Pixels covered by the dilated mask (zero when not masked).
    pub mask_area: u64,
}

/// Wall-clock marks for the stages of one task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageTimestamps {
    /// Loading began.
    pub load_started: DateTime<Utc>,
    /// Inference returned.
    pub inference_done: Option<DateTime<Utc>>,
    /// Outputs were saved.
    pub save_done: Option<DateTime<Utc>>,
}

impl StageTimestamps {
    /// Start the clock for a task.
    #[must_use]
    pub fn started() -> Self {
        Self {
            load_started: Utc::now(),
            inference_done: None,
            save_done: None,
        }
    }
}

/// Per-task state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    /// Enumerated by discovery.
    Discovered,
    /// Pixels and metadata in memory.
    Loaded,
    /// Detections available.
    Inferred,
    /// Masked image and preview composed.
    PostProcessed,
    /// Outputs saved and archived.
    Archived,
    /// Result accounted for.
    Done,
}

impl TaskStage {
    /// The stage that follows a successful transition.
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::Discovered => Self::Loaded,
            Self::Loaded => Self::Inferred,
            Self::Inferred => Self::PostProcessed,
            Self::PostProcessed => Self::Archived,
            Self::Archived | Self::Done => Self::Done,
        }
    }

    /// Stable label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Loaded => "loaded",
            Self::Inferred => "inferred",
            Self::PostProcessed => "post_processed",
            Self::Archived => "archived",
            Self::Done => "done",
        }
    }
}

/// Failure classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Filesystem error, either terminal or after retry exhaustion.
    Io,
    /// Undecodable image or corrupt metadata.
    Malformed,
    /// Inference rejected the image.
    Inference,
    /// Mask composition failed.
    Processing,
    /// Writing the masked image or preview failed.
    Save,
    /// Archiving failed after outputs were saved.
    Archive,
}

impl FailureKind {
    /// Stable label used in logs and events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Io => "io",
            Self::Malformed => "malformed",
            Self::Inference => "inference",
            Self::Processing => "processing",
            Self::Save => "save",
            Self::Archive => "archive",
        }
    }
}

/// Why a task ended in `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskFailure {
    /// Last stage the task completed.
    pub stage: TaskStage,
    /// Classification.
    pub kind: FailureKind,
    /// Rendered error chain.
    pub detail: String,
}

impl TaskFailure {
    /// Convenience constructor.
    #[must_use]
    pub fn new(stage: TaskStage, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            detail: detail.into(),
        }
    }
}

/// Outcome of one task. Fields are fixed at construction.
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    input: PathBuf,
    instances: Vec<InstanceRecord>,
    timestamps: StageTimestamps,
    failure: Option<TaskFailure>,
    duration: Duration,
}

impl ProcessingResult {
    /// Result for a task that reached `Done`.
    #[must_use]
    pub const fn succeeded(
        input: PathBuf,
        instances: Vec<InstanceRecord>,
        timestamps: StageTimestamps,
        duration: Duration,
    ) -> Self {
        Self {
            input,
            instances,
            timestamps,
            failure: None,
            duration,
        }
    }

    /// Result for a task that ended in `Failed`.
    #[must_use]
    pub const fn failed(
        input: PathBuf,
        failure: TaskFailure,
        timestamps: StageTimestamps,
        duration: Duration,
    ) -> Self {
        Self {
            input,
            instances: Vec::new(),
            timestamps,
            failure: Some(failure),
            duration,
        }
    }

    /// Input path the task was created for.
    #[must_use]
    pub fn input(&self) -> &Path {
        &self.input
    }

    /// Number of detections.
    #[must_use]
    pub fn detection_count(&self) -> usize {
        self.instances.len()
    }

    /// Per-instance records.
    #[must_use]
    pub fn instances(&self) -> &[InstanceRecord] {
        &self.instances
    }

    /// Stage timestamps.
    #[must_use]
    pub const fn timestamps(&self) -> &StageTimestamps {
        &self.timestamps
    }

    /// Whether the task reached `Done`.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Stage the task ended in: `Done` on success, otherwise the last stage
    /// completed before the failure.
    #[must_use]
    pub const fn stage(&self) -> TaskStage {
        match &self.failure {
            Some(failure) => failure.stage,
            None => TaskStage::Done,
        }
    }

    /// Failure detail when the task failed.
    #[must_use]
    pub const fn failure(&self) -> Option<&TaskFailure> {
        self.failure.as_ref()
    }

    /// Wall-clock time spent on the task.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }
}

/// Structured record persisted next to each output and archived original.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataRecord {
    /// Random identifier for this record.
    pub record_id: Uuid,
    /// File name of the original image.
    pub original_filename: String,
    /// Path of the original relative to the input root.
    pub relative_path: String,
    /// SHA-256 of the original bytes, lowercase hex.
    pub original_sha256: String,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Capture time from sanitised metadata.
    pub captured_at: Option<DateTime<Utc>>,
    /// Sanitised geolocation.
    pub location: Option<GeoPoint>,
    /// Sanitised remaining tags.
    pub attributes: BTreeMap<String, String>,
    /// Per-instance detections.
    pub detections: Vec<InstanceRecord>,
    /// Detection count per label.
    pub detection_counts: BTreeMap<String, u64>,
    /// File name of the mask preview, when one was written.
    pub mask_preview: Option<String>,
    /// Processing timestamps.
    pub processed: StageTimestamps,
    /// Version of the pipeline that wrote the record.
    pub pipeline_version: String,
}

impl MetadataRecord {
    /// Count detections per label.
    #[must_use]
    pub fn count_labels(instances: &[InstanceRecord]) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        for instance in instances {
            *counts.entry(instance.label.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn instance(index: usize, label: &str) -> InstanceRecord {
        InstanceRecord {
            index,
            class_id: 0,
            label: label.into(),
            score: 0.9,
            bbox: BoundingBox {
                x: 0,
                y: 0,
                width: 1,
                height: 1,
            },
            masked: true,
            mask_area: 1,
        }
    }

    #[test]
    fn bounding_box_tracks_set_pixels() {
        let mut mask = GrayImage::new(20, 20);
        for y in 5..8 {
            for x in 3..13 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let bbox = BoundingBox::from_mask(&mask);
        assert_eq!(
            bbox,
            Some(BoundingBox {
                x: 3,
                y: 5,
                width: 10,
                height: 3
            })
        );
        assert_eq!(BoundingBox::from_mask(&GrayImage::new(4, 4)), None);
    }

    #[test]
    fn stages_advance_in_order() {
        let mut stage = TaskStage::Discovered;
        let mut seen = vec![stage];
        while stage != TaskStage::Done {
            stage = stage.next();
            seen.push(stage);
        }
        assert_eq!(seen.len(), 6);
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn failed_results_carry_no_instances() {
        let result = ProcessingResult::failed(
            PathBuf::from("/in/a.jpg"),
            TaskFailure::new(TaskStage::Discovered, FailureKind::Malformed, "bad jpeg"),
            StageTimestamps::started(),
            Duration::from_millis(3),
        );
        assert!(!result.is_success());
        assert_eq!(result.stage(), TaskStage::Discovered);
        assert_eq!(result.detection_count(), 0);
        assert_eq!(
            result.failure().map(|failure| failure.kind),
            Some(FailureKind::Malformed)
        );
    }

    #[test]
    fn successful_results_end_in_done() {
        let result = ProcessingResult::succeeded(
            PathBuf::from("/in/a.jpg"),
            vec![instance(0, "car")],
            StageTimestamps::started(),
            Duration::from_millis(3),
        );
        assert!(result.is_success());
        assert_eq!(result.stage(), TaskStage::Done);
        assert_eq!(result.stage(), TaskStage::Archived.next());
    }

    #[test]
    fn stages_and_kinds_serialize_as_snake_case() -> Result<(), serde_json::Error> {
        assert_eq!(serde_json::to_string(&TaskStage::PostProcessed)?, "\"post_processed\"");
        assert_eq!(
            serde_json::to_string(&FailureKind::Malformed)?,
            format!("\"{}\"", FailureKind::Malformed.as_str())
        );
        Ok(())
    }

    #[test]
    fn label_counts_group_by_label() {
        let counts =
            MetadataRecord::count_labels(&[instance(0, "car"), instance(1, "car"), instance(2, "person")]);
        assert_eq!(counts.get("car"), Some(&2));
        assert_eq!(counts.get("person"), Some(&1));
    }
}
