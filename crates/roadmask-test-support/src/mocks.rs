//! Stub collaborators standing in for the detection model and EXIF reader.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use image::{GrayImage, Luma, RgbImage};
use roadmask_core::{
    Detection, DetectionSet, GeoPoint, InferenceClient, InferenceError, Metadata, MetadataError,
    MetadataExtractor,
};
use roadmask_masking::{FillStrategy, MaskRegion, MaskStrategy};

/// Counts calls and the peak number of overlapping calls.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ConcurrencyTracker {
    /// Total calls entered so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) -> TrackerGuard<'_> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        TrackerGuard { tracker: self }
    }
}

struct TrackerGuard<'a> {
    tracker: &'a ConcurrencyTracker,
}

impl Drop for TrackerGuard<'_> {
    fn drop(&mut self) {
        self.tracker.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

type ImagePredicate = Box<dyn Fn(&RgbImage) -> bool + Send>;

/// Inference stub that reports one centred detection per image.
pub struct StubInference {
    label: String,
    class_id: u32,
    detect: bool,
    delay: Duration,
    reject: Option<ImagePredicate>,
    fatal_after: Option<usize>,
    tracker: ConcurrencyTracker,
}

impl StubInference {
    /// Detect a `car` covering the central quarter of every image.
    #[must_use]
    pub fn new() -> Self {
        Self {
            label: "car".to_string(),
            class_id: 2,
            detect: true,
            delay: Duration::ZERO,
            reject: None,
            fatal_after: None,
            tracker: ConcurrencyTracker::default(),
        }
    }

    /// Never detect anything.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            detect: false,
            ..Self::new()
        }
    }

    /// Report detections under a different label.
    #[must_use]
    pub fn with_label(mut self, class_id: u32, label: &str) -> Self {
        self.class_id = class_id;
        self.label = label.to_string();
        self
    }

    /// Sleep for `delay` inside every call.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail with [`InferenceError::Image`] when `predicate` matches.
    #[must_use]
    pub fn reject_when(mut self, predicate: impl Fn(&RgbImage) -> bool + Send + 'static) -> Self {
        self.reject = Some(Box::new(predicate));
        self
    }

    /// Fail with [`InferenceError::Resource`] once `calls` calls succeeded.
    #[must_use]
    pub const fn fatal_after(mut self, calls: usize) -> Self {
        self.fatal_after = Some(calls);
        self
    }

    /// Handle for observing calls after the stub is moved into a pipeline.
    #[must_use]
    pub fn tracker(&self) -> ConcurrencyTracker {
        self.tracker.clone()
    }
}

impl Default for StubInference {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceClient for StubInference {
    fn infer(&mut self, image: &RgbImage) -> Result<DetectionSet, InferenceError> {
        let call_index = self.tracker.calls();
        let _guard = self.tracker.enter();
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.fatal_after.is_some_and(|limit| call_index >= limit) {
            return Err(InferenceError::Resource {
                detail: "out of device memory".to_string(),
            });
        }
        if self.reject.as_ref().is_some_and(|reject| reject(image)) {
            return Err(InferenceError::Image {
                detail: "unsupported image".to_string(),
            });
        }
        if !self.detect {
            return Ok(DetectionSet::default());
        }
        let (width, height) = image.dimensions();
        let mask = GrayImage::from_fn(width, height, |x, y| {
            let inside = x >= width / 4 && x < width * 3 / 4 && y >= height / 4 && y < height * 3 / 4;
            Luma([if inside { 255 } else { 0 }])
        });
        Ok(DetectionSet::new(vec![Detection::from_mask(
            self.class_id,
            self.label.clone(),
            0.9,
            mask,
        )]))
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

/// Metadata stub returning a fixed capture time, location, and attributes.
#[derive(Debug, Clone, Default)]
pub struct StubMetadata {
    malformed: Option<String>,
}

impl StubMetadata {
    /// Metadata with a camera serial that [`MetadataExtractor::sanitize`] strips.
    #[must_use]
    pub const fn new() -> Self {
        Self { malformed: None }
    }

    /// Report malformed metadata for files whose name contains `fragment`.
    #[must_use]
    pub fn malformed_for(fragment: &str) -> Self {
        Self {
            malformed: Some(fragment.to_string()),
        }
    }
}

impl MetadataExtractor for StubMetadata {
    fn read_metadata(&self, path: &Path) -> Result<Metadata, MetadataError> {
        let name = path.file_name().and_then(|name| name.to_str()).unwrap_or_default();
        if self
            .malformed
            .as_deref()
            .is_some_and(|fragment| name.contains(fragment))
        {
            return Err(MetadataError::Malformed {
                path: path.to_path_buf(),
                detail: "truncated exif block".to_string(),
            });
        }
        let mut attributes = BTreeMap::new();
        attributes.insert("camera_model".to_string(), "survey-cam".to_string());
        attributes.insert("camera_serial".to_string(), "SN-0042".to_string());
        Ok(Metadata {
            captured_at: Utc.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).single(),
            location: Some(GeoPoint {
                latitude: 52.52,
                longitude: 13.405,
                altitude: None,
            }),
            attributes,
        })
    }

    fn sanitize(&self, mut metadata: Metadata) -> Metadata {
        metadata.attributes.remove("camera_serial");
        metadata
    }
}

/// Fill strategy that sleeps and records overlap, for observing worker
/// parallelism.
#[derive(Debug, Clone, Default)]
pub struct SlowFillStrategy {
    delay: Duration,
    tracker: ConcurrencyTracker,
}

impl SlowFillStrategy {
    /// Sleep `delay` per composite call.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            tracker: ConcurrencyTracker::default(),
        }
    }

    /// Handle for observing calls after the strategy is boxed.
    #[must_use]
    pub fn tracker(&self) -> ConcurrencyTracker {
        self.tracker.clone()
    }
}

impl MaskStrategy for SlowFillStrategy {
    fn name(&self) -> &'static str {
        "slow-fill"
    }

    fn composite(&self, image: &mut RgbImage, regions: &[MaskRegion<'_>]) {
        let _guard = self.tracker.enter();
        thread::sleep(self.delay);
        FillStrategy::new(None).composite(image, regions);
    }
}
