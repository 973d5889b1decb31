//! Default values applied when a section or field is omitted.

/// Extensions accepted as input images.
pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Classes masked unless configured otherwise.
pub const MASKED_CLASSES: [&str; 8] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "bus",
    "truck",
    "license_plate",
    "face",
];

/// Blur kernel size in per mille of the image width.
pub const BLUR_STRENGTH: u32 = 15;

/// Dilation applied to every mask before compositing.
pub const DILATION_RADIUS: u32 = 4;

/// Total time a filesystem operation may spend retrying.
pub const RETRY_TIMEOUT_MS: u64 = 60_000;

/// Pause between retries of a filesystem operation.
pub const RETRY_POLL_MS: u64 = 10_000;

/// Post-processing workers.
pub const WORKERS: usize = 2;

/// Upper bound accepted for `pipeline.workers`.
pub const MAX_WORKERS: usize = 64;

/// Files between progress reports.
pub const PROGRESS_EVERY: u64 = 10;

/// Files in the rolling mean used for ETA estimation.
pub const ETA_WINDOW: usize = 50;

/// Largest accepted dilation radius.
pub const MAX_DILATION_RADIUS: u32 = 255;

/// Default log level.
pub const LOG_LEVEL: &str = "info";
