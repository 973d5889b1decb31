//! Typed configuration sections.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::defaults;

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RoadmaskConfig {
    /// Input, output, and archive roots.
    pub paths: PathsConfig,
    /// Discovery filters and resumability toggles.
    pub discovery: DiscoveryConfig,
    /// Mask compositing options.
    pub masking: MaskingConfig,
    /// Retry policy for filesystem operations.
    pub io: IoConfig,
    /// Worker pool and reporting cadence.
    pub pipeline: PipelineConfig,
    /// Logging options.
    pub telemetry: TelemetryConfig,
}

/// Directory roots. Output and archive paths mirror the input tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Tree of original images.
    pub input_root: PathBuf,
    /// Tree receiving masked images, records, and previews.
    pub output_root: PathBuf,
    /// Optional archive destinations.
    pub archive: ArchiveConfig,
    /// Mirror receiving a copy of each failed input and a note with the
    /// failure cause. Disabled when unset.
    pub error_root: Option<PathBuf>,
}

/// Archive destinations, each enabled by being set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ArchiveConfig {
    /// Archive on local storage.
    pub local_root: Option<PathBuf>,
    /// Archive on a network share.
    pub remote_root: Option<PathBuf>,
}

impl ArchiveConfig {
    /// Whether any archive destination is configured.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.local_root.is_some() || self.remote_root.is_some()
    }

    /// Configured archive roots in a stable order (local first).
    pub fn roots(&self) -> impl Iterator<Item = &Path> {
        self.local_root
            .iter()
            .chain(self.remote_root.iter())
            .map(PathBuf::as_path)
    }
}

/// Candidate selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Extensions accepted as input images (lowercase, no dot).
    pub supported_extensions: Vec<String>,
    /// Image extensions skipped with a log line.
    pub excluded_extensions: Vec<String>,
    /// Glob patterns matched against paths relative to the input root.
    pub exclude_globs: Vec<String>,
    /// Maximum directory nesting below the input root; 0 keeps only files
    /// directly in the root.
    pub max_depth: Option<usize>,
    /// Bypass the done-check and reprocess every candidate.
    pub force_reprocess: bool,
    /// Stream candidates during processing instead of collecting them first.
    pub lazy_paths: bool,
    /// Only consider files modified at or after this instant.
    pub modified_since: Option<DateTime<Utc>>,
    /// Only consider files under these subdirectories of the input root.
    pub only_subdirs: Vec<PathBuf>,
}

impl DiscoveryConfig {
    /// Canonical spelling of an extension: trimmed, lowercase, no leading
    /// dot. Returns `None` for an empty entry.
    #[must_use]
    pub fn normalize_extension(ext: &str) -> Option<String> {
        let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
        (!ext.is_empty()).then_some(ext)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            supported_extensions: defaults::SUPPORTED_EXTENSIONS
                .iter()
                .map(ToString::to_string)
                .collect(),
            excluded_extensions: Vec::new(),
            exclude_globs: Vec::new(),
            max_depth: None,
            force_reprocess: false,
            lazy_paths: false,
            modified_since: None,
            only_subdirs: Vec::new(),
        }
    }
}

/// Compositing mode for masked regions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MaskMode {
    /// Blur pixels under the mask.
    #[default]
    Blur,
    /// Paint pixels under the mask with a solid color.
    Fill,
}

/// Flavour of blur applied in [`MaskMode::Blur`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlurStyle {
    /// Blur each color channel.
    Color,
    /// Blur a grayscale copy.
    Gray,
    /// Grayscale blur with local brightness removed.
    #[default]
    NormalizedGray,
}

/// Blur parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BlurConfig {
    /// Kernel size in per mille of the image width.
    pub strength: u32,
    /// Blur flavour.
    pub style: BlurStyle,
}

impl Default for BlurConfig {
    fn default() -> Self {
        Self {
            strength: defaults::BLUR_STRENGTH,
            style: BlurStyle::default(),
        }
    }
}

/// Mask compositing options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MaskingConfig {
    /// Blur or solid fill.
    pub mode: MaskMode,
    /// Blur parameters, used in blur mode.
    pub blur: BlurConfig,
    /// Fill color; a per-class palette is used when unset.
    pub fill_color: Option<[u8; 3]>,
    /// Pixels each mask grows by before compositing.
    pub dilation_radius: u32,
    /// Classes that are masked; other detections are only recorded.
    pub masked_classes: Vec<String>,
    /// Write a binary preview of the masked area next to the output.
    pub write_preview: bool,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            mode: MaskMode::default(),
            blur: BlurConfig::default(),
            fill_color: None,
            dilation_radius: defaults::DILATION_RADIUS,
            masked_classes: defaults::MASKED_CLASSES
                .iter()
                .map(ToString::to_string)
                .collect(),
            write_preview: true,
        }
    }
}

impl MaskingConfig {
    /// Whether detections of `label` should be masked.
    #[must_use]
    pub fn masks_class(&self, label: &str) -> bool {
        self.masked_classes
            .iter()
            .any(|class| class.eq_ignore_ascii_case(label))
    }
}

/// Retry policy knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct IoConfig {
    /// Total retry budget per operation.
    pub retry_timeout_ms: u64,
    /// Pause between attempts.
    pub retry_poll_ms: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            retry_timeout_ms: defaults::RETRY_TIMEOUT_MS,
            retry_poll_ms: defaults::RETRY_POLL_MS,
        }
    }
}

impl IoConfig {
    /// Retry budget as a [`Duration`].
    #[must_use]
    pub const fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    /// Poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.retry_poll_ms)
    }
}

/// Worker pool and reporting cadence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Concurrent post-processing workers.
    pub workers: usize,
    /// Files between progress events.
    pub progress_every: u64,
    /// Files in the rolling mean used for ETA.
    pub eta_window: usize,
    /// Remove the input once every archive copy is confirmed.
    pub delete_input_after_archive: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: defaults::WORKERS,
            progress_every: defaults::PROGRESS_EVERY,
            eta_window: defaults::ETA_WINDOW,
            delete_input_after_archive: false,
        }
    }
}

/// Logging options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Level directive used when `RUST_LOG` is unset.
    pub log_level: String,
    /// `json` or `pretty`; inferred from the build profile when unset.
    pub log_format: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: defaults::LOG_LEVEL.to_string(),
            log_format: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_roots_list_local_before_remote() {
        let archive = ArchiveConfig {
            local_root: Some(PathBuf::from("/local")),
            remote_root: Some(PathBuf::from("/remote")),
        };
        let roots: Vec<_> = archive.roots().collect();
        assert_eq!(roots, vec![Path::new("/local"), Path::new("/remote")]);
        assert!(archive.is_enabled());
        assert!(!ArchiveConfig::default().is_enabled());
    }

    #[test]
    fn extensions_normalize_to_lowercase_without_dot() {
        assert_eq!(
            DiscoveryConfig::normalize_extension(" .JPG "),
            Some("jpg".to_string())
        );
        assert_eq!(DiscoveryConfig::normalize_extension("png"), Some("png".to_string()));
        assert_eq!(DiscoveryConfig::normalize_extension("."), None);
    }

    #[test]
    fn masks_class_ignores_case() {
        let masking = MaskingConfig::default();
        assert!(masking.masks_class("Car"));
        assert!(masking.masks_class("license_plate"));
        assert!(!masking.masks_class("traffic_sign"));
    }
}
