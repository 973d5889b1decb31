//! Contracts implemented by the external detection model and metadata reader.

use std::path::Path;

use image::RgbImage;

use crate::error::{InferenceError, MetadataError};
use crate::model::{DetectionSet, Metadata};

/// Detection/segmentation model.
///
/// Implementations hold the model in memory and are not reentrant. Taking
/// `&mut self` lets the orchestrator enforce a single call in flight by
/// owning the client exclusively.
pub trait InferenceClient: Send {
    /// Detect instances in `image`. Every returned mask must have the same
    /// dimensions as `image`.
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError::Image`] when only this image is at fault and
    /// [`InferenceError::Resource`] when the model itself is unusable.
    fn infer(&mut self, image: &RgbImage) -> Result<DetectionSet, InferenceError>;

    /// Name recorded in logs.
    fn name(&self) -> &'static str {
        "inference"
    }
}

/// EXIF/geotag reader and sanitiser.
pub trait MetadataExtractor: Send + Sync {
    /// Read metadata embedded in (or next to) the image at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Io`] when the file cannot be read and
    /// [`MetadataError::Malformed`] when its metadata is corrupt.
    fn read_metadata(&self, path: &Path) -> Result<Metadata, MetadataError>;

    /// Strip fields that must not be published. The default keeps everything.
    fn sanitize(&self, metadata: Metadata) -> Metadata {
        metadata
    }
}
