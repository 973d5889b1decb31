//! Temporary survey trees and sample images.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use image::{ImageFormat, Rgb, RgbImage};
use roadmask_config::RoadmaskConfig;
use tempfile::TempDir;

/// Create an empty file, including parent directories.
///
/// # Errors
///
/// Returns an error if the file or its parents cannot be created.
pub fn touch(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, b"")?;
    Ok(())
}

/// Deterministic gradient image.
#[must_use]
pub fn sample_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            u8::try_from(x % 256).unwrap_or(0),
            u8::try_from(y % 256).unwrap_or(0),
            128,
        ])
    })
}

/// Write [`sample_image`] as a JPEG, creating parent directories.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or encoding fails.
pub fn write_sample_jpeg(path: &Path, width: u32, height: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    sample_image(width, height).save_with_format(path, ImageFormat::Jpeg)?;
    Ok(())
}

/// Write a file with an image extension that does not decode.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_corrupt_image(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, [0xFF, 0xD8, 0xFF, 0x00, 0x13, 0x37])?;
    Ok(())
}

/// Input, output, and archive roots under one temp directory.
pub struct SurveyTree {
    dir: TempDir,
    /// Input root.
    pub input: PathBuf,
    /// Output root.
    pub output: PathBuf,
    /// Local archive root (not created until used).
    pub archive: PathBuf,
    /// Error mirror root (not created until used).
    pub errors: PathBuf,
}

impl SurveyTree {
    /// Create the temp directory and an empty input root.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("roadmask-").tempdir()?;
        let input = dir.path().join("input");
        fs::create_dir_all(&input)?;
        Ok(Self {
            input,
            output: dir.path().join("output"),
            archive: dir.path().join("archive"),
            errors: dir.path().join("output_error"),
            dir,
        })
    }

    /// Temp directory holding every root.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Configuration pointing at this tree, with a short retry budget and
    /// no archive destination.
    #[must_use]
    pub fn config(&self) -> RoadmaskConfig {
        let mut config = RoadmaskConfig::default();
        config.paths.input_root.clone_from(&self.input);
        config.paths.output_root.clone_from(&self.output);
        config.io.retry_timeout_ms = 100;
        config.io.retry_poll_ms = 10;
        config.pipeline.progress_every = 1;
        config
    }

    /// Like [`SurveyTree::config`] with the local archive enabled.
    #[must_use]
    pub fn config_with_archive(&self) -> RoadmaskConfig {
        let mut config = self.config();
        config.paths.archive.local_root = Some(self.archive.clone());
        config
    }

    /// Like [`SurveyTree::config`] with failed inputs mirrored to `errors`.
    #[must_use]
    pub fn config_with_error_mirror(&self) -> RoadmaskConfig {
        let mut config = self.config();
        config.paths.error_root = Some(self.errors.clone());
        config
    }

    /// Write a sample JPEG at `relative` below the input root.
    ///
    /// # Errors
    ///
    /// See [`write_sample_jpeg`].
    pub fn add_image(&self, relative: &str, width: u32, height: u32) -> Result<PathBuf> {
        let path = self.input.join(relative);
        write_sample_jpeg(&path, width, height)?;
        Ok(path)
    }

    /// Write an undecodable file at `relative` below the input root.
    ///
    /// # Errors
    ///
    /// See [`write_corrupt_image`].
    pub fn add_corrupt(&self, relative: &str) -> Result<PathBuf> {
        let path = self.input.join(relative);
        write_corrupt_image(&path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_jpeg_round_trips_dimensions() -> Result<()> {
        let tree = SurveyTree::new()?;
        let path = tree.add_image("a/b.jpg", 24, 16)?;
        let decoded = image::open(&path)?;
        assert_eq!((decoded.width(), decoded.height()), (24, 16));
        Ok(())
    }

    #[test]
    fn corrupt_image_does_not_decode() -> Result<()> {
        let tree = SurveyTree::new()?;
        let path = tree.add_corrupt("bad.jpg")?;
        assert!(image::open(&path).is_err());
        Ok(())
    }

    #[test]
    fn config_points_at_tree() -> Result<()> {
        let tree = SurveyTree::new()?;
        let config = tree.config_with_archive();
        assert_eq!(config.paths.input_root, tree.input);
        assert_eq!(config.paths.archive.local_root.as_deref(), Some(tree.archive.as_path()));
        assert!(tree.root().is_dir());
        Ok(())
    }
}
