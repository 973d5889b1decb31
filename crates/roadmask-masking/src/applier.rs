//! Detection set to anonymised artifacts.

use std::fmt;

use image::{GrayImage, Luma, RgbImage};
use roadmask_config::{MaskMode, MaskingConfig};
use roadmask_core::{DetectionSet, InstanceRecord};
use tracing::debug;

use crate::dilate::{coverage, dilate};
use crate::error::{MaskError, MaskResult};
use crate::strategy::{BlurStrategy, FillStrategy, MaskRegion, MaskStrategy};

/// Output of [`MaskApplier::apply`].
#[derive(Debug, Clone)]
pub struct MaskArtifacts {
    /// Image with masked regions rewritten.
    pub masked: RgbImage,
    /// Binary union of every masked, dilated region (255 = hidden).
    pub preview: GrayImage,
    /// One record per detection, masked or not.
    pub instances: Vec<InstanceRecord>,
}

impl MaskArtifacts {
    /// Pixels hidden in the masked image.
    #[must_use]
    pub fn masked_pixels(&self) -> u64 {
        coverage(&self.preview)
    }
}

/// Applies dilation and the configured strategy to a detection set.
pub struct MaskApplier {
    strategy: Box<dyn MaskStrategy>,
    dilation_radius: u32,
    masked_classes: Vec<String>,
}

impl fmt::Debug for MaskApplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaskApplier")
            .field("strategy", &self.strategy.name())
            .field("dilation_radius", &self.dilation_radius)
            .field("masked_classes", &self.masked_classes)
            .finish()
    }
}

impl MaskApplier {
    /// Build an applier, choosing the strategy from `config.mode`.
    #[must_use]
    pub fn new(config: &MaskingConfig) -> Self {
        let strategy: Box<dyn MaskStrategy> = match config.mode {
            MaskMode::Blur => Box::new(BlurStrategy::new(config.blur.strength, config.blur.style)),
            MaskMode::Fill => Box::new(FillStrategy::new(config.fill_color)),
        };
        Self::with_strategy(strategy, config)
    }

    /// Build an applier around a caller-provided strategy.
    #[must_use]
    pub fn with_strategy(strategy: Box<dyn MaskStrategy>, config: &MaskingConfig) -> Self {
        Self {
            strategy,
            dilation_radius: config.dilation_radius,
            masked_classes: config.masked_classes.clone(),
        }
    }

    /// Name of the active strategy.
    #[must_use]
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Mask every detection of a masked class and describe all detections.
    ///
    /// The result depends only on the inputs and the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`MaskError::DimensionMismatch`] when a detection mask does not
    /// match the image frame.
    pub fn apply(&self, image: &RgbImage, detections: &DetectionSet) -> MaskResult<MaskArtifacts> {
        let (width, height) = image.dimensions();
        let mut grown = Vec::new();
        let mut instances = Vec::with_capacity(detections.len());

        for (index, detection) in detections.iter().enumerate() {
            if detection.mask.dimensions() != (width, height) {
                return Err(MaskError::DimensionMismatch {
                    index,
                    expected: (width, height),
                    actual: detection.mask.dimensions(),
                });
            }
            let masked = self.is_masked(&detection.label);
            let mask_area = if masked {
                let mask = dilate(&detection.mask, self.dilation_radius);
                let area = coverage(&mask);
                grown.push((detection.label.as_str(), mask));
                area
            } else {
                0
            };
            instances.push(InstanceRecord {
                index,
                class_id: detection.class_id,
                label: detection.label.clone(),
                score: detection.score,
                bbox: detection.bbox,
                masked,
                mask_area,
            });
        }

        let regions: Vec<MaskRegion<'_>> = grown
            .iter()
            .map(|(label, mask)| MaskRegion {
                label: *label,
                mask,
            })
            .collect();
        let mut masked = image.clone();
        self.strategy.composite(&mut masked, &regions);
        let preview = preview(width, height, &regions);

        debug!(
            strategy = self.strategy.name(),
            detections = instances.len(),
            masked = regions.len(),
            "masks applied"
        );
        Ok(MaskArtifacts {
            masked,
            preview,
            instances,
        })
    }

    fn is_masked(&self, label: &str) -> bool {
        self.masked_classes
            .iter()
            .any(|class| class.eq_ignore_ascii_case(label))
    }
}

fn preview(width: u32, height: u32, regions: &[MaskRegion<'_>]) -> GrayImage {
    let mut out = GrayImage::new(width, height);
    for region in regions {
        for (x, y, pixel) in region.mask.enumerate_pixels() {
            if pixel.0[0] > 0 {
                out.put_pixel(x, y, Luma([255]));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use roadmask_core::Detection;

    fn config(mode: MaskMode, radius: u32) -> MaskingConfig {
        MaskingConfig {
            mode,
            fill_color: Some([0, 0, 0]),
            dilation_radius: radius,
            ..MaskingConfig::default()
        }
    }

    fn square_mask(frame: u32, x0: u32, y0: u32, size: u32) -> GrayImage {
        GrayImage::from_fn(frame, frame, |x, y| {
            let inside = (x0..x0 + size).contains(&x) && (y0..y0 + size).contains(&y);
            Luma([if inside { 255 } else { 0 }])
        })
    }

    fn white(frame: u32) -> RgbImage {
        RgbImage::from_pixel(frame, frame, Rgb([255, 255, 255]))
    }

    fn black_pixels(image: &RgbImage) -> u64 {
        image
            .pixels()
            .map(|pixel| u64::from(*pixel == Rgb([0, 0, 0])))
            .sum()
    }

    #[test]
    fn radius_zero_masks_exactly_the_detection() -> MaskResult<()> {
        let applier = MaskApplier::new(&config(MaskMode::Fill, 0));
        let detections = DetectionSet::new(vec![Detection::from_mask(
            3,
            "car",
            0.9,
            square_mask(40, 10, 10, 10),
        )]);
        let artifacts = applier.apply(&white(40), &detections)?;
        assert_eq!(black_pixels(&artifacts.masked), 100);
        assert_eq!(artifacts.preview, square_mask(40, 10, 10, 10));
        assert_eq!(artifacts.instances[0].mask_area, 100);
        Ok(())
    }

    #[test]
    fn dilation_masks_a_strictly_larger_region() -> MaskResult<()> {
        let applier = MaskApplier::new(&config(MaskMode::Fill, 2));
        let detections = DetectionSet::new(vec![Detection::from_mask(
            3,
            "car",
            0.9,
            square_mask(40, 10, 10, 10),
        )]);
        let artifacts = applier.apply(&white(40), &detections)?;
        assert_eq!(black_pixels(&artifacts.masked), 196);
        assert_eq!(artifacts.masked_pixels(), 196);
        assert_eq!(artifacts.instances[0].bbox.width, 10);
        Ok(())
    }

    #[test]
    fn unmasked_classes_are_recorded_but_untouched() -> MaskResult<()> {
        let applier = MaskApplier::new(&config(MaskMode::Fill, 1));
        let detections = DetectionSet::new(vec![
            Detection::from_mask(10, "traffic_sign", 0.8, square_mask(20, 0, 0, 5)),
            Detection::from_mask(1, "person", 0.7, square_mask(20, 10, 10, 3)),
        ]);
        let artifacts = applier.apply(&white(20), &detections)?;
        assert_eq!(artifacts.instances.len(), 2);
        assert!(!artifacts.instances[0].masked);
        assert_eq!(artifacts.instances[0].mask_area, 0);
        assert!(artifacts.instances[1].masked);
        assert_eq!(black_pixels(&artifacts.masked), 25);
        Ok(())
    }

    #[test]
    fn mismatched_mask_is_rejected() {
        let applier = MaskApplier::new(&config(MaskMode::Blur, 4));
        let detections = DetectionSet::new(vec![Detection::from_mask(
            1,
            "person",
            0.5,
            square_mask(8, 0, 0, 2),
        )]);
        let result = applier.apply(&white(16), &detections);
        assert!(matches!(
            result,
            Err(MaskError::DimensionMismatch { index: 0, .. })
        ));
    }

    #[test]
    fn apply_is_deterministic() -> MaskResult<()> {
        let applier = MaskApplier::new(&config(MaskMode::Blur, 3));
        assert_eq!(applier.strategy_name(), "blur");
        let image = RgbImage::from_fn(32, 32, |x, y| {
            Rgb([
                u8::try_from(x * 7).unwrap_or(u8::MAX),
                u8::try_from(y * 5).unwrap_or(u8::MAX),
                90,
            ])
        });
        let detections = DetectionSet::new(vec![Detection::from_mask(
            1,
            "person",
            0.5,
            square_mask(32, 4, 4, 8),
        )]);
        let first = applier.apply(&image, &detections)?;
        let second = applier.apply(&image, &detections)?;
        assert_eq!(first.masked, second.masked);
        assert_eq!(first.preview, second.preview);
        Ok(())
    }
}
