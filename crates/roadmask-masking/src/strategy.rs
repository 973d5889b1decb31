//! Compositing strategies: blur or solid fill.

use image::{GrayImage, Luma, Rgb, RgbImage, imageops};
use imageproc::filter::box_filter;
use roadmask_config::BlurStyle;

/// Gray level that normalised blur centres on.
const NORMALIZED_GRAY_BASE: i32 = 100;

/// Fill color for labels without a palette entry.
const DEFAULT_COLOR: [u8; 3] = [100, 100, 100];

/// A dilated mask ready for compositing.
#[derive(Debug, Clone, Copy)]
pub struct MaskRegion<'a> {
    /// Class label of the detection.
    pub label: &'a str,
    /// Binary full-frame mask.
    pub mask: &'a GrayImage,
}

/// How masked pixels are rewritten.
pub trait MaskStrategy: Send + Sync {
    /// Name recorded in logs.
    fn name(&self) -> &'static str;

    /// Rewrite every pixel covered by `regions` in place.
    fn composite(&self, image: &mut RgbImage, regions: &[MaskRegion<'_>]);
}

/// Palette used when no explicit fill color is configured.
#[must_use]
pub fn label_color(label: &str) -> [u8; 3] {
    match label {
        "person" => [255, 255, 255],
        "bicycle" => [0, 0, 255],
        "car" => [255, 0, 0],
        "motorcycle" => [255, 255, 0],
        "bus" => [0, 255, 255],
        "truck" => [0, 255, 0],
        _ => DEFAULT_COLOR,
    }
}

/// Paint masked pixels with one color, or a per-label palette.
#[derive(Debug, Clone, Copy, Default)]
pub struct FillStrategy {
    color: Option<[u8; 3]>,
}

impl FillStrategy {
    /// Fill with `color`, or the label palette when `None`.
    #[must_use]
    pub const fn new(color: Option<[u8; 3]>) -> Self {
        Self { color }
    }
}

impl MaskStrategy for FillStrategy {
    fn name(&self) -> &'static str {
        "fill"
    }

    fn composite(&self, image: &mut RgbImage, regions: &[MaskRegion<'_>]) {
        for region in regions {
            let color = Rgb(self.color.unwrap_or_else(|| label_color(region.label)));
            for (x, y, pixel) in region.mask.enumerate_pixels() {
                if pixel.0[0] > 0 {
                    image.put_pixel(x, y, color);
                }
            }
        }
    }
}

/// Replace masked pixels with a box blur of the image.
#[derive(Debug, Clone, Copy)]
pub struct BlurStrategy {
    strength: u32,
    style: BlurStyle,
}

impl BlurStrategy {
    /// `strength` is the kernel size in per mille of the image width.
    #[must_use]
    pub const fn new(strength: u32, style: BlurStyle) -> Self {
        Self { strength, style }
    }

    /// Kernel size for an image `width` pixels wide, never below 3.
    #[must_use]
    pub fn kernel_size(&self, width: u32) -> u32 {
        let size = u64::from(self.strength) * u64::from(width) / 1_000;
        u32::try_from(size).unwrap_or(u32::MAX).max(3)
    }
}

impl MaskStrategy for BlurStrategy {
    fn name(&self) -> &'static str {
        "blur"
    }

    fn composite(&self, image: &mut RgbImage, regions: &[MaskRegion<'_>]) {
        let covered = union(image.dimensions(), regions);
        if !covered.iter().any(|&set| set) {
            return;
        }
        let ksize = self.kernel_size(image.width());
        let radius = ksize / 2;
        let width = image.width() as usize;

        match self.style {
            BlurStyle::Color => {
                let channels: Vec<GrayImage> = (0..3)
                    .map(|channel| box_filter(&split_channel(image, channel), radius, radius))
                    .collect();
                for (x, y, pixel) in image.enumerate_pixels_mut() {
                    if covered[y as usize * width + x as usize] {
                        *pixel = Rgb([
                            channels[0].get_pixel(x, y).0[0],
                            channels[1].get_pixel(x, y).0[0],
                            channels[2].get_pixel(x, y).0[0],
                        ]);
                    }
                }
            }
            BlurStyle::Gray => {
                let blurred = box_filter(&imageops::grayscale(image), radius, radius);
                for (x, y, pixel) in image.enumerate_pixels_mut() {
                    if covered[y as usize * width + x as usize] {
                        let level = blurred.get_pixel(x, y).0[0];
                        *pixel = Rgb([level, level, level]);
                    }
                }
            }
            BlurStyle::NormalizedGray => {
                let gray = imageops::grayscale(image);
                let narrow = box_filter(&gray, radius, radius);
                let wide_radius = ksize * 6 / 5 / 2;
                let wide = box_filter(&gray, wide_radius, wide_radius);
                for (x, y, pixel) in image.enumerate_pixels_mut() {
                    if covered[y as usize * width + x as usize] {
                        let level = i32::from(narrow.get_pixel(x, y).0[0])
                            - i32::from(wide.get_pixel(x, y).0[0])
                            + NORMALIZED_GRAY_BASE;
                        let level = u8::try_from(level.clamp(0, 255)).unwrap_or(u8::MAX);
                        *pixel = Rgb([level, level, level]);
                    }
                }
            }
        }
    }
}

fn union((width, height): (u32, u32), regions: &[MaskRegion<'_>]) -> Vec<bool> {
    let mut covered = vec![false; width as usize * height as usize];
    for region in regions {
        for (x, y, pixel) in region.mask.enumerate_pixels() {
            if pixel.0[0] > 0 {
                covered[y as usize * width as usize + x as usize] = true;
            }
        }
    }
    covered
}

fn split_channel(image: &RgbImage, channel: usize) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([image.get_pixel(x, y).0[channel]])
    })
}
