//! Square-kernel mask dilation.

use image::{GrayImage, Luma, imageops};
use imageproc::distance_transform::Norm;
use imageproc::morphology;
use roadmask_core::BoundingBox;

/// Grow the set pixels of `mask` by `radius` in every direction.
///
/// Uses a `(2r + 1)` square structuring element. The output is binary
/// (0 or 255) and has the same dimensions as the input. A radius of zero
/// returns the binarised mask unchanged.
#[must_use]
pub fn dilate(mask: &GrayImage, radius: u32) -> GrayImage {
    let binary = binarize(mask);
    if radius == 0 {
        return binary;
    }
    let Some(bbox) = BoundingBox::from_mask(&binary) else {
        return binary;
    };

    let (width, height) = binary.dimensions();
    let x0 = bbox.x.saturating_sub(radius);
    let y0 = bbox.y.saturating_sub(radius);
    let x1 = (bbox.x + bbox.width).saturating_add(radius).min(width);
    let y1 = (bbox.y + bbox.height).saturating_add(radius).min(height);

    // Work on the neighbourhood of the set pixels only; the rest stays empty.
    let window = imageops::crop_imm(&binary, x0, y0, x1 - x0, y1 - y0).to_image();
    let k = u8::try_from(radius).unwrap_or(u8::MAX);
    let grown = morphology::dilate(&window, Norm::LInf, k);

    let mut out = GrayImage::new(width, height);
    imageops::replace(&mut out, &grown, i64::from(x0), i64::from(y0));
    out
}

/// Number of set pixels.
#[must_use]
pub fn coverage(mask: &GrayImage) -> u64 {
    mask.pixels().map(|pixel| u64::from(pixel.0[0] > 0)).sum()
}

fn binarize(mask: &GrayImage) -> GrayImage {
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        if mask.get_pixel(x, y).0[0] > 0 {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}
