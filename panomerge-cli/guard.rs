use image::imageops::{self, FilterType};
use panomerge_core::{MergeError, MergeResult, RasterImage, ResourceLimits};
use tracing::{info, warn};

use crate::io::{from_rgb_image, to_rgb_image};

/// Image after the resource guard, with what the guard did to it.
#[derive(Debug, Clone)]
pub struct GuardedImage {
    pub image: RasterImage,
    pub original_width: usize,
    pub original_height: usize,
    /// Output size over input size, 1.0 when passed through
    pub scale: f64,
}

impl GuardedImage {
    pub fn downscaled(&self) -> bool {
        self.scale < 1.0
    }
}

/// Bound the resolution of a decoded image.
///
/// Images above the hard pixel ceiling are refused. Otherwise, when the longer side
/// exceeds `max_dimension`, the image is shrunk uniformly so the longer side equals it.
pub fn guard(image: RasterImage, max_dimension: usize, limits: &ResourceLimits) -> MergeResult<GuardedImage> {
    let (width, height) = image.dimensions();
    let index = image.source_index();

    if image.area() > limits.max_source_pixels {
        warn!(index, width, height, limit = limits.max_source_pixels, "image refused by resource guard");
        return Err(MergeError::ResourceExceeded { index, width, height, limit: limits.max_source_pixels });
    }

    let longer = width.max(height);
    if longer <= max_dimension {
        return Ok(GuardedImage { image, original_width: width, original_height: height, scale: 1.0 });
    }

    let scale = max_dimension as f64 / longer as f64;
    let (new_w, new_h) = if width >= height {
        (max_dimension, ((height as f64 * scale).round() as usize).max(1))
    } else {
        (((width as f64 * scale).round() as usize).max(1), max_dimension)
    };

    let resized = imageops::resize(&to_rgb_image(&image)?, new_w as u32, new_h as u32, FilterType::Triangle);
    info!(index, from_w = width, from_h = height, to_w = new_w, to_h = new_h, "downscaled input");

    Ok(GuardedImage {
        image: from_rgb_image(resized, index)?,
        original_width: width,
        original_height: height,
        scale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_image_passes_through() {
        let img = RasterImage::filled(300, 200, [9, 9, 9], 4);
        let guarded = guard(img.clone(), 800, &ResourceLimits::default()).unwrap();
        assert!(!guarded.downscaled());
        assert_eq!(guarded.image, img);
    }

    #[test]
    fn test_longer_side_becomes_bound() {
        let landscape = guard(RasterImage::filled(1600, 900, [1, 2, 3], 0), 800, &ResourceLimits::default()).unwrap();
        assert_eq!(landscape.image.dimensions(), (800, 450));
        assert!(landscape.downscaled());
        assert_eq!((landscape.original_width, landscape.original_height), (1600, 900));

        let portrait = guard(RasterImage::filled(300, 1200, [1, 2, 3], 1), 600, &ResourceLimits::default()).unwrap();
        assert_eq!(portrait.image.dimensions(), (150, 600));
        assert_eq!(portrait.image.source_index(), 1);
    }

    #[test]
    fn test_hard_ceiling_reports_dimensions() {
        let limits = ResourceLimits { max_source_pixels: 1000, ..ResourceLimits::default() };
        let result = guard(RasterImage::filled(50, 30, [0, 0, 0], 2), 800, &limits);
        assert_eq!(
            result.unwrap_err(),
            MergeError::ResourceExceeded { index: 2, width: 50, height: 30, limit: 1000 }
        );
    }
}
