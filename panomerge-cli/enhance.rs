use image::RgbImage;
use imageproc::filter::gaussian_blur_f32;
use panomerge_core::{MergeResult, RasterImage, CHANNELS};
use panomerge_detect::ImagePreprocessing;
use rayon::prelude::*;
use tracing::info;

use crate::io::to_rgb_image;

/// Post-merge enhancement parameters
#[derive(Debug, Clone, PartialEq)]
pub struct EnhanceParams {
    pub clip_limit: f32,
    pub grid_size: usize,
    pub sharpen_sigma: f32,
    /// Weight of the detail layer added back by the unsharp mask
    pub sharpen_amount: f32,
    pub saturation: f32,
}

impl Default for EnhanceParams {
    fn default() -> Self {
        Self { clip_limit: 2.5, grid_size: 8, sharpen_sigma: 3.0, sharpen_amount: 0.5, saturation: 1.2 }
    }
}

/// Local contrast on luma, unsharp masking, then a saturation boost. Dimensions are kept.
pub fn enhance_panorama(image: &RasterImage, params: &EnhanceParams) -> MergeResult<RasterImage> {
    let (w, h) = image.dimensions();
    let contrasted = equalize_luma(image, params)?;

    let rgb: RgbImage = to_rgb_image(&contrasted)?;
    let blurred = gaussian_blur_f32(&rgb, params.sharpen_sigma);
    let amount = params.sharpen_amount;
    let mut data: Vec<u8> = rgb
        .as_raw()
        .par_iter()
        .zip(blurred.as_raw().par_iter())
        .map(|(&o, &b)| ((1.0 + amount) * o as f32 - amount * b as f32).round().clamp(0.0, 255.0) as u8)
        .collect();

    data.par_chunks_mut(CHANNELS).for_each(|px| saturate(px, params.saturation));

    info!(width = w, height = h, "enhanced panorama");
    RasterImage::new(w, h, data, image.source_index())
}

/// CLAHE on the Y channel of full-range YCbCr, chroma untouched
fn equalize_luma(image: &RasterImage, params: &EnhanceParams) -> MergeResult<RasterImage> {
    let (w, h) = image.dimensions();
    let luma: Vec<u8> = image
        .data()
        .chunks_exact(CHANNELS)
        .map(|p| (0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32).round().clamp(0.0, 255.0) as u8)
        .collect();
    let equalized = ImagePreprocessing::apply_clahe(&luma, w, h, params.clip_limit, params.grid_size)?;

    let data: Vec<u8> = image
        .data()
        .chunks_exact(CHANNELS)
        .zip(&equalized)
        .flat_map(|(p, &y)| {
            let (r, g, b) = (p[0] as f32, p[1] as f32, p[2] as f32);
            let cb = -0.168_736 * r - 0.331_264 * g + 0.5 * b;
            let cr = 0.5 * r - 0.418_688 * g - 0.081_312 * b;
            let y = y as f32;
            let to_u8 = |v: f32| v.round().clamp(0.0, 255.0) as u8;
            [to_u8(y + 1.402 * cr), to_u8(y - 0.344_136 * cb - 0.714_136 * cr), to_u8(y + 1.772 * cb)]
        })
        .collect();
    RasterImage::new(w, h, data, image.source_index())
}

/// Scale HSV saturation by `factor`, keeping hue and value; saturation saturates at 1
fn saturate(px: &mut [u8], factor: f32) {
    let v = px.iter().copied().max().unwrap_or(0) as f32;
    let min = px.iter().copied().min().unwrap_or(0) as f32;
    if v <= 0.0 || v == min {
        return;
    }
    let k = factor.min(v / (v - min));
    for c in px.iter_mut() {
        *c = (v - k * (v - *c as f32)).round().clamp(0.0, 255.0) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panomerge_core::synthetic::textured_scene;

    #[test]
    fn test_dimensions_and_identity_preserved() {
        let img = textured_scene(64, 48, 3).with_source_index(5);
        let out = enhance_panorama(&img, &EnhanceParams::default()).unwrap();
        assert_eq!(out.dimensions(), (64, 48));
        assert_eq!(out.source_index(), 5);
        assert_ne!(out.data(), img.data());
    }

    #[test]
    fn test_saturation_keeps_gray_and_value() {
        let mut gray = [90u8, 90, 90];
        saturate(&mut gray, 1.2);
        assert_eq!(gray, [90, 90, 90]);

        let mut color = [200u8, 100, 150];
        saturate(&mut color, 1.2);
        assert_eq!(color[0], 200);
        assert_eq!(color[1], 80);
        assert_eq!(color[2], 140);

        let mut vivid = [200u8, 10, 100];
        saturate(&mut vivid, 1.2);
        assert_eq!(vivid, [200, 0, 95]);
    }
}
