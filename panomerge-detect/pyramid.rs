use panomerge_core::Image;

use crate::types::ScaleLevel;

/// Image pyramid operations for multi-scale feature detection
pub struct ImagePyramid;

impl ImagePyramid {
    /// Generate scale levels, stopping once a level drops below `min_size` on either side
    pub fn generate_scale_levels(
        width: usize,
        height: usize,
        scale_factor: f32,
        max_levels: usize,
        min_size: usize,
    ) -> Vec<ScaleLevel> {
        let mut levels = Vec::new();
        let mut current_scale = 1.0f32;

        for level in 0..max_levels {
            let scaled_width = ((width as f32) / current_scale).round() as usize;
            let scaled_height = ((height as f32) / current_scale).round() as usize;
            if scaled_width < min_size || scaled_height < min_size {
                break;
            }

            levels.push(ScaleLevel {
                level,
                scale: current_scale,
                width: scaled_width,
                height: scaled_height,
            });
            current_scale *= scale_factor;
        }

        levels
    }

    /// Build image pyramid from base image. Level 0 is the input itself.
    pub fn build_image_pyramid(img: &[u8], width: usize, height: usize, scale_levels: &[ScaleLevel]) -> Vec<Image> {
        scale_levels
            .iter()
            .map(|level| {
                if level.level == 0 {
                    img.to_vec()
                } else {
                    Self::resample(img, width, height, level.width, level.height)
                }
            })
            .collect()
    }

    /// Resample with bilinear interpolation, aligning pixel centres
    pub fn resample(img: &[u8], src_width: usize, src_height: usize, target_width: usize, target_height: usize) -> Image {
        let mut out = vec![0u8; target_width * target_height];
        let x_ratio = src_width as f32 / target_width as f32;
        let y_ratio = src_height as f32 / target_height as f32;

        for y in 0..target_height {
            let src_y = ((y as f32 + 0.5) * y_ratio - 0.5).max(0.0);
            for x in 0..target_width {
                let src_x = ((x as f32 + 0.5) * x_ratio - 0.5).max(0.0);
                let value = bilinear_sample(img, src_width, src_height, src_x, src_y);
                out[y * target_width + x] = value.round().clamp(0.0, 255.0) as u8;
            }
        }

        out
    }

    /// Halve a float image by taking every second pixel
    pub fn decimate(img: &[f32], width: usize, height: usize) -> (Vec<f32>, usize, usize) {
        let w = width / 2;
        let h = height / 2;
        let mut out = Vec::with_capacity(w * h);
        for y in 0..h {
            for x in 0..w {
                out.push(img[(2 * y) * width + 2 * x]);
            }
        }
        (out, w, h)
    }
}

/// Sample image at fractional coordinates using bilinear interpolation, clamping at the border
pub fn bilinear_sample(img: &[u8], width: usize, height: usize, x: f32, y: f32) -> f32 {
    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);
    let x1 = x.floor() as usize;
    let y1 = y.floor() as usize;
    let x2 = (x1 + 1).min(width - 1);
    let y2 = (y1 + 1).min(height - 1);

    let fx = x - x1 as f32;
    let fy = y - y1 as f32;

    let p11 = img[y1 * width + x1] as f32;
    let p12 = img[y1 * width + x2] as f32;
    let p21 = img[y2 * width + x1] as f32;
    let p22 = img[y2 * width + x2] as f32;

    let top = p11 * (1.0 - fx) + p12 * fx;
    let bottom = p21 * (1.0 - fx) + p22 * fx;

    top * (1.0 - fy) + bottom * fy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_shrink_by_factor() {
        let levels = ImagePyramid::generate_scale_levels(800, 600, 1.2, 8, 32);
        assert_eq!(levels.len(), 8);
        assert_eq!((levels[0].width, levels[0].height), (800, 600));
        assert_eq!(levels[1].width, 667);
        assert!((levels[2].scale - 1.44).abs() < 1e-4);
    }

    #[test]
    fn test_levels_respect_min_size() {
        let levels = ImagePyramid::generate_scale_levels(40, 40, 1.2, 8, 32);
        assert_eq!(levels.len(), 2);
        assert!(ImagePyramid::generate_scale_levels(20, 100, 1.2, 8, 32).is_empty());
    }

    #[test]
    fn test_resample_constant_image() {
        let img = vec![77u8; 30 * 20];
        let small = ImagePyramid::resample(&img, 30, 20, 25, 16);
        assert_eq!(small.len(), 25 * 16);
        assert!(small.iter().all(|&v| v == 77));
    }

    #[test]
    fn test_decimate_keeps_even_pixels() {
        let img: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let (half, w, h) = ImagePyramid::decimate(&img, 4, 4);
        assert_eq!((w, h), (2, 2));
        assert_eq!(half, vec![0.0, 2.0, 8.0, 10.0]);
    }
}
