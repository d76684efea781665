use panomerge_core::Image;
use rayon::prelude::*;
use tracing::debug;

use crate::error::{validate_gray, DetectError, DetectResult};
use crate::utils::{histogram, histogram_percentile, mean_intensity};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Lighting class chosen from mean luminance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Illumination {
    Night,
    Normal,
}

/// Tunable preprocessing parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PreprocessParams {
    /// Mean luminance below this selects the night path
    pub night_threshold: f32,
    pub night_clip_limit: f32,
    pub normal_clip_limit: f32,
    /// CLAHE tiles per side
    pub grid_size: usize,
    pub low_percentile: f32,
    pub high_percentile: f32,
    /// Gaussian sigma of the night-path denoise
    pub denoise_sigma: f32,
}

impl Default for PreprocessParams {
    fn default() -> Self {
        Self {
            night_threshold: 100.0,
            night_clip_limit: 4.0,
            normal_clip_limit: 2.0,
            grid_size: 8,
            low_percentile: 5.0,
            high_percentile: 95.0,
            denoise_sigma: 1.0,
        }
    }
}

impl PreprocessParams {
    pub fn validate(&self) -> DetectResult<()> {
        if self.grid_size == 0 {
            return Err(DetectError::InvalidParameter("CLAHE grid must be positive".into()));
        }
        if !(self.night_clip_limit > 0.0 && self.normal_clip_limit > 0.0) {
            return Err(DetectError::InvalidParameter(format!(
                "clip limits must be positive, got night {} normal {}",
                self.night_clip_limit, self.normal_clip_limit
            )));
        }
        if !(0.0 <= self.low_percentile && self.low_percentile < self.high_percentile && self.high_percentile <= 100.0) {
            return Err(DetectError::InvalidParameter(format!(
                "percentiles must satisfy 0 <= low < high <= 100, got {} and {}",
                self.low_percentile, self.high_percentile
            )));
        }
        if !(self.denoise_sigma >= 0.0 && self.night_threshold.is_finite()) {
            return Err(DetectError::InvalidParameter(format!("denoise sigma {} must not be negative", self.denoise_sigma)));
        }
        Ok(())
    }

    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> DetectResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| DetectError::InvalidParameter(e.to_string()))
    }

    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> DetectResult<Self> {
        let params: Self = serde_json::from_str(json).map_err(|e| DetectError::InvalidParameter(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    #[cfg(feature = "serde")]
    pub fn from_toml(toml_str: &str) -> DetectResult<Self> {
        let params: Self = toml::from_str(toml_str).map_err(|e| DetectError::InvalidParameter(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    /// Load tuned parameters from a `.json` or `.toml` file
    #[cfg(feature = "serde")]
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> DetectResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| DetectError::InvalidParameter(format!("{}: {}", path.display(), e)))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            _ => Self::from_json(&content),
        }
    }

    #[cfg(feature = "serde")]
    pub fn save_json<P: AsRef<std::path::Path>>(&self, path: P) -> DetectResult<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?)
            .map_err(|e| DetectError::InvalidParameter(format!("{}: {}", path.display(), e)))
    }
}

/// Clip limit of the aggressive re-enhancement used when detection comes back sparse
pub const AGGRESSIVE_CLIP_LIMIT: f32 = 4.0;
/// Grid size of the aggressive re-enhancement
pub const AGGRESSIVE_GRID_SIZE: usize = 4;

/// Contrast and illumination normalization ahead of detection
pub struct ImagePreprocessing;

impl ImagePreprocessing {
    pub fn classify(img: &[u8], params: &PreprocessParams) -> Illumination {
        if mean_intensity(img) < params.night_threshold {
            Illumination::Night
        } else {
            Illumination::Normal
        }
    }

    /// Illumination-aware enhancement. Output has the input's dimensions.
    pub fn enhance(img: &[u8], width: usize, height: usize, params: &PreprocessParams) -> DetectResult<Image> {
        validate_gray(img, width, height)?;
        let illumination = Self::classify(img, params);
        debug!(?illumination, width, height, "preprocessing");

        match illumination {
            Illumination::Night => {
                let equalized = Self::apply_clahe(img, width, height, params.night_clip_limit, params.grid_size)?;
                let stretched = Self::percentile_stretch(&equalized, params.low_percentile, params.high_percentile);
                Ok(Self::gaussian_blur(&stretched, width, height, params.denoise_sigma))
            }
            Illumination::Normal => {
                let equalized = Self::apply_clahe(img, width, height, params.normal_clip_limit, params.grid_size)?;
                let sigma = Self::adaptive_blur_sigma(width.min(height));
                Ok(Self::gaussian_blur(&equalized, width, height, sigma))
            }
        }
    }

    /// Blur strength grows with resolution: kernels of 3, 5 or 7 pixels
    pub fn adaptive_blur_sigma(short_side: usize) -> f32 {
        let kernel = if short_side < 500 {
            3
        } else if short_side < 1000 {
            5
        } else {
            7
        };
        0.3 * ((kernel as f32 - 1.0) * 0.5 - 1.0) + 0.8
    }

    /// Contrast Limited Adaptive Histogram Equalization with bilinear blending between tiles
    pub fn apply_clahe(img: &[u8], width: usize, height: usize, clip_limit: f32, grid_size: usize) -> DetectResult<Image> {
        validate_gray(img, width, height)?;
        if grid_size == 0 || !(clip_limit.is_finite() && clip_limit > 0.0) {
            return Err(DetectError::InvalidParameter(format!(
                "CLAHE needs grid > 0 and clip > 0, got grid {} clip {}",
                grid_size, clip_limit
            )));
        }

        // Equal tiles over a reflect-padded frame, so no tile is empty or undersized
        let tile_w = width.div_ceil(grid_size.min(width));
        let tile_h = height.div_ceil(grid_size.min(height));
        let tiles_x = width.div_ceil(tile_w);
        let tiles_y = height.div_ceil(tile_h);

        let histograms = Self::compute_tile_histograms(img, width, height, tile_w, tile_h, tiles_x, tiles_y);
        let limited = Self::apply_contrast_limiting(&histograms, clip_limit);
        let luts = Self::compute_tile_luts(&limited);

        let mut out = vec![0u8; img.len()];
        out.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
            let fy = ((y as f32 + 0.5) / tile_h as f32 - 0.5).clamp(0.0, (tiles_y - 1) as f32);
            let ty0 = fy.floor() as usize;
            let ty1 = (ty0 + 1).min(tiles_y - 1);
            let wy = fy - ty0 as f32;
            for (x, px) in row.iter_mut().enumerate() {
                let fx = ((x as f32 + 0.5) / tile_w as f32 - 0.5).clamp(0.0, (tiles_x - 1) as f32);
                let tx0 = fx.floor() as usize;
                let tx1 = (tx0 + 1).min(tiles_x - 1);
                let wx = fx - tx0 as f32;
                let v = img[y * width + x] as usize;

                let top = luts[ty0 * tiles_x + tx0][v] * (1.0 - wx) + luts[ty0 * tiles_x + tx1][v] * wx;
                let bottom = luts[ty1 * tiles_x + tx0][v] * (1.0 - wx) + luts[ty1 * tiles_x + tx1][v] * wx;
                *px = (top * (1.0 - wy) + bottom * wy).round().clamp(0.0, 255.0) as u8;
            }
        });

        Ok(out)
    }

    fn compute_tile_histograms(
        img: &[u8],
        width: usize,
        height: usize,
        tile_w: usize,
        tile_h: usize,
        tiles_x: usize,
        tiles_y: usize,
    ) -> Vec<[u32; 256]> {
        let mut histograms = vec![[0u32; 256]; tiles_x * tiles_y];
        for py in 0..tiles_y * tile_h {
            let y = reflect_101(py, height);
            for px in 0..tiles_x * tile_w {
                let x = reflect_101(px, width);
                histograms[(py / tile_h) * tiles_x + px / tile_w][img[y * width + x] as usize] += 1;
            }
        }
        histograms
    }

    /// Clip each histogram at `clip_limit` times its mean bin height and spread the excess uniformly
    fn apply_contrast_limiting(histograms: &[[u32; 256]], clip_limit: f32) -> Vec<[u32; 256]> {
        histograms
            .iter()
            .map(|histogram| {
                let total: u32 = histogram.iter().sum();
                let clip_threshold = ((total as f32 / 256.0) * clip_limit).max(1.0) as u32;

                let mut limited = *histogram;
                let mut excess = 0u32;
                for count in limited.iter_mut() {
                    if *count > clip_threshold {
                        excess += *count - clip_threshold;
                        *count = clip_threshold;
                    }
                }

                let redistribution = excess / 256;
                for count in limited.iter_mut() {
                    *count += redistribution;
                }
                let remainder = (excess % 256) as usize;
                if remainder > 0 {
                    let step = (256 / remainder).max(1);
                    for count in limited.iter_mut().step_by(step).take(remainder) {
                        *count += 1;
                    }
                }
                limited
            })
            .collect()
    }

    fn compute_tile_luts(histograms: &[[u32; 256]]) -> Vec<[f32; 256]> {
        histograms
            .iter()
            .map(|histogram| {
                let total: u32 = histogram.iter().sum();
                let mut lut = [0.0f32; 256];
                if total == 0 {
                    return lut;
                }
                let mut cumulative = 0u32;
                for (v, &count) in histogram.iter().enumerate() {
                    cumulative += count;
                    lut[v] = (cumulative as f32 / total as f32 * 255.0).round();
                }
                lut
            })
            .collect()
    }

    /// Linearly map the [low, high] percentile range onto [0, 255]
    pub fn percentile_stretch(img: &[u8], low_percentile: f32, high_percentile: f32) -> Image {
        let hist = histogram(img);
        let lo = histogram_percentile(&hist, low_percentile) as f32;
        let hi = histogram_percentile(&hist, high_percentile) as f32;
        if hi - lo < 1.0 {
            return img.to_vec();
        }
        let scale = 255.0 / (hi - lo);
        img.iter()
            .map(|&v| ((v as f32 - lo) * scale).round().clamp(0.0, 255.0) as u8)
            .collect()
    }

    /// Separable Gaussian blur on an 8-bit image with replicated borders
    pub fn gaussian_blur(img: &[u8], width: usize, height: usize, sigma: f32) -> Image {
        let src: Vec<f32> = img.iter().map(|&v| v as f32).collect();
        Self::gaussian_blur_f32(&src, width, height, sigma)
            .into_iter()
            .map(|v| v.round().clamp(0.0, 255.0) as u8)
            .collect()
    }

    /// Separable Gaussian blur on a float image with replicated borders
    pub fn gaussian_blur_f32(img: &[f32], width: usize, height: usize, sigma: f32) -> Vec<f32> {
        if sigma <= 0.0 {
            return img.to_vec();
        }
        let kernel = gaussian_kernel(sigma);
        let radius = (kernel.len() / 2) as isize;

        let mut horizontal = vec![0.0f32; img.len()];
        horizontal.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
            let src = &img[y * width..(y + 1) * width];
            for (x, out) in row.iter_mut().enumerate() {
                let mut acc = 0.0;
                for (k, &w) in kernel.iter().enumerate() {
                    let sx = (x as isize + k as isize - radius).clamp(0, width as isize - 1) as usize;
                    acc += src[sx] * w;
                }
                *out = acc;
            }
        });

        let mut out = vec![0.0f32; img.len()];
        out.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
            for (x, px) in row.iter_mut().enumerate() {
                let mut acc = 0.0;
                for (k, &w) in kernel.iter().enumerate() {
                    let sy = (y as isize + k as isize - radius).clamp(0, height as isize - 1) as usize;
                    acc += horizontal[sy * width + x] * w;
                }
                *px = acc;
            }
        });
        out
    }
}

/// Mirror an index past either edge without repeating the edge sample
fn reflect_101(i: usize, len: usize) -> usize {
    if i < len {
        i
    } else {
        (2 * (len - 1)).saturating_sub(i)
    }
}

/// Normalized 1-D Gaussian kernel covering ±3 sigma
pub fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as isize;
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (-radius..=radius).map(|i| (-((i * i) as f32) / denom).exp()).collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}
