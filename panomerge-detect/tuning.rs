use panomerge_core::DetectorKind;
use rayon::prelude::*;
use tracing::info;

use crate::config::DetectorConfig;
use crate::detector::BinaryDetector;
use crate::error::{DetectError, DetectResult};
use crate::preprocessing::{ImagePreprocessing, PreprocessParams};
use crate::scale_space::ScaleSpaceDetector;
use crate::types::GrayFrame;
use crate::utils::{histogram, histogram_percentile, mean_intensity};

#[cfg(feature = "serde")]
use serde::Serialize;

/// Measurements taken on one image.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ImageStatistics {
    pub brightness: f32,
    /// 5th to 95th percentile spread, in [0, 1]
    pub contrast: f32,
    /// Variance of the Laplacian
    pub noise: f32,
    pub features: usize,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct TuningReport {
    pub params: PreprocessParams,
    pub images: Vec<ImageStatistics>,
    pub avg_brightness: f32,
    pub avg_contrast: f32,
    pub avg_noise: f32,
    pub avg_features: f32,
    pub recommendations: Vec<String>,
}

/// Derive preprocessing parameters from statistics of a representative image set.
pub fn tune_preprocessing(frames: &[GrayFrame], kind: DetectorKind, cfg: &DetectorConfig) -> DetectResult<TuningReport> {
    if frames.is_empty() {
        return Err(DetectError::InvalidParameter("no images provided for tuning".into()));
    }

    let images: Vec<ImageStatistics> = frames
        .par_iter()
        .map(|frame| measure(frame, kind, cfg))
        .collect::<DetectResult<_>>()?;

    let n = images.len() as f32;
    let avg_brightness = images.iter().map(|s| s.brightness).sum::<f32>() / n;
    let avg_contrast = images.iter().map(|s| s.contrast).sum::<f32>() / n;
    let avg_noise = images.iter().map(|s| s.noise).sum::<f32>() / n;
    let avg_features = images.iter().map(|s| s.features as f32).sum::<f32>() / n;

    let mut params = cfg.preprocess.clone();
    let mut brightness: Vec<f32> = images.iter().map(|s| s.brightness).collect();
    brightness.sort_by(f32::total_cmp);
    params.night_threshold = percentile(&brightness, 25.0);

    if avg_features < 100.0 {
        params.night_clip_limit *= 1.2;
        params.normal_clip_limit *= 1.1;
    } else if avg_features > 500.0 {
        params.night_clip_limit *= 0.9;
        params.normal_clip_limit *= 0.95;
    }

    let avg_short_side = frames.iter().map(|f| f.short_side() as f32).sum::<f32>() / n;
    params.grid_size = if avg_short_side < 500.0 {
        4
    } else if avg_short_side < 1000.0 {
        8
    } else {
        16
    };
    params.denoise_sigma = if avg_noise > 100.0 { 1.5 } else { 1.0 };

    let mut recommendations = Vec::new();
    if avg_brightness < 50.0 {
        recommendations.push("images are dark: the binary detector copes better with low light".to_string());
    }
    if avg_contrast < 0.3 {
        recommendations.push("images have low contrast: consider raising the CLAHE clip limits".to_string());
    }
    if avg_noise > 100.0 {
        recommendations.push("high noise detected: denoising strength has been increased".to_string());
    }
    if avg_features < 50.0 {
        recommendations.push("few features detected: consider supplying manual correspondences".to_string());
    }

    info!(
        night_threshold = params.night_threshold,
        night_clip = params.night_clip_limit,
        normal_clip = params.normal_clip_limit,
        grid = params.grid_size,
        "tuned preprocessing parameters"
    );

    Ok(TuningReport {
        params,
        images,
        avg_brightness,
        avg_contrast,
        avg_noise,
        avg_features,
        recommendations,
    })
}

fn measure(frame: &GrayFrame, kind: DetectorKind, cfg: &DetectorConfig) -> DetectResult<ImageStatistics> {
    let GrayFrame { data, width, height } = frame;
    let (width, height) = (*width, *height);

    let hist = histogram(data);
    let p5 = histogram_percentile(&hist, 5.0) as f32;
    let p95 = histogram_percentile(&hist, 95.0) as f32;

    let processed = ImagePreprocessing::enhance(data, width, height, &cfg.preprocess)?;
    let features = match kind {
        DetectorKind::ScaleInvariant => ScaleSpaceDetector::new(cfg.clone())?.detect(&processed, width, height)?.keypoints.len(),
        DetectorKind::Binary => BinaryDetector::new(cfg.clone())?.detect(&processed, width, height)?.keypoints.len(),
    };

    Ok(ImageStatistics {
        brightness: mean_intensity(data),
        contrast: (p95 - p5) / 255.0,
        noise: laplacian_variance(data, width, height),
        features,
    })
}

/// Variance of the 4-neighbour Laplacian over interior pixels
pub fn laplacian_variance(img: &[u8], width: usize, height: usize) -> f32 {
    if width < 3 || height < 3 {
        return 0.0;
    }
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0.0f64;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let c = img[y * width + x] as f64;
            let lap = img[y * width + x - 1] as f64 + img[y * width + x + 1] as f64
                + img[(y - 1) * width + x] as f64
                + img[(y + 1) * width + x] as f64
                - 4.0 * c;
            sum += lap;
            sum_sq += lap * lap;
            count += 1.0;
        }
    }
    let mean = sum / count;
    (sum_sq / count - mean * mean) as f32
}

/// Linear-interpolated percentile of sorted values
fn percentile(sorted: &[f32], p: f32) -> f32 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(value: u8, width: usize, height: usize) -> GrayFrame {
        GrayFrame::new(vec![value; width * height], width, height)
    }

    #[test]
    fn test_empty_set_is_rejected() {
        let result = tune_preprocessing(&[], DetectorKind::Binary, &DetectorConfig::default());
        assert!(matches!(result, Err(DetectError::InvalidParameter(_))));
    }

    #[test]
    fn test_flat_dark_images_raise_clip_limits() {
        let frames = vec![frame(30, 64, 64), frame(40, 64, 64), frame(60, 64, 64), frame(80, 64, 64)];
        let cfg = DetectorConfig::default();
        let report = tune_preprocessing(&frames, DetectorKind::Binary, &cfg).unwrap();

        assert!((report.params.night_threshold - 37.5).abs() < 1e-4);
        assert!((report.params.night_clip_limit - cfg.preprocess.night_clip_limit * 1.2).abs() < 1e-5);
        assert!((report.params.normal_clip_limit - cfg.preprocess.normal_clip_limit * 1.1).abs() < 1e-5);
        assert_eq!(report.params.grid_size, 4);
        assert_eq!(report.avg_features, 0.0);
        assert!(report.recommendations.iter().any(|r| r.contains("low contrast")));
        assert!(report.recommendations.iter().any(|r| r.contains("manual correspondences")));
    }

    #[test]
    fn test_laplacian_variance() {
        assert_eq!(laplacian_variance(&[7u8; 25], 5, 5), 0.0);
        let noisy: Vec<u8> = (0..100).map(|i| if (i / 10 + i % 10) % 2 == 0 { 0 } else { 255 }).collect();
        assert!(laplacian_variance(&noisy, 10, 10) > 100.0);
    }

    #[test]
    fn test_percentile_interpolates() {
        assert_eq!(percentile(&[10.0, 20.0, 30.0, 40.0, 50.0], 25.0), 20.0);
        assert_eq!(percentile(&[5.0], 25.0), 5.0);
    }
}
