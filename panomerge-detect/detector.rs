use panomerge_core::Keypoint;
use rayon::prelude::*;
use tracing::debug;

use crate::config::DetectorConfig;
use crate::corner_detection::CornerDetector;
use crate::error::{validate_gray, DetectResult};
use crate::pyramid::ImagePyramid;
use crate::refinement::KeypointRefinement;
use crate::types::{LevelKeypoint, PyramidDetection, ScaleLevel};

/// Multi-scale oriented FAST detector feeding binary descriptors
#[derive(Debug, Clone)]
pub struct BinaryDetector {
    cfg: DetectorConfig,
}

impl BinaryDetector {
    /// Creates a new detector with validation
    pub fn new(cfg: DetectorConfig) -> DetectResult<Self> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.cfg
    }

    /// Smallest pyramid level side that still leaves room for detection inside the border
    fn min_level_size(&self) -> usize {
        (2 * self.cfg.border + 8).max(32)
    }

    /// Keypoint budget per level, shrinking geometrically with the level scale
    fn level_quotas(&self, n_levels: usize) -> Vec<usize> {
        let factor = 1.0 / self.cfg.scale_factor;
        let total = self.cfg.max_features as f32;
        let first = if n_levels <= 1 {
            total
        } else {
            total * (1.0 - factor) / (1.0 - factor.powi(n_levels as i32))
        };
        (0..n_levels)
            .map(|i| (first * factor.powi(i as i32)).round().max(1.0) as usize)
            .collect()
    }

    /// Detect oriented keypoints across the pyramid.
    ///
    /// Images too small for a single level give an empty result, not an error.
    pub fn detect(&self, img: &[u8], width: usize, height: usize) -> DetectResult<PyramidDetection> {
        validate_gray(img, width, height)?;

        let levels = ImagePyramid::generate_scale_levels(
            width,
            height,
            self.cfg.scale_factor,
            self.cfg.n_levels,
            self.min_level_size(),
        );
        let images = ImagePyramid::build_image_pyramid(img, width, height, &levels);
        let quotas = self.level_quotas(levels.len());

        let per_level: Vec<Vec<LevelKeypoint>> = levels
            .par_iter()
            .zip(images.par_iter())
            .zip(quotas.par_iter())
            .map(|((level, level_img), &quota)| self.detect_level(level_img, level, width, height, quota))
            .collect();

        let all: Vec<LevelKeypoint> = per_level.into_iter().flatten().collect();
        let keypoints = KeypointRefinement::retain_best(all, self.cfg.max_features);
        debug!(levels = levels.len(), keypoints = keypoints.len(), "binary detection");

        Ok(PyramidDetection { levels, images, keypoints })
    }

    fn detect_level(
        &self,
        img: &[u8],
        level: &ScaleLevel,
        base_width: usize,
        base_height: usize,
        quota: usize,
    ) -> Vec<LevelKeypoint> {
        let mut corners = CornerDetector::detect(img, level.width, level.height, self.cfg.fast_threshold, self.cfg.border);
        corners.sort_by(|a, b| b.response.total_cmp(&a.response).then(a.y.cmp(&b.y)).then(a.x.cmp(&b.x)));
        corners.truncate(quota);

        let sx = base_width as f32 / level.width as f32;
        let sy = base_height as f32 / level.height as f32;
        let radius = self.cfg.patch_size / 2;

        corners
            .into_iter()
            .map(|c| {
                let angle = KeypointRefinement::compute_orientation(img, level.width, level.height, c.x, c.y, radius);
                let keypoint = Keypoint {
                    x: (c.x as f32 + 0.5) * sx - 0.5,
                    y: (c.y as f32 + 0.5) * sy - 0.5,
                    size: self.cfg.patch_size as f32 * level.scale,
                    angle,
                    response: c.response,
                    octave: level.level,
                };
                LevelKeypoint {
                    keypoint,
                    level: level.level,
                    layer: 0,
                    level_x: c.x as f32,
                    level_y: c.y as f32,
                    sigma: radius as f32,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DetectError;

    /// Isolated bright squares on a dark background
    fn block_grid(width: usize, height: usize, cell: usize) -> Vec<u8> {
        (0..height)
            .flat_map(|y| {
                (0..width).map(move |x| if (x / cell) % 3 == 1 && (y / cell) % 3 == 1 { 220 } else { 30 })
            })
            .collect()
    }

    #[test]
    fn test_detects_on_block_grid() {
        let img = block_grid(160, 120, 12);
        let detector = BinaryDetector::new(DetectorConfig::default()).unwrap();
        let det = detector.detect(&img, 160, 120).unwrap();
        assert!(!det.keypoints.is_empty());
        assert_eq!(det.levels.len(), det.images.len());
        for kp in &det.keypoints {
            assert!(kp.keypoint.x >= 0.0 && kp.keypoint.x < 160.0);
            assert!(kp.keypoint.y >= 0.0 && kp.keypoint.y < 120.0);
            assert_eq!(kp.level, kp.keypoint.octave);
        }
    }

    #[test]
    fn test_max_features_is_honoured() {
        let img = block_grid(200, 200, 8);
        let cfg = DetectorConfig { max_features: 25, ..DetectorConfig::default() };
        let det = BinaryDetector::new(cfg).unwrap().detect(&img, 200, 200).unwrap();
        assert!(det.keypoints.len() <= 25);
    }

    #[test]
    fn test_small_image_gives_empty_set() {
        let img = block_grid(20, 20, 4);
        let det = BinaryDetector::new(DetectorConfig::default()).unwrap().detect(&img, 20, 20).unwrap();
        assert!(det.keypoints.is_empty());
        assert!(det.levels.is_empty());
    }

    #[test]
    fn test_rejects_wrong_buffer() {
        let detector = BinaryDetector::new(DetectorConfig::default()).unwrap();
        assert!(matches!(detector.detect(&[0u8; 5], 4, 4), Err(DetectError::InvalidImageData { .. })));
    }

    #[test]
    fn test_detection_is_deterministic() {
        let img = block_grid(150, 100, 10);
        let detector = BinaryDetector::new(DetectorConfig::default()).unwrap();
        let a = detector.detect(&img, 150, 100).unwrap();
        let b = detector.detect(&img, 150, 100).unwrap();
        assert_eq!(a.keypoints, b.keypoints);
    }

    #[test]
    fn test_level_quotas_sum_close_to_budget() {
        let detector = BinaryDetector::new(DetectorConfig::default()).unwrap();
        let quotas = detector.level_quotas(8);
        let total: usize = quotas.iter().sum();
        assert!(total.abs_diff(1500) <= 8);
        assert!(quotas.windows(2).all(|w| w[0] >= w[1]));
    }
}
