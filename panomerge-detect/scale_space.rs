//! Difference-of-Gaussians keypoint detection.
//!
//! Octaves are built by repeated Gaussian blurring and 2x decimation. Extrema of the
//! 3x3x3 DoG neighbourhood are refined to sub-pixel, sub-scale accuracy by fitting a
//! quadratic, rejected when their contrast is too low or they sit on an edge, and given
//! one keypoint per dominant gradient orientation.

use std::f32::consts::PI;

use panomerge_core::Keypoint;
use rayon::prelude::*;
use tracing::debug;

use crate::config::DetectorConfig;
use crate::error::{validate_gray, DetectResult};
use crate::preprocessing::ImagePreprocessing;
use crate::pyramid::ImagePyramid;
use crate::refinement::KeypointRefinement;
use crate::types::{LevelKeypoint, Octave, ScaleSpaceDetection};

/// Blur already present in the input image
const INPUT_SIGMA: f32 = 0.5;
/// Pixels skipped at every octave edge
const OCTAVE_BORDER: usize = 5;
const MIN_OCTAVE_SIZE: usize = 32;
const MAX_REFINE_STEPS: usize = 5;
const ORI_BINS: usize = 36;
const ORI_PEAK_RATIO: f32 = 0.8;
const ORI_SIGMA_FACTOR: f32 = 1.5;
const ORI_RADIUS_FACTOR: f32 = 3.0 * ORI_SIGMA_FACTOR;

/// Extremum after quadratic refinement, in octave coordinates
#[derive(Debug, Clone, Copy)]
struct Extremum {
    x: f32,
    y: f32,
    layer: usize,
    /// Fractional scale position inside the octave
    scale: f32,
    contrast: f32,
}

/// Scale-invariant difference-of-Gaussians detector
#[derive(Debug, Clone)]
pub struct ScaleSpaceDetector {
    cfg: DetectorConfig,
}

impl ScaleSpaceDetector {
    pub fn new(cfg: DetectorConfig) -> DetectResult<Self> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.cfg
    }

    /// Detect keypoints and keep the Gaussian octaves for description.
    ///
    /// Images smaller than one octave give an empty result, not an error.
    pub fn detect(&self, img: &[u8], width: usize, height: usize) -> DetectResult<ScaleSpaceDetection> {
        validate_gray(img, width, height)?;

        let octaves = self.build_octaves(img, width, height);
        let layers = self.cfg.octave_layers;

        let mut keypoints = Vec::new();
        for (o, octave) in octaves.iter().enumerate() {
            let dogs: Vec<Vec<f32>> = octave
                .gaussians
                .windows(2)
                .map(|pair| pair[1].iter().zip(&pair[0]).map(|(b, a)| b - a).collect())
                .collect();

            let extrema = self.find_extrema(octave, &dogs);
            let scale = (1usize << o) as f32;
            let found: Vec<LevelKeypoint> = extrema
                .par_iter()
                .flat_map_iter(|e| {
                    let sigma_oct = self.cfg.sigma * 2f32.powf(e.scale / layers as f32);
                    let gauss = &octave.gaussians[e.layer];
                    let angles = orientation_peaks(gauss, octave.width, octave.height, e.x, e.y, sigma_oct);
                    angles.into_iter().map(move |angle| LevelKeypoint {
                        keypoint: Keypoint {
                            x: e.x * scale,
                            y: e.y * scale,
                            size: sigma_oct * scale * 2.0,
                            angle,
                            response: e.contrast.abs(),
                            octave: o,
                        },
                        level: o,
                        layer: e.layer,
                        level_x: e.x,
                        level_y: e.y,
                        sigma: sigma_oct,
                    })
                })
                .collect();
            keypoints.extend(found);
        }

        let keypoints = KeypointRefinement::retain_best(keypoints, self.cfg.max_features);
        debug!(octaves = octaves.len(), keypoints = keypoints.len(), "scale-space detection");
        Ok(ScaleSpaceDetection { octaves, keypoints })
    }

    /// Gaussian octaves, `octave_layers + 3` images each, intensities scaled to [0, 1]
    pub fn build_octaves(&self, img: &[u8], width: usize, height: usize) -> Vec<Octave> {
        let layers = self.cfg.octave_layers;
        let k = 2f32.powf(1.0 / layers as f32);
        let sigmas: Vec<f32> = (0..layers + 3).map(|i| self.cfg.sigma * k.powi(i as i32)).collect();

        let base: Vec<f32> = img.iter().map(|&v| v as f32 / 255.0).collect();
        let initial = (self.cfg.sigma * self.cfg.sigma - INPUT_SIGMA * INPUT_SIGMA).max(0.01).sqrt();
        let mut seed = ImagePreprocessing::gaussian_blur_f32(&base, width, height, initial);
        let (mut w, mut h) = (width, height);

        let mut octaves = Vec::new();
        while octaves.len() < self.cfg.max_octaves && w.min(h) >= MIN_OCTAVE_SIZE {
            let mut gaussians = Vec::with_capacity(sigmas.len());
            gaussians.push(seed);
            for i in 1..sigmas.len() {
                let increment = (sigmas[i] * sigmas[i] - sigmas[i - 1] * sigmas[i - 1]).sqrt();
                let next = ImagePreprocessing::gaussian_blur_f32(&gaussians[i - 1], w, h, increment);
                gaussians.push(next);
            }

            // Layer `layers` has twice the base blur; halving it seeds the next octave
            let (next_seed, nw, nh) = ImagePyramid::decimate(&gaussians[layers], w, h);
            octaves.push(Octave { width: w, height: h, gaussians, sigmas: sigmas.clone() });
            seed = next_seed;
            w = nw;
            h = nh;
        }
        octaves
    }

    fn find_extrema(&self, octave: &Octave, dogs: &[Vec<f32>]) -> Vec<Extremum> {
        let layers = self.cfg.octave_layers;
        let (w, h) = (octave.width, octave.height);
        if w <= 2 * OCTAVE_BORDER || h <= 2 * OCTAVE_BORDER {
            return Vec::new();
        }
        let prefilter = 0.5 * self.cfg.contrast_threshold / layers as f32;

        let candidates: Vec<(usize, usize, usize)> = (1..=layers)
            .flat_map(|layer| (OCTAVE_BORDER..h - OCTAVE_BORDER).map(move |y| (layer, y)))
            .collect::<Vec<_>>()
            .into_par_iter()
            .flat_map_iter(|(layer, y)| {
                (OCTAVE_BORDER..w - OCTAVE_BORDER)
                    .filter(move |&x| is_extremum(dogs, w, layer, x, y, prefilter))
                    .map(move |x| (layer, x, y))
            })
            .collect();

        candidates
            .into_par_iter()
            .filter_map(|(layer, x, y)| self.refine(dogs, w, h, layer, x, y))
            .collect()
    }

    /// Newton steps on the DoG quadratic; None when the fit wanders off or is rejected
    fn refine(&self, dogs: &[Vec<f32>], w: usize, h: usize, layer: usize, x: usize, y: usize) -> Option<Extremum> {
        let layers = self.cfg.octave_layers;
        let (mut layer, mut x, mut y) = (layer, x, y);
        let mut offset = [0.0f32; 3];
        let mut gradient = [0.0f32; 3];
        let mut hessian = [[0.0f32; 3]; 3];
        let mut converged = false;

        for _ in 0..MAX_REFINE_STEPS {
            let d = |l: usize, xx: usize, yy: usize| dogs[l][yy * w + xx];
            let v = d(layer, x, y);

            gradient = [
                (d(layer, x + 1, y) - d(layer, x - 1, y)) * 0.5,
                (d(layer, x, y + 1) - d(layer, x, y - 1)) * 0.5,
                (d(layer + 1, x, y) - d(layer - 1, x, y)) * 0.5,
            ];
            let dxx = d(layer, x + 1, y) + d(layer, x - 1, y) - 2.0 * v;
            let dyy = d(layer, x, y + 1) + d(layer, x, y - 1) - 2.0 * v;
            let dss = d(layer + 1, x, y) + d(layer - 1, x, y) - 2.0 * v;
            let dxy = (d(layer, x + 1, y + 1) - d(layer, x - 1, y + 1) - d(layer, x + 1, y - 1)
                + d(layer, x - 1, y - 1))
                * 0.25;
            let dxs = (d(layer + 1, x + 1, y) - d(layer + 1, x - 1, y) - d(layer - 1, x + 1, y)
                + d(layer - 1, x - 1, y))
                * 0.25;
            let dys = (d(layer + 1, x, y + 1) - d(layer + 1, x, y - 1) - d(layer - 1, x, y + 1)
                + d(layer - 1, x, y - 1))
                * 0.25;
            hessian = [[dxx, dxy, dxs], [dxy, dyy, dys], [dxs, dys, dss]];

            let step = solve3(&hessian, &gradient)?;
            offset = [-step[0], -step[1], -step[2]];

            if offset.iter().all(|o| o.abs() < 0.5) {
                converged = true;
                break;
            }
            if offset.iter().any(|o| o.abs() > (w.max(h) as f32)) {
                return None;
            }

            let nx = x as i64 + offset[0].round() as i64;
            let ny = y as i64 + offset[1].round() as i64;
            let nl = layer as i64 + offset[2].round() as i64;
            let b = OCTAVE_BORDER as i64;
            if nl < 1 || nl > layers as i64 || nx < b || nx >= (w as i64 - b) || ny < b || ny >= (h as i64 - b) {
                return None;
            }
            x = nx as usize;
            y = ny as usize;
            layer = nl as usize;
        }
        if !converged {
            return None;
        }

        let v = dogs[layer][y * w + x];
        let contrast = v + 0.5 * (gradient[0] * offset[0] + gradient[1] * offset[1] + gradient[2] * offset[2]);
        if contrast.abs() * (layers as f32) < self.cfg.contrast_threshold {
            return None;
        }

        // Reject responses along edges: ratio of principal curvatures above edge_threshold
        let (dxx, dyy, dxy) = (hessian[0][0], hessian[1][1], hessian[0][1]);
        let trace = dxx + dyy;
        let det = dxx * dyy - dxy * dxy;
        let r = self.cfg.edge_threshold;
        if det <= 0.0 || trace * trace * r >= (r + 1.0) * (r + 1.0) * det {
            return None;
        }

        Some(Extremum {
            x: x as f32 + offset[0],
            y: y as f32 + offset[1],
            layer,
            scale: layer as f32 + offset[2],
            contrast,
        })
    }
}

fn is_extremum(dogs: &[Vec<f32>], w: usize, layer: usize, x: usize, y: usize, prefilter: f32) -> bool {
    let v = dogs[layer][y * w + x];
    if v.abs() <= prefilter {
        return false;
    }
    let is_max = v > 0.0;
    for l in layer - 1..=layer + 1 {
        let dog = &dogs[l];
        for yy in y - 1..=y + 1 {
            let row = &dog[yy * w + x - 1..yy * w + x + 2];
            for (i, &n) in row.iter().enumerate() {
                if l == layer && yy == y && i == 1 {
                    continue;
                }
                if (is_max && n > v) || (!is_max && n < v) {
                    return false;
                }
            }
        }
    }
    true
}

/// Solve a 3x3 linear system by Cramer's rule
fn solve3(a: &[[f32; 3]; 3], b: &[f32; 3]) -> Option<[f32; 3]> {
    let det3 = |m: &[[f32; 3]; 3]| {
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1]) - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    };
    let det = det3(a);
    if !det.is_finite() || det.abs() < 1e-12 {
        return None;
    }
    let mut out = [0.0f32; 3];
    for (col, slot) in out.iter_mut().enumerate() {
        let mut m = *a;
        for row in 0..3 {
            m[row][col] = b[row];
        }
        *slot = det3(&m) / det;
    }
    Some(out)
}

/// Dominant gradient orientations around (x, y), in radians within (-pi, pi]
pub fn orientation_peaks(img: &[f32], width: usize, height: usize, x: f32, y: f32, sigma: f32) -> Vec<f32> {
    let radius = (ORI_RADIUS_FACTOR * sigma).round() as i64;
    let weight_sigma = ORI_SIGMA_FACTOR * sigma;
    let denom = 2.0 * weight_sigma * weight_sigma;
    let (cx, cy) = (x.round() as i64, y.round() as i64);

    let mut hist = [0.0f32; ORI_BINS];
    for dy in -radius..=radius {
        let py = cy + dy;
        if py <= 0 || py >= height as i64 - 1 {
            continue;
        }
        for dx in -radius..=radius {
            let px = cx + dx;
            if px <= 0 || px >= width as i64 - 1 {
                continue;
            }
            let (px, py) = (px as usize, py as usize);
            let gx = img[py * width + px + 1] - img[py * width + px - 1];
            let gy = img[(py + 1) * width + px] - img[(py - 1) * width + px];
            let magnitude = (gx * gx + gy * gy).sqrt();
            let weight = (-((dx * dx + dy * dy) as f32) / denom).exp();
            let angle = gy.atan2(gx);
            let bin = ((angle / (2.0 * PI) * ORI_BINS as f32).round() as i64).rem_euclid(ORI_BINS as i64) as usize;
            hist[bin] += weight * magnitude;
        }
    }

    let n = ORI_BINS;
    let smooth: Vec<f32> = (0..n)
        .map(|i| {
            let at = |o: i64| hist[(i as i64 + o).rem_euclid(n as i64) as usize];
            (at(-2) + at(2)) / 16.0 + (at(-1) + at(1)) * 4.0 / 16.0 + at(0) * 6.0 / 16.0
        })
        .collect();

    let max = smooth.iter().cloned().fold(0.0f32, f32::max);
    if max <= 0.0 {
        return vec![0.0];
    }

    let mut angles = Vec::new();
    for i in 0..n {
        let left = smooth[(i + n - 1) % n];
        let right = smooth[(i + 1) % n];
        let c = smooth[i];
        if c > left && c > right && c >= ORI_PEAK_RATIO * max {
            let denom = left - 2.0 * c + right;
            let shift = if denom.abs() > f32::EPSILON { 0.5 * (left - right) / denom } else { 0.0 };
            let mut angle = (i as f32 + shift) * 2.0 * PI / n as f32;
            if angle > PI {
                angle -= 2.0 * PI;
            }
            angles.push(angle);
        }
    }
    if angles.is_empty() {
        angles.push(0.0);
    }
    angles
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Dark discs on a bright background: classic blob responses
    fn blob_image(width: usize, height: usize) -> Vec<u8> {
        let centers = [(30.0, 30.0, 5.0), (80.0, 40.0, 7.0), (50.0, 85.0, 4.0), (100.0, 90.0, 6.0)];
        (0..height)
            .flat_map(|y| {
                (0..width).map(move |x| {
                    let inside = centers.iter().any(|&(cx, cy, r): &(f32, f32, f32)| {
                        (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2) <= r * r
                    });
                    if inside { 20 } else { 210 }
                })
            })
            .collect()
    }

    #[test]
    fn test_octave_structure() {
        let detector = ScaleSpaceDetector::new(DetectorConfig::default()).unwrap();
        let img = vec![100u8; 256 * 128];
        let octaves = detector.build_octaves(&img, 256, 128);
        assert_eq!(octaves.len(), 3);
        assert_eq!((octaves[1].width, octaves[1].height), (128, 64));
        assert_eq!(octaves[0].gaussians.len(), 6);
        assert!((octaves[0].sigmas[3] - 3.2).abs() < 1e-4);
    }

    #[test]
    fn test_blobs_are_found_near_centres() {
        let img = blob_image(128, 128);
        let detector = ScaleSpaceDetector::new(DetectorConfig::default()).unwrap();
        let det = detector.detect(&img, 128, 128).unwrap();
        assert!(!det.keypoints.is_empty());
        for (cx, cy) in [(30.0f32, 30.0f32), (80.0, 40.0)] {
            assert!(
                det.keypoints.iter().any(|k| (k.keypoint.x - cx).abs() < 3.0 && (k.keypoint.y - cy).abs() < 3.0),
                "no keypoint near ({}, {})",
                cx,
                cy
            );
        }
    }

    #[test]
    fn test_flat_image_has_no_keypoints() {
        let img = vec![128u8; 96 * 96];
        let det = ScaleSpaceDetector::new(DetectorConfig::default()).unwrap().detect(&img, 96, 96).unwrap();
        assert!(det.keypoints.is_empty());
    }

    #[test]
    fn test_tiny_image_is_empty_not_error() {
        let img = vec![0u8; 10 * 10];
        let det = ScaleSpaceDetector::new(DetectorConfig::default()).unwrap().detect(&img, 10, 10).unwrap();
        assert!(det.octaves.is_empty());
        assert!(det.keypoints.is_empty());
    }

    #[test]
    fn test_solve3_identity() {
        let a = [[2.0, 0.0, 0.0], [0.0, 4.0, 0.0], [0.0, 0.0, 1.0]];
        let x = solve3(&a, &[2.0, 2.0, -3.0]).unwrap();
        assert_eq!(x, [1.0, 0.5, -3.0]);
        assert!(solve3(&[[0.0; 3]; 3], &[1.0, 1.0, 1.0]).is_none());
    }

    #[test]
    fn test_orientation_of_horizontal_ramp() {
        let (w, h) = (40, 40);
        let img: Vec<f32> = (0..w * h).map(|i| (i % w) as f32 / w as f32).collect();
        let angles = orientation_peaks(&img, w, h, 20.0, 20.0, 2.0);
        assert_eq!(angles.len(), 1);
        assert!(angles[0].abs() < 0.1, "{:?}", angles);
    }
}
