//! 128-dimensional gradient-histogram descriptor.
//!
//! A 4x4 grid of 8-bin orientation histograms, sampled in the keypoint's rotated
//! frame with trilinear interpolation, then normalized, clamped at 0.2 and
//! renormalized to damp large gradient magnitudes.

use std::f32::consts::PI;

use panomerge_core::{DescriptorSet, FeatureSet, FloatDescriptor};
use panomerge_detect::ScaleSpaceDetection;
use rayon::prelude::*;

const GRID: usize = 4;
const BINS: usize = 8;
/// Spatial bin width in units of keypoint sigma
const BIN_WIDTH_FACTOR: f32 = 3.0;
const MAGNITUDE_CLAMP: f32 = 0.2;

/// Descriptors for every keypoint of a scale-space detection, in keypoint order
pub fn describe_scale_space(detection: &ScaleSpaceDetection) -> FeatureSet {
    let descriptors: Vec<FloatDescriptor> = detection
        .keypoints
        .par_iter()
        .map(|kp| {
            let octave = &detection.octaves[kp.level];
            gradient_descriptor(
                &octave.gaussians[kp.layer],
                octave.width,
                octave.height,
                kp.level_x,
                kp.level_y,
                kp.keypoint.angle,
                kp.sigma,
            )
        })
        .collect();

    FeatureSet {
        keypoints: detection.keypoints.iter().map(|k| k.keypoint).collect(),
        descriptors: DescriptorSet::Float(descriptors),
    }
}

/// Descriptor of the patch centred on (x, y) with orientation `angle` and blur scale `sigma`
pub fn gradient_descriptor(img: &[f32], width: usize, height: usize, x: f32, y: f32, angle: f32, sigma: f32) -> FloatDescriptor {
    let hist_width = BIN_WIDTH_FACTOR * sigma;
    let radius = (hist_width * std::f32::consts::SQRT_2 * (GRID as f32 + 1.0) * 0.5).round();
    let radius = radius.min(((width * width + height * height) as f32).sqrt()) as i64;
    let (sin_t, cos_t) = angle.sin_cos();
    let (sin_t, cos_t) = (sin_t / hist_width, cos_t / hist_width);
    let weight_denom = 2.0 * (GRID as f32 * 0.5).powi(2);

    // Histogram with a one-bin margin on each spatial side absorbs interpolation spill
    let side = GRID + 2;
    let mut hist = vec![0.0f32; side * side * BINS];
    let (cx, cy) = (x.round() as i64, y.round() as i64);

    for dy in -radius..=radius {
        for dx in -radius..=radius {
            // Offsets rotated into the keypoint frame, in bin units
            let c_rot = dx as f32 * cos_t + dy as f32 * sin_t;
            let r_rot = -(dx as f32) * sin_t + dy as f32 * cos_t;
            let rbin = r_rot + GRID as f32 / 2.0 - 0.5;
            let cbin = c_rot + GRID as f32 / 2.0 - 0.5;
            if rbin <= -1.0 || rbin >= GRID as f32 || cbin <= -1.0 || cbin >= GRID as f32 {
                continue;
            }

            let px = cx + dx;
            let py = cy + dy;
            if px <= 0 || py <= 0 || px >= width as i64 - 1 || py >= height as i64 - 1 {
                continue;
            }
            let (px, py) = (px as usize, py as usize);
            let gx = img[py * width + px + 1] - img[py * width + px - 1];
            let gy = img[(py + 1) * width + px] - img[(py - 1) * width + px];

            let magnitude = (gx * gx + gy * gy).sqrt();
            let weight = (-(c_rot * c_rot + r_rot * r_rot) / weight_denom).exp();
            let mut obin = (gy.atan2(gx) - angle) * (BINS as f32 / (2.0 * PI));
            obin = obin.rem_euclid(BINS as f32);

            accumulate(&mut hist, rbin, cbin, obin, magnitude * weight);
        }
    }

    let mut desc = [0.0f32; GRID * GRID * BINS];
    for r in 0..GRID {
        for c in 0..GRID {
            for o in 0..BINS {
                desc[(r * GRID + c) * BINS + o] = hist[((r + 1) * side + (c + 1)) * BINS + o];
            }
        }
    }

    normalize(&mut desc);
    desc.iter_mut().for_each(|v| *v = v.min(MAGNITUDE_CLAMP));
    normalize(&mut desc);
    desc
}

/// Trilinear spread of one sample over its 8 surrounding (row, col, orientation) bins
fn accumulate(hist: &mut [f32], rbin: f32, cbin: f32, obin: f32, value: f32) {
    let side = GRID + 2;
    let (r0, c0, o0) = (rbin.floor(), cbin.floor(), obin.floor());
    let (dr, dc, d_o) = (rbin - r0, cbin - c0, obin - o0);
    let (r0, c0, o0) = (r0 as i64, c0 as i64, o0 as i64);

    for (ri, wr) in [(0, 1.0 - dr), (1, dr)] {
        let r = (r0 + ri + 1) as usize;
        for (ci, wc) in [(0, 1.0 - dc), (1, dc)] {
            let c = (c0 + ci + 1) as usize;
            for (oi, wo) in [(0, 1.0 - d_o), (1, d_o)] {
                let o = ((o0 + oi) as usize) % BINS;
                hist[(r * side + c) * BINS + o] += value * wr * wc * wo;
            }
        }
    }
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Squared Euclidean distance between two float descriptors
#[inline]
pub fn squared_distance(a: &FloatDescriptor, b: &FloatDescriptor) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}
