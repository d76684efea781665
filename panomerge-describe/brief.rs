use panomerge_core::{BinaryDescriptor, DescriptorSet, FeatureSet, Image};
use panomerge_detect::{bilinear_sample, PyramidDetection};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

const DESCRIPTOR_BITS: usize = 256;
const PATTERN_SEED: u64 = 0x0b71_ef5e_ed00_0256;

/// Rotation-aware BRIEF over the pyramid level each keypoint was found on
#[derive(Debug, Clone)]
pub struct BriefGenerator {
    pairs: Vec<(f32, f32, f32, f32)>,
}

impl Default for BriefGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl BriefGenerator {
    /// Half-size of the sampling window in level pixels
    pub const PATCH_RADIUS: i32 = 15;

    /// Fixed test pattern of 256 point pairs, uniformly sampled inside the patch
    pub fn new() -> Self {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let r = Self::PATCH_RADIUS;
        let mut pairs = Vec::with_capacity(DESCRIPTOR_BITS);
        while pairs.len() < DESCRIPTOR_BITS {
            let p = (rng.gen_range(-r..=r), rng.gen_range(-r..=r), rng.gen_range(-r..=r), rng.gen_range(-r..=r));
            if (p.0, p.1) != (p.2, p.3) {
                pairs.push((p.0 as f32, p.1 as f32, p.2 as f32, p.3 as f32));
            }
        }
        Self { pairs }
    }

    /// Descriptors for every keypoint of a pyramid detection, in keypoint order
    pub fn describe(&self, detection: &PyramidDetection) -> FeatureSet {
        let smoothed: Vec<Image> = detection
            .levels
            .par_iter()
            .zip(detection.images.par_iter())
            .map(|(level, img)| binomial_smooth(img, level.width, level.height))
            .collect();

        let descriptors: Vec<BinaryDescriptor> = detection
            .keypoints
            .par_iter()
            .map(|kp| {
                let level = &detection.levels[kp.level];
                self.generate_descriptor(
                    &smoothed[kp.level],
                    level.width,
                    level.height,
                    kp.level_x,
                    kp.level_y,
                    kp.keypoint.angle,
                )
            })
            .collect();

        FeatureSet {
            keypoints: detection.keypoints.iter().map(|k| k.keypoint).collect(),
            descriptors: DescriptorSet::Binary(descriptors),
        }
    }

    /// One descriptor: bit i set when the first point of pair i is darker than the second
    pub fn generate_descriptor(&self, img: &[u8], width: usize, height: usize, cx: f32, cy: f32, angle: f32) -> BinaryDescriptor {
        let (s, c) = angle.sin_cos();
        let mut d = [0u8; 32];

        for (i, &(dx1, dy1, dx2, dy2)) in self.pairs.iter().enumerate() {
            let (rx1, ry1) = (cx + c * dx1 - s * dy1, cy + s * dx1 + c * dy1);
            let (rx2, ry2) = (cx + c * dx2 - s * dy2, cy + s * dx2 + c * dy2);

            let val1 = bilinear_sample(img, width, height, rx1, ry1);
            let val2 = bilinear_sample(img, width, height, rx2, ry2);

            let bit = (val1 < val2) as u8;
            d[i / 8] |= bit << (i % 8);
        }
        d
    }
}

/// 5x5 binomial smoothing with replicated borders
pub fn binomial_smooth(img: &[u8], width: usize, height: usize) -> Image {
    const K: [u32; 5] = [1, 4, 6, 4, 1];
    let clamp = |v: isize, max: usize| v.clamp(0, max as isize - 1) as usize;

    let mut horizontal = vec![0u32; img.len()];
    for y in 0..height {
        for x in 0..width {
            horizontal[y * width + x] = K
                .iter()
                .enumerate()
                .map(|(k, &w)| w * img[y * width + clamp(x as isize + k as isize - 2, width)] as u32)
                .sum();
        }
    }

    let mut out = vec![0u8; img.len()];
    for y in 0..height {
        for x in 0..width {
            let acc: u32 = K
                .iter()
                .enumerate()
                .map(|(k, &w)| w * horizontal[clamp(y as isize + k as isize - 2, height) * width + x])
                .sum();
            out[y * width + x] = ((acc + 128) / 256) as u8;
        }
    }
    out
}

/// Number of differing bits between two binary descriptors
#[inline]
pub fn hamming_distance(a: &BinaryDescriptor, b: &BinaryDescriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise_image(width: usize, height: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..width * height).map(|_| rng.gen_range(0..=255u8)).collect()
    }

    #[test]
    fn test_pattern_is_fixed_and_full() {
        let a = BriefGenerator::new();
        let b = BriefGenerator::new();
        assert_eq!(a.pairs.len(), 256);
        assert_eq!(a.pairs, b.pairs);
        assert!(a.pairs.iter().all(|p| p.0.abs() <= 15.0 && p.3.abs() <= 15.0));
    }

    #[test]
    fn test_same_patch_same_descriptor() {
        let img = noise_image(64, 64, 3);
        let brief = BriefGenerator::new();
        let smooth = binomial_smooth(&img, 64, 64);
        let d1 = brief.generate_descriptor(&smooth, 64, 64, 32.0, 32.0, 0.4);
        let d2 = brief.generate_descriptor(&smooth, 64, 64, 32.0, 32.0, 0.4);
        assert_eq!(hamming_distance(&d1, &d2), 0);
        let other = brief.generate_descriptor(&smooth, 64, 64, 20.0, 40.0, 0.4);
        assert!(hamming_distance(&d1, &other) > 40);
    }

    #[test]
    fn test_rotation_is_compensated() {
        // Rotating the image by 90 degrees and the keypoint angle with it keeps the descriptor
        let n = 65;
        let img = binomial_smooth(&noise_image(n, n, 9), n, n);
        let mut rotated = vec![0u8; n * n];
        for y in 0..n {
            for x in 0..n {
                // (x, y) -> (n-1-y, x)
                rotated[x * n + (n - 1 - y)] = img[y * n + x];
            }
        }
        let brief = BriefGenerator::new();
        let c = 32.0;
        let d1 = brief.generate_descriptor(&img, n, n, c, c, 0.0);
        let d2 = brief.generate_descriptor(&rotated, n, n, c, c, std::f32::consts::FRAC_PI_2);
        assert!(hamming_distance(&d1, &d2) < 16, "{}", hamming_distance(&d1, &d2));
    }

    #[test]
    fn test_binomial_smooth_flat() {
        let img = vec![99u8; 12 * 7];
        assert_eq!(binomial_smooth(&img, 12, 7), img);
    }

    #[test]
    fn test_hamming() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        b[0] = 0b1011;
        b[31] = 0xff;
        assert_eq!(hamming_distance(&a, &b), 11);
    }
}
