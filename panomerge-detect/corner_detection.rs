use rayon::prelude::*;

use crate::types::{CornerType, ScoredKeypoint};
use crate::utils::has_consecutive_bits;

/// Corner detection algorithms (FAST and Harris)
pub struct CornerDetector;

impl CornerDetector {
    /// FAST circle offsets for corner detection
    pub const FAST_OFFSETS: [(i32, i32); 16] = [
        (0, -3), (1, -3), (2, -2), (3, -1),
        (3, 0), (3, 1), (2, 2), (1, 3),
        (0, 3), (-1, 3), (-2, 2), (-3, 1),
        (-3, 0), (-3, -1), (-2, -2), (-1, -3),
    ];

    /// Arc length that qualifies a FAST-9 corner
    pub const ARC_LENGTH: usize = 9;

    /// FAST-9 corners scored by Harris response, after 3x3 non-maximum suppression.
    ///
    /// Pixels closer than `border` to an edge are never reported.
    pub fn detect(img: &[u8], width: usize, height: usize, threshold: u8, border: usize) -> Vec<ScoredKeypoint> {
        let border = border.max(3);
        if width <= 2 * border || height <= 2 * border {
            return Vec::new();
        }

        let candidates: Vec<ScoredKeypoint> = (border..height - border)
            .into_par_iter()
            .flat_map_iter(|y| {
                (border..width - border).filter_map(move |x| {
                    let center = img[y * width + x];
                    if Self::classify(img, width, x, y, center, threshold) == CornerType::None {
                        return None;
                    }
                    let response = Self::compute_harris_response(img, width, height, x, y);
                    (response > 0.0).then_some(ScoredKeypoint { x, y, response })
                })
            })
            .collect();

        Self::suppress_3x3(candidates, width, height)
    }

    /// Decide whether the Bresenham ring around (x, y) holds a bright or dark arc
    pub(crate) fn classify(img: &[u8], width: usize, x: usize, y: usize, center: u8, threshold: u8) -> CornerType {
        let hi = center.saturating_add(threshold);
        let lo = center.saturating_sub(threshold);

        let ring = |i: usize| {
            let (dx, dy) = Self::FAST_OFFSETS[i];
            img[(y as i32 + dy) as usize * width + (x as i32 + dx) as usize]
        };

        // High-speed test on the four compass points
        let compass = [ring(0), ring(4), ring(8), ring(12)];
        let brighter = compass.iter().filter(|&&p| p > hi).count();
        let darker = compass.iter().filter(|&&p| p < lo).count();
        if brighter < 2 && darker < 2 {
            return CornerType::None;
        }

        let mut bright_mask = 0u16;
        let mut dark_mask = 0u16;
        for i in 0..16 {
            let p = ring(i);
            if p > hi {
                bright_mask |= 1 << i;
            } else if p < lo {
                dark_mask |= 1 << i;
            }
        }

        if has_consecutive_bits(bright_mask, Self::ARC_LENGTH) {
            CornerType::Bright
        } else if has_consecutive_bits(dark_mask, Self::ARC_LENGTH) {
            CornerType::Dark
        } else {
            CornerType::None
        }
    }

    /// Keep candidates that are strict maxima of their 3x3 neighbourhood
    fn suppress_3x3(candidates: Vec<ScoredKeypoint>, width: usize, height: usize) -> Vec<ScoredKeypoint> {
        let mut score = vec![0.0f32; width * height];
        for c in &candidates {
            score[c.y * width + c.x] = c.response;
        }

        candidates
            .into_iter()
            .filter(|c| {
                for dy in -1i32..=1 {
                    for dx in -1i32..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let nx = (c.x as i32 + dx) as usize;
                        let ny = (c.y as i32 + dy) as usize;
                        let other = score[ny * width + nx];
                        // Ties go to the earlier pixel in raster order
                        if other > c.response || (other == c.response && (dy < 0 || (dy == 0 && dx < 0))) {
                            return false;
                        }
                    }
                }
                true
            })
            .collect()
    }

    /// Compute Harris corner response at a pixel over a 5x5 window
    pub fn compute_harris_response(img: &[u8], width: usize, height: usize, x: usize, y: usize) -> f32 {
        if x < 3 || y < 3 || x + 3 >= width || y + 3 >= height {
            return 0.0;
        }

        let mut ixx = 0.0f64;
        let mut ixy = 0.0f64;
        let mut iyy = 0.0f64;

        for dy in -2i32..=2 {
            for dx in -2i32..=2 {
                let nx = (x as i32 + dx) as usize;
                let ny = (y as i32 + dy) as usize;
                let (gx, gy) = Self::compute_gradients(img, width, nx, ny);
                ixx += (gx * gx) as f64;
                ixy += (gx * gy) as f64;
                iyy += (gy * gy) as f64;
            }
        }

        // det(M) - k * trace(M)^2
        let k = 0.04f64;
        let det = ixx * iyy - ixy * ixy;
        let trace = ixx + iyy;
        let harris_response = det - k * trace * trace;

        if harris_response > 0.0 {
            harris_response as f32
        } else {
            0.0
        }
    }

    /// Sobel gradients, caller guarantees a one-pixel margin
    fn compute_gradients(img: &[u8], width: usize, x: usize, y: usize) -> (f32, f32) {
        let p = |xx: usize, yy: usize| img[yy * width + xx] as f32;

        let gx = p(x + 1, y - 1) + 2.0 * p(x + 1, y) + p(x + 1, y + 1)
            - p(x - 1, y - 1) - 2.0 * p(x - 1, y) - p(x - 1, y + 1);
        let gy = p(x - 1, y + 1) + 2.0 * p(x, y + 1) + p(x + 1, y + 1)
            - p(x - 1, y - 1) - 2.0 * p(x, y - 1) - p(x + 1, y - 1);

        (gx / 8.0, gy / 8.0)
    }
}
