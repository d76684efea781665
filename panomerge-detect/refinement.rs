use std::cmp::Ordering;

use panomerge_core::Keypoint;

use crate::types::{LevelKeypoint, ScoredKeypoint};

/// Orientation assignment and keypoint culling
pub struct KeypointRefinement;

impl KeypointRefinement {
    /// Orientation by intensity centroid over a circular patch of `radius`
    pub fn compute_orientation(img: &[u8], width: usize, height: usize, x: usize, y: usize, radius: usize) -> f32 {
        let r = radius as i64;
        let mut m10 = 0i64;
        let mut m01 = 0i64;

        for dy in -r..=r {
            let py = y as i64 + dy;
            if py < 0 || py >= height as i64 {
                continue;
            }
            // Half-width of the disc at this row
            let span = ((r * r - dy * dy) as f64).sqrt() as i64;
            for dx in -span..=span {
                let px = x as i64 + dx;
                if px < 0 || px >= width as i64 {
                    continue;
                }
                let v = img[py as usize * width + px as usize] as i64;
                m10 += dx * v;
                m01 += dy * v;
            }
        }

        if m10 == 0 && m01 == 0 {
            0.0
        } else {
            (m01 as f32).atan2(m10 as f32)
        }
    }

    /// Keep the strongest candidate inside each `cell` x `cell` bucket
    pub fn grid_suppression(keypoints: Vec<ScoredKeypoint>, width: usize, cell: usize) -> Vec<ScoredKeypoint> {
        let cell = cell.max(1);
        let cols = width.div_ceil(cell);
        let mut best: std::collections::HashMap<usize, ScoredKeypoint> = std::collections::HashMap::new();
        for kp in keypoints {
            let key = (kp.y / cell) * cols + kp.x / cell;
            best.entry(key)
                .and_modify(|cur| {
                    if compare_scored(&kp, cur) == Ordering::Less {
                        *cur = kp;
                    }
                })
                .or_insert(kp);
        }
        let mut kept: Vec<ScoredKeypoint> = best.into_values().collect();
        kept.sort_by(compare_scored);
        kept
    }

    /// Strongest `limit` keypoints, ties broken by position so the result is reproducible
    pub fn retain_best(mut keypoints: Vec<LevelKeypoint>, limit: usize) -> Vec<LevelKeypoint> {
        keypoints.sort_by(|a, b| compare_keypoints(&a.keypoint, &b.keypoint));
        keypoints.truncate(limit);
        keypoints
    }
}

/// Descending response, then raster order
fn compare_scored(a: &ScoredKeypoint, b: &ScoredKeypoint) -> Ordering {
    b.response
        .total_cmp(&a.response)
        .then(a.y.cmp(&b.y))
        .then(a.x.cmp(&b.x))
}

fn compare_keypoints(a: &Keypoint, b: &Keypoint) -> Ordering {
    b.response
        .total_cmp(&a.response)
        .then(a.octave.cmp(&b.octave))
        .then(a.y.total_cmp(&b.y))
        .then(a.x.total_cmp(&b.x))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(x: usize, y: usize, response: f32) -> ScoredKeypoint {
        ScoredKeypoint { x, y, response }
    }

    fn level_kp(x: f32, response: f32) -> LevelKeypoint {
        let mut keypoint = Keypoint::at(x, 0.0);
        keypoint.response = response;
        LevelKeypoint { keypoint, level: 0, layer: 0, level_x: x, level_y: 0.0, sigma: 1.0 }
    }

    #[test]
    fn test_orientation_points_to_bright_side() {
        let (w, h) = (31, 31);
        let right: Vec<u8> = (0..w * h).map(|i| if i % w > 15 { 200 } else { 10 }).collect();
        let angle = KeypointRefinement::compute_orientation(&right, w, h, 15, 15, 10);
        assert!(angle.abs() < 0.05, "angle {}", angle);

        let below: Vec<u8> = (0..w * h).map(|i| if i / w > 15 { 200 } else { 10 }).collect();
        let angle = KeypointRefinement::compute_orientation(&below, w, h, 15, 15, 10);
        assert!((angle - std::f32::consts::FRAC_PI_2).abs() < 0.05, "angle {}", angle);
    }

    #[test]
    fn test_grid_suppression_keeps_cell_maximum() {
        let kps = vec![scored(1, 1, 1.0), scored(2, 2, 5.0), scored(12, 1, 3.0)];
        let kept = KeypointRefinement::grid_suppression(kps, 20, 10);
        assert_eq!(kept.len(), 2);
        assert_eq!((kept[0].x, kept[0].y), (2, 2));
        assert_eq!((kept[1].x, kept[1].y), (12, 1));
    }

    #[test]
    fn test_retain_best_is_deterministic() {
        let kps = vec![level_kp(3.0, 1.0), level_kp(1.0, 2.0), level_kp(2.0, 2.0), level_kp(0.0, 0.5)];
        let mut reversed = kps.clone();
        reversed.reverse();
        let a = KeypointRefinement::retain_best(kps, 2);
        let b = KeypointRefinement::retain_best(reversed, 2);
        assert_eq!(a, b);
        assert_eq!(a[0].keypoint.x, 1.0);
        assert_eq!(a[1].keypoint.x, 2.0);
    }
}
