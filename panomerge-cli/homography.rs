//! Projective transform estimation.
//!
//! Direct Linear Transform with Hartley normalization, wrapped in a seeded RANSAC
//! loop with adaptive termination and a least-squares refit over the consensus set.

use nalgebra::{Matrix2, Matrix3, SMatrix, SVector, SymmetricEigen, Vector3};
use panomerge_core::{MergeError, MergeResult, RansacConfig};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use tracing::debug;

pub type Point = [f64; 2];

/// Fewest correspondences that determine a homography
pub const MIN_CORRESPONDENCES: usize = 4;

const DET_RANGE: (f64, f64) = (0.1, 10.0);
const MAX_PERSPECTIVE: f64 = 0.005;
/// Twice the triangle area, in squared pixels, below which three points count as collinear
const COLLINEAR_AREA: f64 = 1.0;

/// Fitted transform mapping image B's plane onto image A's plane.
#[derive(Debug, Clone, PartialEq)]
pub struct HomographyModel {
    pub matrix: Matrix3<f64>,
    /// One flag per input correspondence
    pub inlier_mask: Vec<bool>,
    pub inlier_count: usize,
    pub inlier_ratio: f64,
}

impl HomographyModel {
    pub fn project(&self, x: f64, y: f64) -> Option<Point> {
        project(&self.matrix, x, y)
    }
}

/// Project a point through `h`; `None` when it lands on or behind the line at infinity.
pub fn project(h: &Matrix3<f64>, x: f64, y: f64) -> Option<Point> {
    let p = h * Vector3::new(x, y, 1.0);
    if p[2] <= 1e-12 {
        return None;
    }
    Some([p[0] / p[2], p[1] / p[2]])
}

pub fn reprojection_error(h: &Matrix3<f64>, src: &Point, dst: &Point) -> f64 {
    match project(h, src[0], src[1]) {
        Some(p) => ((p[0] - dst[0]).powi(2) + (p[1] - dst[1]).powi(2)).sqrt(),
        None => f64::INFINITY,
    }
}

/// Translate the centroid to the origin and scale the mean distance to sqrt(2)
fn normalize_points(pts: &[Point]) -> (Matrix3<f64>, Vec<Point>) {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p[1]).sum::<f64>() / n;
    let mean_dist = pts.iter().map(|p| ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt()).sum::<f64>() / n;
    let s = if mean_dist > 1e-12 { std::f64::consts::SQRT_2 / mean_dist } else { 1.0 };

    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = pts.iter().map(|p| [s * (p[0] - cx), s * (p[1] - cy)]).collect();
    (t, normalized)
}

/// Least-squares homography with `dst ≈ project(H, src)`, normalized so `h22 = 1`.
pub fn estimate_dlt(src: &[Point], dst: &[Point]) -> MergeResult<Matrix3<f64>> {
    let n = src.len().min(dst.len());
    if n < MIN_CORRESPONDENCES {
        return Err(MergeError::InsufficientFeatures { found: n, needed: MIN_CORRESPONDENCES });
    }
    if src.len() != dst.len() {
        return Err(MergeError::Configuration("point lists differ in length".into()));
    }

    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    // Accumulate A^T A row by row; the solution is its eigenvector of least eigenvalue
    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (s, d) in src_n.iter().zip(&dst_n) {
        let (sx, sy) = (s[0], s[1]);
        let (dx, dy) = (d[0], d[1]);
        let r1 = SVector::<f64, 9>::from_column_slice(&[0.0, 0.0, 0.0, -sx, -sy, -1.0, dy * sx, dy * sy, dy]);
        let r2 = SVector::<f64, 9>::from_column_slice(&[sx, sy, 1.0, 0.0, 0.0, 0.0, -dx * sx, -dx * sy, -dx]);
        ata += r1 * r1.transpose() + r2 * r2.transpose();
    }

    let eig = SymmetricEigen::new(ata);
    let min_idx = eig.eigenvalues.iamin();
    let v = eig.eigenvectors.column(min_idx);
    let h_norm = Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]);

    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| MergeError::degenerate("normalization transform is singular"))?;
    let h = t_dst_inv * h_norm * t_src;

    let scale = h[(2, 2)];
    if !scale.is_finite() || scale.abs() < 1e-12 {
        return Err(MergeError::degenerate("homography maps the origin to infinity"));
    }
    Ok(h / scale)
}

/// Reject near-singular, mirrored, wildly scaling or strongly perspective transforms.
pub fn validate_model(h: &Matrix3<f64>) -> MergeResult<()> {
    if h.iter().any(|v| !v.is_finite()) {
        return Err(MergeError::degenerate("homography has non-finite entries"));
    }
    let det = Matrix2::new(h[(0, 0)], h[(0, 1)], h[(1, 0)], h[(1, 1)]).determinant();
    if !(DET_RANGE.0..=DET_RANGE.1).contains(&det) {
        return Err(MergeError::degenerate(format!("linear part determinant {:.4} out of range", det)));
    }
    if h[(2, 0)].abs() > MAX_PERSPECTIVE || h[(2, 1)].abs() > MAX_PERSPECTIVE {
        return Err(MergeError::degenerate(format!(
            "perspective terms ({:.5}, {:.5}) too strong",
            h[(2, 0)],
            h[(2, 1)]
        )));
    }
    Ok(())
}

fn collinear(a: &Point, b: &Point, c: &Point) -> bool {
    let cross = (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0]);
    cross.abs() < COLLINEAR_AREA
}

/// True when any three of the four sample points are (nearly) collinear
fn degenerate_sample(pts: &[Point; 4]) -> bool {
    const TRIPLES: [(usize, usize, usize); 4] = [(0, 1, 2), (0, 1, 3), (0, 2, 3), (1, 2, 3)];
    TRIPLES.iter().any(|&(i, j, k)| collinear(&pts[i], &pts[j], &pts[k]))
}

fn consensus(h: &Matrix3<f64>, src: &[Point], dst: &[Point], tolerance: f64) -> (Vec<bool>, usize) {
    let mask: Vec<bool> = src.iter().zip(dst).map(|(s, d)| reprojection_error(h, s, d) < tolerance).collect();
    let count = mask.iter().filter(|&&m| m).count();
    (mask, count)
}

/// Iterations needed to draw one all-inlier sample with the requested confidence
fn required_iterations(inlier_ratio: f64, confidence: f64, max_iterations: usize) -> usize {
    let w4 = inlier_ratio.powi(MIN_CORRESPONDENCES as i32);
    if w4 >= 1.0 - f64::EPSILON {
        return 1;
    }
    if w4 <= f64::EPSILON {
        return max_iterations;
    }
    let needed = (1.0 - confidence).ln() / (1.0 - w4).ln();
    if needed.is_finite() {
        (needed.ceil() as usize).clamp(1, max_iterations)
    } else {
        max_iterations
    }
}

/// Robust fit of the transform taking `src` (image B) onto `dst` (image A).
///
/// The same `seed` always yields the same model. Failures are typed: too few
/// correspondences give `InsufficientFeatures`, a weak or invalid consensus gives
/// `DegenerateAlignment`.
pub fn fit_ransac(src: &[Point], dst: &[Point], cfg: &RansacConfig, seed: u64) -> MergeResult<HomographyModel> {
    let n = src.len();
    if n < MIN_CORRESPONDENCES {
        return Err(MergeError::InsufficientFeatures { found: n, needed: MIN_CORRESPONDENCES });
    }
    if dst.len() != n {
        return Err(MergeError::Configuration("point lists differ in length".into()));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut best: Option<(Matrix3<f64>, usize)> = None;
    let mut limit = cfg.max_iterations;
    let mut iterations = 0;

    while iterations < limit {
        iterations += 1;
        let picked = index::sample(&mut rng, n, MIN_CORRESPONDENCES);
        let s = [src[picked.index(0)], src[picked.index(1)], src[picked.index(2)], src[picked.index(3)]];
        let d = [dst[picked.index(0)], dst[picked.index(1)], dst[picked.index(2)], dst[picked.index(3)]];
        if degenerate_sample(&s) || degenerate_sample(&d) {
            continue;
        }

        let h = match estimate_dlt(&s, &d) {
            Ok(h) if validate_model(&h).is_ok() => h,
            _ => continue,
        };

        let (_, count) = consensus(&h, src, dst, cfg.tolerance);
        if best.is_none_or(|(_, c)| count > c) {
            best = Some((h, count));
            limit = required_iterations(count as f64 / n as f64, cfg.confidence, cfg.max_iterations).max(iterations);
        }
    }

    let Some((best_h, best_count)) = best else {
        return Err(MergeError::degenerate("no non-degenerate sample produced a valid model"));
    };

    // Refit over the consensus set, keeping the sample model if the refit is worse
    let (mask, _) = consensus(&best_h, src, dst, cfg.tolerance);
    let (in_src, in_dst): (Vec<Point>, Vec<Point>) =
        src.iter().zip(dst).zip(&mask).filter(|(_, m)| **m).map(|((s, d), _)| (*s, *d)).unzip();
    let refined = estimate_dlt(&in_src, &in_dst).ok().filter(|h| validate_model(h).is_ok());

    let (matrix, inlier_mask, inlier_count) = match refined {
        Some(h) => {
            let (m, c) = consensus(&h, src, dst, cfg.tolerance);
            if c >= best_count { (h, m, c) } else { (best_h, mask, best_count) }
        }
        None => (best_h, mask, best_count),
    };

    let inlier_ratio = inlier_count as f64 / n as f64;
    debug!(correspondences = n, iterations, inlier_count, inlier_ratio, "ransac finished");

    if inlier_count < cfg.min_inliers {
        return Err(MergeError::degenerate(format!(
            "{} inliers, need at least {}",
            inlier_count, cfg.min_inliers
        )));
    }
    if inlier_ratio < cfg.min_inlier_ratio {
        return Err(MergeError::degenerate(format!(
            "inlier ratio {:.3} below {:.3}",
            inlier_ratio, cfg.min_inlier_ratio
        )));
    }
    validate_model(&matrix)?;

    Ok(HomographyModel { matrix, inlier_mask, inlier_count, inlier_ratio })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::Rng;

    fn true_h() -> Matrix3<f64> {
        Matrix3::new(1.05, 0.03, 120.0, -0.02, 0.98, -15.0, 0.0001, -0.00005, 1.0)
    }

    fn grid(n: usize, step: f64) -> Vec<Point> {
        (0..n * n).map(|i| [(i % n) as f64 * step + 7.0, (i / n) as f64 * step + 11.0]).collect()
    }

    #[test]
    fn test_dlt_recovers_exact_transform() {
        let h = true_h();
        let src = grid(5, 40.0);
        let dst: Vec<Point> = src.iter().filter_map(|p| project(&h, p[0], p[1])).collect();
        let est = estimate_dlt(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(&dst) {
            assert!(reprojection_error(&est, s, d) < 1e-6);
        }
        assert_relative_eq!(est[(2, 2)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_ransac_rejects_outliers() {
        let h = true_h();
        let mut rng = StdRng::seed_from_u64(7);
        let mut src = grid(6, 35.0);
        let mut dst: Vec<Point> = src
            .iter()
            .filter_map(|p| project(&h, p[0], p[1]))
            .map(|p| [p[0] + rng.gen_range(-0.4..0.4), p[1] + rng.gen_range(-0.4..0.4)])
            .collect();
        for _ in 0..12 {
            src.push([rng.gen_range(0.0..200.0), rng.gen_range(0.0..200.0)]);
            dst.push([rng.gen_range(0.0..600.0), rng.gen_range(0.0..600.0)]);
        }

        let model = fit_ransac(&src, &dst, &RansacConfig::default(), 3).unwrap();
        assert!(model.inlier_count >= 36, "{}", model.inlier_count);
        assert!(model.inlier_mask[..36].iter().all(|&m| m));
        assert_relative_eq!(model.inlier_ratio, model.inlier_count as f64 / 48.0);
        let p = model.project(100.0, 100.0).unwrap();
        let q = project(&h, 100.0, 100.0).unwrap();
        assert!((p[0] - q[0]).abs() < 1.0 && (p[1] - q[1]).abs() < 1.0);
    }

    #[test]
    fn test_same_seed_same_model() {
        let mut rng = StdRng::seed_from_u64(1);
        let src: Vec<Point> = (0..40).map(|_| [rng.gen_range(0.0..300.0), rng.gen_range(0.0..300.0)]).collect();
        let dst: Vec<Point> = src
            .iter()
            .enumerate()
            .map(|(i, p)| if i % 3 == 0 { [p[1], p[0]] } else { [p[0] + 30.0, p[1] - 4.0] })
            .collect();
        let a = fit_ransac(&src, &dst, &RansacConfig::default(), 99).unwrap();
        let b = fit_ransac(&src, &dst, &RansacConfig::default(), 99).unwrap();
        assert_eq!(a, b);
        assert_relative_eq!(a.matrix[(0, 2)], 30.0, epsilon = 1e-6);
    }

    #[test]
    fn test_too_few_points() {
        let pts = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
        assert_eq!(
            fit_ransac(&pts, &pts, &RansacConfig::default(), 0).unwrap_err(),
            MergeError::InsufficientFeatures { found: 3, needed: 4 }
        );
    }

    #[test]
    fn test_collinear_points_are_degenerate() {
        let src: Vec<Point> = (0..20).map(|i| [i as f64 * 10.0, 2.0 * i as f64 * 10.0]).collect();
        let result = fit_ransac(&src, &src, &RansacConfig::default(), 0);
        assert!(matches!(result, Err(MergeError::DegenerateAlignment { .. })));
    }

    #[test]
    fn test_random_pairs_are_degenerate() {
        let mut rng = StdRng::seed_from_u64(5);
        let src: Vec<Point> = (0..60).map(|_| [rng.gen_range(0.0..400.0), rng.gen_range(0.0..400.0)]).collect();
        let dst: Vec<Point> = (0..60).map(|_| [rng.gen_range(0.0..400.0), rng.gen_range(0.0..400.0)]).collect();
        let result = fit_ransac(&src, &dst, &RansacConfig::default(), 11);
        assert!(matches!(result, Err(MergeError::DegenerateAlignment { .. })));
    }

    #[test]
    fn test_validity_bounds() {
        assert!(validate_model(&Matrix3::identity()).is_ok());
        assert!(validate_model(&Matrix3::new(0.2, 0.0, 0.0, 0.0, 0.2, 0.0, 0.0, 0.0, 1.0)).is_err());
        assert!(validate_model(&Matrix3::new(-1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0)).is_err());
        assert!(validate_model(&Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.01, 0.0, 1.0)).is_err());
        assert!(validate_model(&Matrix3::new(f64::NAN, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0)).is_err());
    }

    #[test]
    fn test_adaptive_iterations() {
        assert_eq!(required_iterations(1.0, 0.995, 2000), 1);
        assert_eq!(required_iterations(0.0, 0.995, 2000), 2000);
        let half = required_iterations(0.5, 0.995, 2000);
        assert!((80..=90).contains(&half), "{}", half);
    }
}
