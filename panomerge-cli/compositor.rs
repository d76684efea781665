use nalgebra::Matrix3;
use panomerge_core::{MergeError, MergeMode, MergeResult, RasterImage, ResourceLimits, CHANNELS};
use rayon::prelude::*;
use tracing::debug;

/// Output frame of a geometric merge, in image A's coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canvas {
    /// Canvas column of A's x = 0; never positive
    pub origin_x: i64,
    /// Canvas row of A's y = 0; never positive
    pub origin_y: i64,
    pub width: usize,
    pub height: usize,
}

impl Canvas {
    pub fn area(&self) -> usize {
        self.width * self.height
    }
}

/// Extent slack absorbing floating-point noise in projected corners
const EDGE_EPS: f64 = 1e-3;

/// Bounding box of A's frame and B's projected corners, checked for sanity.
///
/// A corner projecting to or behind the line at infinity, or a canvas larger than
/// the growth and pixel limits allow, is an alignment failure.
pub fn plan_canvas(
    a: (usize, usize),
    b: (usize, usize),
    h: &Matrix3<f64>,
    limits: &ResourceLimits,
) -> MergeResult<Canvas> {
    let (wb, hb) = (b.0 as f64, b.1 as f64);
    let (mut min_x, mut min_y) = (0.0f64, 0.0f64);
    let (mut max_x, mut max_y) = (a.0 as f64, a.1 as f64);

    for (x, y) in [(0.0, 0.0), (wb, 0.0), (wb, hb), (0.0, hb)] {
        let w = h[(2, 0)] * x + h[(2, 1)] * y + h[(2, 2)];
        if !(w.is_finite() && w > 0.0) {
            return Err(MergeError::degenerate("image corner projects behind the camera"));
        }
        let px = (h[(0, 0)] * x + h[(0, 1)] * y + h[(0, 2)]) / w;
        let py = (h[(1, 0)] * x + h[(1, 1)] * y + h[(1, 2)]) / w;
        if !(px.is_finite() && py.is_finite()) {
            return Err(MergeError::degenerate("image corner projects to infinity"));
        }
        min_x = min_x.min(px);
        min_y = min_y.min(py);
        max_x = max_x.max(px);
        max_y = max_y.max(py);
    }

    let width_f = (max_x - EDGE_EPS).ceil() - (min_x + EDGE_EPS).floor();
    let height_f = (max_y - EDGE_EPS).ceil() - (min_y + EDGE_EPS).floor();
    let input_area = (a.0 * a.1 + b.0 * b.1) as f64;
    let area = width_f * height_f;
    if area > limits.max_canvas_growth * input_area || area > limits.max_canvas_pixels as f64 {
        return Err(MergeError::degenerate(format!(
            "canvas {:.0}x{:.0} exceeds the allowed area",
            width_f, height_f
        )));
    }

    Ok(Canvas {
        origin_x: (min_x + EDGE_EPS).floor() as i64,
        origin_y: (min_y + EDGE_EPS).floor() as i64,
        width: width_f as usize,
        height: height_f as usize,
    })
}

/// Warp B into A's frame and compose both on one canvas.
///
/// A sits at its native offset. Where both cover a pixel, `FeatureMerge` keeps A and
/// `Blend` mixes `(1 - alpha) * A + alpha * B`. Uncovered pixels are black.
pub fn composite(
    a: &RasterImage,
    b: &RasterImage,
    h: &Matrix3<f64>,
    mode: MergeMode,
    alpha: f32,
    limits: &ResourceLimits,
) -> MergeResult<RasterImage> {
    if !mode.is_geometric() {
        return Err(MergeError::Configuration(format!("{} is not a geometric mode", mode)));
    }
    let canvas = plan_canvas(a.dimensions(), b.dimensions(), h, limits)?;
    let h_inv = h
        .try_inverse()
        .ok_or_else(|| MergeError::degenerate("homography is not invertible"))?;

    let alpha = if mode == MergeMode::Blend { alpha.clamp(0.0, 1.0) } else { 0.0 };
    let (wa, ha) = (a.width() as i64, a.height() as i64);
    let (wb, hb) = (b.width() as f64, b.height() as f64);

    let mut out = vec![0u8; canvas.area() * CHANNELS];
    out.par_chunks_mut(canvas.width * CHANNELS).enumerate().for_each(|(row, line)| {
        let ay = row as i64 + canvas.origin_y;
        for col in 0..canvas.width {
            let ax = col as i64 + canvas.origin_x;
            let from_a = (ax >= 0 && ay >= 0 && ax < wa && ay < ha).then(|| a.pixel(ax as usize, ay as usize));

            let (x, y) = (ax as f64, ay as f64);
            let w = h_inv[(2, 0)] * x + h_inv[(2, 1)] * y + h_inv[(2, 2)];
            let from_b = if w > 0.0 {
                let bx = (h_inv[(0, 0)] * x + h_inv[(0, 1)] * y + h_inv[(0, 2)]) / w;
                let by = (h_inv[(1, 0)] * x + h_inv[(1, 1)] * y + h_inv[(1, 2)]) / w;
                (bx >= -0.5 && by >= -0.5 && bx <= wb - 0.5 && by <= hb - 0.5).then(|| sample_rgb(b, bx, by))
            } else {
                None
            };

            let px = match (from_a, from_b) {
                (Some(pa), Some(pb)) if alpha > 0.0 => mix(pa, pb, alpha),
                (Some(pa), _) => pa,
                (None, Some(pb)) => pb,
                (None, None) => [0, 0, 0],
            };
            line[col * CHANNELS..(col + 1) * CHANNELS].copy_from_slice(&px);
        }
    });

    debug!(width = canvas.width, height = canvas.height, %mode, alpha, "composited pair");
    RasterImage::new(canvas.width, canvas.height, out, a.source_index())
}

fn mix(a: [u8; 3], b: [u8; 3], alpha: f32) -> [u8; 3] {
    let m = |pa: u8, pb: u8| ((1.0 - alpha) * pa as f32 + alpha * pb as f32).round().clamp(0.0, 255.0) as u8;
    [m(a[0], b[0]), m(a[1], b[1]), m(a[2], b[2])]
}

/// Bilinear RGB sample with replicated borders
fn sample_rgb(img: &RasterImage, x: f64, y: f64) -> [u8; 3] {
    let max_x = (img.width() - 1) as f64;
    let max_y = (img.height() - 1) as f64;
    let (x, y) = (x.clamp(0.0, max_x), y.clamp(0.0, max_y));
    let (x0, y0) = (x.floor() as usize, y.floor() as usize);
    let (x1, y1) = ((x0 + 1).min(img.width() - 1), (y0 + 1).min(img.height() - 1));
    let (dx, dy) = (x - x0 as f64, y - y0 as f64);

    let (p00, p10, p01, p11) = (img.pixel(x0, y0), img.pixel(x1, y0), img.pixel(x0, y1), img.pixel(x1, y1));
    let mut out = [0u8; 3];
    for c in 0..CHANNELS {
        let top = p00[c] as f64 * (1.0 - dx) + p10[c] as f64 * dx;
        let bottom = p01[c] as f64 * (1.0 - dx) + p11[c] as f64 * dx;
        out[c] = (top * (1.0 - dy) + bottom * dy).round().clamp(0.0, 255.0) as u8;
    }
    out
}
