//! Deterministic synthetic scenes for tests, benches and demos.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::RasterImage;

/// Textured scene of random rectangles and discs over a smooth gradient.
///
/// The same `(width, height, seed)` always yields the same pixels, so overlapping
/// crops of one scene behave like photographs of the same place.
pub fn textured_scene(width: usize, height: usize, seed: u64) -> RasterImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut img = RasterImage::filled(width, height, [0, 0, 0], 0);
    let base: [f32; 3] = [rng.gen_range(40.0..120.0), rng.gen_range(40.0..120.0), rng.gen_range(40.0..120.0)];
    for y in 0..img.height() {
        for x in 0..img.width() {
            let gx = x as f32 / width.max(1) as f32;
            let gy = y as f32 / height.max(1) as f32;
            let px = [
                (base[0] + 60.0 * gx) as u8,
                (base[1] + 60.0 * gy) as u8,
                (base[2] + 30.0 * (gx + gy)) as u8,
            ];
            img.set_pixel(x, y, px);
        }
    }

    let shapes = (width * height / 900).max(8);
    for _ in 0..shapes {
        let color = [rng.gen_range(0..=255u8), rng.gen_range(0..=255u8), rng.gen_range(0..=255u8)];
        let cx = rng.gen_range(0..img.width()) as i64;
        let cy = rng.gen_range(0..img.height()) as i64;
        if rng.gen_bool(0.6) {
            let hw = rng.gen_range(3..20i64);
            let hh = rng.gen_range(3..20i64);
            fill_where(&mut img, cx - hw, cy - hh, cx + hw, cy + hh, color, |_, _| true);
        } else {
            let r = rng.gen_range(3..16i64);
            fill_where(&mut img, cx - r, cy - r, cx + r, cy + r, color, |x, y| {
                (x - cx).pow(2) + (y - cy).pow(2) <= r * r
            });
        }
    }
    box_blur3(&img)
}

/// Scene with statistics unrelated to any [`textured_scene`]: diagonal stripes and speckle.
pub fn unrelated_scene(width: usize, height: usize, seed: u64) -> RasterImage {
    let mut rng = StdRng::seed_from_u64(seed ^ 0x9E37_79B9_7F4A_7C15);
    let mut img = RasterImage::filled(width, height, [0, 0, 0], 0);
    let period = rng.gen_range(9..17usize);
    for y in 0..img.height() {
        for x in 0..img.width() {
            let stripe: u8 = if ((x + 2 * y) / period) % 2 == 0 { 200 } else { 30 };
            let speckle: u8 = rng.gen_range(0..40);
            let v = stripe.saturating_add(speckle);
            img.set_pixel(x, y, [v, v / 2, 255 - v]);
        }
    }
    img
}

fn fill_where(
    img: &mut RasterImage,
    x0: i64,
    y0: i64,
    x1: i64,
    y1: i64,
    color: [u8; 3],
    inside: impl Fn(i64, i64) -> bool,
) {
    let (w, h) = (img.width() as i64, img.height() as i64);
    for y in y0.max(0)..=y1.min(h - 1) {
        for x in x0.max(0)..=x1.min(w - 1) {
            if inside(x, y) {
                img.set_pixel(x as usize, y as usize, color);
            }
        }
    }
}

fn box_blur3(img: &RasterImage) -> RasterImage {
    let (w, h) = img.dimensions();
    let mut out = img.clone();
    for y in 0..h {
        for x in 0..w {
            let mut acc = [0u32; 3];
            let mut n = 0u32;
            for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                    let p = img.pixel(nx, ny);
                    acc[0] += p[0] as u32;
                    acc[1] += p[1] as u32;
                    acc[2] += p[2] as u32;
                    n += 1;
                }
            }
            out.set_pixel(x, y, [((acc[0] + n / 2) / n) as u8, ((acc[1] + n / 2) / n) as u8, ((acc[2] + n / 2) / n) as u8]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_is_deterministic() {
        assert_eq!(textured_scene(64, 48, 5), textured_scene(64, 48, 5));
        assert_ne!(textured_scene(64, 48, 5), textured_scene(64, 48, 6));
    }

    #[test]
    fn test_scene_has_texture() {
        let luma = textured_scene(120, 90, 1).luminance();
        let min = *luma.iter().min().unwrap();
        let max = *luma.iter().max().unwrap();
        assert!(max - min > 80);
    }
}
