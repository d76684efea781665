use image::imageops::{self, FilterType};
use panomerge_core::{MergeResult, RasterImage, SeamLayout, CHANNELS};
use tracing::debug;

use crate::io::{from_rgb_image, to_rgb_image};

/// Concatenate two images with a soft seam.
///
/// Horizontal layout keeps `a` untouched and scales `b` to `a`'s height; vertical
/// layout does the same along the other axis. Inside the transition band centred on
/// the join, pixels ramp linearly from `a`'s edge column to `b`'s edge column.
pub fn side_by_side(a: &RasterImage, b: &RasterImage, layout: SeamLayout, seam_width: usize) -> MergeResult<RasterImage> {
    match layout {
        SeamLayout::Horizontal => join_horizontal(a, b, seam_width),
        SeamLayout::Vertical => Ok(join_horizontal(&a.transposed(), &b.transposed(), seam_width)?.transposed()),
    }
}

/// Half-width of the transition band: never more than a quarter of either image
pub fn band_half_width(seam_width: usize, wa: usize, wb: usize) -> usize {
    (seam_width / 2).min(wa / 4).min(wb / 4)
}

fn join_horizontal(a: &RasterImage, b: &RasterImage, seam_width: usize) -> MergeResult<RasterImage> {
    let height = a.height();
    let b = if b.height() == height {
        b.clone()
    } else {
        let new_w = ((b.width() as f64 * height as f64 / b.height() as f64).round() as u32).max(1);
        let resized = imageops::resize(&to_rgb_image(b)?, new_w, height as u32, FilterType::Triangle);
        from_rgb_image(resized, b.source_index())?
    };

    let (wa, wb) = (a.width(), b.width());
    let width = wa + wb;
    let half = band_half_width(seam_width, wa, wb);
    let mut out = Vec::with_capacity(width * height * CHANNELS);

    for y in 0..height {
        out.extend_from_slice(&a.data()[y * wa * CHANNELS..(y + 1) * wa * CHANNELS]);
        out.extend_from_slice(&b.data()[y * wb * CHANNELS..(y + 1) * wb * CHANNELS]);
    }

    if half > 0 {
        let band = 2 * half;
        let start = wa - half;
        for y in 0..height {
            let left = a.pixel(wa - 1, y);
            let right = b.pixel(0, y);
            for i in 0..band {
                let t = (i as f32 + 0.5) / band as f32;
                let idx = (y * width + start + i) * CHANNELS;
                for c in 0..CHANNELS {
                    let v = (1.0 - t) * left[c] as f32 + t * right[c] as f32;
                    out[idx + c] = v.round().clamp(0.0, 255.0) as u8;
                }
            }
        }
    }

    debug!(width, height, band = 2 * half, "side-by-side join");
    RasterImage::new(width, height, out, a.source_index())
}

#[cfg(test)]
mod tests {
    use super::*;
    use panomerge_core::synthetic::textured_scene;
    use proptest::prelude::*;

    #[test]
    fn test_band_ramps_between_edges() {
        let a = RasterImage::filled(40, 10, [0, 0, 0], 0);
        let b = RasterImage::filled(40, 10, [200, 200, 200], 1);
        let out = side_by_side(&a, &b, SeamLayout::Horizontal, 16).unwrap();
        assert_eq!(out.dimensions(), (80, 10));
        assert_eq!(out.pixel(31, 3), [0, 0, 0]);
        assert_eq!(out.pixel(48, 3), [200, 200, 200]);
        let ramp: Vec<u8> = (32..48).map(|x| out.pixel(x, 3)[0]).collect();
        assert!(ramp.windows(2).all(|w| w[0] < w[1]), "{:?}", ramp);
        assert_eq!(out.source_index(), 0);
    }

    #[test]
    fn test_band_shrinks_for_narrow_images() {
        assert_eq!(band_half_width(32, 800, 800), 16);
        assert_eq!(band_half_width(32, 20, 800), 5);
        assert_eq!(band_half_width(32, 3, 3), 0);
    }

    #[test]
    fn test_height_matched_to_first() {
        let a = RasterImage::filled(30, 40, [10, 10, 10], 0);
        let b = RasterImage::filled(50, 20, [90, 90, 90], 1);
        let out = side_by_side(&a, &b, SeamLayout::Horizontal, 8).unwrap();
        assert_eq!(out.dimensions(), (130, 40));
    }

    #[test]
    fn test_vertical_layout() {
        let a = RasterImage::filled(30, 20, [10, 20, 30], 0);
        let b = RasterImage::filled(30, 25, [40, 50, 60], 1);
        let out = side_by_side(&a, &b, SeamLayout::Vertical, 8).unwrap();
        assert_eq!(out.dimensions(), (30, 45));
        assert_eq!(out.pixel(7, 0), [10, 20, 30]);
        assert_eq!(out.pixel(7, 44), [40, 50, 60]);
    }

    proptest! {
        #[test]
        fn prop_outer_columns_survive_chained_joins(
            wa in 12usize..60,
            wb in 12usize..60,
            wc in 12usize..60,
            seam in 0usize..40,
            seed in 0u64..20,
        ) {
            let a = textured_scene(wa, 24, seed);
            let b = textured_scene(wb, 24, seed + 100);
            let c = textured_scene(wc, 24, seed + 200);
            let ab = side_by_side(&a, &b, SeamLayout::Horizontal, seam).unwrap();
            let abc = side_by_side(&ab, &c, SeamLayout::Horizontal, seam).unwrap();
            prop_assert_eq!(abc.width(), wa + wb + wc);
            prop_assert_eq!(abc.column(0), a.column(0));
            prop_assert_eq!(abc.column(abc.width() - 1), c.column(wc - 1));
        }
    }
}
