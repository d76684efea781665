use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_circle_mut, draw_line_segment_mut};
use panomerge_core::{Correspondence, Keypoint, MergeResult, RasterImage, CHANNELS};

use crate::extractor::FeatureExtractor;
use crate::io::{from_rgb_image, to_rgb_image};

const INLIER: Rgb<u8> = Rgb([0, 255, 0]);
const OUTLIER: Rgb<u8> = Rgb([255, 0, 0]);
const KEYPOINT_RADIUS: i32 = 4;

/// Optional artifacts produced next to a merge
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    /// Correspondences of the first pair drawn across both source images
    pub matches: Option<RasterImage>,
    /// Anchor image next to its preprocessed luminance
    pub preview: Option<RasterImage>,
}

/// Place two images next to each other on a black canvas, tops aligned
pub fn concat_horizontal(a: &RasterImage, b: &RasterImage) -> MergeResult<RasterImage> {
    let (wa, wb) = (a.width(), b.width());
    let width = wa + wb;
    let height = a.height().max(b.height());
    let mut out = RasterImage::filled(width, height, [0, 0, 0], a.source_index());
    let data = out.data_mut();
    for (img, x0) in [(a, 0), (b, wa)] {
        let w = img.width();
        for y in 0..img.height() {
            let dst = (y * width + x0) * CHANNELS;
            data[dst..dst + w * CHANNELS].copy_from_slice(&img.data()[y * w * CHANNELS..(y + 1) * w * CHANNELS]);
        }
    }
    Ok(out)
}

/// Draw the strongest correspondences as lines between the two images.
///
/// At most `max_drawn` matches, smallest distance first. Inliers are green, everything
/// else red; without a mask every match counts as an outlier.
pub fn draw_matches(
    a: &RasterImage,
    b: &RasterImage,
    keypoints_a: &[Keypoint],
    keypoints_b: &[Keypoint],
    matches: &[Correspondence],
    inlier_mask: Option<&[bool]>,
    max_drawn: usize,
) -> MergeResult<RasterImage> {
    let mut canvas: RgbImage = to_rgb_image(&concat_horizontal(a, b)?)?;
    let offset = a.width() as f32;

    let mut order: Vec<usize> = (0..matches.len()).collect();
    order.sort_by(|&i, &j| matches[i].distance.total_cmp(&matches[j].distance));

    for &i in order.iter().take(max_drawn) {
        let m = &matches[i];
        let (Some(ka), Some(kb)) = (keypoints_a.get(m.query_idx), keypoints_b.get(m.train_idx)) else {
            continue;
        };
        let inlier = inlier_mask.and_then(|mask| mask.get(i).copied()).unwrap_or(false);
        let color = if inlier { INLIER } else { OUTLIER };
        let pa = (ka.x, ka.y);
        let pb = (kb.x + offset, kb.y);
        draw_line_segment_mut(&mut canvas, pa, pb, color);
        draw_hollow_circle_mut(&mut canvas, (pa.0 as i32, pa.1 as i32), KEYPOINT_RADIUS, color);
        draw_hollow_circle_mut(&mut canvas, (pb.0 as i32, pb.1 as i32), KEYPOINT_RADIUS, color);
    }

    from_rgb_image(canvas, a.source_index())
}

/// Original on the left, preprocessed luminance on the right
pub fn preprocessed_preview(extractor: &FeatureExtractor, image: &RasterImage) -> MergeResult<RasterImage> {
    let (w, h) = image.dimensions();
    let processed = RasterImage::from_gray(&extractor.preprocess(image)?, w, h, image.source_index())?;
    concat_horizontal(image, &processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use panomerge_core::DetectorKind;

    #[test]
    fn test_concat_pads_shorter_image() {
        let a = RasterImage::filled(3, 2, [1, 1, 1], 0);
        let b = RasterImage::filled(2, 4, [9, 9, 9], 1);
        let out = concat_horizontal(&a, &b).unwrap();
        assert_eq!(out.dimensions(), (5, 4));
        assert_eq!(out.pixel(0, 3), [0, 0, 0]);
        assert_eq!(out.pixel(4, 3), [9, 9, 9]);
    }

    #[test]
    fn test_matches_are_colored_by_mask() {
        let a = RasterImage::filled(50, 50, [0, 0, 0], 0);
        let b = RasterImage::filled(50, 50, [0, 0, 0], 1);
        let kps = vec![Keypoint::at(10.0, 10.0), Keypoint::at(10.0, 40.0)];
        let matches = vec![
            Correspondence { query_idx: 0, train_idx: 0, distance: 1.0 },
            Correspondence { query_idx: 1, train_idx: 1, distance: 2.0 },
        ];
        let out = draw_matches(&a, &b, &kps, &kps, &matches, Some(&[true, false][..]), 50).unwrap();
        assert_eq!(out.dimensions(), (100, 50));
        assert_eq!(out.pixel(30, 10), [0, 255, 0]);
        assert_eq!(out.pixel(30, 40), [255, 0, 0]);

        let limited = draw_matches(&a, &b, &kps, &kps, &matches, None, 1).unwrap();
        assert_eq!(limited.pixel(30, 10), [255, 0, 0]);
        assert_eq!(limited.pixel(30, 40), [0, 0, 0]);
    }

    #[test]
    fn test_preview_is_twice_as_wide() {
        let img = panomerge_core::synthetic::textured_scene(60, 40, 8);
        let extractor = FeatureExtractor::new(DetectorKind::Binary, 200).unwrap();
        let preview = preprocessed_preview(&extractor, &img).unwrap();
        assert_eq!(preview.dimensions(), (120, 40));
        assert_eq!(preview.column(0), img.column(0));
        let right = preview.pixel(90, 20);
        assert_eq!(right[0], right[1]);
    }
}
