//! Multi-image merge: guard, extract ahead of the fold, then fold pairwise with a
//! fallback chain of requested mode, relaxed blend and side-by-side.

use panomerge_core::{
    CancelToken, Correspondence, DetectorKind, FeatureSet, MergeConfiguration, MergeError, MergeMode, MergeResult,
    RansacConfig, RasterImage, Stage,
};
use panomerge_describe::match_features;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::compositor::composite;
use crate::diagnostics::{draw_matches, preprocessed_preview, Diagnostics};
use crate::extractor::FeatureExtractor;
use crate::guard::{guard, GuardedImage};
use crate::homography::{fit_ransac, HomographyModel, Point, MIN_CORRESPONDENCES};
use crate::side_by_side::side_by_side;

/// How one pair ended up in the composite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairOutcome {
    /// Geometric merge with the requested mode and threshold
    Clean,
    /// Geometric merge after retrying as a blend with a relaxed threshold
    Relaxed,
    /// Geometric pipeline failed; joined side by side
    SideBySide,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairStatus {
    /// Position of the folded-in image in the request
    pub image_index: usize,
    pub outcome: PairOutcome,
    pub mode_used: MergeMode,
    /// Ratio threshold of the last geometric attempt
    pub match_threshold: f32,
    pub correspondences: usize,
    pub inlier_count: usize,
    pub inlier_ratio: f64,
    /// Why earlier attempts failed, in order
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStatus {
    Clean,
    Degraded { reasons: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeMetadata {
    pub mode_used: MergeMode,
    /// `None` when no features were extracted
    pub detector_used: Option<DetectorKind>,
    /// Sum over geometrically merged pairs
    pub inlier_count: usize,
    /// Mean over geometrically merged pairs
    pub inlier_ratio: f64,
    /// At least one pair fell back to side-by-side
    pub degraded: bool,
    pub per_pair_status: Vec<PairStatus>,
    pub canvas_width: usize,
    pub canvas_height: usize,
    /// Request positions of inputs shrunk by the resource guard
    pub downscaled: Vec<usize>,
}

impl MergeMetadata {
    pub fn status(&self) -> MergeStatus {
        if !self.degraded {
            return MergeStatus::Clean;
        }
        let reasons = self
            .per_pair_status
            .iter()
            .filter(|p| p.outcome == PairOutcome::SideBySide)
            .flat_map(|p| p.reasons.iter().map(move |r| format!("image {}: {}", p.image_index, r)))
            .collect();
        MergeStatus::Degraded { reasons }
    }

    pub fn fallback_count(&self) -> usize {
        self.per_pair_status.iter().filter(|p| p.outcome == PairOutcome::SideBySide).count()
    }
}

#[derive(Debug, Clone)]
pub struct MergeOutput {
    pub image: RasterImage,
    pub metadata: MergeMetadata,
    pub diagnostics: Diagnostics,
}

/// Correspondence supplied by the caller: the same scene point in image A and image B
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointPair {
    pub a: Point,
    pub b: Point,
}

/// Result of one geometric attempt on a pair
struct Attempt {
    matches: Vec<Correspondence>,
    result: MergeResult<(HomographyModel, RasterImage)>,
}

struct PairStep {
    image: RasterImage,
    status: PairStatus,
    matches: Vec<Correspondence>,
    inlier_mask: Option<Vec<bool>>,
}

/// Seed of one estimation attempt, mixed from the request seed, pair and attempt number
pub fn pair_seed(seed: u64, pair: usize, attempt: usize) -> u64 {
    let mut z = seed
        ^ (pair as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (attempt as u64).wrapping_mul(0xD1B5_4A32_D192_ED03);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Request-scoped merge pipeline. Holds only read-only configuration.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    config: MergeConfiguration,
    extractor: FeatureExtractor,
}

impl MergeEngine {
    /// Validates the configuration before any image work
    pub fn new(config: MergeConfiguration) -> MergeResult<Self> {
        config.validate()?;
        let extractor = FeatureExtractor::new(config.detector, config.max_features)?;
        Ok(Self { config, extractor })
    }

    /// Engine with a custom extractor, e.g. built from a detector preset
    pub fn with_extractor(config: MergeConfiguration, extractor: FeatureExtractor) -> MergeResult<Self> {
        config.validate()?;
        if extractor.kind() != config.detector {
            return Err(MergeError::Configuration(format!(
                "extractor is {} but configuration asks for {}",
                extractor.kind(),
                config.detector
            )));
        }
        Ok(Self { config, extractor })
    }

    pub fn config(&self) -> &MergeConfiguration {
        &self.config
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    fn guard_all(&self, images: Vec<RasterImage>, cancel: &CancelToken) -> MergeResult<Vec<GuardedImage>> {
        cancel.check(Stage::Guard)?;
        images
            .into_iter()
            .enumerate()
            .map(|(i, img)| guard(img.with_source_index(i), self.config.max_dimension, &self.config.limits))
            .collect()
    }

    /// Merge two or more images, anchored on the first.
    ///
    /// Recoverable per-pair failures never fail the request: they are absorbed by the
    /// fallback chain and reported in [`MergeMetadata::per_pair_status`].
    pub fn merge(&self, images: Vec<RasterImage>, cancel: &CancelToken) -> MergeResult<MergeOutput> {
        if images.len() < 2 {
            return Err(MergeError::TooFewImages(images.len()));
        }
        let guarded = self.guard_all(images, cancel)?;
        let downscaled: Vec<usize> = guarded.iter().enumerate().filter(|(_, g)| g.downscaled()).map(|(i, _)| i).collect();
        let images: Vec<RasterImage> = guarded.into_iter().map(|g| g.image).collect();

        let mut diagnostics = Diagnostics::default();
        if self.config.diagnostics.preprocessed_preview {
            cancel.check(Stage::Preprocess)?;
            diagnostics.preview = Some(preprocessed_preview(&self.extractor, &images[0])?);
        }

        info!(images = images.len(), mode = %self.config.mode, detector = %self.config.detector, "merge started");

        let (image, statuses) = if self.config.mode.is_geometric() {
            self.fold_geometric(&images, cancel, &mut diagnostics)?
        } else {
            self.fold_side_by_side(&images, cancel)?
        };

        let metadata = self.summarize(&image, statuses, downscaled);
        match metadata.status() {
            MergeStatus::Clean => info!(width = metadata.canvas_width, height = metadata.canvas_height, "merge finished"),
            MergeStatus::Degraded { ref reasons } => warn!(
                width = metadata.canvas_width,
                height = metadata.canvas_height,
                fallbacks = reasons.len(),
                "merge finished degraded"
            ),
        }
        Ok(MergeOutput { image, metadata, diagnostics })
    }

    fn fold_side_by_side(&self, images: &[RasterImage], cancel: &CancelToken) -> MergeResult<(RasterImage, Vec<PairStatus>)> {
        let mut acc = images[0].clone();
        let mut statuses = Vec::with_capacity(images.len() - 1);
        for (index, image) in images.iter().enumerate().skip(1) {
            cancel.check(Stage::Compositing)?;
            acc = side_by_side(&acc, image, self.config.layout, self.config.seam_width)?;
            statuses.push(PairStatus {
                image_index: index,
                outcome: PairOutcome::Clean,
                mode_used: MergeMode::SideBySide,
                match_threshold: self.config.match_threshold,
                correspondences: 0,
                inlier_count: 0,
                inlier_ratio: 0.0,
                reasons: Vec::new(),
            });
        }
        Ok((acc, statuses))
    }

    fn fold_geometric(
        &self,
        images: &[RasterImage],
        cancel: &CancelToken,
        diagnostics: &mut Diagnostics,
    ) -> MergeResult<(RasterImage, Vec<PairStatus>)> {
        // Extraction does not depend on alignment, so every input is described up front
        cancel.check(Stage::Extraction)?;
        let features: Vec<FeatureSet> =
            images.par_iter().map(|img| self.extractor.extract(img)).collect::<MergeResult<_>>()?;
        let mut features = features.into_iter();

        let mut acc = images[0].clone();
        let mut acc_features = features.next();
        let mut statuses = Vec::with_capacity(images.len() - 1);

        for ((index, image), image_features) in images.iter().enumerate().skip(1).zip(features) {
            let a_features = match acc_features.take() {
                Some(f) => f,
                None => {
                    cancel.check(Stage::Extraction)?;
                    self.extractor.extract(&acc)?
                }
            };

            let step = self.merge_pair(&acc, &a_features, image, &image_features, index, cancel)?;

            if index == 1 && self.config.diagnostics.match_visualization {
                diagnostics.matches = Some(draw_matches(
                    &images[0],
                    image,
                    &a_features.keypoints,
                    &image_features.keypoints,
                    &step.matches,
                    step.inlier_mask.as_deref(),
                    self.config.diagnostics.max_drawn_matches,
                )?);
            }

            acc = step.image;
            statuses.push(step.status);
        }
        Ok((acc, statuses))
    }

    /// One fold step: requested mode, then relaxed blend, then side-by-side
    fn merge_pair(
        &self,
        a: &RasterImage,
        fa: &FeatureSet,
        b: &RasterImage,
        fb: &FeatureSet,
        index: usize,
        cancel: &CancelToken,
    ) -> MergeResult<PairStep> {
        let cfg = &self.config;
        let attempts = [
            (cfg.mode, cfg.match_threshold, PairOutcome::Clean),
            (MergeMode::Blend, cfg.relaxed_threshold(), PairOutcome::Relaxed),
        ];

        let mut reasons = Vec::new();
        let mut last_matches = Vec::new();
        let mut last_threshold = cfg.match_threshold;

        for (attempt_no, &(mode, threshold, outcome)) in attempts.iter().enumerate() {
            let seed = pair_seed(cfg.seed, index, attempt_no);
            let attempt = self.attempt(a, fa, b, fb, mode, threshold, seed, cancel)?;
            last_threshold = threshold;
            match attempt.result {
                Ok((model, image)) => {
                    info!(
                        image = index,
                        %mode,
                        threshold,
                        matches = attempt.matches.len(),
                        inliers = model.inlier_count,
                        "pair merged"
                    );
                    return Ok(PairStep {
                        image,
                        status: PairStatus {
                            image_index: index,
                            outcome,
                            mode_used: mode,
                            match_threshold: threshold,
                            correspondences: attempt.matches.len(),
                            inlier_count: model.inlier_count,
                            inlier_ratio: model.inlier_ratio,
                            reasons,
                        },
                        matches: attempt.matches,
                        inlier_mask: Some(model.inlier_mask),
                    });
                }
                Err(e) if e.is_recoverable() => {
                    warn!(image = index, %mode, threshold, error = %e, "geometric attempt failed");
                    reasons.push(format!("{} at threshold {:.2}: {}", mode, threshold, e));
                    last_matches = attempt.matches;
                }
                Err(e) => return Err(e),
            }
        }

        cancel.check(Stage::Compositing)?;
        let image = side_by_side(a, b, cfg.layout, cfg.seam_width)?;
        warn!(image = index, "falling back to side-by-side");
        Ok(PairStep {
            image,
            status: PairStatus {
                image_index: index,
                outcome: PairOutcome::SideBySide,
                mode_used: MergeMode::SideBySide,
                match_threshold: last_threshold,
                correspondences: last_matches.len(),
                inlier_count: 0,
                inlier_ratio: 0.0,
                reasons,
            },
            matches: last_matches,
            inlier_mask: None,
        })
    }

    /// Match, estimate and composite. Only fatal errors leave through the outer result.
    #[allow(clippy::too_many_arguments)]
    fn attempt(
        &self,
        a: &RasterImage,
        fa: &FeatureSet,
        b: &RasterImage,
        fb: &FeatureSet,
        mode: MergeMode,
        threshold: f32,
        seed: u64,
        cancel: &CancelToken,
    ) -> MergeResult<Attempt> {
        cancel.check(Stage::Matching)?;
        let matches = match_features(fa, fb, threshold)?;
        if matches.len() < MIN_CORRESPONDENCES {
            let found = matches.len();
            return Ok(Attempt {
                matches,
                result: Err(MergeError::InsufficientFeatures { found, needed: MIN_CORRESPONDENCES }),
            });
        }

        cancel.check(Stage::Estimation)?;
        // B keypoints are the source plane, A keypoints the destination
        let src: Vec<Point> = matches.iter().map(|m| keypoint_point(fb, m.train_idx)).collect();
        let dst: Vec<Point> = matches.iter().map(|m| keypoint_point(fa, m.query_idx)).collect();
        let model = match fit_ransac(&src, &dst, &self.config.ransac, seed) {
            Ok(model) => model,
            Err(e) => return Ok(Attempt { matches, result: Err(e) }),
        };

        cancel.check(Stage::Compositing)?;
        let result = composite(a, b, &model.matrix, mode, self.config.blend_alpha, &self.config.limits)
            .map(|image| (model, image));
        Ok(Attempt { matches, result })
    }

    /// Merge two images from caller-supplied correspondences, without fallback.
    pub fn merge_with_points(
        &self,
        a: RasterImage,
        b: RasterImage,
        points: &[PointPair],
        cancel: &CancelToken,
    ) -> MergeResult<MergeOutput> {
        let mode = self.config.mode;
        if !mode.is_geometric() {
            return Err(MergeError::Configuration(format!("manual correspondences need a geometric mode, got {}", mode)));
        }
        if points.len() < MIN_CORRESPONDENCES {
            return Err(MergeError::InsufficientFeatures { found: points.len(), needed: MIN_CORRESPONDENCES });
        }

        let mut guarded = self.guard_all(vec![a, b], cancel)?;
        let downscaled: Vec<usize> = guarded.iter().enumerate().filter(|(_, g)| g.downscaled()).map(|(i, _)| i).collect();
        let (gb, ga) = match (guarded.pop(), guarded.pop()) {
            (Some(gb), Some(ga)) => (gb, ga),
            _ => return Err(MergeError::TooFewImages(guarded.len())),
        };

        cancel.check(Stage::Estimation)?;
        let src: Vec<Point> = points.iter().map(|p| [p.b[0] * gb.scale, p.b[1] * gb.scale]).collect();
        let dst: Vec<Point> = points.iter().map(|p| [p.a[0] * ga.scale, p.a[1] * ga.scale]).collect();
        let ransac = RansacConfig { min_inliers: MIN_CORRESPONDENCES, ..self.config.ransac.clone() };
        let model = fit_ransac(&src, &dst, &ransac, pair_seed(self.config.seed, 1, 0))?;

        cancel.check(Stage::Compositing)?;
        let image = composite(&ga.image, &gb.image, &model.matrix, mode, self.config.blend_alpha, &self.config.limits)?;
        info!(points = points.len(), inliers = model.inlier_count, "merged from manual correspondences");

        let status = PairStatus {
            image_index: 1,
            outcome: PairOutcome::Clean,
            mode_used: mode,
            match_threshold: self.config.match_threshold,
            correspondences: points.len(),
            inlier_count: model.inlier_count,
            inlier_ratio: model.inlier_ratio,
            reasons: Vec::new(),
        };
        let mut metadata = self.summarize(&image, vec![status], downscaled);
        metadata.detector_used = None;
        Ok(MergeOutput { image, metadata, diagnostics: Diagnostics::default() })
    }

    /// Correspondences of two images drawn side by side, inliers green when a model fits
    pub fn visualize_matches(&self, a: RasterImage, b: RasterImage, cancel: &CancelToken) -> MergeResult<RasterImage> {
        let guarded = self.guard_all(vec![a, b], cancel)?;
        let (a, b) = (&guarded[0].image, &guarded[1].image);

        cancel.check(Stage::Extraction)?;
        let (fa, fb) = rayon::join(|| self.extractor.extract(a), || self.extractor.extract(b));
        let (fa, fb) = (fa?, fb?);

        let mode = if self.config.mode.is_geometric() { self.config.mode } else { MergeMode::FeatureMerge };
        let seed = pair_seed(self.config.seed, 1, 0);
        let attempt = self.attempt(a, &fa, b, &fb, mode, self.config.match_threshold, seed, cancel)?;
        let mask = attempt.result.ok().map(|(model, _)| model.inlier_mask);
        draw_matches(
            a,
            b,
            &fa.keypoints,
            &fb.keypoints,
            &attempt.matches,
            mask.as_deref(),
            self.config.diagnostics.max_drawn_matches,
        )
    }

    /// Guarded image next to its preprocessed luminance
    pub fn preview(&self, image: RasterImage, cancel: &CancelToken) -> MergeResult<RasterImage> {
        let guarded = guard(image.with_source_index(0), self.config.max_dimension, &self.config.limits)?;
        cancel.check(Stage::Preprocess)?;
        preprocessed_preview(&self.extractor, &guarded.image)
    }

    fn summarize(&self, image: &RasterImage, per_pair_status: Vec<PairStatus>, downscaled: Vec<usize>) -> MergeMetadata {
        let geometric: Vec<&PairStatus> =
            per_pair_status.iter().filter(|p| p.outcome != PairOutcome::SideBySide && p.mode_used.is_geometric()).collect();
        let inlier_count = geometric.iter().map(|p| p.inlier_count).sum();
        let inlier_ratio = if geometric.is_empty() {
            0.0
        } else {
            geometric.iter().map(|p| p.inlier_ratio).sum::<f64>() / geometric.len() as f64
        };

        let degraded = per_pair_status.iter().any(|p| p.outcome == PairOutcome::SideBySide);
        let mode_used = if degraded {
            MergeMode::SideBySide
        } else if per_pair_status.iter().any(|p| p.outcome == PairOutcome::Relaxed) {
            MergeMode::Blend
        } else {
            self.config.mode
        };

        MergeMetadata {
            mode_used,
            detector_used: self.config.mode.is_geometric().then_some(self.config.detector),
            inlier_count,
            inlier_ratio,
            degraded,
            per_pair_status,
            canvas_width: image.width(),
            canvas_height: image.height(),
            downscaled,
        }
    }
}

fn keypoint_point(features: &FeatureSet, idx: usize) -> Point {
    let kp = &features.keypoints[idx];
    [kp.x as f64, kp.y as f64]
}

/// Merge with a fresh engine and no cancellation.
pub fn merge(images: Vec<RasterImage>, config: &MergeConfiguration) -> MergeResult<MergeOutput> {
    MergeEngine::new(config.clone())?.merge(images, &CancelToken::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use panomerge_core::synthetic::textured_scene;

    fn status(outcome: PairOutcome, inliers: usize, ratio: f64) -> PairStatus {
        PairStatus {
            image_index: 1,
            outcome,
            mode_used: if outcome == PairOutcome::SideBySide { MergeMode::SideBySide } else { MergeMode::FeatureMerge },
            match_threshold: 0.7,
            correspondences: 10,
            inlier_count: inliers,
            inlier_ratio: ratio,
            reasons: vec!["reason".into()],
        }
    }

    #[test]
    fn test_pair_seed_differs_per_pair_and_attempt() {
        let seeds = [pair_seed(7, 1, 0), pair_seed(7, 1, 1), pair_seed(7, 2, 0), pair_seed(8, 1, 0)];
        for i in 0..seeds.len() {
            for j in i + 1..seeds.len() {
                assert_ne!(seeds[i], seeds[j]);
            }
        }
        assert_eq!(pair_seed(7, 1, 0), pair_seed(7, 1, 0));
    }

    #[test]
    fn test_summary_flags_fallbacks() {
        let engine = MergeEngine::new(MergeConfiguration::default()).unwrap();
        let img = RasterImage::filled(10, 10, [0, 0, 0], 0);
        let meta = engine.summarize(
            &img,
            vec![status(PairOutcome::Clean, 30, 0.8), status(PairOutcome::SideBySide, 0, 0.0), status(PairOutcome::Relaxed, 10, 0.4)],
            vec![2],
        );
        assert!(meta.degraded);
        assert_eq!(meta.fallback_count(), 1);
        assert_eq!(meta.inlier_count, 40);
        assert!((meta.inlier_ratio - 0.6).abs() < 1e-9);
        assert_eq!(meta.mode_used, MergeMode::SideBySide);
        assert_eq!(meta.status(), MergeStatus::Degraded { reasons: vec!["image 1: reason".into()] });
    }

    #[test]
    fn test_too_few_images() {
        let engine = MergeEngine::new(MergeConfiguration::default()).unwrap();
        let result = engine.merge(vec![textured_scene(50, 50, 1)], &CancelToken::new());
        assert_eq!(result.unwrap_err(), MergeError::TooFewImages(1));
    }

    #[test]
    fn test_invalid_configuration_rejected_up_front() {
        let cfg = MergeConfiguration::default().with_match_threshold(1.2);
        assert!(matches!(MergeEngine::new(cfg), Err(MergeError::Configuration(_))));
    }

    #[test]
    fn test_cancelled_token_aborts() {
        let engine = MergeEngine::new(MergeConfiguration::default()).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let images = vec![textured_scene(60, 60, 1), textured_scene(60, 60, 2)];
        assert_eq!(engine.merge(images, &cancel).unwrap_err(), MergeError::Cancelled { stage: Stage::Guard });
    }

    #[test]
    fn test_side_by_side_mode_never_extracts() {
        let cfg = MergeConfiguration::default().with_mode(MergeMode::SideBySide);
        let images = vec![textured_scene(60, 40, 1), textured_scene(50, 40, 2), textured_scene(40, 40, 3)];
        let out = merge(images, &cfg).unwrap();
        assert_eq!(out.image.dimensions(), (150, 40));
        assert!(!out.metadata.degraded);
        assert_eq!(out.metadata.detector_used, None);
        assert_eq!(out.metadata.per_pair_status.len(), 2);
        assert!(out.metadata.per_pair_status.iter().all(|p| p.outcome == PairOutcome::Clean));
    }

    #[test]
    fn test_manual_points_translate() {
        let scene = textured_scene(300, 120, 4);
        let a = scene.crop(0, 0, 200, 120);
        let b = scene.crop(100, 0, 200, 120);
        let points: Vec<PointPair> = [[120.0, 10.0], [190.0, 20.0], [150.0, 100.0], [110.0, 70.0], [165.0, 55.0]]
            .iter()
            .map(|&p| PointPair { a: p, b: [p[0] - 100.0, p[1]] })
            .collect();
        let engine = MergeEngine::new(MergeConfiguration::default()).unwrap();
        let out = engine.merge_with_points(a.clone(), b, &points, &CancelToken::new()).unwrap();
        assert_eq!(out.image.dimensions(), (300, 120));
        assert_eq!(out.image.column(0), a.column(0));
        assert_eq!(out.metadata.per_pair_status[0].inlier_count, 5);

        let too_few = engine.merge_with_points(scene.clone(), scene, &points[..3], &CancelToken::new());
        assert_eq!(too_few.unwrap_err(), MergeError::InsufficientFeatures { found: 3, needed: 4 });
    }
}
