use panomerge_core::{DetectorKind, FeatureSet, Image, MergeResult, RasterImage};
use panomerge_describe::{describe, BriefGenerator, Detection};
use panomerge_detect::{
    BinaryDetector, DetectorConfig, ImagePreprocessing, PreprocessParams, ScaleSpaceDetector,
    AGGRESSIVE_CLIP_LIMIT, AGGRESSIVE_GRID_SIZE,
};
use tracing::{debug, info};

/// Below this many keypoints a second detection pass runs on an aggressively equalized image
pub const MIN_KEYPOINTS: usize = 20;

#[derive(Debug, Clone)]
enum Detector {
    ScaleSpace(ScaleSpaceDetector),
    Binary(BinaryDetector, BriefGenerator),
}

/// High-level feature extractor: preprocessing, detection and description in one step
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    detector: Detector,
    cfg: DetectorConfig,
}

impl FeatureExtractor {
    pub fn new(kind: DetectorKind, max_features: usize) -> MergeResult<Self> {
        let cfg = DetectorConfig { max_features, ..DetectorConfig::default() };
        Self::with_config(kind, cfg)
    }

    /// Extractor with explicit detector tuning, e.g. one of the [`DetectorConfig`] presets
    pub fn with_config(kind: DetectorKind, cfg: DetectorConfig) -> MergeResult<Self> {
        let detector = match kind {
            DetectorKind::ScaleInvariant => Detector::ScaleSpace(ScaleSpaceDetector::new(cfg.clone())?),
            DetectorKind::Binary => Detector::Binary(BinaryDetector::new(cfg.clone())?, BriefGenerator::new()),
        };
        Ok(Self { detector, cfg })
    }

    /// Extractor from an optional detector preset and optional tuned preprocessing.
    ///
    /// `max_features` always wins over the preset's own cap.
    pub fn tuned(
        kind: DetectorKind,
        max_features: usize,
        preset: Option<DetectorConfig>,
        preprocess: Option<PreprocessParams>,
    ) -> MergeResult<Self> {
        let mut builder = preset.unwrap_or_default().to_builder().max_features(max_features);
        if let Some(params) = preprocess {
            builder = builder.preprocess(params);
        }
        let cfg = builder.build()?;
        info!("{}", cfg.summary());
        Self::with_config(kind, cfg)
    }

    pub fn kind(&self) -> DetectorKind {
        match self.detector {
            Detector::ScaleSpace(_) => DetectorKind::ScaleInvariant,
            Detector::Binary(..) => DetectorKind::Binary,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.cfg
    }

    /// Illumination-normalized luminance, same dimensions as the input
    pub fn preprocess(&self, image: &RasterImage) -> MergeResult<Image> {
        let (w, h) = image.dimensions();
        Ok(ImagePreprocessing::enhance(&image.luminance(), w, h, &self.cfg.preprocess)?)
    }

    /// Keypoints and descriptors of one image.
    ///
    /// An empty set is a valid result; the matcher and estimator report the shortage.
    pub fn extract(&self, image: &RasterImage) -> MergeResult<FeatureSet> {
        let (w, h) = image.dimensions();
        let luma = image.luminance();
        let enhanced = ImagePreprocessing::enhance(&luma, w, h, &self.cfg.preprocess)?;
        let mut detection = self.detect(&enhanced, w, h)?;

        if detection.keypoint_count() < MIN_KEYPOINTS {
            let aggressive = ImagePreprocessing::apply_clahe(&luma, w, h, AGGRESSIVE_CLIP_LIMIT, AGGRESSIVE_GRID_SIZE)?;
            let retry = self.detect(&aggressive, w, h)?;
            debug!(
                index = image.source_index(),
                first = detection.keypoint_count(),
                retry = retry.keypoint_count(),
                "sparse detection, retried with aggressive equalization"
            );
            if retry.keypoint_count() > detection.keypoint_count() {
                detection = retry;
            }
        }

        let features = match (&self.detector, &detection) {
            (Detector::Binary(_, brief), Detection::Pyramid(d)) => brief.describe(d),
            _ => describe(&detection),
        };
        info!(
            index = image.source_index(),
            detector = %self.kind(),
            keypoints = features.len(),
            "extracted features"
        );
        Ok(features)
    }

    fn detect(&self, gray: &[u8], width: usize, height: usize) -> MergeResult<Detection> {
        Ok(match &self.detector {
            Detector::ScaleSpace(d) => Detection::ScaleSpace(d.detect(gray, width, height)?),
            Detector::Binary(d, _) => Detection::Pyramid(d.detect(gray, width, height)?),
        })
    }
}
