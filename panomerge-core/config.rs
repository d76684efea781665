use std::fmt;
use std::str::FromStr;

use crate::DetectorKind;
use crate::error::{MergeError, MergeResult};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Compositing strategy requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum MergeMode {
    /// Geometric merge, image A wins every overlapping pixel
    #[default]
    FeatureMerge,
    /// Non-geometric concatenation with a soft seam
    SideBySide,
    /// Geometric merge, overlap mixed by `blend_alpha`
    #[cfg_attr(feature = "serde", serde(alias = "feature_aligned_blend"))]
    Blend,
}

impl MergeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeMode::FeatureMerge => "feature_merge",
            MergeMode::SideBySide => "side_by_side",
            MergeMode::Blend => "blend",
        }
    }

    pub fn is_geometric(self) -> bool {
        !matches!(self, MergeMode::SideBySide)
    }
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeMode {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "feature_merge" => Ok(MergeMode::FeatureMerge),
            "side_by_side" => Ok(MergeMode::SideBySide),
            "blend" | "feature_aligned_blend" => Ok(MergeMode::Blend),
            other => Err(MergeError::Configuration(format!("unknown mode '{}'", other))),
        }
    }
}

/// Axis along which side-by-side images are concatenated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SeamLayout {
    /// Left to right at matched height
    #[default]
    Horizontal,
    /// Top to bottom at matched width
    Vertical,
}

impl FromStr for SeamLayout {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "horizontal" => Ok(SeamLayout::Horizontal),
            "vertical" => Ok(SeamLayout::Vertical),
            other => Err(MergeError::Configuration(format!("unknown layout '{}'", other))),
        }
    }
}

/// Robust estimation parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RansacConfig {
    /// Reprojection error tolerance in pixels
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Probability of drawing at least one all-inlier sample, drives early exit
    pub confidence: f64,
    pub min_inlier_ratio: f64,
    pub min_inliers: usize,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            tolerance: 5.0,
            max_iterations: 2000,
            confidence: 0.995,
            min_inlier_ratio: 0.3,
            min_inliers: 8,
        }
    }
}

/// Hard ceilings enforced before and after decode.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ResourceLimits {
    /// Decoded images above this pixel count are refused outright
    pub max_source_pixels: usize,
    /// Encoded byte ceiling checked before decode
    pub max_encoded_bytes: usize,
    pub max_canvas_pixels: usize,
    /// Canvas may be at most this many times the summed input areas
    pub max_canvas_growth: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_source_pixels: 100_000_000,
            max_encoded_bytes: 16 * 1024 * 1024,
            max_canvas_pixels: 64_000_000,
            max_canvas_growth: 4.0,
        }
    }
}

/// Optional artifacts produced next to the composite.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DiagnosticOptions {
    pub match_visualization: bool,
    pub preprocessed_preview: bool,
    pub max_drawn_matches: usize,
}

impl Default for DiagnosticOptions {
    fn default() -> Self {
        Self { match_visualization: false, preprocessed_preview: false, max_drawn_matches: 50 }
    }
}

/// Immutable per-request merge settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MergeConfiguration {
    pub mode: MergeMode,
    /// Ratio-test cutoff in (0, 1); lower is stricter
    pub match_threshold: f32,
    /// Weight of image B inside the overlap in blend mode
    pub blend_alpha: f32,
    pub detector: DetectorKind,
    /// Longest side allowed after the resource guard
    pub max_dimension: usize,
    pub layout: SeamLayout,
    /// Width in pixels of the side-by-side transition band
    pub seam_width: usize,
    /// Request-scoped seed for robust estimation
    pub seed: u64,
    /// Strongest keypoints kept per image
    pub max_features: usize,
    pub ransac: RansacConfig,
    pub limits: ResourceLimits,
    pub diagnostics: DiagnosticOptions,
}

impl Default for MergeConfiguration {
    fn default() -> Self {
        Self {
            mode: MergeMode::FeatureMerge,
            match_threshold: 0.7,
            blend_alpha: 0.5,
            detector: DetectorKind::ScaleInvariant,
            max_dimension: 800,
            layout: SeamLayout::Horizontal,
            seam_width: 32,
            seed: 0,
            max_features: 1500,
            ransac: RansacConfig::default(),
            limits: ResourceLimits::default(),
            diagnostics: DiagnosticOptions::default(),
        }
    }
}

/// Ratio-threshold multiplier applied on the relaxed retry
pub const RELAXATION_FACTOR: f32 = 1.3;
/// Upper bound on any relaxed ratio threshold
pub const RELAXATION_CAP: f32 = 0.9;

impl MergeConfiguration {
    pub fn with_mode(mut self, mode: MergeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_match_threshold(mut self, threshold: f32) -> Self {
        self.match_threshold = threshold;
        self
    }

    pub fn with_blend_alpha(mut self, alpha: f32) -> Self {
        self.blend_alpha = alpha;
        self
    }

    pub fn with_detector(mut self, detector: DetectorKind) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_max_dimension(mut self, max_dimension: usize) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    pub fn with_layout(mut self, layout: SeamLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: DiagnosticOptions) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Rejects out-of-range values before any image work starts.
    pub fn validate(&self) -> MergeResult<()> {
        let t = self.match_threshold;
        if !(t.is_finite() && t > 0.0 && t < 1.0) {
            return Err(MergeError::Configuration(format!(
                "match_threshold {} must lie in (0, 1)",
                t
            )));
        }
        let a = self.blend_alpha;
        if !(a.is_finite() && (0.0..=1.0).contains(&a)) {
            return Err(MergeError::Configuration(format!("blend_alpha {} must lie in [0, 1]", a)));
        }
        if self.max_dimension < 16 {
            return Err(MergeError::Configuration(format!(
                "max_dimension {} is below the minimum of 16",
                self.max_dimension
            )));
        }
        if self.max_features == 0 {
            return Err(MergeError::Configuration("max_features must be positive".into()));
        }
        let r = &self.ransac;
        if !(r.tolerance.is_finite() && r.tolerance > 0.0) {
            return Err(MergeError::Configuration(format!("ransac tolerance {} must be positive", r.tolerance)));
        }
        if r.max_iterations == 0 {
            return Err(MergeError::Configuration("ransac max_iterations must be positive".into()));
        }
        if !(r.confidence > 0.0 && r.confidence < 1.0) {
            return Err(MergeError::Configuration(format!("ransac confidence {} must lie in (0, 1)", r.confidence)));
        }
        if !(0.0..=1.0).contains(&r.min_inlier_ratio) {
            return Err(MergeError::Configuration(format!(
                "ransac min_inlier_ratio {} must lie in [0, 1]",
                r.min_inlier_ratio
            )));
        }
        if r.min_inliers < 4 {
            return Err(MergeError::Configuration(format!("ransac min_inliers {} is below 4", r.min_inliers)));
        }
        if self.limits.max_canvas_growth < 1.0 {
            return Err(MergeError::Configuration("canvas growth factor must be at least 1".into()));
        }
        Ok(())
    }

    /// Looser ratio cutoff used when a geometric pair is retried.
    pub fn relaxed_threshold(&self) -> f32 {
        let t = self.match_threshold;
        (t * RELAXATION_FACTOR).min(RELAXATION_CAP).max(t)
    }

    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> MergeResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| MergeError::Configuration(e.to_string()))
    }

    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> MergeResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| MergeError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "serde")]
    pub fn to_toml(&self) -> MergeResult<String> {
        toml::to_string_pretty(self).map_err(|e| MergeError::Configuration(e.to_string()))
    }

    #[cfg(feature = "serde")]
    pub fn from_toml(toml_str: &str) -> MergeResult<Self> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| MergeError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` or `.toml` file, chosen by extension.
    #[cfg(feature = "serde")]
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> MergeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| MergeError::Configuration(format!("{}: {}", path.display(), e)))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            Some("toml") => Self::from_toml(&content),
            _ => Err(MergeError::Configuration(format!(
                "{}: expected a .json or .toml file",
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(MergeConfiguration::default().validate().is_ok());
    }

    #[test]
    fn test_threshold_range() {
        for bad in [0.0, 1.0, -0.2, f32::NAN] {
            let cfg = MergeConfiguration::default().with_match_threshold(bad);
            assert!(matches!(cfg.validate(), Err(MergeError::Configuration(_))), "{}", bad);
        }
        assert!(MergeConfiguration::default().with_match_threshold(0.99).validate().is_ok());
    }

    #[test]
    fn test_alpha_accepts_closed_interval() {
        assert!(MergeConfiguration::default().with_blend_alpha(0.0).validate().is_ok());
        assert!(MergeConfiguration::default().with_blend_alpha(1.0).validate().is_ok());
        assert!(MergeConfiguration::default().with_blend_alpha(1.01).validate().is_err());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("blend".parse::<MergeMode>().ok(), Some(MergeMode::Blend));
        assert_eq!("feature_aligned_blend".parse::<MergeMode>().ok(), Some(MergeMode::Blend));
        assert_eq!("SIDE_BY_SIDE".parse::<MergeMode>().ok(), Some(MergeMode::SideBySide));
        assert!(matches!("mosaic".parse::<MergeMode>(), Err(MergeError::Configuration(_))));
    }

    #[test]
    fn test_relaxed_threshold_policy() {
        let cfg = MergeConfiguration::default();
        assert!((cfg.relaxed_threshold() - 0.9).abs() < 1e-6);
        let cfg = cfg.with_match_threshold(0.5);
        assert!((cfg.relaxed_threshold() - 0.65).abs() < 1e-6);
        let cfg = cfg.with_match_threshold(0.95);
        assert!((cfg.relaxed_threshold() - 0.95).abs() < 1e-6);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_json_and_toml_round_trip() {
        let cfg = MergeConfiguration::default()
            .with_mode(MergeMode::Blend)
            .with_detector(DetectorKind::Binary)
            .with_seed(42);
        let json = cfg.to_json().unwrap();
        assert!(json.contains("\"blend\""));
        assert_eq!(MergeConfiguration::from_json(&json).unwrap(), cfg);
        let toml_str = cfg.to_toml().unwrap();
        assert_eq!(MergeConfiguration::from_toml(&toml_str).unwrap(), cfg);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_partial_json_uses_defaults_and_validates() {
        let cfg = MergeConfiguration::from_json(r#"{"mode": "feature_aligned_blend"}"#).unwrap();
        assert_eq!(cfg.mode, MergeMode::Blend);
        assert_eq!(cfg.max_dimension, 800);
        let bad = MergeConfiguration::from_json(r#"{"match_threshold": 1.5}"#);
        assert!(matches!(bad, Err(MergeError::Configuration(_))));
        let unknown = MergeConfiguration::from_json(r#"{"mode": "mosaic"}"#);
        assert!(matches!(unknown, Err(MergeError::Configuration(_))));
    }
}
