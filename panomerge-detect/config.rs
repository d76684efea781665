use crate::error::{DetectError, DetectResult};
use crate::preprocessing::PreprocessParams;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Complete detector configuration for both detector variants
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DetectorConfig {
    /// Strongest keypoints kept per image
    pub max_features: usize,

    /// FAST intensity threshold
    pub fast_threshold: u8,
    /// BRIEF and orientation patch diameter
    pub patch_size: usize,
    pub n_levels: usize,
    pub scale_factor: f32,
    /// Pixels skipped at every pyramid level edge
    pub border: usize,

    /// Gaussian layers per octave where extrema are searched
    pub octave_layers: usize,
    pub max_octaves: usize,
    /// Base blur of the first octave
    pub sigma: f32,
    /// DoG contrast floor, intensities in [0, 1]
    pub contrast_threshold: f32,
    /// Principal curvature ratio limit
    pub edge_threshold: f32,

    pub preprocess: PreprocessParams,

    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub name: Option<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_features: 1500,
            fast_threshold: 20,
            patch_size: 31,
            n_levels: 8,
            scale_factor: 1.2,
            border: 16,
            octave_layers: 3,
            max_octaves: 4,
            sigma: 1.6,
            contrast_threshold: 0.04,
            edge_threshold: 10.0,
            preprocess: PreprocessParams::default(),
            name: None,
        }
    }
}

impl DetectorConfig {
    /// Fast preset: fewer levels and octaves, higher thresholds
    pub fn fast_preset() -> Self {
        Self {
            max_features: 800,
            fast_threshold: 30,
            n_levels: 4,
            max_octaves: 3,
            contrast_threshold: 0.06,
            name: Some("Fast".to_string()),
            ..Self::default()
        }
    }

    /// Quality preset: more features and a lower contrast floor
    pub fn quality_preset() -> Self {
        Self {
            max_features: 3000,
            fast_threshold: 15,
            contrast_threshold: 0.03,
            name: Some("Quality".to_string()),
            ..Self::default()
        }
    }

    /// Illumination robust preset for challenging lighting
    pub fn illumination_robust_preset() -> Self {
        Self {
            fast_threshold: 12,
            contrast_threshold: 0.025,
            preprocess: PreprocessParams {
                night_threshold: 120.0,
                night_clip_limit: 5.0,
                normal_clip_limit: 3.0,
                ..PreprocessParams::default()
            },
            name: Some("Illumination Robust".to_string()),
            ..Self::default()
        }
    }

    pub fn to_builder(self) -> DetectorBuilder {
        DetectorBuilder { config: self }
    }

    /// Generate human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "DetectorConfig{}: max_features={}, fast_threshold={}, levels={}x{:.2}, octaves={}x{}, contrast={}",
            self.name.as_deref().map(|n| format!(" '{}'", n)).unwrap_or_default(),
            self.max_features,
            self.fast_threshold,
            self.n_levels,
            self.scale_factor,
            self.max_octaves,
            self.octave_layers,
            self.contrast_threshold
        )
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> DetectResult<()> {
        if self.fast_threshold == 0 || self.fast_threshold > 127 {
            return Err(DetectError::InvalidThreshold(self.fast_threshold));
        }
        if self.patch_size % 2 == 0 || self.patch_size < 7 {
            return Err(DetectError::InvalidPatchSize { patch_size: self.patch_size });
        }
        if self.max_features == 0 {
            return Err(DetectError::InvalidParameter("max_features must be positive".into()));
        }
        if self.n_levels == 0 || !(self.scale_factor > 1.0) {
            return Err(DetectError::InvalidParameter(format!(
                "pyramid needs at least one level and a scale factor above 1, got {} levels x {}",
                self.n_levels, self.scale_factor
            )));
        }
        if self.octave_layers == 0 || self.max_octaves == 0 {
            return Err(DetectError::InvalidParameter("scale space needs octaves and layers".into()));
        }
        if !(self.sigma > 0.5) || !(self.contrast_threshold > 0.0) || !(self.edge_threshold > 1.0) {
            return Err(DetectError::InvalidParameter(format!(
                "sigma {} must exceed 0.5, contrast {} must be positive, edge ratio {} must exceed 1",
                self.sigma, self.contrast_threshold, self.edge_threshold
            )));
        }
        self.preprocess.validate()
    }
}

/// Fluent API builder for detector configuration
#[derive(Debug, Clone, Default)]
pub struct DetectorBuilder {
    config: DetectorConfig,
}

impl DetectorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_features(mut self, max_features: usize) -> Self {
        self.config.max_features = max_features;
        self
    }

    pub fn fast_threshold(mut self, threshold: u8) -> Self {
        self.config.fast_threshold = threshold;
        self
    }

    pub fn pyramid(mut self, n_levels: usize, scale_factor: f32) -> Self {
        self.config.n_levels = n_levels;
        self.config.scale_factor = scale_factor;
        self
    }

    pub fn octaves(mut self, max_octaves: usize, octave_layers: usize) -> Self {
        self.config.max_octaves = max_octaves;
        self.config.octave_layers = octave_layers;
        self
    }

    pub fn contrast_threshold(mut self, threshold: f32) -> Self {
        self.config.contrast_threshold = threshold;
        self
    }

    pub fn preprocess(mut self, params: PreprocessParams) -> Self {
        self.config.preprocess = params;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.config.name = Some(name.to_string());
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> DetectResult<DetectorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for cfg in [
            DetectorConfig::default(),
            DetectorConfig::fast_preset(),
            DetectorConfig::quality_preset(),
            DetectorConfig::illumination_robust_preset(),
        ] {
            assert!(cfg.validate().is_ok(), "{}", cfg.summary());
        }
    }

    #[test]
    fn test_builder_validates() {
        let cfg = DetectorBuilder::new().max_features(200).fast_threshold(25).name("custom").build().unwrap();
        assert_eq!(cfg.max_features, 200);
        assert!(cfg.summary().contains("'custom'"));

        assert!(matches!(DetectorBuilder::new().fast_threshold(0).build(), Err(DetectError::InvalidThreshold(0))));
        assert!(matches!(
            DetectorBuilder::new().pyramid(4, 1.0).build(),
            Err(DetectError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_even_patch_rejected() {
        let cfg = DetectorConfig { patch_size: 30, ..DetectorConfig::default() };
        assert!(matches!(cfg.validate(), Err(DetectError::InvalidPatchSize { patch_size: 30 })));
    }
}
