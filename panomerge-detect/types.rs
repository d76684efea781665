use panomerge_core::{FloatImage, Image, Keypoint};

/// Grayscale frame with its dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayFrame {
    pub data: Image,
    pub width: usize,
    pub height: usize,
}

impl GrayFrame {
    pub fn new(data: Image, width: usize, height: usize) -> Self {
        Self { data, width, height }
    }

    pub fn short_side(&self) -> usize {
        self.width.min(self.height)
    }
}

/// Keypoint with corner response score for NMS
#[derive(Debug, Clone, Copy)]
pub struct ScoredKeypoint {
    pub x: usize,
    pub y: usize,
    pub response: f32,
}

/// Scale information for pyramid levels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleLevel {
    pub level: usize,
    pub scale: f32,
    pub width: usize,
    pub height: usize,
}

/// Keypoint in base-image coordinates plus where it sits in the scale space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelKeypoint {
    pub keypoint: Keypoint,
    /// Pyramid level or octave index
    pub level: usize,
    /// Gaussian layer inside the octave; always 0 for pyramid levels
    pub layer: usize,
    pub level_x: f32,
    pub level_y: f32,
    /// Blur scale in level pixels
    pub sigma: f32,
}

/// Output of the binary detector: keypoints plus the pyramid they were found on.
#[derive(Debug, Clone)]
pub struct PyramidDetection {
    pub levels: Vec<ScaleLevel>,
    pub images: Vec<Image>,
    pub keypoints: Vec<LevelKeypoint>,
}

/// One octave of the Gaussian scale space.
#[derive(Debug, Clone)]
pub struct Octave {
    pub width: usize,
    pub height: usize,
    /// Blurred images, one per layer, intensities in [0, 1]
    pub gaussians: Vec<FloatImage>,
    /// Absolute blur of each layer in octave pixels
    pub sigmas: Vec<f32>,
}

/// Output of the scale-invariant detector.
#[derive(Debug, Clone)]
pub struct ScaleSpaceDetection {
    pub octaves: Vec<Octave>,
    pub keypoints: Vec<LevelKeypoint>,
}

/// Corner type classification for optimized processing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CornerType {
    Bright,
    Dark,
    None,
}
