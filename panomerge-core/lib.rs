pub mod cancel;
pub mod config;
pub mod error;
pub mod synthetic;

use std::fmt;
use std::str::FromStr;

pub use cancel::{CancelToken, Stage};
pub use config::{
    DiagnosticOptions, MergeConfiguration, MergeMode, RansacConfig, ResourceLimits, SeamLayout,
};
pub use error::{MergeError, MergeResult};

/// Row-major 8-bit grayscale image
pub type Image = Vec<u8>;

/// Row-major single-channel float image
pub type FloatImage = Vec<f32>;

/// Channels per pixel in every [`RasterImage`]
pub const CHANNELS: usize = 3;

/// Dense interleaved RGB raster with an immutable source identity.
///
/// `source_index` is the position of the image in the request that produced it;
/// composites keep the index of their anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    width: usize,
    height: usize,
    data: Vec<u8>,
    source_index: usize,
}

impl RasterImage {
    pub fn new(width: usize, height: usize, data: Vec<u8>, source_index: usize) -> MergeResult<Self> {
        if width == 0 || height == 0 {
            return Err(MergeError::InvalidImage {
                index: source_index,
                reason: format!("dimensions {}x{} must be non-zero", width, height),
            });
        }
        let expected = width * height * CHANNELS;
        if data.len() != expected {
            return Err(MergeError::InvalidImage {
                index: source_index,
                reason: format!("buffer holds {} bytes, expected {}", data.len(), expected),
            });
        }
        Ok(Self { width, height, data, source_index })
    }

    /// Image of uniform color. Zero dimensions are bumped to 1.
    pub fn filled(width: usize, height: usize, rgb: [u8; 3], source_index: usize) -> Self {
        let (width, height) = (width.max(1), height.max(1));
        let data = rgb.iter().copied().cycle().take(width * height * CHANNELS).collect();
        Self { width, height, data, source_index }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn area(&self) -> usize {
        self.width * self.height
    }

    pub fn source_index(&self) -> usize {
        self.source_index
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn with_source_index(mut self, source_index: usize) -> Self {
        self.source_index = source_index;
        self
    }

    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width + x) * CHANNELS;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    #[inline]
    pub fn set_pixel(&mut self, x: usize, y: usize, rgb: [u8; 3]) {
        let i = (y * self.width + x) * CHANNELS;
        self.data[i..i + CHANNELS].copy_from_slice(&rgb);
    }

    /// One pixel-column as RGB triples, top to bottom.
    pub fn column(&self, x: usize) -> Vec<[u8; 3]> {
        (0..self.height).map(|y| self.pixel(x, y)).collect()
    }

    /// Integer BT.601 luma: (77R + 150G + 29B + 128) >> 8.
    pub fn luminance(&self) -> Image {
        self.data
            .chunks_exact(CHANNELS)
            .map(|p| ((77 * p[0] as u32 + 150 * p[1] as u32 + 29 * p[2] as u32 + 128) >> 8) as u8)
            .collect()
    }

    /// Copy a sub-rectangle. The rectangle is clipped to the image bounds.
    pub fn crop(&self, x0: usize, y0: usize, width: usize, height: usize) -> Self {
        let x0 = x0.min(self.width - 1);
        let y0 = y0.min(self.height - 1);
        let width = width.min(self.width - x0).max(1);
        let height = height.min(self.height - y0).max(1);
        let mut data = Vec::with_capacity(width * height * CHANNELS);
        for y in y0..y0 + height {
            let start = (y * self.width + x0) * CHANNELS;
            data.extend_from_slice(&self.data[start..start + width * CHANNELS]);
        }
        Self { width, height, data, source_index: self.source_index }
    }

    /// Swap rows and columns.
    pub fn transposed(&self) -> Self {
        let mut out = Self::filled(self.height, self.width, [0, 0, 0], self.source_index);
        for y in 0..self.height {
            for x in 0..self.width {
                out.set_pixel(y, x, self.pixel(x, y));
            }
        }
        out
    }

    /// Gray image replicated into three channels.
    pub fn from_gray(gray: &[u8], width: usize, height: usize, source_index: usize) -> MergeResult<Self> {
        let data = gray.iter().flat_map(|&v| [v, v, v]).collect();
        Self::new(width, height, data, source_index)
    }
}

/// Detected interest point in base-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Diameter of the meaningful neighbourhood
    pub size: f32,
    /// Orientation in radians
    pub angle: f32,
    pub response: f32,
    pub octave: usize,
}

impl Keypoint {
    pub fn at(x: f32, y: f32) -> Self {
        Self { x, y, size: 7.0, angle: 0.0, response: 0.0, octave: 0 }
    }
}

/// 128-dimensional gradient-histogram descriptor
pub type FloatDescriptor = [f32; 128];

/// 256-bit binary descriptor = 32 bytes
pub type BinaryDescriptor = [u8; 32];

/// Detector variant selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DetectorKind {
    /// Difference-of-Gaussians keypoints with 128-float gradient descriptors
    #[default]
    ScaleInvariant,
    /// Oriented FAST keypoints with 256-bit BRIEF descriptors
    Binary,
}

impl DetectorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectorKind::ScaleInvariant => "scale_invariant",
            DetectorKind::Binary => "binary",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorKind {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scale_invariant" | "sift" => Ok(DetectorKind::ScaleInvariant),
            "binary" | "orb" => Ok(DetectorKind::Binary),
            other => Err(MergeError::Configuration(format!("unknown detector '{}'", other))),
        }
    }
}

/// Descriptors paired 1:1 with keypoints.
#[derive(Debug, Clone, PartialEq)]
pub enum DescriptorSet {
    Float(Vec<FloatDescriptor>),
    Binary(Vec<BinaryDescriptor>),
}

impl DescriptorSet {
    pub fn empty(kind: DetectorKind) -> Self {
        match kind {
            DetectorKind::ScaleInvariant => DescriptorSet::Float(Vec::new()),
            DetectorKind::Binary => DescriptorSet::Binary(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DescriptorSet::Float(d) => d.len(),
            DescriptorSet::Binary(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> DetectorKind {
        match self {
            DescriptorSet::Float(_) => DetectorKind::ScaleInvariant,
            DescriptorSet::Binary(_) => DetectorKind::Binary,
        }
    }
}

/// Keypoints with their descriptors for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSet {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: DescriptorSet,
}

impl FeatureSet {
    pub fn empty(kind: DetectorKind) -> Self {
        Self { keypoints: Vec::new(), descriptors: DescriptorSet::empty(kind) }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn kind(&self) -> DetectorKind {
        self.descriptors.kind()
    }
}

/// Matched pair: keypoint `query_idx` of image A with keypoint `train_idx` of image B.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: f32,
}

/// Initialize Rayon thread pool with the specified number of threads.
///
/// The global pool can only be built once per process; a second call returns the build error.
pub fn init_thread_pool(n_threads: usize) -> Result<(), rayon::ThreadPoolBuildError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(n_threads.max(1))
        .build_global()
}

/// Worker count used when the caller does not pick one.
pub fn default_thread_count() -> usize {
    num_cpus::get().max(1)
}
