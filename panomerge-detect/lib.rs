//! Keypoint detection for image merging.
//!
//! Two detector variants share one preprocessing front end:
//! - [`BinaryDetector`]: oriented FAST-9 corners over a 1.2x image pyramid
//! - [`ScaleSpaceDetector`]: difference-of-Gaussians extrema with gradient orientations
//!
//! [`ImagePreprocessing`] normalizes illumination first (night or normal path) and
//! [`tune_preprocessing`] derives its parameters from a representative image set.

pub mod config;
pub mod corner_detection;
pub mod detector;
pub mod error;
pub mod preprocessing;
pub mod pyramid;
pub mod refinement;
pub mod scale_space;
pub mod tuning;
pub mod types;
pub mod utils;

pub use config::{DetectorBuilder, DetectorConfig};
pub use corner_detection::CornerDetector;
pub use detector::BinaryDetector;
pub use error::{DetectError, DetectResult};
pub use preprocessing::{
    gaussian_kernel, Illumination, ImagePreprocessing, PreprocessParams, AGGRESSIVE_CLIP_LIMIT,
    AGGRESSIVE_GRID_SIZE,
};
pub use pyramid::{bilinear_sample, ImagePyramid};
pub use refinement::KeypointRefinement;
pub use scale_space::ScaleSpaceDetector;
pub use tuning::{laplacian_variance, tune_preprocessing, ImageStatistics, TuningReport};
pub use types::{GrayFrame, LevelKeypoint, Octave, PyramidDetection, ScaleLevel, ScaleSpaceDetection, ScoredKeypoint};
