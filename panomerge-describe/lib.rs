//! Keypoint descriptors and ratio-test matching.
//!
//! Binary (BRIEF) descriptors are computed on the pyramid level a keypoint was
//! detected on; float descriptors come from the Gaussian scale space.

pub mod brief;
pub mod gradient;
pub mod matcher;

use panomerge_core::{DetectorKind, FeatureSet};
use panomerge_detect::{PyramidDetection, ScaleSpaceDetection};

pub use brief::{binomial_smooth, hamming_distance, BriefGenerator};
pub use gradient::{describe_scale_space, gradient_descriptor, squared_distance};
pub use matcher::match_features;

/// Output of one of the two detector families, ready to be described
#[derive(Debug, Clone)]
pub enum Detection {
    ScaleSpace(ScaleSpaceDetection),
    Pyramid(PyramidDetection),
}

impl Detection {
    pub fn kind(&self) -> DetectorKind {
        match self {
            Detection::ScaleSpace(_) => DetectorKind::ScaleInvariant,
            Detection::Pyramid(_) => DetectorKind::Binary,
        }
    }

    pub fn keypoint_count(&self) -> usize {
        match self {
            Detection::ScaleSpace(d) => d.keypoints.len(),
            Detection::Pyramid(d) => d.keypoints.len(),
        }
    }
}

/// Describe every keypoint of a detection with the descriptor matching its family
pub fn describe(detection: &Detection) -> FeatureSet {
    match detection {
        Detection::ScaleSpace(d) => describe_scale_space(d),
        Detection::Pyramid(d) => BriefGenerator::new().describe(d),
    }
}
