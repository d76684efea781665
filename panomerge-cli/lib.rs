//! Feature-based image merging.
//!
//! [`MergeEngine`] runs the whole pipeline: resource guard, illumination-aware
//! preprocessing, feature extraction, ratio-test matching, RANSAC homography,
//! then compositing onto a shared canvas. Pairs that cannot be aligned degrade to a
//! relaxed blend and finally to a side-by-side join instead of failing the request.
//!
//! ```no_run
//! use panomerge_cli::{io, MergeEngine};
//! use panomerge_core::{CancelToken, MergeConfiguration, ResourceLimits};
//!
//! let limits = ResourceLimits::default();
//! let images = vec![
//!     io::load("left.jpg".as_ref(), 0, &limits)?,
//!     io::load("right.jpg".as_ref(), 1, &limits)?,
//! ];
//! let engine = MergeEngine::new(MergeConfiguration::default())?;
//! let out = engine.merge(images, &CancelToken::new())?;
//! io::save_png(&out.image, "panorama.png".as_ref())?;
//! # Ok::<(), panomerge_core::MergeError>(())
//! ```

pub mod compositor;
pub mod diagnostics;
pub mod enhance;
pub mod extractor;
pub mod guard;
pub mod homography;
pub mod io;
pub mod orchestrator;
pub mod side_by_side;

pub use compositor::{composite, plan_canvas, Canvas};
pub use diagnostics::{draw_matches, preprocessed_preview, Diagnostics};
pub use enhance::{enhance_panorama, EnhanceParams};
pub use extractor::{FeatureExtractor, MIN_KEYPOINTS};
pub use guard::{guard, GuardedImage};
pub use homography::{estimate_dlt, fit_ransac, HomographyModel, Point};
pub use orchestrator::{
    merge, pair_seed, MergeEngine, MergeMetadata, MergeOutput, MergeStatus, PairOutcome, PairStatus, PointPair,
};
pub use side_by_side::side_by_side;

pub use panomerge_core;
