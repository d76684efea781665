use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{MergeError, MergeResult};

/// Pipeline stage boundaries where cancellation is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Guard,
    Preprocess,
    Extraction,
    Matching,
    Estimation,
    Compositing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Guard => "resource guard",
            Stage::Preprocess => "preprocessing",
            Stage::Extraction => "feature extraction",
            Stage::Matching => "matching",
            Stage::Estimation => "homography estimation",
            Stage::Compositing => "compositing",
        };
        f.write_str(name)
    }
}

/// Caller-owned cancellation flag with an optional deadline.
///
/// Clones share the flag, so a caller can keep one handle and pass another into a merge.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { flag: Arc::default(), deadline: Some(Instant::now() + timeout) }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fails with [`MergeError::Cancelled`] when the token has tripped.
    pub fn check(&self, stage: Stage) -> MergeResult<()> {
        if self.is_cancelled() {
            Err(MergeError::Cancelled { stage })
        } else {
            Ok(())
        }
    }
}
