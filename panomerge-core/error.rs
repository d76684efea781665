use thiserror::Error;

use crate::cancel::Stage;

/// Failure taxonomy shared by every stage of a merge.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MergeError {
    #[error("image {index} is invalid: {reason}")]
    InvalidImage { index: usize, reason: String },

    #[error("insufficient features: found {found} correspondences, need {needed}")]
    InsufficientFeatures { found: usize, needed: usize },

    #[error("degenerate alignment: {reason}")]
    DegenerateAlignment { reason: String },

    #[error("image {index} is {width}x{height}, exceeding the limit of {limit}")]
    ResourceExceeded { index: usize, width: usize, height: usize, limit: usize },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("merge cancelled before {stage}")]
    Cancelled { stage: Stage },

    #[error("at least two images are required, got {0}")]
    TooFewImages(usize),
}

impl MergeError {
    /// True for per-pair failures the orchestrator absorbs through its fallback chain.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MergeError::InsufficientFeatures { .. } | MergeError::DegenerateAlignment { .. }
        )
    }

    pub fn degenerate(reason: impl Into<String>) -> Self {
        MergeError::DegenerateAlignment { reason: reason.into() }
    }
}

pub type MergeResult<T> = Result<T, MergeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(MergeError::InsufficientFeatures { found: 2, needed: 4 }.is_recoverable());
        assert!(MergeError::degenerate("collinear").is_recoverable());
        assert!(!MergeError::Configuration("bad".into()).is_recoverable());
        assert!(!MergeError::Cancelled { stage: Stage::Matching }.is_recoverable());
        assert!(!MergeError::ResourceExceeded { index: 0, width: 1, height: 1, limit: 0 }.is_recoverable());
    }

    #[test]
    fn test_messages_carry_dimensions() {
        let err = MergeError::ResourceExceeded { index: 3, width: 20000, height: 9000, limit: 100 };
        assert_eq!(err.to_string(), "image 3 is 20000x9000, exceeding the limit of 100");
    }
}
