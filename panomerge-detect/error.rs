use panomerge_core::MergeError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectError {
    #[error("invalid image dimensions: {width}x{height} (must be > 0)")]
    InvalidImageSize { width: usize, height: usize },

    #[error("image data length mismatch: expected {expected_len}, got {actual_len}")]
    InvalidImageData { expected_len: usize, actual_len: usize },

    #[error("invalid FAST threshold: {0} (must be 1-127)")]
    InvalidThreshold(u8),

    #[error("patch size {patch_size} must be odd and at least 7")]
    InvalidPatchSize { patch_size: usize },

    #[error("invalid detector parameter: {0}")]
    InvalidParameter(String),
}

pub type DetectResult<T> = Result<T, DetectError>;

impl From<DetectError> for MergeError {
    fn from(err: DetectError) -> Self {
        match err {
            DetectError::InvalidImageSize { .. } | DetectError::InvalidImageData { .. } => {
                MergeError::InvalidImage { index: 0, reason: err.to_string() }
            }
            other => MergeError::Configuration(other.to_string()),
        }
    }
}

/// Checks that `data` is a dense `width x height` single-channel buffer.
pub(crate) fn validate_gray(data: &[impl Copy], width: usize, height: usize) -> DetectResult<()> {
    if width == 0 || height == 0 {
        return Err(DetectError::InvalidImageSize { width, height });
    }
    let expected_len = width * height;
    if data.len() != expected_len {
        return Err(DetectError::InvalidImageData { expected_len, actual_len: data.len() });
    }
    Ok(())
}
