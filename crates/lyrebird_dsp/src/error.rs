//! Signal Processing Error Types

use thiserror::Error;

/// Errors that can occur during signal processing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DspError {
    #[error("input is not interleaved 16-bit stereo: {0} bytes")]
    MalformedFrame(usize),

    #[error("channel buffer too small: need {needed} bytes, have {have}")]
    OutputTooSmall { needed: usize, have: usize },

    #[error("sync window {0} outside supported range")]
    InvalidWindow(usize),

    #[error("empty input frame")]
    EmptyFrame,
}

/// Result type alias for signal processing operations
pub type DspResult<T> = Result<T, DspError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DspError::MalformedFrame(7);
        assert!(err.to_string().contains("7 bytes"));

        let err = DspError::OutputTooSmall { needed: 64, have: 32 };
        assert!(err.to_string().contains("need 64"));
    }
}
