//! Error types for STEGO operations.

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, StegoError>;

/// Errors raised by the correlation loss, cluster probe, CRF and model wrapper.
#[derive(Debug, Error)]
pub enum StegoError {
    /// Tensor runtime failure (includes shape errors raised by contractions).
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration, detected at construction time.
    #[error("invalid configuration: {message}")]
    Config {
        /// What is wrong with the configuration
        message: String,
    },

    /// A precondition on the inputs of an operation does not hold.
    #[error("precondition violated: {message}")]
    Precondition {
        /// The violated precondition
        message: String,
    },

    /// Channel or prototype counts disagree between two operands.
    #[error("shape mismatch: expected {expected}, actual {actual}")]
    ShapeMismatch {
        /// Expected size
        expected: usize,
        /// Size that was provided
        actual: usize,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl StegoError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    pub fn shape_mismatch(expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch { expected, actual }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = StegoError::config("Backbone resnet unavailable");
        assert_eq!(
            err.to_string(),
            "invalid configuration: Backbone resnet unavailable"
        );

        let err = StegoError::shape_mismatch(27, 30);
        assert_eq!(err.to_string(), "shape mismatch: expected 27, actual 30");

        let err = StegoError::precondition("batch size must be at least 2");
        assert!(err.to_string().contains("at least 2"));
    }

    #[test]
    fn test_candle_error_converts() {
        fn fails() -> Result<()> {
            Err(candle_core::Error::Msg("boom".to_string()))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(StegoError::Candle(_))));
    }
}
