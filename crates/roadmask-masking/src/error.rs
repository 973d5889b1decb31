//! Errors raised while composing masks.

use thiserror::Error;

/// Result alias for mask composition.
pub type MaskResult<T> = Result<T, MaskError>;

/// Errors raised while composing masks.
#[derive(Debug, Error)]
pub enum MaskError {
    /// A detection mask does not cover the same frame as the image.
    #[error("mask dimensions do not match image")]
    DimensionMismatch {
        /// Index of the offending detection.
        index: usize,
        /// Image dimensions.
        expected: (u32, u32),
        /// Mask dimensions.
        actual: (u32, u32),
    },
}
