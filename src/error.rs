//! Error types for the CRF layer.

use thiserror::Error;

/// Result type for CRF operations.
pub type Result<T> = std::result::Result<T, CrfError>;

/// Error type for CRF operations.
///
/// Shape, dtype, mask-value and tag-range failures are caller bugs and always abort.
/// Mask and gold-path inconsistencies carry the example index so the caller
/// can decide between aborting and excluding the example.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CrfError {
    /// Failure reported by the tensor library.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    /// Inconsistent configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Tensor rank or shape does not match the contract.
    #[error("{0}")]
    Shape(String),

    /// Tensor dtype does not match the contract.
    #[error("{0}")]
    DType(String),

    /// The batch holds no examples.
    #[error("batch must hold at least one example")]
    EmptyBatch,

    /// Tag index outside `[0, num_tags)`.
    #[error("tag {tag} at example {example}, step {step} is out of range for {num_tags} tags")]
    TagOutOfRange {
        example: usize,
        step: usize,
        tag: i64,
        num_tags: usize,
    },

    /// Mask entry other than 0 or 1.
    #[error("mask of example {example} holds {value} at step {step}, expected 0 or 1")]
    InvalidMask {
        example: usize,
        step: usize,
        value: u8,
    },

    /// Mask row is not a prefix of ones followed by zeros.
    #[error("mask of example {example} is not a contiguous prefix")]
    NonContiguousMask { example: usize },

    /// Gold path length disagrees with the mask-derived length.
    #[error("gold path of example {example} has length {got}, mask says {expected}")]
    GoldLengthMismatch {
        example: usize,
        expected: usize,
        got: usize,
    },

    /// NaN or infinity produced by the dynamic program.
    #[error("non-finite {stage} score at example {example}, step {step}")]
    NonFinite {
        example: usize,
        step: usize,
        stage: &'static str,
    },
}

impl CrfError {
    /// Create a shape error.
    #[must_use]
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    /// Create a config error.
    #[must_use]
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Index of the offending example, when the failure is local to one.
    pub fn example(&self) -> Option<usize> {
        match self {
            Self::TagOutOfRange { example, .. }
            | Self::InvalidMask { example, .. }
            | Self::NonContiguousMask { example }
            | Self::GoldLengthMismatch { example, .. }
            | Self::NonFinite { example, .. } => Some(*example),
            _ => None,
        }
    }

    /// Whether [`crate::MalformedPolicy::Skip`] may exclude the example
    /// instead of failing the batch.
    pub fn is_data_inconsistency(&self) -> bool {
        matches!(
            self,
            Self::NonContiguousMask { .. } | Self::GoldLengthMismatch { .. }
        )
    }
}
