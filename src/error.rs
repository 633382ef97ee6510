use thiserror::Error;

/// Errors raised by the CRF layer and the decoder built on it.
///
/// Every variant is a precondition violation of the caller; none of them is
/// retryable.
#[derive(Debug, Error)]
pub enum CrfError {
    /// Dimensions of emissions, tags or mask disagree.
    #[error("{0}")]
    ShapeMismatch(String),

    /// A mask row turns back on after a padded position.
    #[error("mask of sample {sample} is not left-aligned, got a valid position at {position} after padding")]
    InvalidMask { sample: usize, position: usize },

    /// A gold tag id outside `[0, tag_dim)`, or the pad id at a valid position.
    #[error("invalid tag id {tag} at sample {sample}, position {position}, expected a value in [0, {tag_dim})")]
    InvalidTagId {
        sample: usize,
        position: usize,
        tag: i64,
        tag_dim: usize,
    },

    #[error("{0}")]
    DTypeMismatch(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown tag `{0}`")]
    UnknownTag(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl CrfError {
    pub(crate) fn shape(message: impl Into<String>) -> Self {
        Self::ShapeMismatch(message.into())
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

pub type Result<T> = std::result::Result<T, CrfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            CrfError::shape("emissions must have 3 dimensions, got 2").to_string(),
            "emissions must have 3 dimensions, got 2"
        );
        assert_eq!(
            CrfError::InvalidMask {
                sample: 1,
                position: 3
            }
            .to_string(),
            "mask of sample 1 is not left-aligned, got a valid position at 3 after padding"
        );
        assert_eq!(
            CrfError::InvalidTagId {
                sample: 0,
                position: 2,
                tag: 7,
                tag_dim: 5
            }
            .to_string(),
            "invalid tag id 7 at sample 0, position 2, expected a value in [0, 5)"
        );
        assert_eq!(
            CrfError::config("tag_dim must be greater than 0").to_string(),
            "invalid configuration: tag_dim must be greater than 0"
        );
        assert_eq!(CrfError::UnknownTag("B-XYZ".into()).to_string(), "unknown tag `B-XYZ`");
    }

    #[test]
    fn test_candle_error_converts() {
        let err: CrfError = candle_core::Error::Msg("boom".to_string()).into();
        assert!(matches!(err, CrfError::Candle(_)));
        assert_eq!(err.to_string(), "boom");
    }
}
