//! Linear-chain conditional random field for sequence tagging on candle.
//!
//! [`CRF`] scores tag paths over batched, masked and padded emission tensors:
//! [`CRF::compute_loss`] gives the per-sample negative log-likelihood and
//! [`CRF::decode`] the Viterbi path. [`CrfDecoder`] puts a dropout + linear
//! head and a tag vocabulary in front of it.

mod config;
mod crf;
mod decoder;
mod error;
mod ops;

pub use config::CrfConfig;
pub use crf::{CRF, PAD_PENALTY};
pub use decoder::{CrfDecoder, CrfDecoderConfig, TagVocab, PAD_TAG};
pub use error::{CrfError, Result};

/// Reduction applied to the per-sample losses by [`CRF::forward`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reduction {
    None,
    Sum,
    /// Average over samples.
    #[default]
    Mean,
    /// Sum divided by the number of valid positions.
    TokenMean,
}
