//! Typed failure kinds surfaced by the tokenizer.
//!
//! Public APIs return [`anyhow::Result`]; callers that need to branch on the
//! failure kind can recover it with `err.downcast_ref::<TritokError>()`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TritokError {
    /// A code fell outside `[0, codebook_size)`.
    #[error("codebook index {index} out of range for codebook of size {size}")]
    IndexOutOfRange { index: i64, size: usize },

    /// Only softmax-normalized entropy loss is implemented.
    #[error("entropy loss {0:?} not supported")]
    UnsupportedEntropyLoss(String),

    /// The backbone only supports 4 (8x) or 5 (16x) resolution stages.
    #[error("unsupported number of resolution stages: {0} (expected 4 or 5)")]
    UnsupportedStageCount(usize),

    /// Unknown feature-normalization kind requested for the backbone.
    #[error("unsupported normalization type {0:?}")]
    UnsupportedNorm(String),

    /// Feature map channels do not match the codebook embedding width.
    #[error("expected {expected} channels, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },

    /// Tensor shapes disagree with the requested layout.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Configuration values that cannot produce a working model.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
