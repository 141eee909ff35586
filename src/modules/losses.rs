//! Regularizers computed alongside quantization.

use crate::error::TritokError;
use crate::modules::ops::{flatten_positions, l2_normalize};
use burn::tensor::{
    activation::{log_softmax, softmax},
    backend::Backend,
    Tensor,
};

/// Default softmax temperature for [`compute_entropy_loss`].
pub const DEFAULT_ENTROPY_TEMPERATURE: f32 = 0.01;

const LOG_EPS: f32 = 1e-5;

/// Entropy-balancing penalty over code affinities.
///
/// `affinity` is any tensor whose last axis enumerates codebook entries
/// (typically negative distances). The result is the mean per-position entropy
/// minus the entropy of the batch-averaged distribution: close to zero when
/// every position collapses onto the same code, and approaching `-ln K` when
/// confident assignments spread evenly over `K` codes.
///
/// # Errors
///
/// Returns [`TritokError::UnsupportedEntropyLoss`] for any `loss_type` other
/// than `"softmax"`.
pub fn compute_entropy_loss<B: Backend, const D: usize>(
    affinity: Tensor<B, D>,
    loss_type: &str,
    temperature: f32,
) -> Result<Tensor<B, 1>, TritokError> {
    let dims = affinity.dims();
    let codes = dims[D - 1];
    let positions = dims[..D - 1].iter().product::<usize>();
    let flat = affinity.reshape([positions, codes]).div_scalar(temperature);

    let probs = softmax(flat.clone(), 1);
    let log_probs = log_softmax(flat.add_scalar(LOG_EPS), 1);
    let target_probs = match loss_type {
        "softmax" => probs,
        other => return Err(TritokError::UnsupportedEntropyLoss(other.to_string())),
    };

    let avg_probs = target_probs.clone().mean_dim(0);
    let avg_entropy = avg_probs
        .clone()
        .mul(avg_probs.add_scalar(LOG_EPS).log())
        .sum()
        .neg();
    let sample_entropy = target_probs.mul(log_probs).sum_dim(1).mean().neg();
    Ok(sample_entropy.sub(avg_entropy))
}

/// Squared cosine similarity between two quantized maps, averaged over
/// positions and scaled by `ratio`.
///
/// Both inputs are `(B, C, H, W)` with identical shapes. The unscaled term lies
/// in `[0, 1]`.
///
/// # Errors
///
/// Returns [`TritokError::ShapeMismatch`] when the maps differ in shape.
pub fn compute_disentangle_loss<B: Backend>(
    first: Tensor<B, 4>,
    second: Tensor<B, 4>,
    ratio: f32,
) -> Result<Tensor<B, 1>, TritokError> {
    if first.dims() != second.dims() {
        return Err(TritokError::ShapeMismatch(format!(
            "disentanglement inputs {:?} and {:?}",
            first.dims(),
            second.dims()
        )));
    }
    let first = l2_normalize(flatten_positions(first), 1);
    let second = l2_normalize(flatten_positions(second), 1);
    let cosine = first.mul(second).sum_dim(1);
    Ok(cosine.powf_scalar(2.0).mean().mul_scalar(ratio))
}
