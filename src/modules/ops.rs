//! Small tensor helpers shared by the quantizer and backbone.

use burn::tensor::{activation::silu, backend::Backend, Tensor};

/// Lower bound applied to vector norms before dividing.
pub const NORM_EPS: f32 = 1e-12;

/// Divide each slice along `dim` by its L2 norm (clamped to [`NORM_EPS`]).
pub fn l2_normalize<B: Backend, const D: usize>(input: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    let norm = input
        .clone()
        .powf_scalar(2.0)
        .sum_dim(dim)
        .clamp_min(NORM_EPS * NORM_EPS)
        .sqrt();
    input.div(norm)
}

/// Swish / SiLU nonlinearity used throughout the backbone.
pub fn swish<B: Backend, const D: usize>(input: Tensor<B, D>) -> Tensor<B, D> {
    silu(input)
}

/// `(B, C, H, W)` -> `(B*H*W, C)` with channels last.
pub fn flatten_positions<B: Backend>(input: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch, channels, height, width] = input.dims();
    input
        .permute([0, 2, 3, 1])
        .reshape([batch * height * width, channels])
}

/// `(B*H*W, C)` -> `(B, C, H, W)`; inverse of [`flatten_positions`].
pub fn unflatten_positions<B: Backend>(
    input: Tensor<B, 2>,
    [batch, channels, height, width]: [usize; 4],
) -> Tensor<B, 4> {
    input
        .reshape([batch, height, width, channels])
        .permute([0, 3, 1, 2])
}

/// `(B, C, H, W)` -> `(B, H*W, C)` token sequence.
pub fn to_tokens<B: Backend>(input: Tensor<B, 4>) -> Tensor<B, 3> {
    let [batch, channels, height, width] = input.dims();
    input
        .reshape([batch, channels, height * width])
        .swap_dims(1, 2)
}

/// `(B, H*W, C)` -> `(B, C, H, W)`; inverse of [`to_tokens`].
pub fn from_tokens<B: Backend>(input: Tensor<B, 3>, height: usize, width: usize) -> Tensor<B, 4> {
    let [batch, _, channels] = input.dims();
    input
        .swap_dims(1, 2)
        .reshape([batch, channels, height, width])
}
