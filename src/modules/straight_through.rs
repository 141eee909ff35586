//! Straight-through estimator for the nearest-neighbor lookup.
//!
//! The lookup is not differentiable, so the quantized output carries two
//! paths: the *value* path is the selected codebook vectors, the *gradient*
//! path is the continuous encoder output. The combined tensor evaluates to the
//! value path exactly while backpropagating an identity gradient into the
//! gradient path and nothing into the codebook.

use burn::tensor::{backend::Backend, Tensor};

#[derive(Debug, Clone)]
pub struct StraightThrough<B: Backend, const D: usize> {
    value: Tensor<B, D>,
    gradient: Tensor<B, D>,
}

impl<B: Backend, const D: usize> StraightThrough<B, D> {
    /// Pair the quantized `value` with the continuous `gradient` source.
    pub fn new(value: Tensor<B, D>, gradient: Tensor<B, D>) -> Self {
        Self { value, gradient }
    }

    /// Merge both paths: `gradient + detach(value - gradient)`.
    pub fn into_tensor(self) -> Tensor<B, D> {
        let correction = self.value.sub(self.gradient.clone()).detach();
        self.gradient.add(correction)
    }
}
