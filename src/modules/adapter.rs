//! Token-level transformer stacks: the per-head adapters of the encoder and
//! the semantic feature-prediction heads.

use crate::error::TritokError;
use crate::modules::ops::{from_tokens, to_tokens};
use crate::perf::{self, Metric};
use burn::module::Param;
use burn::tensor::{
    activation::{gelu, relu},
    backend::Backend,
    Distribution, Tensor,
};
use burn_nn::attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig};
use burn_nn::{LayerNorm, LayerNormConfig, Linear, LinearConfig};

const MLP_RATIO: usize = 4;

fn learned_embedding<B: Backend>(rows: usize, width: usize, device: &B::Device) -> Param<Tensor<B, 2>> {
    let scale = (width as f64).powf(-0.5);
    Param::from_tensor(
        Tensor::random([rows, width], Distribution::Normal(0.0, 1.0), device).mul_scalar(scale),
    )
}

/// Pre-LN transformer block: self-attention and a GELU MLP, both residual.
#[derive(Debug, Clone)]
pub struct ResidualAttentionBlock<B: Backend> {
    pub ln_1: LayerNorm<B>,
    pub attn: MultiHeadAttention<B>,
    pub ln_2: LayerNorm<B>,
    pub c_fc: Linear<B>,
    pub c_proj: Linear<B>,
}

impl<B: Backend> ResidualAttentionBlock<B> {
    pub fn new(width: usize, num_heads: usize, device: &B::Device) -> Self {
        let hidden = width * MLP_RATIO;
        Self {
            ln_1: LayerNormConfig::new(width).init(device),
            attn: MultiHeadAttentionConfig::new(width, num_heads)
                .with_dropout(0.0)
                .init(device),
            ln_2: LayerNormConfig::new(width).init(device),
            c_fc: LinearConfig::new(width, hidden).init(device),
            c_proj: LinearConfig::new(hidden, width).init(device),
        }
    }

    /// `x` is `(B, L, width)`.
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let attended = self
            .attn
            .forward(MhaInput::self_attn(self.ln_1.forward(x.clone())))
            .context;
        let x = x + attended;
        let mlp = self
            .c_proj
            .forward(gelu(self.c_fc.forward(self.ln_2.forward(x.clone()))));
        x + mlp
    }
}

fn transformer<B: Backend>(
    width: usize,
    num_layers: usize,
    num_heads: usize,
    device: &B::Device,
) -> Vec<ResidualAttentionBlock<B>> {
    (0..num_layers)
        .map(|_| ResidualAttentionBlock::new(width, num_heads, device))
        .collect()
}

/// Transformer over the latent grid of one encoder head.
///
/// Input and output are `(B, width, grid, grid)`; the positional embedding is
/// sized for exactly `grid * grid` tokens.
#[derive(Debug, Clone)]
pub struct FactorizedAdapter<B: Backend> {
    pub positional_embedding: Param<Tensor<B, 2>>,
    pub ln_pre: LayerNorm<B>,
    pub layers: Vec<ResidualAttentionBlock<B>>,
    pub ln_post: LayerNorm<B>,
    grid_size: usize,
    width: usize,
}

impl<B: Backend> FactorizedAdapter<B> {
    pub fn new(
        width: usize,
        grid_size: usize,
        num_layers: usize,
        num_heads: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            positional_embedding: learned_embedding(grid_size * grid_size, width, device),
            ln_pre: LayerNormConfig::new(width).init(device),
            layers: transformer(width, num_layers, num_heads, device),
            ln_post: LayerNormConfig::new(width).init(device),
            grid_size,
            width,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> anyhow::Result<Tensor<B, 4>> {
        let [_, channels, height, width] = x.dims();
        if height != self.grid_size || width != self.grid_size || channels != self.width {
            return Err(TritokError::ShapeMismatch(format!(
                "adapter expects (B, {}, {g}, {g}), got {:?}",
                self.width,
                x.dims(),
                g = self.grid_size
            ))
            .into());
        }
        let tokens = to_tokens(x) + self.positional_embedding.val().unsqueeze::<3>();
        let mut tokens = self.ln_pre.forward(tokens);
        for layer in &self.layers {
            tokens = layer.forward(tokens);
        }
        let tokens = self.ln_post.forward(tokens);
        Ok(from_tokens(tokens, height, width))
    }
}

/// Predicts target semantic features from a quantized map.
///
/// Output is `(B, 1 + H*W, out_dim)`; token 0 is the learned summary token.
#[derive(Debug, Clone)]
pub struct FeatPredHead<B: Backend> {
    pub upscale_in: Linear<B>,
    pub upscale_out: Linear<B>,
    pub class_embedding: Param<Tensor<B, 2>>,
    pub positional_embedding: Param<Tensor<B, 2>>,
    pub ln_pre: LayerNorm<B>,
    pub layers: Vec<ResidualAttentionBlock<B>>,
    pub ln_post: LayerNorm<B>,
    grid_size: usize,
    out_dim: usize,
}

impl<B: Backend> FeatPredHead<B> {
    pub fn new(
        input_dim: usize,
        out_dim: usize,
        grid_size: usize,
        num_layers: usize,
        num_heads: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            upscale_in: LinearConfig::new(input_dim, out_dim).init(device),
            upscale_out: LinearConfig::new(out_dim, out_dim).init(device),
            class_embedding: learned_embedding(1, out_dim, device),
            positional_embedding: learned_embedding(grid_size * grid_size + 1, out_dim, device),
            ln_pre: LayerNormConfig::new(out_dim).init(device),
            layers: transformer(out_dim, num_layers, num_heads, device),
            ln_post: LayerNormConfig::new(out_dim).init(device),
            grid_size,
            out_dim,
        }
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> anyhow::Result<Tensor<B, 3>> {
        let _span = perf::span(Metric::SemanticPrediction);
        let [batch, _, height, width] = x.dims();
        if height != self.grid_size || width != self.grid_size {
            return Err(TritokError::ShapeMismatch(format!(
                "prediction head expects a {g}x{g} grid, got {height}x{width}",
                g = self.grid_size
            ))
            .into());
        }
        let tokens = self
            .upscale_out
            .forward(relu(self.upscale_in.forward(to_tokens(x))));
        let class_token = self
            .class_embedding
            .val()
            .unsqueeze::<3>()
            .repeat_dim(0, batch);
        let tokens = Tensor::cat(vec![class_token, tokens], 1)
            + self.positional_embedding.val().unsqueeze::<3>();
        let mut tokens = self.ln_pre.forward(tokens);
        for layer in &self.layers {
            tokens = layer.forward(tokens);
        }
        Ok(self.ln_post.forward(tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn adapter_keeps_map_shape() {
        let device = NdArrayDevice::default();
        let adapter = FactorizedAdapter::<TestBackend>::new(16, 2, 1, 4, &device);
        let input = Tensor::<TestBackend, 4>::random([2, 16, 2, 2], Distribution::Default, &device);
        let out = adapter.forward(input).expect("forward");
        assert_eq!(out.dims(), [2, 16, 2, 2]);
    }

    #[test]
    fn adapter_rejects_other_grids() {
        let device = NdArrayDevice::default();
        let adapter = FactorizedAdapter::<TestBackend>::new(16, 2, 1, 4, &device);
        let input = Tensor::<TestBackend, 4>::zeros([1, 16, 4, 4], &device);
        let err = adapter.forward(input).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TritokError>(),
            Some(TritokError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn prediction_head_prepends_summary_token() {
        let device = NdArrayDevice::default();
        let head = FeatPredHead::<TestBackend>::new(4, 24, 3, 1, 8, &device);
        let input = Tensor::<TestBackend, 4>::random([2, 4, 3, 3], Distribution::Default, &device);
        let out = head.forward(input).expect("forward");
        assert_eq!(out.dims(), [2, 10, 24]);
        assert_eq!(head.out_dim(), 24);
    }
}
