//! Convolutional building blocks of the default backbone.

use crate::config::GROUP_NORM_GROUPS;
use crate::error::TritokError;
use crate::modules::ops::swish;
use burn::tensor::{
    activation::softmax,
    backend::Backend,
    module::interpolate,
    ops::{InterpolateMode, InterpolateOptions},
    Tensor,
};
use burn_nn::conv::{Conv2d, Conv2dConfig};
use burn_nn::{Dropout, DropoutConfig, GroupNorm, GroupNormConfig, PaddingConfig2d};

/// Feature normalization kinds accepted by the backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormType {
    Group,
}

impl NormType {
    /// Parse a normalization name.
    ///
    /// # Errors
    ///
    /// Only `"group"` is supported; anything else is
    /// [`TritokError::UnsupportedNorm`].
    pub fn parse(name: &str) -> Result<Self, TritokError> {
        match name {
            "group" => Ok(NormType::Group),
            other => Err(TritokError::UnsupportedNorm(other.to_string())),
        }
    }
}

/// Group normalization with 32 groups and eps 1e-6.
pub fn normalize<B: Backend>(
    norm_type: NormType,
    channels: usize,
    device: &B::Device,
) -> GroupNorm<B> {
    match norm_type {
        NormType::Group => GroupNormConfig::new(GROUP_NORM_GROUPS, channels)
            .with_epsilon(1e-6)
            .init(device),
    }
}

fn conv3x3<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Same)
        .init(device)
}

/// 1x1 convolution, used for channel projections.
pub fn conv1x1<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [1, 1]).init(device)
}

/// Pre-activation residual block with an optional 1x1 shortcut.
#[derive(Debug, Clone)]
pub struct ResnetBlock<B: Backend> {
    pub norm1: GroupNorm<B>,
    pub conv1: Conv2d<B>,
    pub norm2: GroupNorm<B>,
    pub dropout: Dropout,
    pub conv2: Conv2d<B>,
    pub nin_shortcut: Option<Conv2d<B>>,
}

impl<B: Backend> ResnetBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        dropout: f64,
        norm_type: NormType,
        device: &B::Device,
    ) -> Self {
        Self {
            norm1: normalize(norm_type, in_channels, device),
            conv1: conv3x3(in_channels, out_channels, device),
            norm2: normalize(norm_type, out_channels, device),
            dropout: DropoutConfig::new(dropout).init(),
            conv2: conv3x3(out_channels, out_channels, device),
            nin_shortcut: (in_channels != out_channels)
                .then(|| conv1x1(in_channels, out_channels, device)),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let h = swish(self.norm1.forward(input.clone()));
        let h = self.conv1.forward(h);
        let h = swish(self.norm2.forward(h));
        let h = self.conv2.forward(self.dropout.forward(h));
        let shortcut = match &self.nin_shortcut {
            Some(conv) => conv.forward(input),
            None => input,
        };
        shortcut + h
    }
}

/// Single-head spatial self-attention over all `H*W` positions.
#[derive(Debug, Clone)]
pub struct AttnBlock<B: Backend> {
    pub norm: GroupNorm<B>,
    pub q: Conv2d<B>,
    pub k: Conv2d<B>,
    pub v: Conv2d<B>,
    pub proj_out: Conv2d<B>,
}

impl<B: Backend> AttnBlock<B> {
    pub fn new(channels: usize, norm_type: NormType, device: &B::Device) -> Self {
        Self {
            norm: normalize(norm_type, channels, device),
            q: conv1x1(channels, channels, device),
            k: conv1x1(channels, channels, device),
            v: conv1x1(channels, channels, device),
            proj_out: conv1x1(channels, channels, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = input.dims();
        let positions = height * width;
        let h = self.norm.forward(input.clone());
        let q = self
            .q
            .forward(h.clone())
            .reshape([batch, channels, positions])
            .swap_dims(1, 2);
        let k = self.k.forward(h.clone()).reshape([batch, channels, positions]);
        let v = self.v.forward(h).reshape([batch, channels, positions]);

        // weights[b, i, j]: query position i attending to key position j
        let weights = q.matmul(k).mul_scalar((channels as f64).powf(-0.5));
        let weights = softmax(weights, 2);
        let attended = v
            .matmul(weights.swap_dims(1, 2))
            .reshape([batch, channels, height, width]);
        input + self.proj_out.forward(attended)
    }
}

/// Stride-2 convolution with right/bottom zero padding.
#[derive(Debug, Clone)]
pub struct Downsample<B: Backend> {
    pub conv: Conv2d<B>,
}

impl<B: Backend> Downsample<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([channels, channels], [3, 3])
                .with_stride([2, 2])
                .init(device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = input.dims();
        let device = input.device();
        let right = Tensor::zeros([batch, channels, height, 1], &device);
        let padded = Tensor::cat(vec![input, right], 3);
        let bottom = Tensor::zeros([batch, channels, 1, width + 1], &device);
        let padded = Tensor::cat(vec![padded, bottom], 2);
        self.conv.forward(padded)
    }
}

/// Nearest-neighbor 2x upsampling followed by a 3x3 convolution.
#[derive(Debug, Clone)]
pub struct Upsample<B: Backend> {
    pub conv: Conv2d<B>,
}

impl<B: Backend> Upsample<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            conv: conv3x3(channels, channels, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = input.dims();
        let upsampled = interpolate(
            input,
            [height * 2, width * 2],
            InterpolateOptions::new(InterpolateMode::Nearest),
        );
        self.conv.forward(upsampled)
    }
}
