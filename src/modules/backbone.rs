//! Pixel-space encoder and decoder around the three latent streams.
//!
//! The model talks to its backbone through [`FeatureEncoder`] and
//! [`PixelDecoder`], so alternative networks can be plugged in. [`Encoder`]
//! and [`Decoder`] are the default convolutional implementations.

use crate::config::ModelConfig;
use crate::error::TritokError;
use crate::modules::adapter::FactorizedAdapter;
use crate::modules::blocks::{normalize, AttnBlock, Downsample, NormType, ResnetBlock, Upsample};
use crate::modules::ops::swish;
use crate::modules::triple::Triple;
use crate::perf::{self, Metric};
use burn::tensor::{backend::Backend, Tensor};
use burn_nn::conv::{Conv2d, Conv2dConfig};
use burn_nn::{GroupNorm, PaddingConfig2d};

/// Number of image channels consumed and produced by the default backbone.
pub const IMAGE_CHANNELS: usize = 3;

/// Maps an image to three latent feature maps.
pub trait FeatureEncoder<B: Backend> {
    /// `(B, 3, H, W)` to three `(B, z_channels, H/f, W/f)` maps.
    fn encode(&self, image: Tensor<B, 4>) -> anyhow::Result<Triple<Tensor<B, 4>>>;

    /// Spatial reduction factor `f`.
    fn downsample_factor(&self) -> usize;

    fn z_channels(&self) -> usize;
}

/// Maps a mixed latent back to pixels.
pub trait PixelDecoder<B: Backend> {
    /// `(B, z_channels, H/f, W/f)` to `(B, 3, H, W)`.
    fn decode(&self, z: Tensor<B, 4>) -> anyhow::Result<Tensor<B, 4>>;
}

fn conv3x3<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Same)
        .init(device)
}

/// Residual blocks of one resolution, each optionally followed by attention.
#[derive(Debug, Clone)]
pub struct Stage<B: Backend> {
    pub res: Vec<ResnetBlock<B>>,
    pub attn: Vec<AttnBlock<B>>,
}

impl<B: Backend> Stage<B> {
    fn forward(&self, mut h: Tensor<B, 4>) -> Tensor<B, 4> {
        for (index, block) in self.res.iter().enumerate() {
            h = block.forward(h);
            if let Some(attn) = self.attn.get(index) {
                h = attn.forward(h);
            }
        }
        h
    }
}

/// Resnet, attention, resnet at the bottleneck resolution.
#[derive(Debug, Clone)]
pub struct MidBlock<B: Backend> {
    pub block_1: ResnetBlock<B>,
    pub attn: AttnBlock<B>,
    pub block_2: ResnetBlock<B>,
}

impl<B: Backend> MidBlock<B> {
    fn new(channels: usize, dropout: f64, norm_type: NormType, device: &B::Device) -> Self {
        Self {
            block_1: ResnetBlock::new(channels, channels, dropout, norm_type, device),
            attn: AttnBlock::new(channels, norm_type, device),
            block_2: ResnetBlock::new(channels, channels, dropout, norm_type, device),
        }
    }

    fn forward(&self, h: Tensor<B, 4>) -> Tensor<B, 4> {
        self.block_2.forward(self.attn.forward(self.block_1.forward(h)))
    }
}

/// Stream-specific tail of the encoder.
#[derive(Debug, Clone)]
pub struct EncoderHead<B: Backend> {
    pub adapter: FactorizedAdapter<B>,
    pub norm_out: GroupNorm<B>,
    pub conv_out: Conv2d<B>,
}

impl<B: Backend> EncoderHead<B> {
    fn forward(&self, h: Tensor<B, 4>) -> anyhow::Result<Tensor<B, 4>> {
        let h = self.adapter.forward(h)?;
        Ok(self.conv_out.forward(swish(self.norm_out.forward(h))))
    }
}

/// Default convolutional encoder with one adapter head per stream.
#[derive(Debug, Clone)]
pub struct Encoder<B: Backend> {
    pub conv_in: Conv2d<B>,
    pub stages: Vec<Stage<B>>,
    pub downsamples: Vec<Downsample<B>>,
    pub mid: MidBlock<B>,
    pub heads: Triple<EncoderHead<B>>,
    downsample_factor: usize,
    z_channels: usize,
}

impl<B: Backend> Encoder<B> {
    /// Build the encoder described by `config`.
    ///
    /// # Errors
    ///
    /// Fails on an unsupported stage count or normalization kind.
    pub fn new(config: &ModelConfig, device: &B::Device) -> Result<Self, TritokError> {
        let norm_type = NormType::parse(&config.backbone.norm_type)?;
        let downsample_factor = config.downsample_factor()?;
        let ch = config.backbone.base_channels;
        let num_resolutions = config.num_resolutions();
        let dropout = config.dropout_p;

        let conv_in = conv3x3(IMAGE_CHANNELS, ch, device);
        let mut stages = Vec::with_capacity(num_resolutions);
        let mut downsamples = Vec::with_capacity(num_resolutions - 1);
        let mut block_in = ch;
        for (level, mult) in config.encoder_ch_mult.iter().enumerate() {
            let block_out = ch * mult;
            let is_last = level == num_resolutions - 1;
            let mut res = Vec::with_capacity(config.backbone.num_res_blocks);
            let mut attn = Vec::new();
            for _ in 0..config.backbone.num_res_blocks {
                res.push(ResnetBlock::new(block_in, block_out, dropout, norm_type, device));
                block_in = block_out;
                if is_last {
                    attn.push(AttnBlock::new(block_in, norm_type, device));
                }
            }
            stages.push(Stage { res, attn });
            if !is_last {
                downsamples.push(Downsample::new(block_in, device));
            }
        }

        let mid = MidBlock::new(block_in, dropout, norm_type, device);
        let grid_size = config.backbone.image_size / downsample_factor;
        let adapter = &config.backbone.adapter;
        let head = || EncoderHead {
            adapter: FactorizedAdapter::new(
                block_in,
                grid_size,
                adapter.num_layers,
                adapter.num_heads,
                device,
            ),
            norm_out: normalize(norm_type, block_in, device),
            conv_out: conv3x3(block_in, config.z_channels, device),
        };
        let heads = Triple::new(head(), head(), head());

        Ok(Self {
            conv_in,
            stages,
            downsamples,
            mid,
            heads,
            downsample_factor,
            z_channels: config.z_channels,
        })
    }
}

impl<B: Backend> FeatureEncoder<B> for Encoder<B> {
    fn encode(&self, image: Tensor<B, 4>) -> anyhow::Result<Triple<Tensor<B, 4>>> {
        let _span = perf::span(Metric::EncoderForward);
        let channels = image.dims()[1];
        if channels != IMAGE_CHANNELS {
            return Err(TritokError::ChannelMismatch {
                expected: IMAGE_CHANNELS,
                actual: channels,
            }
            .into());
        }

        let mut h = self.conv_in.forward(image);
        for (level, stage) in self.stages.iter().enumerate() {
            h = stage.forward(h);
            if let Some(downsample) = self.downsamples.get(level) {
                h = downsample.forward(h);
            }
        }
        let h = self.mid.forward(h);
        self.heads.each_ref().try_map(|head| head.forward(h.clone()))
    }

    fn downsample_factor(&self) -> usize {
        self.downsample_factor
    }

    fn z_channels(&self) -> usize {
        self.z_channels
    }
}

/// Default convolutional decoder.
#[derive(Debug, Clone)]
pub struct Decoder<B: Backend> {
    pub conv_in: Conv2d<B>,
    pub mid: MidBlock<B>,
    /// Ordered from the lowest resolution upwards.
    pub stages: Vec<Stage<B>>,
    pub upsamples: Vec<Upsample<B>>,
    pub norm_out: GroupNorm<B>,
    pub conv_out: Conv2d<B>,
    z_channels: usize,
}

impl<B: Backend> Decoder<B> {
    /// Build the decoder described by `config`.
    ///
    /// # Errors
    ///
    /// Fails on an unsupported stage count or normalization kind.
    pub fn new(config: &ModelConfig, device: &B::Device) -> Result<Self, TritokError> {
        let norm_type = NormType::parse(&config.backbone.norm_type)?;
        crate::config::downsample_factor(config.decoder_ch_mult.len())?;
        let ch = config.backbone.base_channels;
        let num_resolutions = config.decoder_ch_mult.len();
        let dropout = config.dropout_p;

        let mut block_in = ch * config.decoder_ch_mult[num_resolutions - 1];
        let conv_in = conv3x3(config.z_channels, block_in, device);
        let mid = MidBlock::new(block_in, dropout, norm_type, device);

        let mut stages = Vec::with_capacity(num_resolutions);
        let mut upsamples = Vec::with_capacity(num_resolutions - 1);
        for level in (0..num_resolutions).rev() {
            let block_out = ch * config.decoder_ch_mult[level];
            let is_top = level == num_resolutions - 1;
            let mut res = Vec::with_capacity(config.backbone.num_res_blocks + 1);
            let mut attn = Vec::new();
            for _ in 0..=config.backbone.num_res_blocks {
                res.push(ResnetBlock::new(block_in, block_out, dropout, norm_type, device));
                block_in = block_out;
                if is_top {
                    attn.push(AttnBlock::new(block_in, norm_type, device));
                }
            }
            stages.push(Stage { res, attn });
            if level != 0 {
                upsamples.push(Upsample::new(block_in, device));
            }
        }

        Ok(Self {
            conv_in,
            mid,
            stages,
            upsamples,
            norm_out: normalize(norm_type, block_in, device),
            conv_out: conv3x3(block_in, IMAGE_CHANNELS, device),
            z_channels: config.z_channels,
        })
    }
}

impl<B: Backend> PixelDecoder<B> for Decoder<B> {
    fn decode(&self, z: Tensor<B, 4>) -> anyhow::Result<Tensor<B, 4>> {
        let _span = perf::span(Metric::DecoderForward);
        let channels = z.dims()[1];
        if channels != self.z_channels {
            return Err(TritokError::ChannelMismatch {
                expected: self.z_channels,
                actual: channels,
            }
            .into());
        }

        let mut h = self.mid.forward(self.conv_in.forward(z));
        for (level, stage) in self.stages.iter().enumerate() {
            h = stage.forward(h);
            if let Some(upsample) = self.upsamples.get(level) {
                h = upsample.forward(h);
            }
        }
        Ok(self.conv_out.forward(swish(self.norm_out.forward(h))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn tiny_config() -> ModelConfig {
        let mut config = ModelConfig {
            encoder_ch_mult: vec![1, 1, 1, 1],
            decoder_ch_mult: vec![1, 1, 1, 1],
            z_channels: 8,
            ..ModelConfig::default()
        };
        config.backbone.base_channels = 32;
        config.backbone.num_res_blocks = 1;
        config.backbone.image_size = 16;
        config.backbone.adapter.num_layers = 1;
        config
    }

    #[test]
    fn encoder_produces_three_latent_maps() {
        let device = NdArrayDevice::default();
        let encoder = Encoder::<TestBackend>::new(&tiny_config(), &device).expect("encoder");
        assert_eq!(encoder.downsample_factor(), 8);
        let image = Tensor::<TestBackend, 4>::zeros([1, 3, 16, 16], &device);
        let maps = encoder.encode(image).expect("encode");
        for map in maps.into_array() {
            assert_eq!(map.dims(), [1, 8, 2, 2]);
        }
    }

    #[test]
    fn decoder_restores_resolution() {
        let device = NdArrayDevice::default();
        let decoder = Decoder::<TestBackend>::new(&tiny_config(), &device).expect("decoder");
        assert_eq!(decoder.stages[0].attn.len(), 2);
        assert!(decoder.stages[1].attn.is_empty());
        let z = Tensor::<TestBackend, 4>::zeros([2, 8, 2, 2], &device);
        assert_eq!(decoder.decode(z).expect("decode").dims(), [2, 3, 16, 16]);
    }

    #[test]
    fn encoder_rejects_non_rgb_input() {
        let device = NdArrayDevice::default();
        let encoder = Encoder::<TestBackend>::new(&tiny_config(), &device).expect("encoder");
        let err = encoder
            .encode(Tensor::zeros([1, 1, 16, 16], &device))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TritokError>(),
            Some(TritokError::ChannelMismatch { expected: 3, actual: 1 })
        ));
    }

    #[test]
    fn unsupported_backbones_fail_construction() {
        let device = NdArrayDevice::default();
        let mut config = tiny_config();
        config.backbone.norm_type = "batch".to_string();
        assert!(matches!(
            Encoder::<TestBackend>::new(&config, &device),
            Err(TritokError::UnsupportedNorm(_))
        ));

        let mut config = tiny_config();
        config.decoder_ch_mult = vec![1, 1, 1];
        assert!(matches!(
            Decoder::<TestBackend>::new(&config, &device),
            Err(TritokError::UnsupportedStageCount(3))
        ));
    }
}
