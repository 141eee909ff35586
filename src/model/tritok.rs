//! Triple-stream tokenizer: one encoder, three quantized latents, one decoder.
//!
//! The image is encoded into a visual-detail map and two semantic maps
//! (mid-level and high-level). Each map is projected to the codebook width and
//! quantized by its own
//! [`VectorQuantizer`]; the three quantized maps are
//! concatenated in visual, mid, high order and decoded back to pixels.

use crate::config::ModelConfig;
use crate::error::TritokError;
use crate::modules::adapter::FeatPredHead;
use crate::modules::backbone::{Decoder, Encoder, FeatureEncoder, PixelDecoder};
use crate::modules::blocks::conv1x1;
use crate::modules::losses::compute_disentangle_loss;
use crate::modules::quantizer::{
    Layout, Mode, QuantizerInfo, QuantizerLosses, QuantizerOutput, VectorQuantizer,
    VectorQuantizerConfig,
};
use crate::modules::triple::Triple;
use crate::perf::{self, Metric};
use burn::tensor::{backend::Backend, Int, Tensor};
use burn_nn::conv::Conv2d;

/// Channel projection and quantizer of one latent stream.
#[derive(Debug, Clone)]
pub struct LatentStream<B: Backend> {
    /// 1x1 projection from `z_channels` to the codebook width.
    pub quant_conv: Conv2d<B>,
    pub quantizer: VectorQuantizer<B>,
}

impl<B: Backend> LatentStream<B> {
    fn quantize(&mut self, features: Tensor<B, 4>) -> anyhow::Result<QuantizerOutput<B>> {
        self.quantizer.forward(self.quant_conv.forward(features))
    }
}

/// Feature-prediction heads on the two semantic streams.
#[derive(Debug, Clone)]
pub struct SemanticHeads<B: Backend> {
    pub mid: FeatPredHead<B>,
    pub high: FeatPredHead<B>,
}

/// Result of [`TriTokModel::encode`].
#[derive(Debug, Clone)]
pub struct EncodeOutput<B: Backend> {
    /// Quantized `(B, dim, h, w)` map per stream.
    pub quant: Triple<Tensor<B, 4>>,
    pub info: Triple<QuantizerInfo<B>>,
    pub losses: Triple<QuantizerLosses<B>>,
}

/// Result of [`TriTokModel::forward`].
#[derive(Debug, Clone)]
pub struct ForwardOutput<B: Backend> {
    /// `(B, 3, H, W)`
    pub reconstruction: Tensor<B, 4>,
    pub losses: Triple<QuantizerLosses<B>>,
    /// Averaged pairwise penalty; zero when disentanglement is disabled.
    pub disentangle_loss: Tensor<B, 1>,
    /// `(B, 1 + h*w, mid_dim)` when semantic supervision is enabled.
    pub mid_semantic_prediction: Option<Tensor<B, 3>>,
    /// `(B, 1 + h*w, high_dim)` when semantic supervision is enabled.
    pub high_semantic_prediction: Option<Tensor<B, 3>>,
}

/// The triple-stream tokenizer.
#[derive(Debug, Clone)]
pub struct TriTokModel<B: Backend, E = Encoder<B>, D = Decoder<B>> {
    pub encoder: E,
    pub decoder: D,
    pub streams: Triple<LatentStream<B>>,
    /// 1x1 mixing projection from `3 * dim` to `z_channels`.
    pub post_quant_conv: Conv2d<B>,
    pub semantic_heads: Option<SemanticHeads<B>>,
    config: ModelConfig,
    mode: Mode,
}

impl<B: Backend> TriTokModel<B> {
    /// Build the model with the default convolutional backbone.
    ///
    /// # Errors
    ///
    /// Fails when the configuration is not supported by the default backbone.
    pub fn from_config(config: &ModelConfig, device: &B::Device) -> anyhow::Result<Self> {
        let _span = perf::span(Metric::ModelFromConfig);
        config.validate()?;
        let encoder = Encoder::new(config, device)?;
        let decoder = Decoder::new(config, device)?;
        Self::with_backbone(config, encoder, decoder, device)
    }
}

impl<B, E, D> TriTokModel<B, E, D>
where
    B: Backend,
    E: FeatureEncoder<B>,
    D: PixelDecoder<B>,
{
    /// Build the model around caller-supplied backbone collaborators.
    ///
    /// Only the backbone-independent part of `config` is checked; the encoder
    /// must produce `config.z_channels` channels.
    ///
    /// # Errors
    ///
    /// Fails on an invalid stream configuration or a `z_channels` mismatch.
    pub fn with_backbone(
        config: &ModelConfig,
        encoder: E,
        decoder: D,
        device: &B::Device,
    ) -> anyhow::Result<Self> {
        let factor = encoder.downsample_factor();
        config.validate_streams(factor)?;
        if encoder.z_channels() != config.z_channels {
            return Err(TritokError::ChannelMismatch {
                expected: config.z_channels,
                actual: encoder.z_channels(),
            }
            .into());
        }

        let mut quantizer_config =
            VectorQuantizerConfig::new(config.codebook_size, config.codebook_embed_dim)
                .with_beta(config.commit_loss_beta)
                .with_entropy_loss_ratio(config.entropy_loss_ratio)
                .with_entropy_loss_type(config.entropy_loss_type.clone())
                .with_l2_norm(config.codebook_l2_norm)
                .with_show_usage(config.codebook_show_usage)
                .with_usage_capacity(config.codebook_usage_capacity);
        quantizer_config.entropy_temperature = config.entropy_temperature;

        let stream = || -> Result<LatentStream<B>, TritokError> {
            Ok(LatentStream {
                quant_conv: conv1x1(config.z_channels, config.codebook_embed_dim, device),
                quantizer: quantizer_config.init(device)?,
            })
        };
        let streams = Triple::new(stream()?, stream()?, stream()?);
        for name in Triple::<()>::NAMES {
            tracing::info!(
                stream = name,
                size = config.codebook_size,
                dim = config.codebook_embed_dim,
                "codebook initialized"
            );
        }

        let grid_size = config.backbone.image_size / factor;
        let semantic_heads = if config.with_clip_supervision {
            let heads = &config.semantic_heads;
            tracing::info!(
                mid_dim = heads.mid_dim,
                high_dim = heads.high_dim,
                grid_size,
                "semantic feature prediction enabled"
            );
            let head = |out_dim| {
                FeatPredHead::new(
                    config.codebook_embed_dim,
                    out_dim,
                    grid_size,
                    heads.num_layers,
                    heads.num_heads,
                    device,
                )
            };
            Some(SemanticHeads {
                mid: head(heads.mid_dim),
                high: head(heads.high_dim),
            })
        } else {
            tracing::info!("semantic feature prediction disabled");
            None
        };
        if config.with_disentanglement {
            tracing::info!(ratio = config.disentanglement_ratio, "disentanglement enabled");
        } else {
            tracing::info!("disentanglement disabled");
        }

        Ok(Self {
            encoder,
            decoder,
            streams,
            post_quant_conv: conv1x1(3 * config.codebook_embed_dim, config.z_channels, device),
            semantic_heads,
            config: config.clone(),
            mode: Mode::default(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Switch all three quantizers to `mode`.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        for stream in self.streams.each_mut().into_array() {
            stream.quantizer.set_mode(mode);
        }
    }

    /// Fraction of each codebook seen in its recent usage history.
    ///
    /// Zero for streams without usage tracking.
    pub fn codebook_usage(&self) -> Triple<f32> {
        self.streams.each_ref().map(|stream| {
            stream
                .quantizer
                .usage()
                .map_or(0.0, |tracker| tracker.usage())
        })
    }

    /// Encode and quantize an image `(B, 3, H, W)`.
    ///
    /// # Errors
    ///
    /// Propagates backbone and quantizer failures.
    pub fn encode(&mut self, image: Tensor<B, 4>) -> anyhow::Result<EncodeOutput<B>> {
        let _span = perf::span(Metric::ModelEncode);
        perf::add_count(Metric::Images, image.dims()[0] as u64);
        let features = self.encoder.encode(image)?;
        let z_channels = self.config.z_channels;
        let outputs = self
            .streams
            .each_mut()
            .zip(features)
            .try_map(|(stream, h)| -> anyhow::Result<QuantizerOutput<B>> {
                let channels = h.dims()[1];
                if channels != z_channels {
                    return Err(TritokError::ChannelMismatch {
                        expected: z_channels,
                        actual: channels,
                    }
                    .into());
                }
                stream.quantize(h)
            })?;
        for (stream, output) in outputs.each_ref().into_array().into_iter().enumerate() {
            let positions: usize = output.info.indices.dims().iter().product();
            perf::record_stream(stream, positions as u64, output.losses.codebook_usage);
        }

        let Triple {
            vis,
            sem_mid,
            sem_high,
        } = outputs;
        Ok(EncodeOutput {
            quant: Triple::new(vis.z_q, sem_mid.z_q, sem_high.z_q),
            info: Triple::new(vis.info, sem_mid.info, sem_high.info),
            losses: Triple::new(vis.losses, sem_mid.losses, sem_high.losses),
        })
    }

    /// Decode a concatenated quantized map `(B, 3 * dim, h, w)`.
    pub fn decode(&self, quant: Tensor<B, 4>) -> anyhow::Result<Tensor<B, 4>> {
        let _span = perf::span(Metric::ModelDecode);
        let expected = 3 * self.config.codebook_embed_dim;
        let channels = quant.dims()[1];
        if channels != expected {
            return Err(TritokError::ChannelMismatch {
                expected,
                actual: channels,
            }
            .into());
        }
        self.decoder.decode(self.post_quant_conv.forward(quant))
    }

    /// Concatenate the three quantized maps and decode them.
    ///
    /// # Errors
    ///
    /// Fails when the maps disagree in batch or spatial size.
    pub fn decode_streams(&self, quant: Triple<Tensor<B, 4>>) -> anyhow::Result<Tensor<B, 4>> {
        let [vis, sem_mid, sem_high] = quant.into_array();
        let [batch, _, height, width] = vis.dims();
        for other in [&sem_mid, &sem_high] {
            let [other_batch, _, other_height, other_width] = other.dims();
            if (other_batch, other_height, other_width) != (batch, height, width) {
                return Err(TritokError::ShapeMismatch(format!(
                    "stream maps {:?} and {:?} cannot be concatenated",
                    vis.dims(),
                    other.dims()
                ))
                .into());
            }
        }
        self.decode(Tensor::cat(vec![vis, sem_mid, sem_high], 1))
    }

    /// Decode directly from flat per-stream indices.
    ///
    /// `shapes` follow `layout` as in
    /// [`VectorQuantizer::get_codebook_entry`].
    /// No losses are computed and usage histories are untouched.
    pub fn decode_code(
        &self,
        indices: Triple<Tensor<B, 1, Int>>,
        shapes: Triple<[usize; 4]>,
        layout: Layout,
    ) -> anyhow::Result<Tensor<B, 4>> {
        let _span = perf::span(Metric::ModelDecodeCode);
        let quant = self
            .streams
            .each_ref()
            .zip(indices.zip(shapes))
            .try_map(|(stream, (indices, shape))| {
                let entry = stream
                    .quantizer
                    .get_codebook_entry(indices, shape, layout)?;
                anyhow::Ok(match layout {
                    Layout::ChannelFirst => entry,
                    Layout::ChannelLast => entry.permute([0, 3, 1, 2]),
                })
            })?;
        self.decode_streams(quant)
    }

    /// Decode from `(B, h, w)` index maps, as produced in
    /// [`QuantizerInfo::indices`].
    pub fn decode_index_maps(
        &self,
        indices: Triple<Tensor<B, 3, Int>>,
    ) -> anyhow::Result<Tensor<B, 4>> {
        let _span = perf::span(Metric::ModelDecodeCode);
        let quant = self
            .streams
            .each_ref()
            .zip(indices)
            .try_map(|(stream, map)| stream.quantizer.decode_index_map(map))?;
        self.decode_streams(quant)
    }

    /// Average of the three pairwise disentanglement terms, or zero when
    /// disabled.
    pub fn disentangle_loss(&self, quant: &Triple<Tensor<B, 4>>) -> anyhow::Result<Tensor<B, 1>> {
        if !self.config.with_disentanglement {
            return Ok(Tensor::zeros([1], &quant.vis.device()));
        }
        let _span = perf::span(Metric::DisentangleLoss);
        let ratio = self.config.disentanglement_ratio;
        let vis_mid = compute_disentangle_loss(quant.vis.clone(), quant.sem_mid.clone(), ratio)?;
        let vis_high = compute_disentangle_loss(quant.vis.clone(), quant.sem_high.clone(), ratio)?;
        let mid_high =
            compute_disentangle_loss(quant.sem_mid.clone(), quant.sem_high.clone(), ratio)?;
        Ok(vis_mid.add(vis_high).add(mid_high).div_scalar(3.0))
    }

    /// Full pass: encode, quantize, predict semantic features, decode.
    pub fn forward(&mut self, image: Tensor<B, 4>) -> anyhow::Result<ForwardOutput<B>> {
        let _span = perf::span(Metric::ModelForward);
        let EncodeOutput { quant, losses, .. } = self.encode(image)?;

        let (mid_semantic_prediction, high_semantic_prediction) = match &self.semantic_heads {
            Some(heads) => (
                Some(heads.mid.forward(quant.sem_mid.clone())?),
                Some(heads.high.forward(quant.sem_high.clone())?),
            ),
            None => (None, None),
        };
        let disentangle_loss = self.disentangle_loss(&quant)?;
        let reconstruction = self.decode_streams(quant)?;

        Ok(ForwardOutput {
            reconstruction,
            losses,
            disentangle_loss,
            mid_semantic_prediction,
            high_semantic_prediction,
        })
    }
}
