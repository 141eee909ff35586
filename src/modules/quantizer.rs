//! Nearest-neighbor vector quantizer with straight-through gradients.
//!
//! One instance exists per latent stream. Each owns its codebook and usage
//! history; nothing is shared between instances.

use crate::config::DEFAULT_USAGE_CAPACITY;
use crate::error::TritokError;
use crate::modules::codebook::Codebook;
use crate::modules::losses::{compute_entropy_loss, DEFAULT_ENTROPY_TEMPERATURE};
use crate::modules::ops::{flatten_positions, l2_normalize, unflatten_positions};
use crate::modules::straight_through::StraightThrough;
use crate::modules::usage::UsageTracker;
use crate::perf::{self, Metric};
use burn::tensor::{backend::Backend, Int, Tensor};

/// Operating mode shared by every quantizer of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Losses, entropy regularization and usage tracking are active.
    #[default]
    Train,
    /// Losses and usage tracking are suppressed.
    Eval,
}

impl Mode {
    pub fn is_training(self) -> bool {
        self == Mode::Train
    }
}

/// Memory layout of a reconstructed quantized map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    /// `(B, C, H, W)`
    #[default]
    ChannelFirst,
    /// `(B, H, W, C)`
    ChannelLast,
}

/// Hyperparameters for a [`VectorQuantizer`].
#[derive(Debug, Clone)]
pub struct VectorQuantizerConfig {
    /// Number of codebook entries.
    pub codebook_size: usize,
    /// Embedding width.
    pub embed_dim: usize,
    /// Commitment loss weight.
    pub beta: f32,
    /// Entropy loss weight.
    pub entropy_loss_ratio: f32,
    /// Probability normalization used by the entropy loss.
    pub entropy_loss_type: String,
    /// Softmax temperature used by the entropy loss.
    pub entropy_temperature: f32,
    /// Match in unit-normalized space.
    pub l2_norm: bool,
    /// Track codebook usage in training mode.
    pub show_usage: bool,
    /// Slots in the usage history.
    pub usage_capacity: usize,
}

impl VectorQuantizerConfig {
    /// Config with default hyperparameters for everything but the table shape.
    pub fn new(codebook_size: usize, embed_dim: usize) -> Self {
        Self {
            codebook_size,
            embed_dim,
            beta: 0.25,
            entropy_loss_ratio: 0.0,
            entropy_loss_type: "softmax".to_string(),
            entropy_temperature: DEFAULT_ENTROPY_TEMPERATURE,
            l2_norm: true,
            show_usage: true,
            usage_capacity: DEFAULT_USAGE_CAPACITY,
        }
    }

    pub fn with_beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }

    pub fn with_entropy_loss_ratio(mut self, ratio: f32) -> Self {
        self.entropy_loss_ratio = ratio;
        self
    }

    pub fn with_entropy_loss_type(mut self, loss_type: impl Into<String>) -> Self {
        self.entropy_loss_type = loss_type.into();
        self
    }

    pub fn with_l2_norm(mut self, l2_norm: bool) -> Self {
        self.l2_norm = l2_norm;
        self
    }

    pub fn with_show_usage(mut self, show_usage: bool) -> Self {
        self.show_usage = show_usage;
        self
    }

    pub fn with_usage_capacity(mut self, capacity: usize) -> Self {
        self.usage_capacity = capacity;
        self
    }

    /// Build a quantizer with a freshly initialized codebook.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<VectorQuantizer<B>, TritokError> {
        check_table_shape(self.codebook_size, self.embed_dim)?;
        let codebook = Codebook::new(self.codebook_size, self.embed_dim, self.l2_norm, device);
        VectorQuantizer::new(self.clone(), codebook)
    }
}

fn check_table_shape(size: usize, dim: usize) -> Result<(), TritokError> {
    if size == 0 || dim == 0 {
        return Err(TritokError::InvalidConfig(format!(
            "codebook must be non-empty, got {size} x {dim}"
        )));
    }
    Ok(())
}

/// Training-mode losses for one stream. All fields are `None` in eval mode.
#[derive(Debug, Clone)]
pub struct QuantizerLosses<B: Backend> {
    /// Pulls codebook vectors toward the (detached) encoder outputs.
    pub embedding_loss: Option<Tensor<B, 1>>,
    /// Pulls encoder outputs toward their (detached) codes, scaled by beta.
    pub commitment_loss: Option<Tensor<B, 1>>,
    /// Scaled entropy-balancing penalty.
    pub entropy_loss: Option<Tensor<B, 1>>,
    /// Fraction of the codebook seen in the recent window (0 when untracked).
    pub codebook_usage: f32,
}

impl<B: Backend> QuantizerLosses<B> {
    fn absent() -> Self {
        Self {
            embedding_loss: None,
            commitment_loss: None,
            entropy_loss: None,
            codebook_usage: 0.0,
        }
    }

    /// Sum of the present loss terms, if any.
    pub fn total(&self) -> Option<Tensor<B, 1>> {
        [
            self.embedding_loss.clone(),
            self.commitment_loss.clone(),
            self.entropy_loss.clone(),
        ]
        .into_iter()
        .flatten()
        .reduce(|acc, term| acc.add(term))
    }
}

/// Auxiliary outputs of a quantizer pass.
#[derive(Debug, Clone)]
pub struct QuantizerInfo<B: Backend> {
    /// Reserved; not computed.
    pub perplexity: Option<Tensor<B, 1>>,
    /// Reserved; not computed.
    pub min_encodings: Option<Tensor<B, 2>>,
    /// Selected code per position, `(B, H, W)`.
    pub indices: Tensor<B, 3, Int>,
}

/// Result of [`VectorQuantizer::forward`].
#[derive(Debug, Clone)]
pub struct QuantizerOutput<B: Backend> {
    /// Quantized map `(B, C, H, W)`; values are codebook rows.
    pub z_q: Tensor<B, 4>,
    pub losses: QuantizerLosses<B>,
    pub info: QuantizerInfo<B>,
}

/// Vector quantizer owning one codebook and its usage history.
#[derive(Debug, Clone)]
pub struct VectorQuantizer<B: Backend> {
    pub codebook: Codebook<B>,
    config: VectorQuantizerConfig,
    usage: Option<UsageTracker>,
    mode: Mode,
}

impl<B: Backend> VectorQuantizer<B> {
    /// Create a quantizer around an existing codebook.
    ///
    /// The codebook shape overrides `config.codebook_size` / `config.embed_dim`.
    ///
    /// # Errors
    ///
    /// Fails on an empty codebook or a zero usage capacity.
    pub fn new(
        mut config: VectorQuantizerConfig,
        codebook: Codebook<B>,
    ) -> Result<Self, TritokError> {
        check_table_shape(codebook.size(), codebook.dim())?;
        config.codebook_size = codebook.size();
        config.embed_dim = codebook.dim();
        let usage = if config.show_usage {
            Some(UsageTracker::new(config.usage_capacity, config.codebook_size)?)
        } else {
            None
        };
        Ok(Self {
            codebook,
            config,
            usage,
            mode: Mode::default(),
        })
    }

    pub fn config(&self) -> &VectorQuantizerConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Usage history, present when usage tracking is enabled.
    pub fn usage(&self) -> Option<&UsageTracker> {
        self.usage.as_ref()
    }

    /// Codebook as used for matching (normalized when `l2_norm` is set).
    pub fn embedding(&self) -> Tensor<B, 2> {
        self.codebook.read(self.config.l2_norm)
    }

    /// Quantize a `(B, C, H, W)` feature map.
    ///
    /// Takes `&mut self` because training-mode passes update the usage
    /// history.
    ///
    /// # Errors
    ///
    /// Fails when `C` differs from the embedding width, when the map has no
    /// positions, or when the configured entropy loss kind is unsupported.
    /// A failed pass leaves the usage history untouched.
    pub fn forward(&mut self, z: Tensor<B, 4>) -> anyhow::Result<QuantizerOutput<B>> {
        let _span = perf::span(Metric::QuantizerForward);
        let [batch, channels, height, width] = z.dims();
        if channels != self.config.embed_dim {
            return Err(TritokError::ChannelMismatch {
                expected: self.config.embed_dim,
                actual: channels,
            }
            .into());
        }
        let positions = batch * height * width;
        if positions == 0 {
            return Err(TritokError::ShapeMismatch(format!(
                "cannot quantize an empty map {:?}",
                [batch, channels, height, width]
            ))
            .into());
        }
        perf::add_count(Metric::QuantizedPositions, positions as u64);

        let mut z_flat = flatten_positions(z);
        let embedding = self.embedding();
        if self.config.l2_norm {
            z_flat = l2_normalize(z_flat, 1);
        }

        let distances = pairwise_sq_distances(z_flat.clone(), embedding.clone());
        let indices = distances.clone().argmin(1).reshape([positions]);
        let quantized = self.codebook.gather(embedding, indices.clone())?;

        let losses = if self.mode.is_training() {
            let entropy_loss = compute_entropy_loss(
                distances.neg(),
                &self.config.entropy_loss_type,
                self.config.entropy_temperature,
            )?
            .mul_scalar(self.config.entropy_loss_ratio);
            let embedding_loss = quantized
                .clone()
                .sub(z_flat.clone().detach())
                .powf_scalar(2.0)
                .mean();
            let commitment_loss = quantized
                .clone()
                .detach()
                .sub(z_flat.clone())
                .powf_scalar(2.0)
                .mean()
                .mul_scalar(self.config.beta);
            let usage = self.record_usage(&indices)?;
            QuantizerLosses {
                embedding_loss: Some(embedding_loss),
                commitment_loss: Some(commitment_loss),
                entropy_loss: Some(entropy_loss),
                codebook_usage: usage,
            }
        } else {
            QuantizerLosses::absent()
        };

        let z_q = StraightThrough::new(quantized, z_flat).into_tensor();
        let z_q = unflatten_positions(z_q, [batch, channels, height, width]);

        Ok(QuantizerOutput {
            z_q,
            losses,
            info: QuantizerInfo {
                perplexity: None,
                min_encodings: None,
                indices: indices.reshape([batch, height, width]),
            },
        })
    }

    /// Rebuild a quantized map from flat indices without losses or usage
    /// updates.
    ///
    /// `shape` is `(B, C, H, W)` for [`Layout::ChannelFirst`] and
    /// `(B, H, W, C)` for [`Layout::ChannelLast`].
    ///
    /// # Errors
    ///
    /// Fails on out-of-range indices, on an index count different from
    /// `B*H*W`, or on a channel entry different from the embedding width.
    pub fn get_codebook_entry(
        &self,
        indices: Tensor<B, 1, Int>,
        shape: [usize; 4],
        layout: Layout,
    ) -> anyhow::Result<Tensor<B, 4>> {
        let [batch, height, width, channels] = match layout {
            Layout::ChannelFirst => [shape[0], shape[2], shape[3], shape[1]],
            Layout::ChannelLast => shape,
        };
        if channels != self.config.embed_dim {
            return Err(TritokError::ChannelMismatch {
                expected: self.config.embed_dim,
                actual: channels,
            }
            .into());
        }
        let count = indices.dims()[0];
        if count != batch * height * width {
            return Err(TritokError::ShapeMismatch(format!(
                "{count} indices cannot fill shape {shape:?}"
            ))
            .into());
        }

        let rows = self.codebook.gather(self.embedding(), indices)?;
        Ok(match layout {
            Layout::ChannelFirst => unflatten_positions(rows, [batch, channels, height, width]),
            Layout::ChannelLast => rows.reshape(shape),
        })
    }

    /// Look up a `(B, H, W)` index map into a `(B, C, H, W)` quantized map.
    pub fn decode_index_map(&self, indices: Tensor<B, 3, Int>) -> anyhow::Result<Tensor<B, 4>> {
        let [batch, height, width] = indices.dims();
        let flat = indices.reshape([batch * height * width]);
        self.get_codebook_entry(
            flat,
            [batch, self.config.embed_dim, height, width],
            Layout::ChannelFirst,
        )
    }

    fn record_usage(&mut self, indices: &Tensor<B, 1, Int>) -> anyhow::Result<f32> {
        let Some(tracker) = self.usage.as_mut() else {
            return Ok(0.0);
        };
        let codes: Vec<i64> = indices.to_data().iter::<i64>().collect();
        tracker.record(&codes)?;
        tracing::debug!(
            distinct = tracker.distinct(),
            usage = tracker.usage(),
            "codebook usage updated"
        );
        Ok(tracker.usage())
    }
}

/// Squared Euclidean distances `(N, K)` via `|z|^2 + |e|^2 - 2 z.e`.
pub fn pairwise_sq_distances<B: Backend>(
    inputs: Tensor<B, 2>,
    embedding: Tensor<B, 2>,
) -> Tensor<B, 2> {
    let codes = embedding.dims()[0];
    let input_sq = inputs.clone().powf_scalar(2.0).sum_dim(1);
    let embed_sq = embedding
        .clone()
        .powf_scalar(2.0)
        .sum_dim(1)
        .reshape([1, codes]);
    let cross = inputs.matmul(embedding.transpose());
    input_sq.add(embed_sq).sub(cross.mul_scalar(2.0))
}
