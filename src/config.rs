//! Configuration types for the tokenizer architecture.
//!
//! Configurations are typically built from a [`Preset`] or loaded from YAML
//! files using [`load_config`]. Every field has a default, so a YAML file only
//! needs to list what it overrides.

use crate::error::TritokError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Default capacity of the per-quantizer usage history.
pub const DEFAULT_USAGE_CAPACITY: usize = 65536;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Factorized transformer adapter placed at the top of each encoder head.
pub struct AdapterConfig {
    /// Token width. Defaults to the encoder's last-stage channel count.
    #[serde(default)]
    pub width: Option<usize>,
    /// Number of residual attention blocks.
    #[serde(default = "default_adapter_layers")]
    pub num_layers: usize,
    /// Attention heads per block.
    #[serde(default = "default_heads")]
    pub num_heads: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            width: None,
            num_layers: default_adapter_layers(),
            num_heads: default_heads(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Convolutional backbone shape parameters.
pub struct BackboneConfig {
    /// Base channel count multiplied by the per-stage multipliers.
    #[serde(default = "default_base_channels")]
    pub base_channels: usize,
    /// Residual blocks per encoder stage (the decoder uses one more).
    #[serde(default = "default_num_res_blocks")]
    pub num_res_blocks: usize,
    /// Feature normalization kind ("group").
    #[serde(default = "default_norm_type")]
    pub norm_type: String,
    /// Square input resolution the positional embeddings are sized for.
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    /// Per-head transformer adapter.
    #[serde(default)]
    pub adapter: AdapterConfig,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            base_channels: default_base_channels(),
            num_res_blocks: default_num_res_blocks(),
            norm_type: default_norm_type(),
            image_size: default_image_size(),
            adapter: AdapterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Feature-prediction heads used for semantic supervision.
pub struct SemanticHeadConfig {
    /// Output width of the mid-level prediction head.
    #[serde(default = "default_mid_dim")]
    pub mid_dim: usize,
    /// Output width of the high-level prediction head.
    #[serde(default = "default_high_dim")]
    pub high_dim: usize,
    /// Transformer blocks per head.
    #[serde(default = "default_head_layers")]
    pub num_layers: usize,
    /// Attention heads per block.
    #[serde(default = "default_heads")]
    pub num_heads: usize,
}

impl Default for SemanticHeadConfig {
    fn default() -> Self {
        Self {
            mid_dim: default_mid_dim(),
            high_dim: default_high_dim(),
            num_layers: default_head_layers(),
            num_heads: default_heads(),
        }
    }
}

/// Top-level tokenizer configuration.
///
/// # Example YAML
///
/// ```yaml
/// codebook_size: 4096
/// codebook_embed_dim: 8
/// encoder_ch_mult: [1, 2, 2, 4]
/// decoder_ch_mult: [1, 2, 2, 4]
/// with_disentanglement: true
/// disentanglement_ratio: 0.1
/// backbone:
///   base_channels: 64
///   image_size: 128
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Number of entries in each of the three codebooks.
    #[serde(default = "default_codebook_size")]
    pub codebook_size: usize,
    /// Width of each codebook vector.
    #[serde(default = "default_embed_dim")]
    pub codebook_embed_dim: usize,
    /// Unit-normalize inputs and codebook rows before matching.
    #[serde(default = "default_true")]
    pub codebook_l2_norm: bool,
    /// Track codebook usage in training mode.
    #[serde(default = "default_true")]
    pub codebook_show_usage: bool,
    /// Capacity of the usage history.
    #[serde(default = "default_usage_capacity")]
    pub codebook_usage_capacity: usize,
    /// Commitment loss weight.
    #[serde(default = "default_beta")]
    pub commit_loss_beta: f32,
    /// Entropy loss weight.
    #[serde(default)]
    pub entropy_loss_ratio: f32,
    /// Probability normalization for the entropy loss.
    #[serde(default = "default_entropy_loss_type")]
    pub entropy_loss_type: String,
    /// Softmax temperature for the entropy loss.
    #[serde(default = "default_entropy_temperature")]
    pub entropy_temperature: f32,
    /// Encoder channel multipliers, one per resolution stage.
    #[serde(default = "default_ch_mult_16")]
    pub encoder_ch_mult: Vec<usize>,
    /// Decoder channel multipliers, one per resolution stage.
    #[serde(default = "default_ch_mult_16")]
    pub decoder_ch_mult: Vec<usize>,
    /// Channel count of the backbone latent.
    #[serde(default = "default_z_channels")]
    pub z_channels: usize,
    /// Dropout probability inside residual blocks.
    #[serde(default)]
    pub dropout_p: f64,
    /// Build the semantic feature-prediction heads.
    #[serde(default)]
    pub with_clip_supervision: bool,
    /// Compute the cross-stream disentanglement penalty.
    #[serde(default)]
    pub with_disentanglement: bool,
    /// Weight of the disentanglement penalty.
    #[serde(default)]
    pub disentanglement_ratio: f32,
    /// Backbone shape parameters.
    #[serde(default)]
    pub backbone: BackboneConfig,
    /// Semantic prediction head parameters.
    #[serde(default)]
    pub semantic_heads: SemanticHeadConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            codebook_size: default_codebook_size(),
            codebook_embed_dim: default_embed_dim(),
            codebook_l2_norm: true,
            codebook_show_usage: true,
            codebook_usage_capacity: default_usage_capacity(),
            commit_loss_beta: default_beta(),
            entropy_loss_ratio: 0.0,
            entropy_loss_type: default_entropy_loss_type(),
            entropy_temperature: default_entropy_temperature(),
            encoder_ch_mult: default_ch_mult_16(),
            decoder_ch_mult: default_ch_mult_16(),
            z_channels: default_z_channels(),
            dropout_p: 0.0,
            with_clip_supervision: false,
            with_disentanglement: false,
            disentanglement_ratio: 0.0,
            backbone: BackboneConfig::default(),
            semantic_heads: SemanticHeadConfig::default(),
        }
    }
}

/// Named architecture presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// Four stages, 8x spatial downsampling.
    Vq8,
    /// Five stages, 16x spatial downsampling.
    Vq16,
}

impl Preset {
    pub const ALL: [Preset; 2] = [Preset::Vq8, Preset::Vq16];

    pub fn name(self) -> &'static str {
        match self {
            Preset::Vq8 => "VQ-8",
            Preset::Vq16 => "VQ-16",
        }
    }

    fn ch_mult(self) -> Vec<usize> {
        match self {
            Preset::Vq8 => vec![1, 2, 2, 4],
            Preset::Vq16 => default_ch_mult_16(),
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Preset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('_', "-").as_str() {
            "VQ-8" | "VQ8" => Ok(Preset::Vq8),
            "VQ-16" | "VQ16" => Ok(Preset::Vq16),
            other => anyhow::bail!("Unknown preset {other:?} (expected VQ-8 or VQ-16)"),
        }
    }
}

impl ModelConfig {
    /// Build the configuration of a named preset with default hyperparameters.
    pub fn preset(preset: Preset) -> Self {
        Self {
            encoder_ch_mult: preset.ch_mult(),
            decoder_ch_mult: preset.ch_mult(),
            ..Self::default()
        }
    }

    /// Number of resolution stages in the encoder.
    pub fn num_resolutions(&self) -> usize {
        self.encoder_ch_mult.len()
    }

    /// Spatial downsampling factor implied by the stage count.
    pub fn downsample_factor(&self) -> Result<usize, TritokError> {
        downsample_factor(self.num_resolutions())
    }

    /// Side length of the latent grid for the configured image size.
    pub fn grid_size(&self) -> Result<usize, TritokError> {
        Ok(self.backbone.image_size / self.downsample_factor()?)
    }

    /// Check that the configuration describes a buildable model with the
    /// default backbone.
    ///
    /// # Errors
    ///
    /// Returns the first [`TritokError`] describing an unsupported value.
    pub fn validate(&self) -> Result<(), TritokError> {
        let factor = self.downsample_factor()?;
        if self.decoder_ch_mult.len() != self.encoder_ch_mult.len() {
            return Err(TritokError::InvalidConfig(format!(
                "decoder has {} stages but encoder has {}",
                self.decoder_ch_mult.len(),
                self.encoder_ch_mult.len()
            )));
        }
        if self.backbone.norm_type != "group" {
            return Err(TritokError::UnsupportedNorm(self.backbone.norm_type.clone()));
        }
        self.validate_streams(factor)?;
        let channels = std::iter::once(&1)
            .chain(self.encoder_ch_mult.iter())
            .chain(self.decoder_ch_mult.iter())
            .map(|mult| mult * self.backbone.base_channels);
        for ch in channels {
            if ch == 0 || ch % GROUP_NORM_GROUPS != 0 {
                return Err(TritokError::InvalidConfig(format!(
                    "stage width {ch} must be a positive multiple of {GROUP_NORM_GROUPS}"
                )));
            }
        }
        let adapter_width = self.adapter_width();
        if adapter_width != self.encoder_out_channels() {
            return Err(TritokError::InvalidConfig(format!(
                "adapter width {adapter_width} must equal the encoder output width {}",
                self.encoder_out_channels()
            )));
        }
        if self.backbone.adapter.num_heads == 0
            || adapter_width % self.backbone.adapter.num_heads != 0
        {
            return Err(TritokError::InvalidConfig(format!(
                "adapter width {adapter_width} not divisible by {} heads",
                self.backbone.adapter.num_heads
            )));
        }
        Ok(())
    }

    /// Check the backbone-independent part of the configuration: codebooks,
    /// losses, usage tracking and prediction heads, for a backbone that
    /// downsamples by `factor`.
    ///
    /// # Errors
    ///
    /// Returns the first [`TritokError`] describing an unsupported value.
    pub fn validate_streams(&self, factor: usize) -> Result<(), TritokError> {
        if self.entropy_loss_type != "softmax" {
            return Err(TritokError::UnsupportedEntropyLoss(
                self.entropy_loss_type.clone(),
            ));
        }
        if self.codebook_size == 0 || self.codebook_embed_dim == 0 || self.z_channels == 0 {
            return Err(TritokError::InvalidConfig(
                "codebook size, embedding dim and z channels must be positive".to_string(),
            ));
        }
        if self.codebook_show_usage && self.codebook_usage_capacity == 0 {
            return Err(TritokError::InvalidConfig(
                "usage capacity must be positive when usage tracking is enabled".to_string(),
            ));
        }
        if factor == 0 || self.backbone.image_size % factor != 0 {
            return Err(TritokError::InvalidConfig(format!(
                "image size {} is not divisible by the downsample factor {factor}",
                self.backbone.image_size
            )));
        }
        if self.with_clip_supervision {
            let heads = self.semantic_heads.num_heads;
            for dim in [self.semantic_heads.mid_dim, self.semantic_heads.high_dim] {
                if heads == 0 || dim % heads != 0 {
                    return Err(TritokError::InvalidConfig(format!(
                        "prediction head width {dim} not divisible by {heads} heads"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Channel count after the last encoder stage.
    pub fn encoder_out_channels(&self) -> usize {
        self.backbone.base_channels * self.encoder_ch_mult.last().copied().unwrap_or(1)
    }

    /// Width of the factorized adapters.
    pub fn adapter_width(&self) -> usize {
        self.backbone
            .adapter
            .width
            .unwrap_or_else(|| self.encoder_out_channels())
    }
}

/// Group count used by every group normalization in the backbone.
pub const GROUP_NORM_GROUPS: usize = 32;

/// Map a stage count to its spatial downsampling factor.
pub fn downsample_factor(num_resolutions: usize) -> Result<usize, TritokError> {
    match num_resolutions {
        4 => Ok(8),
        5 => Ok(16),
        other => Err(TritokError::UnsupportedStageCount(other)),
    }
}

/// Load a model configuration from a YAML file.
///
/// # Errors
///
/// Returns an error if the file doesn't exist or contains invalid YAML.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<ModelConfig> {
    let path = path.as_ref();
    if !path.exists() {
        anyhow::bail!("Config file not found: {}", path.display());
    }

    let data = fs::read_to_string(path)?;
    let config: ModelConfig = serde_yaml::from_str(&data)?;
    Ok(config)
}

fn default_codebook_size() -> usize {
    16384
}

fn default_embed_dim() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_usage_capacity() -> usize {
    DEFAULT_USAGE_CAPACITY
}

fn default_beta() -> f32 {
    0.25
}

fn default_entropy_loss_type() -> String {
    "softmax".to_string()
}

fn default_entropy_temperature() -> f32 {
    0.01
}

fn default_ch_mult_16() -> Vec<usize> {
    vec![1, 1, 2, 2, 4]
}

fn default_z_channels() -> usize {
    256
}

fn default_base_channels() -> usize {
    128
}

fn default_num_res_blocks() -> usize {
    2
}

fn default_norm_type() -> String {
    "group".to_string()
}

fn default_image_size() -> usize {
    256
}

fn default_adapter_layers() -> usize {
    6
}

fn default_heads() -> usize {
    8
}

fn default_mid_dim() -> usize {
    384
}

fn default_high_dim() -> usize {
    768
}

fn default_head_layers() -> usize {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_map_to_downsample_factors() {
        assert_eq!(ModelConfig::preset(Preset::Vq8).downsample_factor(), Ok(8));
        assert_eq!(ModelConfig::preset(Preset::Vq16).downsample_factor(), Ok(16));
        assert_eq!(ModelConfig::preset(Preset::Vq16).grid_size(), Ok(16));
    }

    #[test]
    fn preset_names_parse() {
        assert_eq!("VQ-8".parse::<Preset>().unwrap(), Preset::Vq8);
        assert_eq!("vq16".parse::<Preset>().unwrap(), Preset::Vq16);
        assert!("VQ-32".parse::<Preset>().is_err());
    }

    #[test]
    fn default_config_is_valid() {
        ModelConfig::default().validate().expect("valid");
        assert_eq!(ModelConfig::default().adapter_width(), 512);
    }

    #[test]
    fn three_stages_are_rejected() {
        let config = ModelConfig {
            encoder_ch_mult: vec![1, 2, 4],
            decoder_ch_mult: vec![1, 2, 4],
            ..ModelConfig::default()
        };
        assert_eq!(config.validate(), Err(TritokError::UnsupportedStageCount(3)));
    }

    #[test]
    fn batch_norm_is_rejected() {
        let mut config = ModelConfig::default();
        config.backbone.norm_type = "batch".to_string();
        assert_eq!(
            config.validate(),
            Err(TritokError::UnsupportedNorm("batch".to_string()))
        );
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = "codebook_size: 32\nbackbone:\n  base_channels: 32\n";
        let config: ModelConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.codebook_size, 32);
        assert_eq!(config.backbone.base_channels, 32);
        assert_eq!(config.codebook_embed_dim, 8);
        assert_eq!(config.backbone.adapter.num_layers, 6);
        assert!(config.codebook_l2_norm);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = "codebook_sise: 32\n";
        assert!(serde_yaml::from_str::<ModelConfig>(yaml).is_err());
    }
}
