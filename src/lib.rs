//! # tritok - Triple-Stream Discrete Visual Tokenizer
//!
//! Turns images into three grids of discrete codes and back. One encoder
//! produces three latent maps (visual detail, mid-level semantics and
//! high-level semantics). Each is quantized against its own learned codebook
//! and the three quantized maps are jointly decoded into pixels.
//!
//! ## Architecture Overview
//!
//! 1. **Backbone** ([`FeatureEncoder`] / [`PixelDecoder`]): the default
//!    [`Encoder`] is a residual convolutional network with spatial attention
//!    and one transformer adapter head per stream; [`Decoder`] mirrors it.
//!
//! 2. **Quantization** ([`VectorQuantizer`]): nearest-neighbor lookup in an
//!    optionally unit-normalized codebook, with straight-through gradients,
//!    commitment/embedding/entropy losses and a fixed-capacity codebook usage
//!    history.
//!
//! 3. **Orchestration** ([`TriTokModel`]): channel projections around the three
//!    quantizers, stream concatenation, decoding from codes, the cross-stream
//!    disentanglement penalty and optional semantic feature prediction.
//!
//! ## Quick Start
//!
//! ```no_run
//! use burn::tensor::{Distribution, Tensor};
//! use burn_ndarray::{NdArray, NdArrayDevice};
//! use tritok::{Mode, ModelConfig, Preset, TriTokModel};
//!
//! let config = ModelConfig::preset(Preset::Vq16);
//! let device = NdArrayDevice::default();
//! let mut model = TriTokModel::<NdArray<f32>>::from_config(&config, &device).unwrap();
//! model.set_mode(Mode::Eval);
//!
//! let image = Tensor::<NdArray<f32>, 4>::random([1, 3, 256, 256], Distribution::Default, &device);
//! let encoded = model.encode(image).unwrap();
//! let codes = encoded.info.map(|info| info.indices);
//! let reconstruction = model.decode_index_maps(codes).unwrap();
//! assert_eq!(reconstruction.dims(), [1, 3, 256, 256]);
//! ```
//!
//! ## Configuration
//!
//! Models are described by [`ModelConfig`], built from a [`Preset`] (`VQ-8`,
//! `VQ-16`) or loaded from YAML with [`load_config`].

pub mod config;
pub mod error;
pub mod perf;

// Exposed for integration tests and custom backbones.
#[doc(hidden)]
pub mod model;
#[doc(hidden)]
pub mod modules;

pub use config::{load_config, ModelConfig, Preset};
pub use error::TritokError;
pub use model::tritok::{EncodeOutput, ForwardOutput, TriTokModel};
pub use modules::backbone::{Decoder, Encoder, FeatureEncoder, PixelDecoder};
pub use modules::codebook::Codebook;
pub use modules::quantizer::{Layout, Mode, VectorQuantizer, VectorQuantizerConfig};
pub use modules::triple::Triple;
pub use modules::usage::UsageTracker;
