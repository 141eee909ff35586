//! Building blocks of the tokenizer.
//!
//! The quantization path (codebook, usage history, straight-through estimator,
//! losses, quantizer) is backbone-agnostic. The convolutional blocks, adapters
//! and default encoder/decoder form the pixel-space backbone.

pub mod adapter;
pub mod backbone;
pub mod blocks;
pub mod codebook;
pub mod losses;
pub mod ops;
pub mod quantizer;
pub mod straight_through;
pub mod triple;
pub mod usage;
