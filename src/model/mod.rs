//! Model-level composition of the three latent streams.

pub mod tritok;
