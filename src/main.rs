//! Command-line interface for the triple-stream tokenizer.
//!
//! The CLI builds models from presets or YAML configs, prints architecture
//! summaries, and runs synthetic encode/decode passes on randomly initialized
//! weights.

use anyhow::Result;
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, ElementConversion, Int, Tensor};
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tritok::config::{load_config, ModelConfig, Preset};
use tritok::perf;
use tritok::{Layout, Mode, TriTokModel, Triple};

/// Top-level CLI options.
#[derive(Parser)]
#[command(name = "tritok")]
#[command(about = "Triple-stream discrete visual tokenizer", long_about = None)]
struct Cli {
    /// Print performance summary at the end of the run.
    #[arg(long, short, global = true)]
    verbose: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Where the model configuration comes from.
#[derive(Args, Clone)]
struct ModelArgs {
    /// Named preset (VQ-8 or VQ-16).
    #[arg(long, default_value = "VQ-16")]
    preset: Preset,
    /// YAML config file; takes precedence over --preset.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the square input resolution.
    #[arg(long)]
    image_size: Option<usize>,
}

impl ModelArgs {
    fn resolve(&self) -> Result<ModelConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ModelConfig::preset(self.preset),
        };
        if let Some(image_size) = self.image_size {
            config.backbone.image_size = image_size;
        }
        config.validate()?;
        Ok(config)
    }
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// List the named presets.
    Presets,
    /// Print the resolved configuration and derived shapes.
    Summary {
        #[command(flatten)]
        model: ModelArgs,
        /// Print the resolved configuration as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Encode and decode a random image batch.
    Roundtrip {
        #[command(flatten)]
        model: ModelArgs,
        /// Number of images in the batch.
        #[arg(long, default_value_t = 1)]
        batch: usize,
        /// Run in eval mode (no losses, no usage tracking).
        #[arg(long)]
        eval: bool,
    },
    /// Decode a latent grid filled with a single code in every stream.
    DecodeCode {
        #[command(flatten)]
        model: ModelArgs,
        /// Code index used at every position.
        #[arg(long, default_value_t = 0)]
        code: i64,
        /// Number of images in the batch.
        #[arg(long, default_value_t = 1)]
        batch: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tritok=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let verbose = cli.verbose;
    let device = NdArrayDevice::default();

    match cli.command {
        Commands::Presets => {
            for preset in Preset::ALL {
                let config = ModelConfig::preset(preset);
                println!(
                    "{preset}: ch_mult={:?} downsample={}x",
                    config.encoder_ch_mult,
                    config.downsample_factor()?
                );
            }
        }
        Commands::Summary { model, json } => {
            let config = model.resolve()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print_summary(&config)?;
            }
        }
        Commands::Roundtrip { model, batch, eval } => {
            let config = model.resolve()?;
            run_roundtrip::<NdArray<f32>>(&config, batch, eval, &device)?;
        }
        Commands::DecodeCode { model, code, batch } => {
            let config = model.resolve()?;
            run_decode_code::<NdArray<f32>>(&config, code, batch, &device)?;
        }
    }

    if verbose {
        eprintln!("{}", perf::report());
    }
    Ok(())
}

fn print_summary(config: &ModelConfig) -> Result<()> {
    let grid = config.grid_size()?;
    println!("image size:        {}", config.backbone.image_size);
    println!("downsample factor: {}", config.downsample_factor()?);
    println!("latent grid:       {grid}x{grid}");
    println!(
        "codebooks:         3 x [{} x {}] (l2_norm={})",
        config.codebook_size, config.codebook_embed_dim, config.codebook_l2_norm
    );
    println!("z channels:        {}", config.z_channels);
    println!("tokens per image:  {}", 3 * grid * grid);
    println!("semantic heads:    {}", config.with_clip_supervision);
    println!(
        "disentanglement:   {} (ratio {})",
        config.with_disentanglement, config.disentanglement_ratio
    );
    Ok(())
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f32 {
    tensor.into_scalar().elem::<f32>()
}

fn run_roundtrip<B: Backend>(
    config: &ModelConfig,
    batch: usize,
    eval: bool,
    device: &B::Device,
) -> Result<()> {
    let mut model = TriTokModel::<B>::from_config(config, device)?;
    if eval {
        model.set_mode(Mode::Eval);
    }
    let size = config.backbone.image_size;
    let image = Tensor::<B, 4>::random([batch, 3, size, size], Distribution::Uniform(-1.0, 1.0), device);

    let output = model.forward(image.clone())?;
    let mse = scalar(output.reconstruction.clone().sub(image).powf_scalar(2.0).mean());
    println!("reconstruction: {:?} mse={mse:.6}", output.reconstruction.dims());

    let usage = model.codebook_usage();
    let streams = output.losses.zip(usage);
    for (name, (losses, usage)) in Triple::<()>::NAMES.into_iter().zip(streams.into_array()) {
        match losses.total() {
            Some(total) => println!("{name:>8}: loss={:.6} usage={usage:.4}", scalar(total)),
            None => println!("{name:>8}: loss=n/a usage={usage:.4}"),
        }
    }
    println!("disentangle: {:.6}", scalar(output.disentangle_loss));
    Ok(())
}

fn run_decode_code<B: Backend>(
    config: &ModelConfig,
    code: i64,
    batch: usize,
    device: &B::Device,
) -> Result<()> {
    let mut model = TriTokModel::<B>::from_config(config, device)?;
    model.set_mode(Mode::Eval);
    let grid = config.grid_size()?;
    let indices = Triple::splat(Tensor::<B, 1, Int>::full([batch * grid * grid], code, device));
    let shapes = Triple::splat([batch, config.codebook_embed_dim, grid, grid]);

    let image = model.decode_code(indices, shapes, Layout::ChannelFirst)?;
    let mean = scalar(image.clone().mean());
    let max = scalar(image.clone().abs().max());
    println!("decoded: {:?} mean={mean:.6} max_abs={max:.6}", image.dims());
    Ok(())
}
