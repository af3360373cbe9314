//! Generate an image grid from a trained checkpoint.

use anyhow::Result;
use clap::Parser;

use candle::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use candle_tarflow::flow::Guide;
use candle_tarflow::model::{Config, Model};
use candle_tarflow::{checkpoint, utils};

#[derive(Parser)]
struct Args {
    /// Model configuration, JSON.
    #[arg(long)]
    config: String,

    /// Safetensors checkpoint with weights and prior variance.
    #[arg(long)]
    checkpoint: String,

    #[arg(long, default_value_t = 16)]
    num_samples: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Classifier-free guidance strength; zero disables the unconditional
    /// branch entirely.
    #[arg(long, default_value_t = 0.)]
    guidance: f64,

    /// Which affine parameters guidance steers: "a" (scale), "b" (shift) or
    /// "ab" (both).
    #[arg(long, default_value = "ab")]
    guide: Guide,

    /// Attention temperature for the unguided branch.
    #[arg(long, default_value_t = 1.)]
    attn_temp: f64,

    /// Ramp guidance linearly over patch positions instead of applying it
    /// uniformly.
    #[arg(long)]
    annealed: bool,

    /// Class label to condition every sample on; omit for unlabeled sampling.
    #[arg(long)]
    label: Option<i64>,

    /// Images per grid row.
    #[arg(long, default_value_t = 4)]
    nrow: usize,

    #[arg(long, default_value = "samples.png")]
    out: String,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };

    let cfg: Config = serde_json::from_str(&std::fs::read_to_string(&args.config)?)?;
    cfg.validate()?;

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Model::new(&cfg, vb)?;
    checkpoint::load(&mut varmap, &model, &args.checkpoint)?;
    tracing::info!("loaded {}", args.checkpoint);

    let labels = match args.label {
        Some(label) => {
            anyhow::ensure!(
                cfg.num_classes > 0,
                "model is unconditional, --label cannot be honored"
            );
            anyhow::ensure!(
                (label as usize) < cfg.num_classes,
                "label {label} out of range for {} classes",
                cfg.num_classes
            );
            Some(Tensor::full(label, args.num_samples, &device)?)
        }
        None => None,
    };

    let noise = model.sample_noise(args.num_samples, args.seed)?;
    tracing::info!(
        "sampling {} images, guidance {} ({})",
        args.num_samples,
        args.guidance,
        args.guide
    );
    let images = model.reverse(
        &noise,
        labels.as_ref(),
        args.guidance,
        args.guide,
        args.attn_temp,
        args.annealed,
    )?;

    utils::write_image_grid(&images, &args.out, args.nrow)?;
    tracing::info!("wrote {}", args.out);
    Ok(())
}
