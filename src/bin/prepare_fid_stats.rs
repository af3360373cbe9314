//! Precompute the reference FID statistics for a dataset so evaluation runs
//! only have to embed generated samples.

use anyhow::Result;
use clap::Parser;

use candle::{Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use candle_tarflow::data::WhichDataset;
use candle_tarflow::distributed::Distributed;
use candle_tarflow::fid::{stats_file_name, ConvEmbedder, FidStats, ImageEmbedder};

#[derive(Parser)]
struct Args {
    /// Root directory holding the datasets.
    #[arg(long)]
    data: String,

    #[arg(long, value_enum)]
    dataset: WhichDataset,

    #[arg(long, default_value_t = 32)]
    img_size: usize,

    #[arg(long, default_value_t = 256)]
    batch_size: usize,

    /// Width of the embedding features.
    #[arg(long, default_value_t = 64)]
    embed_dim: usize,

    /// Seed for the fixed embedder weights. Must match the seed used at
    /// evaluation time or the two feature spaces are incomparable.
    #[arg(long, default_value_t = 0)]
    embed_seed: u64,

    /// Directory to write the statistics file into.
    #[arg(long, default_value = ".")]
    out: String,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,
}

/// Overwrite every variable with seeded Gaussian values so the embedder is
/// identical across processes and across runs.
fn seed_weights(varmap: &VarMap, seed: u64) -> candle::Result<()> {
    let data = varmap.data().lock().unwrap();
    let mut names = data.keys().cloned().collect::<Vec<_>>();
    names.sort();
    let mut rng = StdRng::seed_from_u64(seed);
    for name in names {
        let var = &data[&name];
        let values = (0..var.elem_count())
            .map(|_| rng.sample::<f32, _>(StandardNormal) * 0.1)
            .collect::<Vec<_>>();
        var.set(&Tensor::from_vec(values, var.shape().clone(), var.device())?)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let dist = Distributed::single();

    let stats_path =
        std::path::Path::new(&args.out).join(stats_file_name(args.dataset.name(), args.img_size));
    anyhow::ensure!(
        !stats_path.exists(),
        "FID stats file {} already exists",
        stats_path.display()
    );

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(dist.local_rank())?
    };

    tracing::info!("loading {} at {}x{}", args.dataset, args.img_size, args.img_size);
    let dataset = args.dataset.load(&args.data, args.img_size, &device)?;
    tracing::info!("{} training images", dataset.len());

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, candle::DType::F32, &device);
    let embedder = ConvEmbedder::new(3, args.embed_dim, vb)?;
    seed_weights(&varmap, args.embed_seed)?;

    let mut stats = FidStats::new(embedder.dim());
    for (images, _labels) in dataset.batches(args.batch_size, None)? {
        // Embedder inputs live in [0, 1].
        let images = ((images + 1.)? * 0.5)?;
        let features = embedder.embed(&images)?;
        stats.update(&dist.gather_concat(&features)?, true)?;
    }
    tracing::info!("accumulated {} feature vectors", stats.real_count());

    dist.barrier()?;
    if dist.is_main() {
        stats.save(&stats_path)?;
        tracing::info!("wrote {}", stats_path.display());
    }
    dist.barrier()?;
    dist.shutdown()?;
    Ok(())
}
