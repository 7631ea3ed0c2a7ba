//! Training binary for convolutional sparse coding
//!
//! Samples patches from a directory of images (or a CSV file of flattened
//! patches, or synthetic gratings when no data is given) and learns the
//! dictionary, writing loss logs, receptive field plots and checkpoints to
//! `<output-dir>/<session-name>`.

#![recursion_limit = "256"]
use std::path::PathBuf;

use burn::backend::{Autodiff, NdArray, Wgpu};
use burn::tensor::backend::AutodiffBackend;
use clap::{Parser, ValueEnum};
use sparse_coding::{
    DictionaryConfig, IstaConfig, PatchDataset, PatchDatasetConfig, SparseNetConfig,
    TrainingConfig, train,
};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

type CpuBackend = Autodiff<NdArray>;
type GpuBackend = Autodiff<Wgpu<f32, i32>>;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Device {
    Cpu,
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of this run; artifacts go to <output-dir>/<session-name>
    #[arg(long, default_value = "sparse-coding")]
    session_name: String,

    /// Root directory for training artifacts
    #[arg(short, long, default_value = "runs")]
    output_dir: PathBuf,

    /// Image directory or CSV file of patches (synthetic patches if omitted)
    #[arg(long)]
    data: Option<PathBuf>,

    /// Number of dictionary filters (N)
    #[arg(long, default_value = "400")]
    n_neuron: usize,

    /// Filter size (K)
    #[arg(long, default_value = "10")]
    kernel_size: usize,

    /// Transposed convolution stride (S)
    #[arg(long, default_value = "10")]
    stride: usize,

    /// ISTA step size on the code
    #[arg(long, default_value = "1e-2")]
    r_learning_rate: f64,

    /// Soft-threshold (L1 penalty) applied to the code
    #[arg(long, default_value = "5e-3")]
    reg: f64,

    /// Dictionary learning rate
    #[arg(long, default_value = "1e-2")]
    learning_rate: f64,

    /// Batch size
    #[arg(long, default_value = "2000")]
    batch_size: usize,

    /// Number of training epochs
    #[arg(long, default_value = "100")]
    epochs: usize,

    /// Patch side length (D)
    #[arg(long, default_value = "10")]
    img_size: usize,

    /// Number of patches sampled from the images
    #[arg(long, default_value = "2000")]
    num_patches: usize,

    /// Upper bound on ISTA iterations per batch
    #[arg(long, default_value = "10000")]
    max_iterations: usize,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Compute device
    #[arg(long, value_enum, default_value = "cpu")]
    device: Device,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn load_dataset(args: &Args) -> sparse_coding::Result<PatchDataset> {
    let config = PatchDatasetConfig {
        num_patches: args.num_patches,
        patch_size: args.img_size,
        seed: args.seed,
    };
    match &args.data {
        Some(path) if path.extension().is_some_and(|ext| ext == "csv") => {
            PatchDataset::from_csv(path, args.img_size)
        }
        Some(path) => PatchDataset::from_image_dir(path, &config),
        None => {
            info!("no data given, using synthetic gratings");
            Ok(PatchDataset::synthetic(&config))
        }
    }
}

fn run<B: AutodiffBackend>(
    artifact_dir: &str,
    config: TrainingConfig,
    device: B::Device,
    dataset: PatchDataset,
) -> sparse_coding::Result<()> {
    let model = train::<B>(artifact_dir, config, device, dataset)?;
    let norms = model.dictionary.filter_norms()?;
    info!(
        filters = norms.len(),
        "final dictionary saved, mean filter norm {:.4}",
        norms.iter().sum::<f32>() / norms.len().max(1) as f32
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    init_tracing();

    let artifact_dir = args.output_dir.join(&args.session_name);
    info!("starting sparse coding training in {}", artifact_dir.display());
    info!(
        epochs = args.epochs,
        batch_size = args.batch_size,
        learning_rate = args.learning_rate,
        n_neuron = args.n_neuron,
        kernel_size = args.kernel_size,
        stride = args.stride,
        "configuration"
    );

    let dataset = load_dataset(&args)?;
    info!(patches = dataset.len(), "dataset ready");

    let model_config = SparseNetConfig::new(
        DictionaryConfig::new(args.n_neuron, args.kernel_size, args.stride).with_seed(args.seed),
    )
    .with_ista(
        IstaConfig::new()
            .with_code_lr(args.r_learning_rate)
            .with_lambda(args.reg)
            .with_max_iterations(args.max_iterations),
    );
    model_config.dictionary.code_size(args.img_size)?;

    let training_config = TrainingConfig::new(model_config)
        .with_learning_rate(args.learning_rate)
        .with_batch_size(args.batch_size)
        .with_num_epochs(args.epochs)
        .with_seed(args.seed);

    let artifact_dir = artifact_dir.to_string_lossy().to_string();
    match args.device {
        Device::Cpu => run::<CpuBackend>(
            &artifact_dir,
            training_config,
            Default::default(),
            dataset,
        )?,
        Device::Wgpu => run::<GpuBackend>(
            &artifact_dir,
            training_config,
            burn::backend::wgpu::WgpuDevice::default(),
            dataset,
        )?,
    }

    info!("training completed");
    Ok(())
}
