//! Sparse Coding - Demo Application
//!
//! Restores a checkpoint (or initializes a fresh network when none is given),
//! infers sparse codes for a batch of synthetic patches and reports how well
//! the dictionary reconstructs them and how sparse the codes are.

use std::path::PathBuf;

use burn::backend::{Autodiff, NdArray};
use burn::data::dataloader::batcher::Batcher;
use burn::tensor::ElementConversion;
use clap::Parser;
use sparse_coding::{
    DictionaryConfig, IstaConfig, PatchBatcher, PatchDataset, PatchDatasetConfig,
    SparseNetConfig, checkpoint,
};

type Backend = Autodiff<NdArray>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Checkpoint stem to restore, e.g. runs/sparse-coding/checkpoints/ckpt-100
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Number of synthetic patches to reconstruct
    #[arg(long, default_value = "16")]
    patches: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    let device = Default::default();

    let model = match &args.checkpoint {
        Some(stem) => {
            println!("Restoring {}...", stem.display());
            checkpoint::load::<Backend>(stem, &device)?
        }
        None => {
            println!("Initializing model...");
            SparseNetConfig::new(DictionaryConfig::new(16, 5, 5))
                .with_ista(IstaConfig::new().with_code_lr(1e-2))
                .init::<Backend>(&device)?
        }
    };
    println!("{model}");

    // Smallest patch the dictionary can tile
    let patch_size = model.dictionary.kernel_size + model.dictionary.stride;
    let dataset = PatchDataset::synthetic(&PatchDatasetConfig {
        num_patches: args.patches,
        patch_size,
        seed: 0,
    });
    let images = PatchBatcher::<Backend>::new(patch_size)
        .batch(dataset.items, &device)
        .images;

    let energy = images.clone().powf_scalar(2.0).sum().into_scalar().elem::<f64>();
    let (outcome, reconstruction) = model.forward(images.clone(), &device)?;
    let residual = (images - reconstruction)
        .powf_scalar(2.0)
        .sum()
        .into_scalar()
        .elem::<f64>();

    let [batch, filters, rows, cols] = outcome.code.dims();
    let active = outcome
        .code
        .abs()
        .greater_elem(0.0)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>();

    println!("Inference finished: {:?}", outcome.convergence);
    println!("  Iterations: {}", outcome.iterations);
    println!("  Code: {:?}", [batch, filters, rows, cols]);
    println!(
        "  Active coefficients: {} / {}",
        active,
        batch * filters * rows * cols
    );
    println!(
        "  Residual energy: {:.4} of {:.4} ({:.1}%)",
        residual,
        energy,
        100.0 * residual / energy.max(f64::EPSILON)
    );

    Ok(())
}
