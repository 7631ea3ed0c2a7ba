//! Dictionary learning
//!
//! Each mini-batch goes through two strictly sequential optimizations:
//! 1. the ISTA inner loop infers the sparse code with the dictionary frozen;
//! 2. one SGD step on the dictionary weights, differentiating the summed
//!    squared residual through a detached copy of the converged code,
//!    followed by re-normalization of the filters.
//!
//! The epoch loop accumulates the running loss, asks the observer for a
//! filter snapshot every `visualize_every` epochs and for a checkpoint every
//! `checkpoint_every` epochs and after the final one.

use std::path::Path;

use burn::{
    config::Config,
    data::dataloader::{DataLoaderBuilder, batcher::Batcher},
    optim::{GradientsParams, Optimizer, SgdConfig},
    tensor::{
        ElementConversion, Tensor,
        backend::{AutodiffBackend, Backend},
    },
};
use tracing::{debug, info, warn};

use crate::{
    checkpoint::{find_latest_checkpoint, load},
    dataset::{PatchBatcher, PatchDataset},
    error::{self, SparseCodingError},
    ista::{Convergence, reconstruction_loss},
    model::{SparseNet, SparseNetConfig},
    observer::{ArtifactObserver, EpochSummary, TrainingObserver, checkpoint_dir},
};

/// Configuration for dictionary learning
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Network configuration
    pub model: SparseNetConfig,
    /// Learning rate of the dictionary update
    #[config(default = 1e-2)]
    pub learning_rate: f64,
    /// Batch size
    #[config(default = 2000)]
    pub batch_size: usize,
    /// Number of training epochs
    #[config(default = 100)]
    pub num_epochs: usize,
    /// Number of data loader workers (0 or 1 loads on the training thread)
    #[config(default = 0)]
    pub num_workers: usize,
    /// Random seed for batch shuffling
    #[config(default = 42)]
    pub seed: u64,
    /// Snapshot the filters every this many epochs
    #[config(default = 5)]
    pub visualize_every: usize,
    /// Checkpoint every this many epochs
    #[config(default = 10)]
    pub checkpoint_every: usize,
    /// Pixels per weight in filter snapshots
    #[config(default = 8)]
    pub filter_scale: u32,
}

impl TrainingConfig {
    pub fn validate(&self) -> error::Result<()> {
        if self.batch_size == 0 || self.visualize_every == 0 || self.checkpoint_every == 0 {
            return Err(SparseCodingError::InvalidConfig(
                "batch_size, visualize_every and checkpoint_every must be positive".to_string(),
            ));
        }
        if !(self.learning_rate > 0.0) {
            return Err(SparseCodingError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// Outcome of one mini-batch
#[derive(Debug, Clone, Copy)]
pub struct StepReport {
    /// Summed squared residual at the converged code, before the update
    pub loss: f64,
    pub iterations: usize,
    pub convergence: Convergence,
}

/// Outer optimizer: one SGD step on the dictionary per mini-batch
pub struct DictionaryLearner<B: AutodiffBackend, O: Optimizer<SparseNet<B>, B>> {
    optimizer: O,
    learning_rate: f64,
    device: B::Device,
}

/// Create a learner driving plain SGD on the dictionary weights.
pub fn sgd_learner<B: AutodiffBackend>(
    learning_rate: f64,
    device: B::Device,
) -> DictionaryLearner<B, impl Optimizer<SparseNet<B>, B>> {
    DictionaryLearner {
        optimizer: SgdConfig::new().init::<B, SparseNet<B>>(),
        learning_rate,
        device,
    }
}

impl<B: AutodiffBackend, O: Optimizer<SparseNet<B>, B>> DictionaryLearner<B, O> {
    /// Infer the code of `images`, step the dictionary, then normalize it.
    pub fn step(
        &mut self,
        model: SparseNet<B>,
        images: Tensor<B, 4>,
    ) -> error::Result<(SparseNet<B>, StepReport)> {
        let images = images.to_device(&self.device);

        let outcome = model.infer(images.clone(), &self.device)?;
        let (model, loss) = self.descend(model, images, outcome.code);
        let model = model.normalize();

        Ok((
            model,
            StepReport {
                loss,
                iterations: outcome.iterations,
                convergence: outcome.convergence,
            },
        ))
    }

    /// One gradient step on the dictionary for a fixed `code`.
    ///
    /// The code is detached, so the backward pass reaches the weights only.
    /// Returns the updated (not yet normalized) model and the loss before the
    /// step.
    pub fn descend(
        &mut self,
        model: SparseNet<B>,
        images: Tensor<B, 4>,
        code: Tensor<B, 4>,
    ) -> (SparseNet<B>, f64) {
        let reconstruction = model.reconstruct(code.detach());
        let loss = reconstruction_loss(images.detach(), reconstruction);
        let loss_value = loss.clone().into_scalar().elem::<f64>();

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        let model = self.optimizer.step(self.learning_rate, model, grads);

        (model, loss_value)
    }
}

/// Run the epoch loop on `model`, starting after `start_epoch` completed epochs.
pub fn fit<B: AutodiffBackend, T: TrainingObserver<B>>(
    config: &TrainingConfig,
    mut model: SparseNet<B>,
    start_epoch: usize,
    device: B::Device,
    dataset: PatchDataset,
    observer: &mut T,
) -> error::Result<SparseNet<B>> {
    config.validate()?;
    if dataset.is_empty() {
        return Err(SparseCodingError::InvalidInput(
            "training dataset is empty".to_string(),
        ));
    }

    let patch_size = dataset.patch_size;
    let mut builder = DataLoaderBuilder::new(PatchBatcher::<B>::new(patch_size))
        .batch_size(config.batch_size)
        .shuffle(config.seed);
    if config.num_workers > 1 {
        builder = builder.num_workers(config.num_workers);
    }
    let dataloader = builder.build(dataset);
    let batches_per_epoch = dataloader.num_items().div_ceil(config.batch_size);

    let mut learner = sgd_learner::<B>(config.learning_rate, device);
    let mut last_checkpoint = None;

    for epoch in start_epoch..config.num_epochs {
        let mut running_loss = 0.0;
        let mut batches = 0;
        let mut iterations = 0;
        let mut unconverged = 0;

        for batch in dataloader.iter() {
            let batch_size = batch.images.dims()[0];
            let images = batch
                .images
                .reshape([batch_size, 1, patch_size, patch_size]);

            let (next, report) = learner.step(model, images)?;
            model = next;

            running_loss += report.loss;
            iterations += report.iterations;
            batches += 1;
            if report.convergence == Convergence::MaxIterationsExceeded {
                unconverged += 1;
            }
            debug!(
                epoch = epoch + 1,
                batch = batches,
                loss = report.loss,
                iterations = report.iterations,
                "batch done"
            );
        }

        let summary = EpochSummary {
            epoch: epoch + 1,
            global_step: epoch * batches_per_epoch + batches,
            loss: running_loss / batches.max(1) as f64,
            batches,
            mean_iterations: iterations as f64 / batches.max(1) as f64,
            unconverged,
        };
        info!(
            epoch = summary.epoch,
            loss = summary.loss,
            mean_iterations = summary.mean_iterations,
            "epoch done"
        );
        if unconverged > 0 {
            warn!(
                epoch = summary.epoch,
                unconverged, "some sparse codes did not converge"
            );
        }
        observer.on_epoch_end(&summary)?;

        if (epoch + 1) % config.visualize_every == 0 {
            observer.on_filters(epoch + 1, summary.global_step, model.filters())?;
        }
        if (epoch + 1) % config.checkpoint_every == 0 {
            observer.on_checkpoint(epoch + 1, &model)?;
            last_checkpoint = Some(epoch + 1);
        }
    }

    if start_epoch < config.num_epochs && last_checkpoint != Some(config.num_epochs) {
        observer.on_checkpoint(config.num_epochs, &model)?;
    }

    Ok(model)
}

/// Train a sparse coding network, writing artifacts under `artifact_dir`.
///
/// Resumes from the latest checkpoint found in `artifact_dir/checkpoints`.
pub fn train<B: AutodiffBackend>(
    artifact_dir: &str,
    config: TrainingConfig,
    device: B::Device,
    dataset: PatchDataset,
) -> error::Result<SparseNet<B>> {
    config.validate()?;
    std::fs::create_dir_all(artifact_dir)?;
    config.save(format!("{artifact_dir}/config.json"))?;

    let checkpoint_dir = checkpoint_dir(Path::new(artifact_dir));
    let (model, start_epoch) = match find_latest_checkpoint(&checkpoint_dir) {
        Some(epoch) => {
            info!(epoch, "found existing checkpoint, resuming training");
            let stem = crate::checkpoint::checkpoint_stem(&checkpoint_dir, epoch);
            (load::<B>(&stem, &device)?, epoch)
        }
        None => {
            info!("no existing checkpoint, starting fresh training");
            (config.model.init::<B>(&device)?, 0)
        }
    };
    info!("{model}");

    let mut observer = ArtifactObserver::new(artifact_dir, config.filter_scale, start_epoch)?;
    let model = fit(&config, model, start_epoch, device, dataset, &mut observer)?;

    info!("training completed, artifacts in {}", Path::new(artifact_dir).display());
    Ok(model)
}

/// Loss of `model` over a whole dataset with codes inferred under the current dictionary.
pub fn evaluate<B: AutodiffBackend>(
    model: &SparseNet<B>,
    dataset: &PatchDataset,
    batch_size: usize,
    device: &B::Device,
) -> error::Result<f64> {
    let batcher = PatchBatcher::<B>::new(dataset.patch_size);
    let mut total = 0.0;
    for chunk in dataset.items.chunks(batch_size.max(1)) {
        let batch = batcher.batch(chunk.to_vec(), device);
        let outcome = model.infer(batch.images.clone(), device)?;
        total += model.loss(batch.images, outcome.code);
    }
    Ok(total)
}
