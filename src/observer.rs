//! Training observers
//!
//! The trainer reports per-epoch scalars, periodic snapshots of the filter
//! bank and periodic checkpoints to a [`TrainingObserver`]. The default
//! [`ArtifactObserver`] writes all three under an artifact directory.

use std::fs::File;
use std::path::{Path, PathBuf};

use burn::tensor::{Tensor, backend::Backend};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checkpoint::{checkpoint_stem, save};
use crate::error::Result;
use crate::model::SparseNet;
use crate::visualize::save_filters;

/// Scalars collected over one epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    /// 1-based epoch number
    pub epoch: usize,
    /// `epoch_index * batches_per_epoch + batches_seen`
    pub global_step: usize,
    /// Mean over batches of the summed squared residual
    pub loss: f64,
    pub batches: usize,
    /// Mean number of ISTA iterations per batch
    pub mean_iterations: f64,
    /// Batches whose ISTA solve hit the iteration bound
    pub unconverged: usize,
}

/// Receiver for training progress
pub trait TrainingObserver<B: Backend> {
    fn on_epoch_end(&mut self, summary: &EpochSummary) -> Result<()>;

    /// Called with the filter bank `[N, K, K]` on visualization epochs.
    fn on_filters(&mut self, epoch: usize, global_step: usize, filters: Tensor<B, 3>)
    -> Result<()>;

    /// Called on checkpoint epochs and once after the final epoch.
    fn on_checkpoint(&mut self, epoch: usize, model: &SparseNet<B>) -> Result<()>;
}

/// Observer writing `loss.csv`, `filters/rf-<step>.png` and `checkpoints/ckpt-<epoch>.*`
pub struct ArtifactObserver {
    dir: PathBuf,
    loss_log: csv::Writer<File>,
    filter_scale: u32,
}

impl ArtifactObserver {
    /// Open the artifacts in `dir` for a run that has `completed_epochs`
    /// epochs behind it.
    ///
    /// Rows of `loss.csv` past `completed_epochs` belong to epochs that are
    /// about to be trained again and are dropped.
    pub fn new(dir: impl AsRef<Path>, filter_scale: u32, completed_epochs: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let log_path = dir.join("loss.csv");
        let kept = read_log(&log_path, completed_epochs)?;

        let mut loss_log = csv::Writer::from_path(&log_path)?;
        for row in &kept {
            loss_log.serialize(row)?;
        }
        loss_log.flush()?;
        debug!(rows = kept.len(), "opened {}", log_path.display());

        Ok(Self {
            dir,
            loss_log,
            filter_scale,
        })
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        checkpoint_dir(&self.dir)
    }
}

/// Checkpoint directory inside the artifact directory `dir`.
pub fn checkpoint_dir(dir: &Path) -> PathBuf {
    dir.join("checkpoints")
}

/// Rows of an existing loss log up to and including epoch `last_epoch`.
fn read_log(path: &Path, last_epoch: usize) -> Result<Vec<EpochSummary>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize::<EpochSummary>() {
        let row = row?;
        if row.epoch <= last_epoch {
            rows.push(row);
        }
    }
    Ok(rows)
}

impl<B: Backend> TrainingObserver<B> for ArtifactObserver {
    fn on_epoch_end(&mut self, summary: &EpochSummary) -> Result<()> {
        self.loss_log.serialize(summary)?;
        self.loss_log.flush()?;
        Ok(())
    }

    fn on_filters(
        &mut self,
        epoch: usize,
        global_step: usize,
        filters: Tensor<B, 3>,
    ) -> Result<()> {
        let path = self
            .dir
            .join("filters")
            .join(format!("rf-{global_step}.png"));
        save_filters(filters, self.filter_scale, &path)?;
        debug!(epoch, "wrote receptive fields to {}", path.display());
        Ok(())
    }

    fn on_checkpoint(&mut self, epoch: usize, model: &SparseNet<B>) -> Result<()> {
        save(model, &checkpoint_stem(&self.checkpoint_dir(), epoch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::DictionaryConfig;
    use crate::model::SparseNetConfig;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn summary(epoch: usize) -> EpochSummary {
        EpochSummary {
            epoch,
            global_step: epoch * 3,
            loss: 1.5 / epoch as f64,
            batches: 3,
            mean_iterations: 12.0,
            unconverged: 0,
        }
    }

    fn read_rows(dir: &Path) -> Vec<EpochSummary> {
        let mut reader = csv::Reader::from_path(dir.join("loss.csv")).unwrap();
        reader.deserialize().map(|row| row.unwrap()).collect()
    }

    #[test]
    fn test_loss_log_appends_with_single_header() {
        let dir = tempfile::tempdir().unwrap();

        let mut observer = ArtifactObserver::new(dir.path(), 2, 0).unwrap();
        TrainingObserver::<TestBackend>::on_epoch_end(&mut observer, &summary(1)).unwrap();
        drop(observer);

        let mut observer = ArtifactObserver::new(dir.path(), 2, 1).unwrap();
        TrainingObserver::<TestBackend>::on_epoch_end(&mut observer, &summary(2)).unwrap();
        drop(observer);

        assert_eq!(read_rows(dir.path()), vec![summary(1), summary(2)]);
    }

    #[test]
    fn test_loss_log_drops_epochs_being_retrained() {
        let dir = tempfile::tempdir().unwrap();

        let mut observer = ArtifactObserver::new(dir.path(), 2, 0).unwrap();
        for epoch in 1..=3 {
            TrainingObserver::<TestBackend>::on_epoch_end(&mut observer, &summary(epoch)).unwrap();
        }
        drop(observer);

        // only epoch 1 is covered by a checkpoint
        let mut observer = ArtifactObserver::new(dir.path(), 2, 1).unwrap();
        assert_eq!(read_rows(dir.path()), vec![summary(1)]);
        for epoch in 2..=3 {
            TrainingObserver::<TestBackend>::on_epoch_end(&mut observer, &summary(epoch)).unwrap();
        }
        drop(observer);

        assert_eq!(read_rows(dir.path()), vec![summary(1), summary(2), summary(3)]);

        // a fresh start discards the whole log
        drop(ArtifactObserver::new(dir.path(), 2, 0).unwrap());
        assert!(read_rows(dir.path()).is_empty());
    }

    #[test]
    fn test_filters_and_checkpoints_written() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let model = SparseNetConfig::new(DictionaryConfig::new(4, 3, 1))
            .init::<TestBackend>(&device)
            .unwrap();
        let mut observer = ArtifactObserver::new(dir.path(), 2, 0).unwrap();

        observer.on_filters(5, 15, model.filters()).unwrap();
        observer.on_checkpoint(10, &model).unwrap();

        assert!(dir.path().join("filters/rf-15.png").exists());
        assert!(dir.path().join("checkpoints/ckpt-10.json").exists());
        assert!(dir.path().join("checkpoints/ckpt-10.mpk").exists());
    }
}
