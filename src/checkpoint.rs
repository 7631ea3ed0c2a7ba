//! Model checkpoints
//!
//! A checkpoint is a pair of files sharing one stem: `<stem>.json` holds the
//! `SparseNetConfig` (N, K, S, R_lr, lambda, stopping rule) and `<stem>.mpk`
//! holds the dictionary weights in full precision, written by Burn's
//! `NamedMpkFileRecorder`.

use std::path::{Path, PathBuf};

use burn::config::Config;
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::Backend;
use tracing::info;

use crate::error::{Result, SparseCodingError};
use crate::model::{SparseNet, SparseNetConfig};

type Recorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Stem of the checkpoint written after `epoch` (1-based) in `dir`.
pub fn checkpoint_stem(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("ckpt-{epoch}"))
}

/// Write `model` as `<stem>.json` and `<stem>.mpk`.
pub fn save<B: Backend>(model: &SparseNet<B>, stem: &Path) -> Result<()> {
    if let Some(parent) = stem.parent() {
        std::fs::create_dir_all(parent)?;
    }

    model.config().save(stem.with_extension("json"))?;
    model
        .clone()
        .save_file(stem.to_path_buf(), &Recorder::new())
        .map_err(|err| SparseCodingError::Record(format!("{err:?}")))?;

    info!("saved checkpoint {}", stem.display());
    Ok(())
}

/// Restore a model written by [`save`].
pub fn load<B: Backend>(stem: &Path, device: &B::Device) -> Result<SparseNet<B>> {
    let config = SparseNetConfig::load(stem.with_extension("json"))
        .map_err(|err| SparseCodingError::Record(format!("{err:?}")))?;

    config
        .init::<B>(device)?
        .load_file(stem.to_path_buf(), &Recorder::new(), device)
        .map_err(|err| SparseCodingError::Record(format!("{err:?}")))
}

/// Latest epoch with a complete checkpoint in `dir`, if any.
pub fn find_latest_checkpoint(dir: &Path) -> Option<usize> {
    let entries = std::fs::read_dir(dir).ok()?;

    entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            let epoch = name
                .strip_prefix("ckpt-")?
                .strip_suffix(".mpk")?
                .parse::<usize>()
                .ok()?;
            checkpoint_stem(dir, epoch)
                .with_extension("json")
                .exists()
                .then_some(epoch)
        })
        .max()
}
