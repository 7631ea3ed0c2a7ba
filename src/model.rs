//! Sparse coding network
//!
//! `SparseNet` bundles the convolutional dictionary with the hyperparameters of
//! its ISTA inner loop. A forward pass first infers the sparse code of the
//! batch under the current dictionary, then reconstructs the batch from that
//! code. The config is the part of a checkpoint that is not a tensor.

use burn::config::Config;
use burn::module::{Content, DisplaySettings, Module, ModuleDisplay};
use burn::tensor::{
    ElementConversion, Tensor,
    backend::{AutodiffBackend, Backend},
};

use crate::dictionary::{Dictionary, DictionaryConfig};
use crate::error;
use crate::ista::{IstaConfig, IstaOutcome, SparseSolver, reconstruction_loss};

/// Configuration for the sparse coding network
#[derive(Config, Debug)]
pub struct SparseNetConfig {
    /// Dictionary shape (N, K, S) and initialization seed
    pub dictionary: DictionaryConfig,
    /// ISTA step size, threshold and stopping rule
    #[config(default = "IstaConfig::new()")]
    pub ista: IstaConfig,
}

impl SparseNetConfig {
    /// Initialize the network on `device`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<SparseNet<B>> {
        self.ista.validate()?;
        let dictionary = self.dictionary.init(device)?;

        Ok(SparseNet {
            dictionary,
            code_lr: self.ista.code_lr,
            lambda: self.ista.lambda,
            tolerance: self.ista.tolerance,
            max_iterations: self.ista.max_iterations,
        })
    }
}

/// Dictionary plus ISTA hyperparameters
#[derive(Module, Debug)]
#[module(custom_display)]
pub struct SparseNet<B: Backend> {
    pub dictionary: Dictionary<B>,
    // Inner loop hyperparameters stored as regular fields (not modules)
    pub code_lr: f64,
    pub lambda: f64,
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl<B: Backend> ModuleDisplay for SparseNet<B> {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(true)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("code_lr", &self.code_lr)
            .add("lambda", &self.lambda)
            .add("max_iterations", &self.max_iterations)
            .optional()
    }
}

impl<B: Backend> SparseNet<B> {
    /// ISTA settings carried by this network.
    pub fn ista_config(&self) -> IstaConfig {
        IstaConfig::new()
            .with_code_lr(self.code_lr)
            .with_lambda(self.lambda)
            .with_tolerance(self.tolerance)
            .with_max_iterations(self.max_iterations)
    }

    /// Configuration that rebuilds a network of the same shape and seed.
    pub fn config(&self) -> SparseNetConfig {
        SparseNetConfig::new(
            DictionaryConfig::new(
                self.dictionary.num_filters,
                self.dictionary.kernel_size,
                self.dictionary.stride,
            )
            .with_seed(self.dictionary.seed),
        )
        .with_ista(self.ista_config())
    }

    /// Reconstruct an image batch from a code.
    pub fn reconstruct(&self, code: Tensor<B, 4>) -> Tensor<B, 4> {
        self.dictionary.reconstruct(code)
    }

    /// Summed squared residual of `images` reconstructed from `code`.
    pub fn loss(&self, images: Tensor<B, 4>, code: Tensor<B, 4>) -> f64 {
        reconstruction_loss(images, self.reconstruct(code))
            .into_scalar()
            .elem::<f64>()
    }

    /// Current filter bank `[N, K, K]`.
    pub fn filters(&self) -> Tensor<B, 3> {
        self.dictionary.filters()
    }

    /// Rescale the dictionary filters to unit norm.
    pub fn normalize(mut self) -> Self {
        self.dictionary = self.dictionary.normalize();
        self
    }
}

impl<B: AutodiffBackend> SparseNet<B> {
    /// Infer the sparse code of `images` with the dictionary held fixed.
    pub fn infer(&self, images: Tensor<B, 4>, device: &B::Device) -> error::Result<IstaOutcome<B>> {
        SparseSolver::new(self.ista_config())?.infer(&self.dictionary, images, device)
    }

    /// Infer the code of `images`, then reconstruct them from it.
    pub fn forward(
        &self,
        images: Tensor<B, 4>,
        device: &B::Device,
    ) -> error::Result<(IstaOutcome<B>, Tensor<B, 4>)> {
        let outcome = self.infer(images, device)?;
        let reconstruction = self.reconstruct(outcome.code.clone());
        Ok((outcome, reconstruction))
    }
}
