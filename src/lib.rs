//! Convolutional Sparse Coding Library
//!
//! This library learns an overcomplete dictionary of convolutional filters that
//! reconstruct image patches from a sparse code, implemented in the Burn framework.
//! Codes are inferred with ISTA (gradient descent plus soft-thresholding) for a
//! fixed dictionary, and the dictionary is then updated by one gradient step and
//! re-normalized, batch after batch.

pub mod checkpoint;
pub mod dataset;
pub mod dictionary;
pub mod error;
pub mod ista;
pub mod model;
pub mod observer;
pub mod training;
pub mod visualize;

// Re-export main types for convenience
pub use dataset::{PatchBatch, PatchBatcher, PatchDataset, PatchDatasetConfig, PatchItem};
pub use dictionary::{Dictionary, DictionaryConfig};
pub use error::{Result, SparseCodingError};
pub use ista::{Convergence, IstaConfig, IstaOutcome, SparseSolver, soft_threshold};
pub use model::{SparseNet, SparseNetConfig};
pub use observer::{ArtifactObserver, EpochSummary, TrainingObserver};
pub use training::{DictionaryLearner, StepReport, TrainingConfig, evaluate, fit, sgd_learner, train};
