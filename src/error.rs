//! Error types shared across the crate.

use thiserror::Error;

/// Errors raised by dictionary construction, sparse inference, data loading
/// and checkpointing.
#[derive(Debug, Error)]
pub enum SparseCodingError {
    /// Kernel and stride cannot tile the input exactly.
    #[error(
        "kernel and stride size mismatch: (input {input} - kernel {kernel}) is not a multiple of stride {stride}"
    )]
    ShapeMismatch {
        input: usize,
        kernel: usize,
        stride: usize,
    },

    /// Input tensor does not have the (batch, 1, D, D) layout.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Backward pass produced no gradient for the sparse code.
    #[error("no gradient was recorded for the sparse code")]
    MissingGradient,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("checkpoint record error: {0}")]
    Record(String),

    #[error("tensor data error: {0}")]
    TensorData(String),
}

pub type Result<T> = std::result::Result<T, SparseCodingError>;
