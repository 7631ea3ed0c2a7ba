//! Iterative Shrinkage-Thresholding (ISTA) inference of sparse codes
//!
//! For a fixed dictionary and an image batch, the solver minimizes
//! `||images - D(R)||^2` by gradient descent on the code `R`, projecting after
//! every descent step with the soft-thresholding operator. The L1 penalty is
//! never part of the differentiated loss; it only enters through the
//! threshold `lambda`.
//!
//! Each iteration is an explicit two-phase update on the raw (inner backend)
//! values of the code:
//! 1. descent: `R <- R - code_lr * dL/dR`
//! 2. projection: `R <- shrink(R, lambda)`
//!
//! and the projected values are re-attached to a fresh autodiff graph on the
//! next iteration. The dictionary is frozen for the whole solve, so the
//! backward pass only ever produces a gradient for the code.

use burn::config::Config;
use burn::module::Module;
use burn::tensor::{
    ElementConversion, Tensor, activation,
    backend::{AutodiffBackend, Backend},
};
use tracing::{debug, trace, warn};

use crate::dictionary::Dictionary;
use crate::error::{self, SparseCodingError};

/// Configuration for the ISTA inner loop
#[derive(Config, Debug)]
pub struct IstaConfig {
    /// Step size of the descent phase (R_lr)
    #[config(default = 0.1)]
    pub code_lr: f64,
    /// Soft-threshold applied in the projection phase (lambda)
    #[config(default = 5e-3)]
    pub lambda: f64,
    /// Relative change of the code below which the solve has converged
    #[config(default = 0.01)]
    pub tolerance: f64,
    /// Upper bound on the number of iterations of a single solve
    #[config(default = 10000)]
    pub max_iterations: usize,
}

impl IstaConfig {
    pub fn validate(&self) -> error::Result<()> {
        if !(self.code_lr > 0.0) {
            return Err(SparseCodingError::InvalidConfig(format!(
                "code_lr must be positive, got {}",
                self.code_lr
            )));
        }
        if !(self.lambda >= 0.0) {
            return Err(SparseCodingError::InvalidConfig(format!(
                "lambda must be non-negative, got {}",
                self.lambda
            )));
        }
        if !(self.tolerance > 0.0) {
            return Err(SparseCodingError::InvalidConfig(format!(
                "tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(SparseCodingError::InvalidConfig(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Terminal state of a solve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// The relative change of the code fell below the tolerance
    Converged,
    /// The iteration bound was reached first
    MaxIterationsExceeded,
}

/// Result of a single ISTA solve
#[derive(Debug, Clone)]
pub struct IstaOutcome<B: Backend> {
    /// Final code `[batch, N, C, C]`, detached from any graph
    pub code: Tensor<B, 4>,
    pub convergence: Convergence,
    /// Number of descent/projection iterations performed
    pub iterations: usize,
    /// Relative change measured on the last iteration
    pub relative_change: f64,
    /// Summed squared residual evaluated on the last iteration, before its update
    pub loss: f64,
}

impl<B: Backend> IstaOutcome<B> {
    pub fn converged(&self) -> bool {
        self.convergence == Convergence::Converged
    }
}

/// Soft-thresholding operator `relu(x - lambda) - relu(-x - lambda)`.
pub fn soft_threshold<B: Backend, const D: usize>(x: Tensor<B, D>, lambda: f64) -> Tensor<B, D> {
    activation::relu(x.clone().sub_scalar(lambda)) - activation::relu(x.neg().sub_scalar(lambda))
}

/// Euclidean norm over every element of `x`.
pub fn l2_norm<B: Backend, const D: usize>(x: Tensor<B, D>) -> f64 {
    x.powf_scalar(2.0).sum().sqrt().into_scalar().elem::<f64>()
}

/// Relative change `||new - old|| / ||old||`.
///
/// With a zero-norm `old` the ratio is 0 when `new` is also zero and infinite
/// otherwise, so the result is never NaN for finite inputs.
pub fn relative_change<B: Backend, const D: usize>(new: Tensor<B, D>, old: Tensor<B, D>) -> f64 {
    let old_norm = l2_norm(old.clone());
    let delta = l2_norm(new - old);

    if old_norm == 0.0 {
        if delta == 0.0 { 0.0 } else { f64::INFINITY }
    } else {
        delta / old_norm
    }
}

/// Summed squared residual between an image batch and its reconstruction.
pub fn reconstruction_loss<B: Backend>(
    images: Tensor<B, 4>,
    reconstruction: Tensor<B, 4>,
) -> Tensor<B, 1> {
    (images - reconstruction).powf_scalar(2.0).sum()
}

/// Check that `images` is laid out as `[batch, 1, D, D]` and return `D`.
pub fn image_side(dims: [usize; 4]) -> error::Result<usize> {
    let [batch, channels, height, width] = dims;
    if batch == 0 {
        return Err(SparseCodingError::InvalidInput(
            "image batch is empty".to_string(),
        ));
    }
    if channels != 1 {
        return Err(SparseCodingError::InvalidInput(format!(
            "expected a single channel, got {channels}"
        )));
    }
    if height != width {
        return Err(SparseCodingError::InvalidInput(format!(
            "expected square patches, got {height}x{width}"
        )));
    }
    Ok(height)
}

/// ISTA solver for sparse codes under a fixed dictionary
#[derive(Debug, Clone)]
pub struct SparseSolver {
    config: IstaConfig,
}

impl SparseSolver {
    pub fn new(config: IstaConfig) -> error::Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &IstaConfig {
        &self.config
    }

    /// Infer the sparse code of `images` under `dictionary`.
    ///
    /// The code starts at zero on `device` and is iterated until the relative
    /// change drops below the tolerance or `max_iterations` is reached.
    /// Hitting the bound is reported through [`Convergence`], not as an error.
    pub fn infer<B: AutodiffBackend>(
        &self,
        dictionary: &Dictionary<B>,
        images: Tensor<B, 4>,
        device: &B::Device,
    ) -> error::Result<IstaOutcome<B>> {
        let side = image_side(images.dims())?;
        let code_side = dictionary.code_size(side)?;
        let batch_size = images.dims()[0];

        let frozen = dictionary.clone().no_grad();
        let images = images.detach().to_device(device);

        let mut code = Tensor::<B, 4>::zeros(
            [batch_size, dictionary.num_filters, code_side, code_side],
            device,
        )
        .inner();

        let mut loss = 0.0;
        let mut change = f64::INFINITY;

        for iteration in 1..=self.config.max_iterations {
            let old_code = code.clone();
            let (next, step_loss) = self.step(&frozen, images.clone(), code)?;
            code = next;
            loss = step_loss;
            change = relative_change(code.clone(), old_code);

            trace!(iteration, loss, relative_change = change, "ista iteration");

            if change < self.config.tolerance {
                debug!(iterations = iteration, loss, "ista converged");
                return Ok(IstaOutcome {
                    code: Tensor::from_inner(code),
                    convergence: Convergence::Converged,
                    iterations: iteration,
                    relative_change: change,
                    loss,
                });
            }
        }

        warn!(
            max_iterations = self.config.max_iterations,
            relative_change = change,
            "ista reached the iteration bound before converging"
        );
        Ok(IstaOutcome {
            code: Tensor::from_inner(code),
            convergence: Convergence::MaxIterationsExceeded,
            iterations: self.config.max_iterations,
            relative_change: change,
            loss,
        })
    }

    /// One descent step followed by one projection step.
    ///
    /// `dictionary` is expected to be frozen; `code` holds raw values and is
    /// attached to a new graph only for the duration of the backward pass.
    /// Returns the updated code and the loss evaluated before the update.
    pub fn step<B: AutodiffBackend>(
        &self,
        dictionary: &Dictionary<B>,
        images: Tensor<B, 4>,
        code: Tensor<B::InnerBackend, 4>,
    ) -> error::Result<(Tensor<B::InnerBackend, 4>, f64)> {
        let tracked = Tensor::<B, 4>::from_inner(code).require_grad();

        let reconstruction = dictionary.reconstruct(tracked.clone());
        let loss = reconstruction_loss(images, reconstruction);
        let loss_value = loss.clone().into_scalar().elem::<f64>();

        let grads = loss.backward();
        let grad = tracked
            .grad(&grads)
            .ok_or(SparseCodingError::MissingGradient)?;

        let descended = tracked.inner() - grad.mul_scalar(self.config.code_lr);
        let projected = soft_threshold(descended, self.config.lambda);

        Ok((projected, loss_value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::DictionaryConfig;
    use approx::assert_abs_diff_eq;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    fn synthetic_patch(side: usize) -> Vec<f32> {
        (0..side * side)
            .map(|index| {
                let (i, j) = ((index / side) as f32, (index % side) as f32);
                (i * 0.7).sin() + (j * 1.3).cos()
            })
            .collect()
    }

    fn solver(code_lr: f64, lambda: f64) -> SparseSolver {
        SparseSolver::new(
            IstaConfig::new()
                .with_code_lr(code_lr)
                .with_lambda(lambda)
                .with_max_iterations(500),
        )
        .unwrap()
    }

    #[test]
    fn test_soft_threshold_values() {
        let device = Default::default();
        let x = Tensor::<NdArray, 1>::from_floats([-2.0, -0.5, 0.0, 0.3, 1.5], &device);

        let shrunk = soft_threshold(x, 0.5).into_data().to_vec::<f32>().unwrap();

        let expected = [-1.5, 0.0, 0.0, 0.0, 1.0];
        for (value, expected) in shrunk.iter().zip(expected) {
            assert_abs_diff_eq!(*value, expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_soft_threshold_zero_lambda_is_identity() {
        let device = Default::default();
        let values: [f32; 5] = [-3.25, -1e-4, 0.0, 2e-3, 7.5];
        let x = Tensor::<NdArray, 1>::from_floats(values, &device);

        let shrunk = soft_threshold(x, 0.0).into_data().to_vec::<f32>().unwrap();

        for (value, expected) in shrunk.iter().zip(values) {
            assert_abs_diff_eq!(*value, expected, epsilon = 1e-7);
        }
    }

    #[test]
    fn test_soft_threshold_shrinks_again_when_repeated() {
        let device = Default::default();
        let x = Tensor::<NdArray, 1>::from_floats([2.0, -2.0], &device);

        let twice = soft_threshold(soft_threshold(x, 0.5), 0.5)
            .into_data()
            .to_vec::<f32>()
            .unwrap();

        assert_abs_diff_eq!(twice[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(twice[1], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_relative_change_zero_denominator() {
        let device = Default::default();
        let zeros = Tensor::<NdArray, 1>::zeros([3], &device);
        let ones = Tensor::<NdArray, 1>::ones([3], &device);

        assert_eq!(relative_change(zeros.clone(), zeros.clone()), 0.0);
        assert!(relative_change(ones.clone(), zeros).is_infinite());

        let halves = ones.clone().mul_scalar(0.5);
        assert_abs_diff_eq!(relative_change(halves, ones), 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_zero_images_converge_to_zero_code() {
        let device = Default::default();
        let dictionary = DictionaryConfig::new(4, 3, 1)
            .init::<TestBackend>(&device)
            .unwrap();
        let images = Tensor::<TestBackend, 4>::zeros([2, 1, 5, 5], &device);

        let outcome = solver(0.1, 5e-3)
            .infer(&dictionary, images, &device)
            .unwrap();

        assert_eq!(outcome.convergence, Convergence::Converged);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.loss, 0.0);
        assert_eq!(outcome.relative_change, 0.0);
        assert_eq!(outcome.code.dims(), [2, 4, 3, 3]);
        assert_eq!(l2_norm(outcome.code), 0.0);
    }

    #[test]
    fn test_converges_and_reduces_error() {
        let device = Default::default();
        let dictionary = DictionaryConfig::new(4, 3, 1)
            .with_seed(3)
            .init::<TestBackend>(&device)
            .unwrap();
        let images = Tensor::<TestBackend, 1>::from_floats(synthetic_patch(5).as_slice(), &device)
            .reshape([1, 1, 5, 5]);
        let solver = solver(0.01, 1e-3);

        let outcome = solver.infer(&dictionary, images.clone(), &device).unwrap();

        assert!(outcome.converged());
        assert!(outcome.iterations < 500);

        let error_at_zero = l2_norm(images.clone()).powi(2);
        let final_error = reconstruction_loss(
            images.clone(),
            dictionary.reconstruct(outcome.code.clone()),
        )
        .into_scalar()
        .elem::<f64>();
        assert!(final_error < error_at_zero);

        // One more iteration past convergence keeps the change under the tolerance.
        let frozen = dictionary.clone().no_grad();
        let before = outcome.code.clone().inner();
        let (after, _) = solver.step(&frozen, images, before.clone()).unwrap();
        assert!(relative_change(after, before) < 0.01);
    }

    #[test]
    fn test_iteration_bound_is_reported() {
        let device = Default::default();
        let dictionary = DictionaryConfig::new(4, 3, 1)
            .init::<TestBackend>(&device)
            .unwrap();
        let images = Tensor::<TestBackend, 1>::from_floats(synthetic_patch(5).as_slice(), &device)
            .reshape([1, 1, 5, 5]);
        let solver =
            SparseSolver::new(IstaConfig::new().with_code_lr(0.01).with_max_iterations(1))
                .unwrap();

        let outcome = solver.infer(&dictionary, images, &device).unwrap();

        assert_eq!(outcome.convergence, Convergence::MaxIterationsExceeded);
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.relative_change.is_infinite());
    }

    #[test]
    fn test_kernel_stride_mismatch_is_fatal() {
        let device = Default::default();
        let dictionary = DictionaryConfig::new(4, 3, 2)
            .init::<TestBackend>(&device)
            .unwrap();
        let images = Tensor::<TestBackend, 4>::ones([1, 1, 6, 6], &device);

        let result = solver(0.1, 5e-3).infer(&dictionary, images, &device);

        assert!(matches!(
            result,
            Err(SparseCodingError::ShapeMismatch {
                input: 6,
                kernel: 3,
                stride: 2
            })
        ));
    }

    #[test]
    fn test_non_square_input_rejected() {
        let device = Default::default();
        let dictionary = DictionaryConfig::new(4, 3, 1)
            .init::<TestBackend>(&device)
            .unwrap();
        let images = Tensor::<TestBackend, 4>::ones([1, 1, 5, 6], &device);

        let result = solver(0.1, 5e-3).infer(&dictionary, images, &device);

        assert!(matches!(result, Err(SparseCodingError::InvalidInput(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(SparseSolver::new(IstaConfig::new().with_code_lr(0.0)).is_err());
        assert!(SparseSolver::new(IstaConfig::new().with_lambda(-1.0)).is_err());
        assert!(SparseSolver::new(IstaConfig::new().with_max_iterations(0)).is_err());
    }
}
