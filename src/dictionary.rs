//! Convolutional dictionary (the generative "synaptic weights" of the sparse coder)
//!
//! The dictionary maps a sparse code of shape `[batch, N, C, C]` to an image of
//! shape `[batch, 1, D, D]` through a transposed convolution with `N` filters of
//! size `K x K` and stride `S`, where `D = (C - 1) * S + K`.
//!
//! Every filter is kept at unit L2 norm outside an in-progress optimizer step:
//! the dictionary is normalized at construction and the trainer normalizes it
//! again after each update.

use burn::config::Config;
use burn::module::{Content, DisplaySettings, Module, ModuleDisplay, Param};
use burn::nn::conv::{ConvTranspose2d, ConvTranspose2dConfig};
use burn::tensor::{Tensor, backend::Backend};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::error::{self, SparseCodingError};

/// Smallest filter norm used as a divisor during normalization.
const NORM_EPSILON: f64 = 1e-12;

/// Configuration for the convolutional dictionary
#[derive(Config, Debug)]
pub struct DictionaryConfig {
    /// Number of filters (N)
    pub num_filters: usize,
    /// Spatial size of each square filter (K)
    pub kernel_size: usize,
    /// Stride of the transposed convolution (S)
    pub stride: usize,
    /// Seed for the random initial weights
    #[config(default = 42)]
    pub seed: u64,
}

impl DictionaryConfig {
    /// Check that N, K and S are positive.
    pub fn validate(&self) -> error::Result<()> {
        if self.num_filters == 0 || self.kernel_size == 0 || self.stride == 0 {
            return Err(SparseCodingError::InvalidConfig(format!(
                "num_filters, kernel_size and stride must be positive (got {}, {}, {})",
                self.num_filters, self.kernel_size, self.stride
            )));
        }
        Ok(())
    }

    /// Spatial size of the code produced for an input of side `input_size`.
    pub fn code_size(&self, input_size: usize) -> error::Result<usize> {
        code_size(input_size, self.kernel_size, self.stride)
    }

    /// Initialize a dictionary with seeded uniform weights, then normalize it.
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<Dictionary<B>> {
        self.validate()?;

        let [n, k] = [self.num_filters, self.kernel_size];
        let bound = 1.0 / (k as f32);
        let mut rng = StdRng::seed_from_u64(self.seed);
        let values: Vec<f32> = (0..n * k * k)
            .map(|_| rng.gen_range(-bound..bound))
            .collect();

        let weights = Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape([n, 1, k, k]);

        let mut dictionary = Dictionary::from_weights(weights, self.stride)?;
        dictionary.seed = self.seed;
        Ok(dictionary)
    }
}

/// Derived code size `C = (D - K) / S + 1`.
///
/// Fails when the kernel does not fit the input or when the stride does not
/// tile it exactly.
pub fn code_size(input_size: usize, kernel_size: usize, stride: usize) -> error::Result<usize> {
    if stride == 0 || kernel_size == 0 || input_size < kernel_size {
        return Err(SparseCodingError::ShapeMismatch {
            input: input_size,
            kernel: kernel_size,
            stride,
        });
    }
    let span = input_size - kernel_size;
    if span % stride != 0 {
        return Err(SparseCodingError::ShapeMismatch {
            input: input_size,
            kernel: kernel_size,
            stride,
        });
    }
    Ok(span / stride + 1)
}

/// Bank of `N` unit-norm `K x K` filters applied as a transposed convolution
#[derive(Module, Debug)]
#[module(custom_display)]
pub struct Dictionary<B: Backend> {
    /// Transposed convolution holding the weights `[N, 1, K, K]` (no bias)
    pub conv: ConvTranspose2d<B>,
    pub num_filters: usize,
    pub kernel_size: usize,
    pub stride: usize,
    /// Seed the initial weights were drawn from
    pub seed: u64,
}

impl<B: Backend> ModuleDisplay for Dictionary<B> {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("num_filters", &self.num_filters)
            .add("kernel_size", &self.kernel_size)
            .add("stride", &self.stride)
            .optional()
    }
}

impl<B: Backend> Dictionary<B> {
    /// Build a dictionary around explicit weights of shape `[N, 1, K, K]`.
    ///
    /// The weights are normalized before the dictionary is returned.
    pub fn from_weights(weights: Tensor<B, 4>, stride: usize) -> error::Result<Self> {
        let [num_filters, channels, k1, k2] = weights.dims();
        if channels != 1 || k1 != k2 {
            return Err(SparseCodingError::InvalidInput(format!(
                "dictionary weights must be [N, 1, K, K], got {:?}",
                weights.dims()
            )));
        }
        let config = DictionaryConfig::new(num_filters, k1, stride);
        config.validate()?;

        let device = weights.device();
        let mut conv = ConvTranspose2dConfig::new([num_filters, 1], [k1, k1])
            .with_stride([stride, stride])
            .with_bias(false)
            .init(&device);
        conv.weight = Param::from_tensor(weights.detach());

        let dictionary = Self {
            conv,
            num_filters,
            kernel_size: k1,
            stride,
            seed: config.seed,
        };
        Ok(dictionary.normalize())
    }

    /// Reconstruct an image batch `[batch, 1, D, D]` from a code `[batch, N, C, C]`.
    pub fn reconstruct(&self, code: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(code)
    }

    /// Rescale every filter to unit L2 norm.
    ///
    /// The rescaling is not recorded on the autodiff graph and the parameter
    /// keeps its id, so optimizer state stays attached to it.
    pub fn normalize(mut self) -> Self {
        self.conv.weight = self.conv.weight.map(normalize_filters);
        self
    }

    /// Side of the code produced for an input of side `input_size`.
    pub fn code_size(&self, input_size: usize) -> error::Result<usize> {
        code_size(input_size, self.kernel_size, self.stride)
    }

    /// Current weights `[N, 1, K, K]`.
    pub fn weights(&self) -> Tensor<B, 4> {
        self.conv.weight.val()
    }

    /// Filter bank as `[N, K, K]`, for visualization.
    pub fn filters(&self) -> Tensor<B, 3> {
        self.weights()
            .reshape([self.num_filters, self.kernel_size, self.kernel_size])
    }

    /// L2 norm of every flattened filter.
    pub fn filter_norms(&self) -> error::Result<Vec<f32>> {
        let flat = self
            .weights()
            .reshape([self.num_filters, self.kernel_size * self.kernel_size]);
        flat.powf_scalar(2.0)
            .sum_dim(1)
            .sqrt()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| SparseCodingError::TensorData(format!("{err:?}")))
    }
}

/// Normalize each `[1, K, K]` slice of a `[N, 1, K, K]` tensor to unit L2 norm.
///
/// A filter whose norm is below `NORM_EPSILON` is divided by the epsilon
/// instead, so an all-zero filter stays zero.
pub fn normalize_filters<B: Backend>(weight: Tensor<B, 4>) -> Tensor<B, 4> {
    let require_grad = weight.is_require_grad();
    let [n, c, k1, k2] = weight.dims();

    let flat = weight
        .detach()
        .set_require_grad(false)
        .reshape([n, c * k1 * k2]);
    let norms = flat
        .clone()
        .powf_scalar(2.0)
        .sum_dim(1)
        .sqrt()
        .clamp_min(NORM_EPSILON);

    (flat / norms)
        .reshape([n, c, k1, k2])
        .set_require_grad(require_grad)
}
