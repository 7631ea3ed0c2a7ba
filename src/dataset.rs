//! Image patch dataset
//!
//! This module supplies batches of single-channel square patches. Patches are
//! sampled at random positions from a directory of natural images, read from a
//! CSV file with one flattened patch per row, or generated synthetically.

use std::path::{Path, PathBuf};

use burn::data::dataloader::batcher::Batcher;
use burn::tensor::{Tensor, backend::Backend};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::{debug, info};

use crate::error::{Result, SparseCodingError};

/// Configuration for patch sampling
#[derive(Debug, Clone)]
pub struct PatchDatasetConfig {
    /// Number of patches to draw
    pub num_patches: usize,
    /// Side length of each square patch (D)
    pub patch_size: usize,
    /// Seed for patch positions and synthetic content
    pub seed: u64,
}

impl Default for PatchDatasetConfig {
    fn default() -> Self {
        Self {
            num_patches: 2000,
            patch_size: 10,
            seed: 42,
        }
    }
}

/// A single flattened `D x D` patch in row-major order
#[derive(Debug, Clone)]
pub struct PatchItem {
    pub pixels: Vec<f32>,
}

/// Batch of patches shaped `[batch, 1, D, D]`
#[derive(Debug, Clone)]
pub struct PatchBatch<B: Backend> {
    pub images: Tensor<B, 4>,
}

/// A grayscale image standardized to zero mean and unit variance
struct StandardizedImage {
    width: usize,
    height: usize,
    pixels: Vec<f32>,
}

impl StandardizedImage {
    fn new(width: usize, height: usize, mut pixels: Vec<f32>) -> Self {
        let count = pixels.len().max(1) as f32;
        let mean = pixels.iter().sum::<f32>() / count;
        let variance = pixels.iter().map(|p| (p - mean).powi(2)).sum::<f32>() / count;
        let std = variance.sqrt().max(1e-8);
        for pixel in pixels.iter_mut() {
            *pixel = (*pixel - mean) / std;
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    fn patch(&self, row: usize, col: usize, side: usize) -> PatchItem {
        let mut pixels = Vec::with_capacity(side * side);
        for r in row..row + side {
            let start = r * self.width + col;
            pixels.extend_from_slice(&self.pixels[start..start + side]);
        }
        PatchItem { pixels }
    }
}

/// In-memory dataset of image patches
pub struct PatchDataset {
    pub items: Vec<PatchItem>,
    pub patch_size: usize,
}

impl PatchDataset {
    /// Sample random patches from every decodable image file found in `dir`.
    pub fn from_image_dir(dir: impl AsRef<Path>, config: &PatchDatasetConfig) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && image::ImageFormat::from_path(path).is_ok())
            .collect();
        paths.sort();

        let mut images = Vec::with_capacity(paths.len());
        for path in &paths {
            let luma = match image::open(path) {
                Ok(decoded) => decoded.to_luma32f(),
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "skipping undecodable image");
                    continue;
                }
            };
            let (width, height) = (luma.width() as usize, luma.height() as usize);
            if width < config.patch_size || height < config.patch_size {
                debug!(path = %path.display(), width, height, "skipping image smaller than a patch");
                continue;
            }
            images.push(StandardizedImage::new(width, height, luma.into_raw()));
        }

        if images.is_empty() {
            return Err(SparseCodingError::InvalidInput(format!(
                "no image of at least {0}x{0} pixels in {1}",
                config.patch_size,
                dir.display()
            )));
        }

        info!(
            images = images.len(),
            patches = config.num_patches,
            "sampling patches from {}",
            dir.display()
        );
        Ok(Self::sample(&images, config))
    }

    /// Load patches from a CSV file holding `D * D` values per row, no header.
    pub fn from_csv(path: impl AsRef<Path>, patch_size: usize) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path.as_ref())?;

        let expected = patch_size * patch_size;
        let mut items = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            if record.len() != expected {
                return Err(SparseCodingError::InvalidInput(format!(
                    "row {} has {} values, expected {}",
                    line + 1,
                    record.len(),
                    expected
                )));
            }
            let pixels = record
                .iter()
                .map(|field| {
                    field.trim().parse::<f32>().map_err(|err| {
                        SparseCodingError::InvalidInput(format!(
                            "row {}: cannot parse {field:?}: {err}",
                            line + 1
                        ))
                    })
                })
                .collect::<Result<Vec<f32>>>()?;
            items.push(PatchItem { pixels });
        }

        info!(patches = items.len(), "loaded patches from {}", path.as_ref().display());
        Ok(Self { items, patch_size })
    }

    /// Generate oriented sinusoidal gratings with a little noise.
    pub fn synthetic(config: &PatchDatasetConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let side = config.patch_size;

        let items = (0..config.num_patches)
            .map(|_| {
                let angle = rng.gen_range(0.0..std::f32::consts::PI);
                let frequency = rng.gen_range(0.5..2.0);
                let phase = rng.gen_range(0.0..std::f32::consts::TAU);
                let (dx, dy) = (angle.cos(), angle.sin());
                let pixels = (0..side * side)
                    .map(|index| {
                        let (y, x) = ((index / side) as f32, (index % side) as f32);
                        (frequency * (x * dx + y * dy) + phase).sin()
                            + rng.gen_range(-0.05..0.05)
                    })
                    .collect();
                PatchItem { pixels }
            })
            .collect();

        Self {
            items,
            patch_size: side,
        }
    }

    fn sample(images: &[StandardizedImage], config: &PatchDatasetConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let side = config.patch_size;

        let items = (0..config.num_patches)
            .map(|_| {
                let image = &images[rng.gen_range(0..images.len())];
                let row = rng.gen_range(0..=image.height - side);
                let col = rng.gen_range(0..=image.width - side);
                image.patch(row, col, side)
            })
            .collect();

        Self {
            items,
            patch_size: side,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl burn::data::dataset::Dataset<PatchItem> for PatchDataset {
    fn get(&self, index: usize) -> Option<PatchItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Batcher stacking patches into `[batch, 1, D, D]` tensors
#[derive(Clone)]
pub struct PatchBatcher<B: Backend> {
    patch_size: usize,
    _phantom: std::marker::PhantomData<B>,
}

impl<B: Backend> PatchBatcher<B> {
    pub fn new(patch_size: usize) -> Self {
        Self {
            patch_size,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, PatchItem, PatchBatch<B>> for PatchBatcher<B> {
    fn batch(&self, items: Vec<PatchItem>, device: &B::Device) -> PatchBatch<B> {
        let batch_size = items.len();
        let side = self.patch_size;

        let mut data = Vec::with_capacity(batch_size * side * side);
        for item in items {
            data.extend(item.pixels);
        }

        let images = Tensor::<B, 1>::from_floats(data.as_slice(), device)
            .reshape([batch_size, 1, side, side]);

        PatchBatch { images }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;
    use burn::data::dataset::Dataset;
    use std::io::Write;

    type TestBackend = NdArray;

    #[test]
    fn test_synthetic_dataset() {
        let config = PatchDatasetConfig {
            num_patches: 16,
            patch_size: 6,
            seed: 1,
        };
        let dataset = PatchDataset::synthetic(&config);

        assert_eq!(Dataset::len(&dataset), 16);
        let item = Dataset::get(&dataset, 3).unwrap();
        assert_eq!(item.pixels.len(), 36);
        assert!(item.pixels.iter().all(|p| p.abs() <= 1.05));
        assert!(Dataset::get(&dataset, 16).is_none());
    }

    #[test]
    fn test_csv_dataset() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0.0,0.5,1.0,-1.0").unwrap();
        writeln!(file, "2.0,2.5,3.0,-3.0").unwrap();

        let dataset = PatchDataset::from_csv(file.path(), 2).unwrap();

        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.items[1].pixels, vec![2.0, 2.5, 3.0, -3.0]);
    }

    #[test]
    fn test_csv_row_length_checked() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0.0,0.5,1.0").unwrap();

        let result = PatchDataset::from_csv(file.path(), 2);

        assert!(matches!(result, Err(SparseCodingError::InvalidInput(_))));
    }

    #[test]
    fn test_image_dir_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let gradient = image::GrayImage::from_fn(20, 16, |x, y| image::Luma([(x * 10 + y) as u8]));
        gradient.save(dir.path().join("gradient.png")).unwrap();
        let tiny = image::GrayImage::from_fn(4, 4, |x, _| image::Luma([x as u8]));
        tiny.save(dir.path().join("tiny.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

        let config = PatchDatasetConfig {
            num_patches: 50,
            patch_size: 8,
            seed: 5,
        };
        let dataset = PatchDataset::from_image_dir(dir.path(), &config).unwrap();

        assert_eq!(dataset.len(), 50);
        assert_eq!(dataset.patch_size, 8);
        assert!(dataset.items.iter().all(|item| item.pixels.len() == 64));
    }

    #[test]
    fn test_image_dir_without_usable_images() {
        let dir = tempfile::tempdir().unwrap();
        let tiny = image::GrayImage::from_fn(4, 4, |x, _| image::Luma([x as u8]));
        tiny.save(dir.path().join("tiny.png")).unwrap();

        let result = PatchDataset::from_image_dir(dir.path(), &PatchDatasetConfig::default());

        assert!(result.is_err());
    }

    #[test]
    fn test_standardized_image() {
        let image = StandardizedImage::new(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        let mean = image.pixels.iter().sum::<f32>() / 4.0;
        let variance = image.pixels.iter().map(|p| (p - mean).powi(2)).sum::<f32>() / 4.0;

        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(variance, 1.0, epsilon = 1e-5);
        assert_eq!(image.patch(1, 0, 1).pixels.len(), 1);
    }

    #[test]
    fn test_batcher_shape() {
        let device = Default::default();
        let dataset = PatchDataset::synthetic(&PatchDatasetConfig {
            num_patches: 5,
            patch_size: 4,
            seed: 0,
        });
        let batcher = PatchBatcher::<TestBackend>::new(4);

        let batch = batcher.batch(dataset.items.clone(), &device);

        assert_eq!(batch.images.dims(), [5, 1, 4, 4]);
    }
}
