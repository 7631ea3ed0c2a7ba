//! Receptive field rendering
//!
//! Tiles the filter bank `[N, K, K]` into a single grayscale image so the
//! learned dictionary can be inspected while training runs.

use std::path::Path;

use burn::tensor::{Tensor, backend::Backend};
use image::{GrayImage, Luma};

use crate::error::{Result, SparseCodingError};

/// Gray level of the separator lines between filters.
const SEPARATOR: u8 = 0;

/// Tile `filters` into a near-square grid, `scale` pixels per weight.
///
/// Each filter is min-max scaled on its own; a constant filter renders as
/// mid-gray.
pub fn render_filters<B: Backend>(filters: Tensor<B, 3>, scale: u32) -> Result<GrayImage> {
    let [count, height, width] = filters.dims();
    if count == 0 || height == 0 || width == 0 || scale == 0 {
        return Err(SparseCodingError::InvalidInput(format!(
            "cannot render filter bank of shape {:?} at scale {scale}",
            filters.dims()
        )));
    }

    let values = filters
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| SparseCodingError::TensorData(format!("{err:?}")))?;

    let cols = (count as f64).sqrt().ceil() as usize;
    let rows = count.div_ceil(cols);
    let cell_w = width as u32 * scale + 1;
    let cell_h = height as u32 * scale + 1;

    let mut canvas = GrayImage::from_pixel(
        cols as u32 * cell_w + 1,
        rows as u32 * cell_h + 1,
        Luma([SEPARATOR]),
    );

    for (index, filter) in values.chunks(height * width).enumerate() {
        let (min, max) = filter
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let range = max - min;

        let origin_x = (index % cols) as u32 * cell_w + 1;
        let origin_y = (index / cols) as u32 * cell_h + 1;

        for (offset, &value) in filter.iter().enumerate() {
            let level = if range > f32::EPSILON {
                ((value - min) / range * 255.0).round() as u8
            } else {
                128
            };
            let x0 = origin_x + (offset % width) as u32 * scale;
            let y0 = origin_y + (offset / width) as u32 * scale;
            for dy in 0..scale {
                for dx in 0..scale {
                    canvas.put_pixel(x0 + dx, y0 + dy, Luma([level]));
                }
            }
        }
    }

    Ok(canvas)
}

/// Render `filters` and write the grid as an image file at `path`.
pub fn save_filters<B: Backend>(filters: Tensor<B, 3>, scale: u32, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    render_filters(filters, scale)?.save(path)?;
    Ok(())
}
