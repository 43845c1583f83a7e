//! Input preparation shared by the backends.

use image::imageops::{self, FilterType};

use crate::codec::Bitmap;

/// Per-channel mean/std applied to pixels scaled to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    /// Plain `/255` scaling.
    pub const UNIT: Normalization = Normalization {
        mean: [0.0; 3],
        std: [1.0; 3],
    };

    /// Statistics the region-proposal model was trained with.
    pub const REGION_PROPOSAL: Normalization = Normalization {
        mean: [0.25295600, 0.23075905, 0.26414612],
        std: [0.27508822, 0.25421992, 0.27524212],
    };
}

/// Resize to a `size`x`size` square, ignoring aspect ratio.
pub fn resize_square(bitmap: &Bitmap, size: u32) -> Bitmap {
    if bitmap.dimensions() == (size, size) {
        return bitmap.clone();
    }
    imageops::resize(bitmap, size, size, FilterType::Triangle)
}

/// Interleaved (NHWC) float tensor data.
pub fn to_nhwc(bitmap: &Bitmap, norm: &Normalization) -> Vec<f32> {
    bitmap
        .pixels()
        .flat_map(|pixel| {
            let [r, g, b] = pixel.0;
            [
                (r as f32 / 255.0 - norm.mean[0]) / norm.std[0],
                (g as f32 / 255.0 - norm.mean[1]) / norm.std[1],
                (b as f32 / 255.0 - norm.mean[2]) / norm.std[2],
            ]
        })
        .collect()
}

/// Planar (NCHW) float tensor data.
pub fn to_nchw(bitmap: &Bitmap, norm: &Normalization) -> Vec<f32> {
    let plane = (bitmap.width() * bitmap.height()) as usize;
    let mut data = vec![0.0f32; plane * 3];
    for (index, pixel) in bitmap.pixels().enumerate() {
        for channel in 0..3 {
            data[channel * plane + index] =
                (pixel.0[channel] as f32 / 255.0 - norm.mean[channel]) / norm.std[channel];
        }
    }
    data
}
