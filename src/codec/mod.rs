//! Still-image payload decoding.
//!
//! Clients send frames either as raw base64 or as data URLs
//! (`data:image/jpeg;base64,...`). Everything up to the first comma is
//! treated as a prefix and discarded.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{DynamicImage, ImageFormat, RgbImage};

/// Canonical decoded frame: 8-bit RGB, no alpha.
pub type Bitmap = RgbImage;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid base64: {0}")]
    Base64(#[source] base64::DecodeError),

    #[error("payload bytes are not a supported image: {0}")]
    Image(#[source] image::ImageError),

    #[error("image has a zero dimension: {width}x{height}")]
    EmptyImage { width: u32, height: u32 },
}

/// Decode a transport payload into an RGB bitmap. No resizing happens here.
pub fn decode(payload: &str) -> Result<Bitmap, DecodeError> {
    let body = match payload.split_once(',') {
        Some((_prefix, body)) => body,
        None => payload,
    };
    let bytes = STANDARD.decode(body.trim()).map_err(DecodeError::Base64)?;
    let image = image::load_from_memory(&bytes).map_err(DecodeError::Image)?;
    into_bitmap(image)
}

/// Normalize any decoded image to the canonical bitmap layout.
pub fn into_bitmap(image: DynamicImage) -> Result<Bitmap, DecodeError> {
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return Err(DecodeError::EmptyImage { width, height });
    }
    Ok(image.into_rgb8())
}

/// Encode a bitmap as a PNG data URL, the same shape browsers send.
pub fn encode_png_payload(bitmap: &Bitmap) -> Result<String, image::ImageError> {
    let mut png = Vec::new();
    bitmap.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(format!("data:image/png;base64,{}", STANDARD.encode(png)))
}
