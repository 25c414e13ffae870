//! Image decoding and encoding for the vision model.
//!
//! Embedded images arrive in whatever format the document author pasted
//! (PNG, JPEG, GIF, BMP). They are decoded once to learn their pixel size,
//! then re-encoded as base64 PNG wrapped in `ImageData`. Formats the
//! `image` crate cannot decode (EMF/WMF, truncated data) fail here and the
//! caller records an [`crate::error::ImageError::Undecodable`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// A decoded image ready to send, plus the facts the size filter needs.
pub struct PreparedImage {
    pub width: u32,
    pub height: u32,
    /// Size of the original encoded bytes.
    pub byte_len: usize,
    pub image: DynamicImage,
}

impl PreparedImage {
    /// Below either pixel threshold or the byte threshold.
    pub fn is_undersized(&self, min_width: u32, min_height: u32, min_bytes: usize) -> bool {
        self.width < min_width || self.height < min_height || self.byte_len < min_bytes
    }
}

/// Decode raw image bytes.
pub fn decode_image(bytes: &[u8]) -> Result<PreparedImage, image::ImageError> {
    let image = image::load_from_memory(bytes)?;
    debug!(
        "Decoded image {}x{} from {} bytes",
        image.width(),
        image.height(),
        bytes.len()
    );
    Ok(PreparedImage {
        width: image.width(),
        height: image.height(),
        byte_len: bytes.len(),
        image,
    })
}

/// Encode an image as base64 PNG text.
pub fn encode_png_base64(img: &DynamicImage) -> Result<String, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded image → {} bytes base64", b64.len());
    Ok(b64)
}

/// Wrap base64 PNG text for the vision API.
///
/// `detail: "high"` keeps small UI text in screenshots legible to
/// GPT-4-class models.
pub fn png_image_data(b64: String) -> ImageData {
    ImageData::new(b64, "image/png").with_detail("high")
}

/// Encode an image as a base64 PNG ready for the vision API.
pub fn encode_image(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    encode_png_base64(img).map(png_image_data)
}

#[cfg(test)]
pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    use image::{Rgba, RgbaImage};
    // Noise keeps PNG compression from shrinking large images below byte thresholds.
    let img = RgbaImage::from_fn(width, height, |x, y| {
        let v = (x.wrapping_mul(31) ^ y.wrapping_mul(17)) as u8;
        Rgba([v, v.wrapping_add(80), v.wrapping_mul(3), 255])
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}
