//! Image helpers: header-only dimension probing, perceptual hashing, and
//! solid-colour PNG encoding.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageError, ImageFormat, ImageReader, Rgb, RgbImage};

/// Width of the grayscale thumbnail used by [`difference_hash`]. One wider
/// than the hash rows so each row yields eight comparisons.
const DHASH_WIDTH: u32 = 9;
const DHASH_HEIGHT: u32 = 8;

/// Read the dimensions of an encoded image without decoding its pixels.
pub fn dimensions(bytes: &[u8]) -> Result<(u32, u32), ImageError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_dimensions()
}

/// MIME type of encoded image bytes, sniffed from their magic number.
pub fn mime_type(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes).map_or("application/octet-stream", |format| format.to_mime_type())
}

/// Fully decode an encoded image.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, ImageError> {
    image::load_from_memory(bytes)
}

/// 64-bit difference hash: each bit records whether a pixel of the 9x8
/// grayscale thumbnail is brighter than its right-hand neighbour.
pub fn difference_hash(img: &DynamicImage) -> u64 {
    let thumb = img
        .resize_exact(DHASH_WIDTH, DHASH_HEIGHT, FilterType::Triangle)
        .to_luma8();

    let mut hash = 0u64;
    for y in 0..DHASH_HEIGHT {
        for x in 0..DHASH_WIDTH - 1 {
            let left = thumb.get_pixel(x, y).0[0];
            let right = thumb.get_pixel(x + 1, y).0[0];
            hash = (hash << 1) | u64::from(left > right);
        }
    }
    hash
}

/// Render a difference hash as 16 lowercase hex characters.
pub fn hash_hex(hash: u64) -> String {
    format!("{hash:016x}")
}

/// Encode a solid-colour RGB image as PNG.
pub fn solid_png(width: u32, height: u32, rgb: [u8; 3]) -> Result<Vec<u8>, ImageError> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(rgb)));
    encode_png(&img)
}

/// Encode any decoded image as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, ImageError> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}
