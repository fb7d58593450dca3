//! JPEG encoding for stream parts and alert snapshots.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

use crate::frame::Frame;

pub const JPEG_QUALITY: u8 = 80;

/// Encode an RGB24 frame as JPEG.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let image = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
        .ok_or_else(|| {
            anyhow!(
                "frame {} buffer does not match {}x{} RGB24",
                frame.index,
                frame.width,
                frame.height
            )
        })?;
    encode_image(&image)
}

/// Encode an image buffer as JPEG.
pub fn encode_image(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY)
        .encode_image(image)
        .context("jpeg encode")?;
    Ok(buffer)
}

/// Dark filler image streamed while a source has no frame to show, with a
/// lighter band across the middle so clients can tell it from a dead feed.
pub fn placeholder_image(width: u32, height: u32) -> RgbImage {
    let mut image = RgbImage::from_pixel(width.max(1), height.max(1), Rgb([16, 16, 16]));
    let band_top = image.height() / 3;
    let band_bottom = band_top * 2;
    for y in band_top..band_bottom {
        for x in 0..image.width() {
            image.put_pixel(x, y, Rgb([48, 48, 48]));
        }
    }
    image
}

pub fn placeholder_jpeg(width: u32, height: u32) -> Result<Vec<u8>> {
    encode_image(&placeholder_image(width, height))
}
