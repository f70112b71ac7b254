//! Raw capture buffer → 3-channel frame image conversions.
//!
//! Every converter produces BGR, the native order of all frame sources.

use image::{ImageFormat, RgbImage};
use secureface_core::alignment::swap_red_blue;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("decode failed: {0}")]
    Decode(String),
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// BT.601 limited-range YUV → BGR.
fn yuv_to_bgr(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as f32 - 16.0) * 1.164;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    [
        clamp_u8(c + 2.018 * d),
        clamp_u8(c - 0.391 * d - 0.813 * e),
        clamp_u8(c + 1.596 * e),
    ]
}

/// Convert packed YUYV (4:2:2) to BGR.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V], sharing chroma.
pub fn yuyv_to_bgr(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width as usize) * (height as usize) * 2;
    check_len("YUYV", yuyv, expected)?;

    let mut out = Vec::with_capacity(expected / 2 * 3);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        out.extend_from_slice(&yuv_to_bgr(y0, u, v));
        out.extend_from_slice(&yuv_to_bgr(y1, u, v));
    }
    RgbImage::from_raw(width, height, out)
        .ok_or_else(|| FrameError::Decode("YUYV: odd width".into()))
}

/// Replicate 8-bit grayscale into three channels.
pub fn grey_to_bgr(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width as usize) * (height as usize);
    check_len("GREY", grey, pixels)?;
    let out: Vec<u8> = grey[..pixels].iter().flat_map(|&p| [p, p, p]).collect();
    RgbImage::from_raw(width, height, out).ok_or_else(|| FrameError::Decode("GREY".into()))
}

/// Packed 24-bit BGR3 buffer taken as-is.
pub fn packed24(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width as usize) * (height as usize) * 3;
    check_len("24-bit", buf, expected)?;
    RgbImage::from_raw(width, height, buf[..expected].to_vec())
        .ok_or_else(|| FrameError::Decode("24-bit".into()))
}

/// Packed 24-bit RGB3 buffer, reordered to BGR.
pub fn rgb24_to_bgr(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let mut img = packed24(buf, width, height)?;
    swap_red_blue(&mut img);
    Ok(img)
}

/// Decode a Motion-JPEG frame to BGR.
pub fn mjpeg_to_bgr(buf: &[u8]) -> Result<RgbImage, FrameError> {
    let mut img = image::load_from_memory_with_format(buf, ImageFormat::Jpeg)
        .map_err(|e| FrameError::Decode(format!("MJPG: {e}")))?
        .to_rgb8();
    swap_red_blue(&mut img);
    Ok(img)
}

/// Decode an image file to BGR, as a still-image frame or enrollment photo.
pub fn load_image_bgr(path: &Path) -> Result<RgbImage, FrameError> {
    let mut img = image::open(path)
        .map_err(|e| FrameError::Decode(format!("{}: {e}", path.display())))?
        .to_rgb8();
    swap_red_blue(&mut img);
    Ok(img)
}
