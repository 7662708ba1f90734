use super::{CaptureError, CapturedFrame, FrameSource};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, DynamicImage, RgbaImage};
use std::path::Path;
use tracing::debug;

pub const JPEG_QUALITY: u8 = 70;
pub const OUT_OF_MEMORY_TEXT: &str = "内存不足";

// 16k x 16k; anything bigger is refused rather than allocated
const MAX_ENCODE_PIXELS: u64 = 16_384 * 16_384;

/// Encode to JPEG, consuming the frame
pub fn encode_jpeg(frame: CapturedFrame, quality: u8) -> Result<Vec<u8>, CaptureError> {
    let (width, height) = (frame.width(), frame.height());
    if width == 0 || height == 0 {
        return Err(CaptureError::EncodingFailed(format!(
            "empty frame {}x{}",
            width, height
        )));
    }
    if width as u64 * height as u64 > MAX_ENCODE_PIXELS {
        return Err(CaptureError::EncodingFailed(OUT_OF_MEMORY_TEXT.to_string()));
    }

    let rgba = RgbaImage::from_raw(width, height, frame.into_pixels()).ok_or_else(|| {
        CaptureError::EncodingFailed("pixel buffer does not match frame size".to_string())
    })?;
    let rgb = DynamicImage::ImageRgba8(rgba).into_rgb8();

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(rgb.as_raw(), width, height, ColorType::Rgb8)
        .map_err(|e| CaptureError::EncodingFailed(e.to_string()))?;

    debug!(width, height, quality, bytes = out.len(), "Encoded JPEG");
    Ok(out)
}

/// `data:image/jpeg;base64,...` at the default quality
pub fn encode_data_uri(frame: CapturedFrame) -> Result<String, CaptureError> {
    let jpeg = encode_jpeg(frame, JPEG_QUALITY)?;
    Ok(format!("data:image/jpeg;base64,{}", BASE64.encode(jpeg)))
}

/// Decode a user-picked image file
pub fn load_picked(path: &Path) -> Result<CapturedFrame, CaptureError> {
    let image = image::open(path)
        .map_err(|e| CaptureError::ImageLoad(format!("{}: {}", path.display(), e)))?;
    let rgba = image.into_rgba8();
    let (width, height) = rgba.dimensions();
    debug!(path = %path.display(), width, height, "Loaded picked image");
    Ok(CapturedFrame::new(
        width,
        height,
        rgba.into_raw(),
        FrameSource::Picked,
    ))
}
