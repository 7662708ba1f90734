//! Single-shot frame capture
//!
//! A [`FrameProducer`] renders the display bound to a capture grant into a
//! transient render target. [`capture`] attaches one, takes the first frame
//! it delivers, copies it into a tightly packed [`CapturedFrame`] and tears
//! the target down again on every exit path.

pub mod encode;
pub mod screen;

use crate::permissions::CaptureGrant;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use screen::DesktopScreenProducer;

/// RGBA8
pub const BYTES_PER_PIXEL: usize = 4;
/// Frames the render target may queue before the producer blocks
pub const MAX_PENDING_FRAMES: usize = 2;
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Screen capture failed: {0}")]
    CaptureFailed(String),
    #[error("Image encoding failed: {0}")]
    EncodingFailed(String),
    #[error("Failed to load image: {0}")]
    ImageLoad(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    Screen,
    Picked,
}

/// Owned, tightly packed RGBA8 image
#[derive(Debug)]
pub struct CapturedFrame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    source: FrameSource,
}

impl CapturedFrame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>, source: FrameSource) -> Self {
        Self {
            width,
            height,
            pixels,
            source,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn source(&self) -> FrameSource {
        self.source
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }
}

/// A frame as the producer hands it over, rows possibly padded
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub pixel_stride: usize,
    pub row_stride: usize,
    pub data: Vec<u8>,
}

/// Physical size of the display a grant is bound to
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayGeometry {
    pub width: u32,
    pub height: u32,
    pub scale_factor: f32,
}

impl DisplayGeometry {
    pub fn from_logical(width: u32, height: u32, scale_factor: f32) -> Self {
        let scale = if scale_factor.is_finite() && scale_factor > 0.0 {
            scale_factor
        } else {
            1.0
        };
        Self {
            width: (width as f32 * scale).floor() as u32,
            height: (height as f32 * scale).floor() as u32,
            scale_factor: scale,
        }
    }
}

pub trait FrameProducer: Send + Sync {
    fn geometry(&self, grant: &CaptureGrant) -> Result<DisplayGeometry, CaptureError>;

    /// Start rendering into a transient target. Frames arrive on `frames`;
    /// dropping the sender without a frame means the producer gave up.
    fn attach(
        &self,
        grant: &CaptureGrant,
        geometry: DisplayGeometry,
        frames: mpsc::Sender<Result<RawFrame, CaptureError>>,
    ) -> Result<Box<dyn RenderTarget>, CaptureError>;
}

pub trait RenderTarget: Send {
    fn release(&mut self);
}

struct TargetGuard {
    target: Box<dyn RenderTarget>,
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        self.target.release();
        debug!("Render target released");
    }
}

pub async fn capture(
    producer: &dyn FrameProducer,
    grant: &CaptureGrant,
) -> Result<CapturedFrame, CaptureError> {
    capture_with_timeout(producer, grant, FRAME_TIMEOUT).await
}

pub async fn capture_with_timeout(
    producer: &dyn FrameProducer,
    grant: &CaptureGrant,
    limit: Duration,
) -> Result<CapturedFrame, CaptureError> {
    if !grant.is_usable() {
        return Err(CaptureError::CaptureFailed(
            "capture grant is not usable".to_string(),
        ));
    }

    let geometry = producer.geometry(grant)?;
    debug!(
        width = geometry.width,
        height = geometry.height,
        scale = geometry.scale_factor,
        "Display geometry"
    );

    let (tx, mut rx) = mpsc::channel(MAX_PENDING_FRAMES);
    let _guard = TargetGuard {
        target: producer.attach(grant, geometry, tx)?,
    };

    let raw = match tokio::time::timeout(limit, rx.recv()).await {
        Ok(Some(frame)) => frame?,
        Ok(None) => {
            return Err(CaptureError::CaptureFailed(
                "frame producer closed without a frame".to_string(),
            ));
        }
        Err(_) => {
            warn!("No frame within {:?}", limit);
            return Err(CaptureError::CaptureFailed(format!(
                "no frame within {} ms",
                limit.as_millis()
            )));
        }
    };

    if grant.is_revoked() {
        return Err(CaptureError::CaptureFailed(
            "capture grant was revoked".to_string(),
        ));
    }

    let frame = trim_row_padding(&raw, geometry)?;
    info!(width = frame.width, height = frame.height, "Captured frame");
    Ok(frame)
}

/// Copy the `geometry` region out of `raw`, dropping row padding and any
/// rows beyond the requested height
pub fn trim_row_padding(
    raw: &RawFrame,
    geometry: DisplayGeometry,
) -> Result<CapturedFrame, CaptureError> {
    if raw.pixel_stride != BYTES_PER_PIXEL {
        return Err(CaptureError::CaptureFailed(format!(
            "unsupported pixel stride {}",
            raw.pixel_stride
        )));
    }
    if raw.width < geometry.width || raw.height < geometry.height {
        return Err(CaptureError::CaptureFailed(format!(
            "frame {}x{} is smaller than display {}x{}",
            raw.width, raw.height, geometry.width, geometry.height
        )));
    }

    let width = geometry.width as usize;
    let height = geometry.height as usize;
    let row_len = width * BYTES_PER_PIXEL;
    if raw.row_stride < row_len {
        return Err(CaptureError::CaptureFailed(format!(
            "row stride {} is shorter than a row of {} bytes",
            raw.row_stride, row_len
        )));
    }
    let needed = if height == 0 {
        0
    } else {
        raw.row_stride * (height - 1) + row_len
    };
    if raw.data.len() < needed {
        return Err(CaptureError::CaptureFailed(format!(
            "frame buffer holds {} bytes, {} needed",
            raw.data.len(),
            needed
        )));
    }

    let pixels = if raw.row_stride == row_len {
        raw.data[..row_len * height].to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_len * height);
        for row in raw.data.chunks(raw.row_stride).take(height) {
            pixels.extend_from_slice(&row[..row_len]);
        }
        pixels
    };

    Ok(CapturedFrame::new(
        geometry.width,
        geometry.height,
        pixels,
        FrameSource::Screen,
    ))
}
