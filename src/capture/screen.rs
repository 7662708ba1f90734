//! Frame producer backed by the `screenshots` crate

use super::{
    BYTES_PER_PIXEL, CaptureError, DisplayGeometry, FrameProducer, RawFrame, RenderTarget,
};
use crate::permissions::CaptureGrant;
use screenshots::Screen;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const PRIMARY_DISPLAY: &str = "primary";

#[derive(Debug, Default)]
pub struct DesktopScreenProducer;

impl DesktopScreenProducer {
    pub fn new() -> Self {
        Self
    }
}

/// Pick the screen named by a grant payload: `primary` (or empty) or a display id
fn select_screen(selector: &str) -> Result<Screen, CaptureError> {
    let mut screens = Screen::all()
        .map_err(|e| CaptureError::CaptureFailed(format!("Failed to list screens: {}", e)))?;
    if screens.is_empty() {
        return Err(CaptureError::CaptureFailed("No screens found".to_string()));
    }

    let selector = selector.trim();
    let index = if selector.is_empty() || selector == PRIMARY_DISPLAY {
        screens
            .iter()
            .position(|s| s.display_info.is_primary)
            .unwrap_or(0)
    } else {
        let id: u32 = selector.parse().map_err(|_| {
            CaptureError::CaptureFailed(format!("Invalid display selector '{}'", selector))
        })?;
        screens
            .iter()
            .position(|s| s.display_info.id == id)
            .ok_or_else(|| CaptureError::CaptureFailed(format!("Display {} not found", id)))?
    };

    Ok(screens.swap_remove(index))
}

struct ScreenTarget {
    released: Arc<AtomicBool>,
}

impl RenderTarget for ScreenTarget {
    fn release(&mut self) {
        self.released.store(true, Ordering::Release);
    }
}

impl FrameProducer for DesktopScreenProducer {
    fn geometry(&self, grant: &CaptureGrant) -> Result<DisplayGeometry, CaptureError> {
        let screen = select_screen(grant.payload())?;
        let info = &screen.display_info;
        Ok(DisplayGeometry::from_logical(
            info.width,
            info.height,
            info.scale_factor,
        ))
    }

    fn attach(
        &self,
        grant: &CaptureGrant,
        geometry: DisplayGeometry,
        frames: mpsc::Sender<Result<RawFrame, CaptureError>>,
    ) -> Result<Box<dyn RenderTarget>, CaptureError> {
        let released = Arc::new(AtomicBool::new(false));
        let target_released = Arc::clone(&released);
        let selector = grant.payload().to_string();

        tokio::task::spawn_blocking(move || {
            let result = select_screen(&selector).and_then(|screen| {
                screen
                    .capture()
                    .map_err(|e| CaptureError::CaptureFailed(e.to_string()))
            });

            let frame = result.map(|image| {
                let (width, height) = image.dimensions();
                if width != geometry.width || height != geometry.height {
                    debug!(
                        width,
                        height,
                        expected_width = geometry.width,
                        expected_height = geometry.height,
                        "Grabbed image differs from display geometry"
                    );
                }
                RawFrame {
                    width,
                    height,
                    pixel_stride: BYTES_PER_PIXEL,
                    row_stride: width as usize * BYTES_PER_PIXEL,
                    data: image.into_raw(),
                }
            });

            if released.load(Ordering::Acquire) {
                debug!("Render target released before the frame was ready");
                return;
            }
            if frames.blocking_send(frame).is_err() {
                warn!("Frame receiver dropped");
            }
        });

        Ok(Box::new(ScreenTarget {
            released: target_released,
        }))
    }
}
