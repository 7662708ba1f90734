//! Permission gate and capture-grant cache
//!
//! The gate is an owned session object: the service builds one at startup and
//! hands it (behind a mutex) to everything that needs capability checks. It
//! holds at most one capture grant; storing a new grant revokes the old one.

use crate::desktop::DisplayServer;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Result code of an accepted capture consent
pub const RESULT_OK: i32 = -1;
/// Result code of a declined capture consent
pub const RESULT_CANCELED: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    StorageRead,
    OverlayDraw,
    Notifications,
    ScreenCapture,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::StorageRead,
        Capability::OverlayDraw,
        Capability::Notifications,
        Capability::ScreenCapture,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::StorageRead => "storage_read",
            Capability::OverlayDraw => "overlay_draw",
            Capability::Notifications => "notifications",
            Capability::ScreenCapture => "screen_capture",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-time authorization to read screen pixels.
///
/// Clones share the revocation flag, so a capture holding a clone observes a
/// release that happens while it is in flight.
#[derive(Debug, Clone)]
pub struct CaptureGrant {
    result_code: i32,
    payload: String,
    revoked: Arc<AtomicBool>,
}

impl CaptureGrant {
    fn new(result_code: i32, payload: String) -> Self {
        Self {
            result_code,
            payload,
            revoked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Opaque payload handed back to the frame producer (display selector on desktop)
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    pub fn is_usable(&self) -> bool {
        self.result_code == RESULT_OK && !self.is_revoked()
    }

    fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }
}

/// Platform-side capability checks
pub trait PlatformPermissions: Send {
    /// Whether the platform currently grants `capability`.
    /// `ScreenCapture` is never asked; the gate answers it from the grant cache.
    fn check(&self, capability: Capability) -> bool;

    /// Start the platform's request flow. The answer comes back later
    /// through [`PermissionGate::on_permission_result`].
    fn request(&self, capability: Capability);
}

/// Checks against the running desktop session
#[derive(Debug, Default)]
pub struct DesktopPlatform;

impl DesktopPlatform {
    fn pictures_dir() -> Option<PathBuf> {
        directories::UserDirs::new().and_then(|dirs| dirs.picture_dir().map(|p| p.to_path_buf()))
    }

    fn tool_available(tool: &str) -> bool {
        Command::new("which")
            .arg(tool)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

impl PlatformPermissions for DesktopPlatform {
    fn check(&self, capability: Capability) -> bool {
        match capability {
            Capability::OverlayDraw => !matches!(DisplayServer::detect(), DisplayServer::Unknown),
            Capability::StorageRead => Self::pictures_dir()
                .map(|dir| std::fs::read_dir(dir).is_ok())
                .unwrap_or(false),
            Capability::Notifications => Self::tool_available("notify-send"),
            Capability::ScreenCapture => false,
        }
    }

    fn request(&self, capability: Capability) {
        let hint = match capability {
            Capability::OverlayDraw => "start tyan from inside a Wayland or X11 session",
            Capability::StorageRead => "make your pictures directory readable",
            Capability::Notifications => "install libnotify (notify-send)",
            Capability::ScreenCapture => "run 'tyan grant' to allow screen capture",
        };
        warn!(%capability, "Permission missing: {}", hint);
    }
}

pub struct PermissionGate {
    platform: Box<dyn PlatformPermissions>,
    grant: Option<CaptureGrant>,
    granted: HashSet<Capability>,
    pending: HashSet<Capability>,
}

impl PermissionGate {
    pub fn new(platform: Box<dyn PlatformPermissions>) -> Self {
        Self {
            platform,
            grant: None,
            granted: HashSet::new(),
            pending: HashSet::new(),
        }
    }

    pub fn desktop() -> Self {
        Self::new(Box::new(DesktopPlatform))
    }

    /// Check a capability, starting the platform request flow if it is missing
    pub fn ensure_granted(&mut self, capability: Capability) -> bool {
        let granted = match capability {
            Capability::ScreenCapture => self.active_grant().is_some(),
            other => self.granted.contains(&other) || self.platform.check(other),
        };

        if granted {
            self.pending.remove(&capability);
            return true;
        }

        if self.pending.insert(capability) {
            debug!(%capability, "Requesting permission");
            self.platform.request(capability);
        }
        false
    }

    /// Deliver the asynchronous answer of a platform request flow
    pub fn on_permission_result(&mut self, capability: Capability, granted: bool) {
        self.pending.remove(&capability);
        if granted {
            info!(%capability, "Permission granted");
            self.granted.insert(capability);
        } else {
            info!(%capability, "Permission denied");
            self.granted.remove(&capability);
        }
    }

    pub fn is_pending(&self, capability: Capability) -> bool {
        self.pending.contains(&capability)
    }

    /// Check every capability without starting any request flow
    pub fn check_all(&self) -> Vec<(Capability, bool)> {
        Capability::ALL
            .into_iter()
            .map(|capability| {
                let granted = match capability {
                    Capability::ScreenCapture => self.active_grant().is_some(),
                    other => self.granted.contains(&other) || self.platform.check(other),
                };
                (capability, granted)
            })
            .collect()
    }

    /// Store a new capture grant, revoking any previous one. Returns whether it is usable.
    pub fn store_capture(&mut self, result_code: i32, payload: impl Into<String>) -> bool {
        self.release_grant();

        let grant = CaptureGrant::new(result_code, payload.into());
        let usable = grant.is_usable();
        if usable {
            info!(payload = grant.payload(), "Screen capture grant stored");
        } else {
            warn!(result_code, "Screen capture consent was not given");
        }
        self.grant = Some(grant);
        self.pending.remove(&Capability::ScreenCapture);
        usable
    }

    pub fn active_grant(&self) -> Option<CaptureGrant> {
        self.grant.as_ref().filter(|g| g.is_usable()).cloned()
    }

    /// Revoke and drop the current grant, if any
    pub fn release_grant(&mut self) {
        if let Some(grant) = self.grant.take() {
            grant.revoke();
            debug!("Screen capture grant released");
        }
    }
}

impl Drop for PermissionGate {
    fn drop(&mut self) {
        self.release_grant();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Grants every platform-checked capability
    pub struct AllowAll;

    impl PlatformPermissions for AllowAll {
        fn check(&self, _capability: Capability) -> bool {
            true
        }

        fn request(&self, _capability: Capability) {}
    }

    pub fn gate_with_grant() -> PermissionGate {
        let mut gate = PermissionGate::new(Box::new(AllowAll));
        gate.store_capture(RESULT_OK, "primary");
        gate
    }
}
