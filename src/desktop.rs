//! Desktop collaborators: clipboard and transient notifications
//!
//! Both shell out to the usual session tools (`wl-copy`/`xclip`,
//! `notify-send`) picked by the detected display server.

use crate::delivery::{ClipboardError, ClipboardSink, Notifier};
use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayServer {
    Wayland,
    X11,
    Unknown,
}

impl DisplayServer {
    /// Detect which display server is currently running
    pub fn detect() -> Self {
        if env::var("WAYLAND_DISPLAY").is_ok()
            || env::var("XDG_SESSION_TYPE").as_ref().map(|s| s.as_str()) == Ok("wayland")
        {
            return DisplayServer::Wayland;
        }

        if env::var("DISPLAY").is_ok() {
            return DisplayServer::X11;
        }

        DisplayServer::Unknown
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayServer::Wayland => "wayland",
            DisplayServer::X11 => "x11",
            DisplayServer::Unknown => "unknown",
        }
    }

    fn copy_command(&self) -> Option<Command> {
        match self {
            DisplayServer::X11 => {
                let mut cmd = Command::new("xclip");
                cmd.args(["-selection", "clipboard"]);
                Some(cmd)
            }
            DisplayServer::Wayland => {
                let mut cmd = Command::new("wl-copy");
                cmd.args(["--type", "text/plain;charset=utf-8"]);
                Some(cmd)
            }
            DisplayServer::Unknown => None,
        }
    }

    fn paste_command(&self) -> Option<Command> {
        match self {
            DisplayServer::X11 => {
                let mut cmd = Command::new("xclip");
                cmd.args(["-selection", "clipboard", "-o"]);
                Some(cmd)
            }
            DisplayServer::Wayland => {
                let mut cmd = Command::new("wl-paste");
                cmd.args(["--no-newline", "--type", "text/plain"]);
                Some(cmd)
            }
            DisplayServer::Unknown => None,
        }
    }
}

fn ensure_tool(cmd: &Command) -> Result<String, ClipboardError> {
    let tool = cmd.get_program().to_string_lossy().to_string();
    if Path::new(&tool).is_absolute() {
        return if Path::new(&tool).is_file() {
            Ok(tool)
        } else {
            Err(ClipboardError::ToolMissing(tool))
        };
    }
    let found = Command::new("which")
        .arg(&tool)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false);
    if found {
        Ok(tool)
    } else {
        Err(ClipboardError::ToolMissing(tool))
    }
}

#[derive(Debug)]
pub struct SystemClipboard {
    display_server: DisplayServer,
    /// Replaces the copy tool's program, keeping its arguments
    copy_program: Option<PathBuf>,
}

impl SystemClipboard {
    pub fn new() -> Self {
        Self {
            display_server: DisplayServer::detect(),
            copy_program: None,
        }
    }

    pub fn display_server(&self) -> DisplayServer {
        self.display_server
    }

    fn copy_command(&self) -> Option<Command> {
        let base = self.display_server.copy_command()?;
        let Some(program) = &self.copy_program else {
            return Some(base);
        };
        let mut cmd = Command::new(program);
        cmd.args(base.get_args());
        Some(cmd)
    }

    /// Read the current text selection, `None` when it is empty
    pub fn read_text(&self) -> Result<Option<String>, ClipboardError> {
        let mut cmd = self
            .display_server
            .paste_command()
            .ok_or(ClipboardError::NoDisplay)?;
        let tool = ensure_tool(&cmd)?;

        let output = cmd.output()?;
        if !output.status.success() {
            // wl-paste exits non-zero on an empty clipboard
            debug!("{} returned {}", tool, output.status);
            return Ok(None);
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        Ok(if text.trim().is_empty() { None } else { Some(text) })
    }
}

impl Default for SystemClipboard {
    fn default() -> Self {
        Self::new()
    }
}

impl ClipboardSink for SystemClipboard {
    fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        let mut cmd = self.copy_command().ok_or(ClipboardError::NoDisplay)?;
        let tool = ensure_tool(&cmd)?;

        // xclip and wl-copy leave a forked owner serving the selection, so
        // no output pipe may outlive the foreground process
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes())?;
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(ClipboardError::ToolFailed {
                tool,
                status: status.to_string(),
            });
        }

        debug!(chars = text.chars().count(), "Copied text to clipboard via {}", tool);
        Ok(())
    }
}

/// Transient confirmations through `notify-send`, logged when that is unavailable
#[derive(Debug)]
pub struct DesktopNotifier {
    available: bool,
}

impl DesktopNotifier {
    pub fn new() -> Self {
        let available = Command::new("which")
            .arg("notify-send")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);
        Self { available }
    }
}

impl Default for DesktopNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for DesktopNotifier {
    fn notify(&self, message: &str) {
        info!("{}", message);
        if !self.available {
            return;
        }

        let status = Command::new("notify-send")
            .args(["--app-name=tyan", "--expire-time=2000", "tyan"])
            .arg(message)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = status {
            warn!("notify-send failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::{Duration, Instant};

    fn fake_tool(script: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tyan-clip-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("xclip");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn clipboard_with(program: PathBuf) -> SystemClipboard {
        SystemClipboard {
            display_server: DisplayServer::X11,
            copy_program: Some(program),
        }
    }

    #[test]
    fn test_write_returns_while_selection_owner_lives() {
        let tool = fake_tool("#!/bin/sh\ncat > /dev/null\n( sleep 8 ) &\nexit 0\n");
        let clipboard = clipboard_with(tool.clone());

        let started = Instant::now();
        clipboard.write_text("Sounds good!").unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));

        let _ = std::fs::remove_dir_all(tool.parent().unwrap());
    }

    #[test]
    fn test_write_reports_tool_failure() {
        let tool = fake_tool("#!/bin/sh\ncat > /dev/null\nexit 3\n");
        let clipboard = clipboard_with(tool.clone());

        let err = clipboard.write_text("Sounds good!").unwrap_err();
        assert!(matches!(err, ClipboardError::ToolFailed { .. }));

        let _ = std::fs::remove_dir_all(tool.parent().unwrap());
    }

    #[test]
    fn test_missing_tool_is_reported() {
        let clipboard = clipboard_with(PathBuf::from("/nonexistent/tyan/xclip"));
        let err = clipboard.write_text("x").unwrap_err();
        assert!(matches!(err, ClipboardError::ToolMissing(_)));
    }

    #[test]
    fn test_unknown_display_has_no_copy_tool() {
        let clipboard = SystemClipboard {
            display_server: DisplayServer::Unknown,
            copy_program: None,
        };
        assert!(matches!(clipboard.write_text("x"), Err(ClipboardError::NoDisplay)));
    }
}
