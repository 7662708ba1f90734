//! Overlay capture pipeline: grant check, capture, request, clipboard

use crate::capture::{self, CaptureError, CapturedFrame, FrameProducer};
use crate::delivery::{ClipboardSink, Notifier, deliver_overlay};
use crate::model::{ModelClient, build_request, compose_user_content};
use crate::permissions::{Capability, PermissionGate};
use crate::protocol::State;
use crate::settings::StyleSettings;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CAPTURING_TEXT: &str = "正在截图...";
pub const SENDING_TEXT: &str = "正在发送给大模型...";
pub const CAPTURE_FAILED_TEXT: &str = "截图失败";
pub const PERMISSION_DENIED_TEXT: &str = "截图权限被拒绝，请先运行 tyan grant";
pub const OUT_OF_MEMORY_HINT: &str = "内存不足，请尝试较小的截图";

/// Everything one overlay run borrows from the service
pub struct OverlayContext<'a> {
    pub gate: &'a Mutex<PermissionGate>,
    pub producer: &'a dyn FrameProducer,
    pub client: &'a ModelClient,
    pub settings: &'a StyleSettings,
    pub clipboard: &'a dyn ClipboardSink,
    pub notifier: &'a dyn Notifier,
    /// Wait before grabbing so the "capturing" notification is off screen
    pub settle_delay: Duration,
}

/// Run one capture-to-clipboard cycle. Returns the reply, or the message
/// already shown to the user.
pub async fn run_overlay_capture<F>(ctx: &OverlayContext<'_>, mut on_state: F) -> Result<String, String>
where
    F: FnMut(State) + Send,
{
    let grant = {
        let mut gate = ctx.gate.lock().await;
        if !gate.ensure_granted(Capability::ScreenCapture) {
            None
        } else {
            gate.active_grant()
        }
    };
    let Some(grant) = grant else {
        warn!("Capture requested without a usable grant");
        ctx.notifier.notify(PERMISSION_DENIED_TEXT);
        on_state(State::Error);
        return Err(PERMISSION_DENIED_TEXT.to_string());
    };

    on_state(State::Capturing);
    ctx.notifier.notify(CAPTURING_TEXT);
    if !ctx.settle_delay.is_zero() {
        tokio::time::sleep(ctx.settle_delay).await;
    }

    let frame = match capture::capture(ctx.producer, &grant).await {
        Ok(frame) => frame,
        Err(e) => {
            warn!("{}", e);
            let message = format!("{}: {}", CAPTURE_FAILED_TEXT, e);
            ctx.notifier.notify(&message);
            on_state(State::Error);
            return Err(message);
        }
    };

    send_frame(ctx, frame, &mut on_state).await
}

/// Encode a captured frame, send it and deliver the reply
async fn send_frame<F>(ctx: &OverlayContext<'_>, frame: CapturedFrame, on_state: &mut F) -> Result<String, String>
where
    F: FnMut(State) + Send,
{
    on_state(State::Sending);
    ctx.notifier.notify(SENDING_TEXT);

    let user_text = compose_user_content(ctx.settings, None, true);
    let request = match build_request(ctx.settings, &user_text, Some(frame)) {
        Ok(request) => request,
        Err(e) => {
            warn!("{}", e);
            let message = encoding_failure_message(&e);
            ctx.notifier.notify(&message);
            on_state(State::Error);
            return Err(message);
        }
    };

    let result = ctx.client.send(ctx.settings, &request).await;
    let outcome = deliver_overlay(result, ctx.clipboard, ctx.notifier);
    match &outcome {
        Ok(reply) => {
            info!(chars = reply.chars().count(), "Reply copied to clipboard");
            on_state(State::Idle);
        }
        Err(_) => on_state(State::Error),
    }
    outcome
}

fn encoding_failure_message(error: &CaptureError) -> String {
    match error {
        CaptureError::EncodingFailed(cause) if cause == capture::encode::OUT_OF_MEMORY_TEXT => {
            OUT_OF_MEMORY_HINT.to_string()
        }
        other => format!("发送图片失败: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::SolidProducer;
    use crate::capture::{DisplayGeometry, FrameSource, RawFrame, RenderTarget};
    use crate::permissions::CaptureGrant;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use crate::delivery::OVERLAY_COPIED_TEXT;
    use crate::delivery::testing::{RecordingClipboard, RecordingNotifier};
    use crate::model::testing::serve_once;
    use crate::permissions::testing::{AllowAll, gate_with_grant};

    fn settings_for(url: &str) -> StyleSettings {
        let mut settings = StyleSettings::default();
        settings.url = url.to_string();
        settings
    }

    #[tokio::test]
    async fn test_overlay_success_copies_reply() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"choices":[{"message":{"content":"好的，马上处理"}}]}"#,
        )
        .await;
        let gate = Mutex::new(gate_with_grant());
        let client = ModelClient::new(None).unwrap();
        let settings = settings_for(&url);
        let clipboard = RecordingClipboard::default();
        let notifier = RecordingNotifier::default();
        let ctx = OverlayContext {
            gate: &gate,
            producer: &SolidProducer,
            client: &client,
            settings: &settings,
            clipboard: &clipboard,
            notifier: &notifier,
            settle_delay: Duration::ZERO,
        };

        let mut states = Vec::new();
        let reply = run_overlay_capture(&ctx, |s| states.push(s)).await.unwrap();
        assert_eq!(reply, "好的，马上处理");
        assert_eq!(clipboard.writes.lock().unwrap().as_slice(), &["好的，马上处理".to_string()]);
        assert_eq!(
            notifier.messages.lock().unwrap().last().map(String::as_str),
            Some(OVERLAY_COPIED_TEXT)
        );
        assert_eq!(states, vec![State::Capturing, State::Sending, State::Idle]);

        let raw = server.await.unwrap();
        assert!(raw.contains("data:image/jpeg;base64,"));
        assert!(raw.contains("请根据图片内容给出合适的回复。"));
    }

    #[tokio::test]
    async fn test_overlay_without_grant_aborts_before_capture() {
        let gate = Mutex::new(PermissionGate::new(Box::new(AllowAll)));
        let client = ModelClient::new(None).unwrap();
        let settings = StyleSettings::default();
        let clipboard = RecordingClipboard::default();
        let notifier = RecordingNotifier::default();
        let ctx = OverlayContext {
            gate: &gate,
            producer: &SolidProducer,
            client: &client,
            settings: &settings,
            clipboard: &clipboard,
            notifier: &notifier,
            settle_delay: Duration::ZERO,
        };

        let err = run_overlay_capture(&ctx, |_| {}).await.unwrap_err();
        assert_eq!(err, PERMISSION_DENIED_TEXT);
        assert!(clipboard.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overlay_api_error_is_notified_not_copied() {
        let (url, server) = serve_once("500 Internal Server Error", "upstream down").await;
        let gate = Mutex::new(gate_with_grant());
        let client = ModelClient::new(None).unwrap();
        let settings = settings_for(&url);
        let clipboard = RecordingClipboard::default();
        let notifier = RecordingNotifier::default();
        let ctx = OverlayContext {
            gate: &gate,
            producer: &SolidProducer,
            client: &client,
            settings: &settings,
            clipboard: &clipboard,
            notifier: &notifier,
            settle_delay: Duration::ZERO,
        };

        let err = run_overlay_capture(&ctx, |_| {}).await.unwrap_err();
        assert_eq!(err, "请求错误: 500 - upstream down");
        assert!(clipboard.writes.lock().unwrap().is_empty());
        server.await.unwrap();
    }

    /// Gives up without delivering a frame
    struct SilentProducer;

    struct IdleTarget;

    impl RenderTarget for IdleTarget {
        fn release(&mut self) {}
    }

    impl FrameProducer for SilentProducer {
        fn geometry(&self, _grant: &CaptureGrant) -> Result<DisplayGeometry, CaptureError> {
            Ok(DisplayGeometry::from_logical(4, 4, 1.0))
        }

        fn attach(
            &self,
            _grant: &CaptureGrant,
            _geometry: DisplayGeometry,
            frames: mpsc::Sender<Result<RawFrame, CaptureError>>,
        ) -> Result<Box<dyn RenderTarget>, CaptureError> {
            drop(frames);
            Ok(Box::new(IdleTarget))
        }
    }

    #[tokio::test]
    async fn test_overlay_capture_failure_sends_nothing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let gate = Mutex::new(gate_with_grant());
        let client = ModelClient::new(None).unwrap();
        let settings = settings_for(&url);
        let clipboard = RecordingClipboard::default();
        let notifier = RecordingNotifier::default();
        let ctx = OverlayContext {
            gate: &gate,
            producer: &SilentProducer,
            client: &client,
            settings: &settings,
            clipboard: &clipboard,
            notifier: &notifier,
            settle_delay: Duration::ZERO,
        };

        let mut states = Vec::new();
        let err = run_overlay_capture(&ctx, |s| states.push(s)).await.unwrap_err();
        assert!(err.starts_with(CAPTURE_FAILED_TEXT));
        assert_eq!(states, vec![State::Capturing, State::Error]);
        assert_eq!(notifier.messages.lock().unwrap().last(), Some(&err));
        assert!(clipboard.writes.lock().unwrap().is_empty());

        let accepted = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(accepted.is_err(), "no request may reach the model endpoint");
    }

    #[tokio::test]
    async fn test_oversized_frame_reports_out_of_memory() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let gate = Mutex::new(gate_with_grant());
        let client = ModelClient::new(None).unwrap();
        let settings = settings_for(&url);
        let clipboard = RecordingClipboard::default();
        let notifier = RecordingNotifier::default();
        let ctx = OverlayContext {
            gate: &gate,
            producer: &SolidProducer,
            client: &client,
            settings: &settings,
            clipboard: &clipboard,
            notifier: &notifier,
            settle_delay: Duration::ZERO,
        };

        // Only the declared size matters; the guard refuses before touching pixels
        let frame = CapturedFrame::new(20_000, 20_000, Vec::new(), FrameSource::Screen);
        let mut states = Vec::new();
        let err = send_frame(&ctx, frame, &mut |s| states.push(s)).await.unwrap_err();

        assert_eq!(err, OUT_OF_MEMORY_HINT);
        assert_eq!(states, vec![State::Sending, State::Error]);
        assert_eq!(
            notifier.messages.lock().unwrap().last().map(String::as_str),
            Some(OUT_OF_MEMORY_HINT)
        );
        assert!(clipboard.writes.lock().unwrap().is_empty());

        let accepted = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(accepted.is_err());
    }

    #[test]
    fn test_other_encoding_failures_keep_cause() {
        let message = encoding_failure_message(&CaptureError::EncodingFailed("empty frame 0x0".into()));
        assert_eq!(message, "发送图片失败: Image encoding failed: empty frame 0x0");
    }
}
