//! Terminal chat session: the local-image reply screen
//!
//! The session owns the transcript. Requests run on spawned tasks and post
//! their result back over a channel, so every transcript change happens on
//! the caller's loop.

use crate::capture::encode::load_picked;
use crate::delivery::{
    ClipboardSink, CycleOutcome, Notifier, SendTicket, Transcript, TranscriptEntry, deliver,
};
use crate::desktop::SystemClipboard;
use crate::model::{ModelClient, ReplyResult, build_request, compose_user_content};
use crate::permissions::{Capability, PermissionGate};
use crate::settings::{SettingKey, StyleSettings};
use jiff::Zoned;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const STORAGE_DENIED_TEXT: &str = "需要存储权限才能选择图片";
pub const IMAGE_LOAD_ERROR_TEXT: &str = "图片加载失败";
pub const PASTED_TEXT: &str = "已粘贴剪贴板内容";

const HELP_TEXT: &str = "Commands: /image PATH, /clear-image, /paste, /help, /quit. Any other line is sent as a message.\n/paste shows the clipboard text; an empty line then sends it, any other input discards it.";

#[derive(Debug)]
pub enum ChatEvent {
    Reply {
        ticket: SendTicket,
        result: ReplyResult,
    },
}

pub struct ChatSession {
    transcript: Transcript,
    settings: StyleSettings,
    client: ModelClient,
    clipboard: Arc<dyn ClipboardSink>,
    notifier: Arc<dyn Notifier>,
    gate: PermissionGate,
    image: Option<PathBuf>,
    // Pasted text waiting for the user to confirm it
    draft: Option<String>,
    events_tx: mpsc::UnboundedSender<ChatEvent>,
    events_rx: mpsc::UnboundedReceiver<ChatEvent>,
    // Entries already written to the terminal
    printed: usize,
}

enum Input {
    Line(Option<String>),
    Event(ChatEvent),
}

impl ChatSession {
    pub fn new(
        settings: StyleSettings,
        client: ModelClient,
        clipboard: Arc<dyn ClipboardSink>,
        notifier: Arc<dyn Notifier>,
        gate: PermissionGate,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            transcript: Transcript::new(),
            settings,
            client,
            clipboard,
            notifier,
            gate,
            image: None,
            draft: None,
            events_tx,
            events_rx,
            printed: 0,
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn selected_image(&self) -> Option<&Path> {
        self.image.as_deref()
    }

    /// Select an image for the following sends. Needs the storage-read capability.
    pub fn pick_image(&mut self, path: PathBuf) -> bool {
        if !self.gate.ensure_granted(Capability::StorageRead) {
            self.notifier.notify(STORAGE_DENIED_TEXT);
            return false;
        }

        // Decode once up front so a bad file is reported at pick time
        match load_picked(&path) {
            Ok(frame) => {
                debug!(width = frame.width(), height = frame.height(), "Image selected");
            }
            Err(e) => {
                warn!("{}", e);
                self.notifier.notify(IMAGE_LOAD_ERROR_TEXT);
                return false;
            }
        }

        self.transcript
            .push(TranscriptEntry::Image(path.display().to_string()));
        self.image = Some(path);
        true
    }

    pub fn clear_image(&mut self) {
        self.image = None;
    }

    /// Start a send cycle for `message`. Blank messages are ignored.
    pub fn send(&mut self, message: &str) -> Option<u64> {
        let message = message.trim();
        if message.is_empty() {
            return None;
        }

        self.transcript.push(TranscriptEntry::User(message.to_string()));
        let ticket = self.transcript.begin_send();
        let cycle = ticket.cycle();

        let frame = match &self.image {
            Some(path) => match load_picked(path) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    self.abandon(ticket, e.to_string());
                    return None;
                }
            },
            None => None,
        };

        let user_text = compose_user_content(&self.settings, Some(message), frame.is_some());
        let request = match build_request(&self.settings, &user_text, frame) {
            Ok(request) => request,
            Err(e) => {
                self.abandon(ticket, e.to_string());
                return None;
            }
        };

        self.transcript.push(TranscriptEntry::System(format!(
            "正在发送请求到: {}\n模型: {}",
            self.settings.effective(SettingKey::Url),
            self.settings.effective(SettingKey::ModelName)
        )));

        let client = self.client.clone();
        let settings = self.settings.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = client.send(&settings, &request).await;
            if events.send(ChatEvent::Reply { ticket, result }).is_err() {
                debug!("Chat session closed before the reply arrived");
            }
        });

        Some(cycle)
    }

    fn abandon(&mut self, ticket: SendTicket, cause: String) {
        warn!("Request could not be built: {}", cause);
        self.unprint_loading(ticket.cycle());
        self.transcript.abandon(ticket);
        self.transcript
            .push(TranscriptEntry::System(format!("请求构建失败: {}", cause)));
        self.notifier.notify(&cause);
    }

    // Keep the printed count aligned when a loading entry that was already shown is removed
    fn unprint_loading(&mut self, cycle: u64) {
        let position = self.transcript.entries().iter().position(
            |e| matches!(e, TranscriptEntry::Loading { cycle: c, .. } if *c == cycle),
        );
        if let Some(index) = position
            && index < self.printed
        {
            self.printed -= 1;
        }
    }

    pub async fn next_event(&mut self) -> Option<ChatEvent> {
        self.events_rx.recv().await
    }

    pub fn handle_event(&mut self, event: ChatEvent) -> CycleOutcome {
        match event {
            ChatEvent::Reply { ticket, result } => {
                self.unprint_loading(ticket.cycle());
                deliver(
                    result,
                    &mut self.transcript,
                    ticket,
                    self.clipboard.as_ref(),
                    self.notifier.as_ref(),
                )
            }
        }
    }

    /// Write entries added since the last call
    pub fn render_pending(&mut self, out: &mut impl Write) -> std::io::Result<()> {
        let entries = self.transcript.entries();
        let start = self.printed.min(entries.len());
        for entry in &entries[start..] {
            let time = Zoned::now().strftime("%H:%M:%S");
            match entry {
                TranscriptEntry::User(text) => writeln!(out, "[{}] 你: {}", time, text)?,
                TranscriptEntry::Model(text) => writeln!(out, "[{}] 回复: {}", time, text)?,
                TranscriptEntry::System(text) => writeln!(out, "[{}] 系统: {}", time, text)?,
                TranscriptEntry::Image(path) => writeln!(out, "[{}] 图片: {}", time, path)?,
                TranscriptEntry::Loading { text, .. } => writeln!(out, "[{}] … {}", time, text)?,
            }
        }
        self.printed = entries.len();
        out.flush()
    }

    /// Send one message and wait for its outcome
    pub async fn run_once(&mut self, message: &str, out: &mut impl Write) -> anyhow::Result<CycleOutcome> {
        let Some(cycle) = self.send(message) else {
            self.render_pending(out)?;
            return Ok(CycleOutcome::Failed);
        };
        self.render_pending(out)?;

        while let Some(event) = self.next_event().await {
            let ChatEvent::Reply { ticket, .. } = &event;
            let done = ticket.cycle() == cycle;
            let outcome = self.handle_event(event);
            self.render_pending(out)?;
            if done {
                return Ok(outcome);
            }
        }
        anyhow::bail!("Chat session closed before the reply arrived")
    }

    fn paste(&mut self, clipboard: &SystemClipboard) {
        match clipboard.read_text() {
            Ok(Some(text)) => {
                println!("{}", text.trim_end());
                println!("(Enter sends the pasted text, any other input discards it)");
                self.stage_paste(text);
            }
            Ok(None) => debug!("Clipboard is empty"),
            Err(e) => warn!("Failed to read clipboard: {}", e),
        }
    }

    /// Hold pasted text as the pending input instead of sending it
    fn stage_paste(&mut self, text: String) {
        self.notifier.notify(PASTED_TEXT);
        self.draft = Some(text);
    }

    /// An empty line sends the staged paste; any other line drops it.
    /// Returns whether the line was consumed.
    fn confirm_draft(&mut self, line: &str) -> bool {
        let Some(draft) = self.draft.take() else {
            return false;
        };
        if line.is_empty() {
            self.send(&draft);
            true
        } else {
            debug!("Discarded pasted text");
            false
        }
    }

    /// Line-driven loop over stdin until `/quit` or EOF with nothing in flight
    pub async fn run_interactive(&mut self, paste_on_start: bool) -> anyhow::Result<()> {
        let mut stdout = std::io::stdout();
        let reader = SystemClipboard::new();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;

        println!("{}", HELP_TEXT);
        if paste_on_start {
            self.paste(&reader);
        }
        self.render_pending(&mut stdout)?;

        loop {
            if !stdin_open && self.transcript.pending_cycles() == 0 {
                break;
            }

            let input = tokio::select! {
                line = lines.next_line(), if stdin_open => Input::Line(line?),
                Some(event) = self.events_rx.recv() => Input::Event(event),
            };

            match input {
                Input::Line(None) => stdin_open = false,
                Input::Line(Some(line)) => {
                    let line = line.trim();
                    if self.confirm_draft(line) {
                        // sent
                    } else if line == "/quit" {
                        break;
                    } else if line == "/help" {
                        println!("{}", HELP_TEXT);
                    } else if line == "/clear-image" {
                        self.clear_image();
                        println!("Image cleared");
                    } else if line == "/paste" {
                        self.paste(&reader);
                    } else if let Some(path) = line.strip_prefix("/image") {
                        let path = path.trim();
                        if path.is_empty() {
                            println!("Usage: /image PATH");
                        } else {
                            self.pick_image(PathBuf::from(path));
                        }
                    } else {
                        self.send(line);
                    }
                }
                Input::Event(event) => {
                    self.handle_event(event);
                }
            }

            self.render_pending(&mut stdout)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::testing::{RecordingClipboard, RecordingNotifier};
    use crate::delivery::{COPIED_TEXT, FORBIDDEN_HINT};
    use crate::model::testing::serve_once;
    use crate::permissions::PlatformPermissions;
    use crate::permissions::testing::AllowAll;
    use image::RgbaImage;

    struct DenyAll;

    impl PlatformPermissions for DenyAll {
        fn check(&self, _capability: Capability) -> bool {
            false
        }

        fn request(&self, _capability: Capability) {}
    }

    struct Harness {
        session: ChatSession,
        clipboard: Arc<RecordingClipboard>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness(url: &str, gate: PermissionGate) -> Harness {
        let mut settings = StyleSettings::default();
        settings.url = url.to_string();
        let clipboard = Arc::new(RecordingClipboard::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let session = ChatSession::new(
            settings,
            ModelClient::new(None).unwrap(),
            clipboard.clone(),
            notifier.clone(),
            gate,
        );
        Harness {
            session,
            clipboard,
            notifier,
        }
    }

    #[tokio::test]
    async fn test_success_lands_in_transcript_and_clipboard() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"choices":[{"message":{"content":"Sounds good!"}}]}"#,
        )
        .await;
        let mut h = harness(&url, PermissionGate::new(Box::new(AllowAll)));

        let mut out = Vec::new();
        let outcome = h.session.run_once("Are we still on for 6pm?", &mut out).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Delivered);

        let entries = h.session.transcript().entries();
        assert_eq!(entries[0], TranscriptEntry::User("Are we still on for 6pm?".to_string()));
        assert!(matches!(&entries[1], TranscriptEntry::System(s) if s.starts_with("正在发送请求到: ")));
        assert_eq!(entries[2], TranscriptEntry::Model("Sounds good!".to_string()));
        assert_eq!(entries.len(), 3);
        assert_eq!(h.session.transcript().pending_cycles(), 0);

        assert_eq!(h.clipboard.writes.lock().unwrap().as_slice(), &["Sounds good!".to_string()]);
        assert_eq!(h.notifier.messages.lock().unwrap().as_slice(), &[COPIED_TEXT.to_string()]);

        let rendered = String::from_utf8(out).unwrap();
        assert!(rendered.contains("回复: Sounds good!"));
        assert!(rendered.contains("正在生成回复..."));

        let raw = server.await.unwrap();
        assert!(raw.contains("用户消息: Are we still on for 6pm?"));
        assert!(raw.contains("请给出合适的回复。"));
    }

    #[tokio::test]
    async fn test_forbidden_adds_error_and_guidance() {
        let (url, server) = serve_once("403 Forbidden", r#"{"error":"invalid key"}"#).await;
        let mut h = harness(&url, PermissionGate::new(Box::new(AllowAll)));

        let outcome = h.session.run_once("hello", &mut std::io::sink()).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Failed);

        let entries = h.session.transcript().entries();
        let n = entries.len();
        assert_eq!(
            entries[n - 2],
            TranscriptEntry::System("API请求错误 403\n错误详情: {\"error\":\"invalid key\"}".to_string())
        );
        assert_eq!(entries[n - 1], TranscriptEntry::System(FORBIDDEN_HINT.to_string()));
        assert!(!entries.iter().any(|e| e.is_loading()));
        assert!(h.clipboard.writes.lock().unwrap().is_empty());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_paste_waits_for_confirmation() {
        let mut h = harness("http://127.0.0.1:9", PermissionGate::new(Box::new(AllowAll)));

        h.session.stage_paste("明天见".to_string());
        assert!(h.session.transcript().is_empty());
        assert_eq!(h.notifier.messages.lock().unwrap().as_slice(), &[PASTED_TEXT.to_string()]);

        assert!(h.session.confirm_draft(""));
        assert_eq!(h.session.transcript().entries()[0], TranscriptEntry::User("明天见".to_string()));
        assert!(!h.session.confirm_draft(""));
    }

    #[tokio::test]
    async fn test_other_input_discards_paste() {
        let mut h = harness("http://127.0.0.1:9", PermissionGate::new(Box::new(AllowAll)));

        h.session.stage_paste("明天见".to_string());
        assert!(!h.session.confirm_draft("/help"));
        assert!(h.session.transcript().is_empty());
        assert!(!h.session.confirm_draft(""));
    }

    #[tokio::test]
    async fn test_blank_message_is_ignored() {
        let mut h = harness("http://127.0.0.1:9", PermissionGate::new(Box::new(AllowAll)));
        assert!(h.session.send("   ").is_none());
        assert!(h.session.transcript().is_empty());
    }

    #[tokio::test]
    async fn test_pick_image_requires_storage_permission() {
        let mut h = harness("http://127.0.0.1:9", PermissionGate::new(Box::new(DenyAll)));
        assert!(!h.session.pick_image(PathBuf::from("/nonexistent.png")));
        assert!(h.session.selected_image().is_none());
        assert_eq!(
            h.notifier.messages.lock().unwrap().as_slice(),
            &[STORAGE_DENIED_TEXT.to_string()]
        );
    }

    #[tokio::test]
    async fn test_picked_image_is_sent_with_message() {
        let dir = std::env::temp_dir().join(format!("tyan-chat-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("chat.png");
        RgbaImage::from_pixel(6, 6, image::Rgba([10, 20, 30, 255]))
            .save(&path)
            .unwrap();

        let (url, server) = serve_once(
            "200 OK",
            r#"{"choices":[{"message":{"content":"看起来不错"}}]}"#,
        )
        .await;
        let mut h = harness(&url, PermissionGate::new(Box::new(AllowAll)));
        assert!(h.session.pick_image(path.clone()));
        assert!(matches!(
            &h.session.transcript().entries()[0],
            TranscriptEntry::Image(p) if p.ends_with("chat.png")
        ));

        let outcome = h.session.run_once("怎么回？", &mut std::io::sink()).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Delivered);
        assert_eq!(h.session.selected_image(), Some(path.as_path()));

        let raw = server.await.unwrap();
        assert!(raw.contains("data:image/jpeg;base64,"));
        assert!(raw.contains("请根据图片内容给出合适的回复。"));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_unreadable_image_abandons_cycle() {
        let dir = std::env::temp_dir().join(format!("tyan-chat-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("gone.png");
        RgbaImage::from_pixel(2, 2, image::Rgba([0, 0, 0, 255]))
            .save(&path)
            .unwrap();

        let mut h = harness("http://127.0.0.1:9", PermissionGate::new(Box::new(AllowAll)));
        assert!(h.session.pick_image(path.clone()));
        std::fs::remove_file(&path).unwrap();

        assert!(h.session.send("hi").is_none());
        assert_eq!(h.session.transcript().pending_cycles(), 0);
        assert!(matches!(
            h.session.transcript().entries().last(),
            Some(TranscriptEntry::System(s)) if s.starts_with("请求构建失败")
        ));

        let _ = std::fs::remove_dir_all(dir);
    }
}
