//! Delivery of model replies to the clipboard, the chat transcript and the user
//!
//! A send cycle is `begin_send` (loading entry appended) followed by exactly one
//! `deliver`, which consumes the cycle's [`SendTicket`]. The loading entry is
//! tagged with the cycle id, so overlapping cycles each remove their own.

use crate::model::ReplyResult;
use thiserror::Error;
use tracing::{debug, warn};

pub const LOADING_TEXT: &str = "正在生成回复...";
pub const COPIED_TEXT: &str = "已复制到剪贴板";
pub const OVERLAY_COPIED_TEXT: &str = "大模型回复已复制到剪贴板";
pub const NETWORK_ERROR_TEXT: &str = "网络请求失败";
pub const API_ERROR_TEXT: &str = "API请求错误";
pub const FORBIDDEN_HINT: &str = "403错误通常表示授权问题。请检查:\n\
1. API密钥是否正确\n\
2. API密钥是否已过期\n\
3. 是否有权限访问此API\n\
4. 请求格式是否符合API要求";

const OVERLAY_BODY_LIMIT: usize = 200;

#[derive(Error, Debug)]
pub enum ClipboardError {
    #[error("No display server detected")]
    NoDisplay,
    #[error("{0} not found")]
    ToolMissing(String),
    #[error("{tool} failed: {status}")]
    ToolFailed { tool: String, status: String },
    #[error("Clipboard I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write-only clipboard, one string at a time
pub trait ClipboardSink: Send + Sync {
    fn write_text(&self, text: &str) -> Result<(), ClipboardError>;
}

/// Transient confirmation shown to the user (toast)
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEntry {
    User(String),
    Model(String),
    System(String),
    /// A picked image, referenced by path or URI
    Image(String),
    Loading { cycle: u64, text: String },
}

impl TranscriptEntry {
    pub fn is_loading(&self) -> bool {
        matches!(self, TranscriptEntry::Loading { .. })
    }
}

/// Proof that a send cycle is in flight. Consumed by [`deliver`].
#[derive(Debug, PartialEq, Eq)]
pub struct SendTicket {
    cycle: u64,
}

impl SendTicket {
    pub fn cycle(&self) -> u64 {
        self.cycle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Delivered,
    Failed,
}

#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    next_cycle: u64,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TranscriptEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_cycles(&self) -> usize {
        self.entries.iter().filter(|e| e.is_loading()).count()
    }

    /// Append the loading entry of a new send cycle
    pub fn begin_send(&mut self) -> SendTicket {
        self.next_cycle += 1;
        let cycle = self.next_cycle;
        self.entries.push(TranscriptEntry::Loading {
            cycle,
            text: LOADING_TEXT.to_string(),
        });
        debug!(cycle, "Send cycle started");
        SendTicket { cycle }
    }

    /// Drop a cycle that never reached the network (request could not be built)
    pub fn abandon(&mut self, ticket: SendTicket) {
        self.finish(ticket);
    }

    /// Remove the loading entry belonging to `ticket`
    fn finish(&mut self, ticket: SendTicket) -> bool {
        let position = self.entries.iter().position(
            |e| matches!(e, TranscriptEntry::Loading { cycle, .. } if *cycle == ticket.cycle),
        );
        match position {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => {
                warn!(cycle = ticket.cycle, "Loading entry already gone");
                false
            }
        }
    }
}

/// Deliver the outcome of one send cycle into the transcript
pub fn deliver(
    result: ReplyResult,
    transcript: &mut Transcript,
    ticket: SendTicket,
    clipboard: &dyn ClipboardSink,
    notifier: &dyn Notifier,
) -> CycleOutcome {
    transcript.finish(ticket);

    match result {
        ReplyResult::Success(text) => {
            transcript.push(TranscriptEntry::Model(text.clone()));
            match clipboard.write_text(&text) {
                Ok(()) => notifier.notify(COPIED_TEXT),
                Err(e) => {
                    warn!("Failed to copy reply to clipboard: {}", e);
                    transcript.push(TranscriptEntry::System(format!("复制到剪贴板失败: {}", e)));
                }
            }
            CycleOutcome::Delivered
        }
        ReplyResult::NetworkFailure(cause) => {
            transcript.push(TranscriptEntry::System(format!(
                "{}\n错误详情: {}",
                NETWORK_ERROR_TEXT, cause
            )));
            CycleOutcome::Failed
        }
        ReplyResult::ApiError { status, body } => {
            transcript.push(TranscriptEntry::System(format!(
                "{} {}\n错误详情: {}",
                API_ERROR_TEXT, status, body
            )));
            if status == 403 {
                transcript.push(TranscriptEntry::System(FORBIDDEN_HINT.to_string()));
            }
            CycleOutcome::Failed
        }
    }
}

/// Overlay path: no transcript, only clipboard and a notification.
/// Returns the reply text, or the message shown to the user on failure.
pub fn deliver_overlay(
    result: ReplyResult,
    clipboard: &dyn ClipboardSink,
    notifier: &dyn Notifier,
) -> Result<String, String> {
    let message = match result {
        ReplyResult::Success(text) => {
            return match clipboard.write_text(&text) {
                Ok(()) => {
                    notifier.notify(OVERLAY_COPIED_TEXT);
                    Ok(text)
                }
                Err(e) => {
                    let message = format!("复制到剪贴板失败: {}", e);
                    notifier.notify(&message);
                    Err(message)
                }
            };
        }
        ReplyResult::NetworkFailure(cause) => format!("请求失败: {}", cause),
        ReplyResult::ApiError { status, body } => {
            let body = body.trim();
            if body.is_empty() {
                format!("请求错误: {}", status)
            } else {
                let clipped: String = body.chars().take(OVERLAY_BODY_LIMIT).collect();
                format!("请求错误: {} - {}", status, clipped)
            }
        }
    };

    notifier.notify(&message);
    Err(message)
}


#[cfg(test)]
mod tests {
    use super::testing::{RecordingClipboard, RecordingNotifier};
    use super::*;

    #[test]
    fn test_success_copies_and_replaces_loading() {
        let clipboard = RecordingClipboard::default();
        let notifier = RecordingNotifier::default();
        let mut transcript = Transcript::new();
        transcript.push(TranscriptEntry::User("hi".to_string()));
        let ticket = transcript.begin_send();
        assert_eq!(transcript.pending_cycles(), 1);

        let outcome = deliver(
            ReplyResult::Success("Sounds good!".to_string()),
            &mut transcript,
            ticket,
            &clipboard,
            &notifier,
        );

        assert_eq!(outcome, CycleOutcome::Delivered);
        assert_eq!(clipboard.writes.lock().unwrap().as_slice(), &["Sounds good!"]);
        assert_eq!(
            transcript.entries(),
            &[
                TranscriptEntry::User("hi".to_string()),
                TranscriptEntry::Model("Sounds good!".to_string()),
            ]
        );
        assert_eq!(notifier.messages.lock().unwrap().as_slice(), &[COPIED_TEXT]);
    }

    #[test]
    fn test_forbidden_adds_troubleshooting_entry() {
        let clipboard = RecordingClipboard::default();
        let notifier = RecordingNotifier::default();
        let mut transcript = Transcript::new();
        let ticket = transcript.begin_send();

        let outcome = deliver(
            ReplyResult::ApiError {
                status: 403,
                body: "{\"error\":\"invalid key\"}".to_string(),
            },
            &mut transcript,
            ticket,
            &clipboard,
            &notifier,
        );

        assert_eq!(outcome, CycleOutcome::Failed);
        assert_eq!(transcript.len(), 2);
        match &transcript.entries()[0] {
            TranscriptEntry::System(text) => {
                assert!(text.contains("403"));
                assert!(text.contains("{\"error\":\"invalid key\"}"));
            }
            other => panic!("unexpected entry: {:?}", other),
        }
        match &transcript.entries()[1] {
            TranscriptEntry::System(text) => {
                for point in ["1.", "2.", "3.", "4."] {
                    assert!(text.contains(point));
                }
            }
            other => panic!("unexpected entry: {:?}", other),
        }
        assert!(clipboard.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_other_api_errors_have_no_hint() {
        let mut transcript = Transcript::new();
        let ticket = transcript.begin_send();
        deliver(
            ReplyResult::ApiError {
                status: 500,
                body: "boom".to_string(),
            },
            &mut transcript,
            ticket,
            &RecordingClipboard::default(),
            &RecordingNotifier::default(),
        );
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript.pending_cycles(), 0);
    }

    #[test]
    fn test_network_failure_records_cause() {
        let mut transcript = Transcript::new();
        let ticket = transcript.begin_send();
        deliver(
            ReplyResult::NetworkFailure("connection refused".to_string()),
            &mut transcript,
            ticket,
            &RecordingClipboard::default(),
            &RecordingNotifier::default(),
        );
        assert_eq!(
            transcript.entries(),
            &[TranscriptEntry::System(format!(
                "{}\n错误详情: connection refused",
                NETWORK_ERROR_TEXT
            ))]
        );
    }

    #[test]
    fn test_overlapping_cycles_remove_their_own_loading_entry() {
        let clipboard = RecordingClipboard::default();
        let notifier = RecordingNotifier::default();
        let mut transcript = Transcript::new();
        let first = transcript.begin_send();
        let second = transcript.begin_send();
        let second_cycle = second.cycle();

        deliver(
            ReplyResult::Success("second".to_string()),
            &mut transcript,
            second,
            &clipboard,
            &notifier,
        );

        assert_eq!(transcript.pending_cycles(), 1);
        assert!(matches!(
            transcript.entries()[0],
            TranscriptEntry::Loading { cycle, .. } if cycle != second_cycle
        ));

        deliver(
            ReplyResult::NetworkFailure("timeout".to_string()),
            &mut transcript,
            first,
            &clipboard,
            &notifier,
        );
        assert_eq!(transcript.pending_cycles(), 0);
        assert_eq!(transcript.len(), 2);
    }

    #[test]
    fn test_clipboard_failure_is_surfaced() {
        let clipboard = RecordingClipboard {
            fail: true,
            ..Default::default()
        };
        let notifier = RecordingNotifier::default();
        let mut transcript = Transcript::new();
        let ticket = transcript.begin_send();

        deliver(
            ReplyResult::Success("ok".to_string()),
            &mut transcript,
            ticket,
            &clipboard,
            &notifier,
        );
        assert_eq!(transcript.len(), 2);
        assert!(matches!(&transcript.entries()[1], TranscriptEntry::System(t) if t.contains("剪贴板")));
        assert!(notifier.messages.lock().unwrap().is_empty());
    }

    #[test]
    fn test_overlay_delivery() {
        let clipboard = RecordingClipboard::default();
        let notifier = RecordingNotifier::default();

        let reply = deliver_overlay(ReplyResult::Success("好的".to_string()), &clipboard, &notifier);
        assert_eq!(reply, Ok("好的".to_string()));
        assert_eq!(clipboard.writes.lock().unwrap().as_slice(), &["好的"]);

        let err = deliver_overlay(
            ReplyResult::ApiError {
                status: 401,
                body: String::new(),
            },
            &clipboard,
            &notifier,
        );
        assert_eq!(err, Err("请求错误: 401".to_string()));
        assert_eq!(
            notifier.messages.lock().unwrap().as_slice(),
            &[OVERLAY_COPIED_TEXT, "请求错误: 401"]
        );
    }
}
