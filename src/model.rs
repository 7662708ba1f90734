//! Chat-completion client for the reply model
//!
//! One request, one terminal [`ReplyResult`]. There is no retry: a connection
//! failure, a non-2xx status or an unparseable body all end the cycle.

use crate::capture::{CaptureError, CapturedFrame, encode};
use crate::settings::{SettingKey, StyleSettings};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const SYSTEM_PROMPT: &str = "你是一位社交达人，请你智能识别内容，帮我做出回复，只需要给我回复的内容，不需要给我其他多余的内容。";
pub const IMAGE_REPLY_PROMPT: &str = "请根据图片内容给出合适的回复。";
pub const TEXT_REPLY_PROMPT: &str = "请给出合适的回复。";
pub const MAX_TOKENS: u32 = 512;
pub const TEMPERATURE: f64 = 0.6;
const COMPLETIONS_PATH: &str = "chat/completions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

/// Outbound chat-completion body. Built fresh per send and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    max_tokens: u32,
    temperature: f64,
}

impl ReplyRequest {
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn has_image(&self) -> bool {
        self.messages
            .iter()
            .any(|m| matches!(m.content, MessageContent::Parts(_)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyResult {
    Success(String),
    NetworkFailure(String),
    ApiError { status: u16, body: String },
}

impl ReplyResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ReplyResult::Success(_))
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// User turn text: the style context, the optional user message, and the closing ask
pub fn compose_user_content(settings: &StyleSettings, message: Option<&str>, has_image: bool) -> String {
    let mut content = format!(
        "场景: {}\n语气: {}\n回复对象: {}\n其他要求: {}\n\n",
        settings.effective(SettingKey::Scene),
        settings.effective(SettingKey::Tone),
        settings.effective(SettingKey::Target),
        settings.effective(SettingKey::OtherRequirements),
    );

    if let Some(message) = message {
        content.push_str("用户消息: ");
        content.push_str(message);
        content.push_str("\n\n");
    }

    content.push_str(if has_image {
        IMAGE_REPLY_PROMPT
    } else {
        TEXT_REPLY_PROMPT
    });
    content
}

/// Build the request body. A frame, when given, is encoded inline and dropped.
pub fn build_request(
    settings: &StyleSettings,
    user_text: &str,
    frame: Option<CapturedFrame>,
) -> Result<ReplyRequest, CaptureError> {
    let content = match frame {
        Some(frame) => {
            let (width, height) = (frame.width(), frame.height());
            let url = encode::encode_data_uri(frame)?;
            debug!(width, height, encoded_len = url.len(), "Encoded frame for request");
            MessageContent::Parts(vec![
                ContentPart::Text {
                    text: user_text.to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url },
                },
            ])
        }
        None => MessageContent::Text(user_text.to_string()),
    };

    Ok(ReplyRequest {
        model: settings.effective(SettingKey::ModelName).to_string(),
        messages: vec![
            ChatMessage {
                role: Role::System,
                content: MessageContent::Text(SYSTEM_PROMPT.to_string()),
            },
            ChatMessage {
                role: Role::User,
                content,
            },
        ],
        stream: false,
        max_tokens: MAX_TOKENS,
        temperature: TEMPERATURE,
    })
}

/// Ensure exactly one trailing slash
pub fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    format!("{}/", trimmed)
}

pub fn completions_url(endpoint: &str) -> String {
    format!("{}{}", normalize_endpoint(endpoint), COMPLETIONS_PATH)
}

/// Classify a finished HTTP exchange
pub fn parse_reply(status: u16, body: String) -> ReplyResult {
    if !(200..300).contains(&status) {
        return ReplyResult::ApiError { status, body };
    }

    match serde_json::from_str::<CompletionResponse>(&body) {
        Ok(response) => match response.choices.into_iter().next() {
            Some(choice) => ReplyResult::Success(choice.message.content),
            None => {
                warn!("Response contained no choices");
                ReplyResult::ApiError { status, body }
            }
        },
        Err(e) => {
            warn!("Failed to parse response: {}", e);
            ReplyResult::ApiError { status, body }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelClient {
    http: reqwest::Client,
}

impl ModelClient {
    pub fn new(timeout: Option<Duration>) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            http: builder.build()?,
        })
    }

    /// Single POST to `<endpoint>/chat/completions`
    pub async fn send(&self, settings: &StyleSettings, request: &ReplyRequest) -> ReplyResult {
        let url = completions_url(settings.effective(SettingKey::Url));
        info!(%url, model = request.model(), image = request.has_image(), "Sending reply request");

        let response = match self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .bearer_auth(settings.get(SettingKey::ApiKey))
            .json(request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Request failed: {}", e);
                return ReplyResult::NetworkFailure(e.to_string());
            }
        };

        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => {
                debug!(status, body_len = body.len(), "Received response");
                let result = parse_reply(status, body);
                if let ReplyResult::ApiError { status, body } = &result {
                    warn!(status, "Request error, body: {}", body);
                }
                result
            }
            Err(e) if (200..300).contains(&status) => {
                warn!("Failed to read response body: {}", e);
                ReplyResult::NetworkFailure(e.to_string())
            }
            Err(e) => {
                warn!(status, "Failed to read error response: {}", e);
                ReplyResult::ApiError {
                    status,
                    body: String::new(),
                }
            }
        }
    }
}
