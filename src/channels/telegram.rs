//! Telegram channel: long-polls the Bot API for updates, answers commands,
//! sends progress notifications and delivers downloaded files.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::channels::{Channel, IncomingMessage, MessageStream};
use crate::commands::Reply;
use crate::error::{ChannelError, PlatformError};
use crate::platform::bot_api::classify_api_error;
use crate::platform::{Deliverer, ItemMetadata, MediaKind};
use crate::progress::Notifier;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Maximum caption length for media messages.
const TELEGRAM_MAX_CAPTION_LENGTH: usize = 1024;

const DEFAULT_BASE_URL: &str = "https://api.telegram.org";

/// Telegram channel, connected to the Bot API by long-polling.
pub struct TelegramChannel {
    bot_token: SecretString,
    allowed_users: Vec<String>,
    base_url: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString, allowed_users: Vec<String>) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, bot_token, allowed_users)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        bot_token: SecretString,
        allowed_users: Vec<String>,
    ) -> Self {
        Self {
            bot_token,
            allowed_users,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.base_url,
            self.bot_token.expose_secret()
        )
    }

    /// Check if a username is in the allowed list.
    pub fn is_user_allowed(&self, username: &str) -> bool {
        check_user_allowed(&self.allowed_users, [username])
    }

    /// Check if any of the provided identities is allowed.
    pub fn is_any_user_allowed<'a, I>(&self, identities: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        check_user_allowed(&self.allowed_users, identities)
    }

    /// Send a text message, trying Markdown first with plain text fallback.
    /// Splits long messages that exceed Telegram's 4096 char limit.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), ChannelError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(chat_id, &chunk).await?;
        }
        Ok(())
    }

    /// Send a single message chunk (≤4096 chars), Markdown-first with fallback.
    async fn send_message_chunk(&self, chat_id: i64, text: &str) -> Result<(), ChannelError> {
        let markdown_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });

        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&markdown_body)
            .send()
            .await
            .map_err(send_failed)?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        if markdown_status.as_u16() == 429 {
            return Err(ChannelError::RateLimited {
                name: "telegram".into(),
            });
        }
        tracing::debug!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        let plain_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&plain_body)
            .send()
            .await
            .map_err(send_failed)?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!(
                    "sendMessage failed (markdown: {markdown_status}, plain: {plain_err})"
                ),
            });
        }

        Ok(())
    }

    /// Delete a message, e.g. one that carried a session string.
    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(self.api_url("deleteMessage"))
            .json(&serde_json::json!({ "chat_id": chat_id, "message_id": message_id }))
            .send()
            .await
            .map_err(send_failed)?;
        if !resp.status().is_success() {
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!("deleteMessage returned {}", resp.status()),
            });
        }
        Ok(())
    }

    /// Upload in-memory bytes with one of the `send<Media>` methods.
    ///
    /// Failures carry a [`PlatformError`] so callers can classify them.
    pub async fn send_media_bytes(
        &self,
        method: &str,
        field: &str,
        chat_id: i64,
        file_bytes: Vec<u8>,
        file_name: &str,
        caption: Option<&str>,
    ) -> anyhow::Result<()> {
        let part = Part::bytes(file_bytes).file_name(file_name.to_string());

        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field.to_string(), part);

        if let Some(cap) = caption {
            form = form.text("caption", truncate(cap, TELEGRAM_MAX_CAPTION_LENGTH));
        }

        let resp = self
            .client
            .post(self.api_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| PlatformError::Transient {
                reason: format!("{method}: {e}"),
            })?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let data: Value = resp.json().await.unwrap_or(Value::Null);
            let code = data
                .get("error_code")
                .and_then(Value::as_u64)
                .map_or(status, |c| c as u16);
            let description = data
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("no description");
            let retry_after = data
                .get("parameters")
                .and_then(|p| p.get("retry_after"))
                .and_then(Value::as_u64);
            return Err(classify_api_error(method, code, description, retry_after).into());
        }

        tracing::info!(chat_id, file_name, method, "Telegram media sent");
        Ok(())
    }

    /// Send a document from bytes (in-memory).
    pub async fn send_document_bytes(
        &self,
        chat_id: i64,
        file_bytes: Vec<u8>,
        file_name: &str,
        caption: Option<&str>,
    ) -> anyhow::Result<()> {
        self.send_media_bytes("sendDocument", "document", chat_id, file_bytes, file_name, caption)
            .await
    }
}

// ── Channel trait implementation ────────────────────────────────────

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let url = self.api_url("getUpdates");
        let allowed_users = self.allowed_users.clone();
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram channel listening for messages...");

            loop {
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": 30,
                    "allowed_updates": ["message"]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e.without_url(), "Telegram poll error");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let data: Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!(error = %e.without_url(), "Telegram parse error");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let Some(results) = data.get("result").and_then(Value::as_array) else {
                    continue;
                };
                for update in results {
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }
                    let Some(incoming) = parse_update(update, &allowed_users) else {
                        continue;
                    };
                    if tx.send(incoming).is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn respond(&self, msg: &IncomingMessage, reply: &Reply) -> Result<(), ChannelError> {
        if reply.delete_request {
            if let Err(e) = self.delete_message(msg.chat_id, msg.message_id).await {
                tracing::warn!(chat_id = msg.chat_id, error = %e, "Could not delete message");
            }
        }
        self.send_message(msg.chat_id, &reply.text).await
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.without_url().to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }
}

#[async_trait]
impl Notifier for TelegramChannel {
    async fn notify(&self, chat_id: i64, text: &str) -> Result<(), ChannelError> {
        self.send_message(chat_id, text).await
    }
}

#[async_trait]
impl Deliverer for TelegramChannel {
    async fn deliver(
        &self,
        chat_id: i64,
        item: &ItemMetadata,
        bytes: Vec<u8>,
    ) -> Result<(), PlatformError> {
        if item.kind == MediaKind::Text {
            let text = String::from_utf8_lossy(&bytes);
            return self.send_message(chat_id, &text).await.map_err(|e| match e {
                ChannelError::RateLimited { .. } => PlatformError::RateLimited { retry_after: None },
                other => PlatformError::Transient {
                    reason: other.to_string(),
                },
            });
        }

        let (method, field) = media_method(item.kind);
        let name = item.display_name();
        self.send_media_bytes(method, field, chat_id, bytes, &name, item.caption.as_deref())
            .await
            .map_err(|e| match e.downcast::<PlatformError>() {
                Ok(platform) => platform,
                Err(other) => PlatformError::Transient {
                    reason: other.to_string(),
                },
            })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Bot API method and form field used to re-send each kind of media.
fn media_method(kind: MediaKind) -> (&'static str, &'static str) {
    match kind {
        MediaKind::Photo => ("sendPhoto", "photo"),
        MediaKind::Video => ("sendVideo", "video"),
        MediaKind::Audio => ("sendAudio", "audio"),
        MediaKind::Voice => ("sendVoice", "voice"),
        MediaKind::Animation => ("sendAnimation", "animation"),
        MediaKind::Sticker => ("sendSticker", "sticker"),
        MediaKind::VideoNote => ("sendVideoNote", "video_note"),
        MediaKind::Document | MediaKind::Text => ("sendDocument", "document"),
    }
}

/// Turn one update into an incoming message, dropping anything that is not
/// a text message from an allowed user.
fn parse_update(update: &Value, allowed_users: &[String]) -> Option<IncomingMessage> {
    let message = update.get("message")?;
    let text = message.get("text").and_then(Value::as_str)?;
    let from = message.get("from")?;
    let user_id = from.get("id").and_then(Value::as_i64)?;
    let username = from.get("username").and_then(Value::as_str);
    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)?;
    let message_id = message.get("message_id").and_then(Value::as_i64)?;

    // Check allowlist against both username and numeric ID
    let user_id_str = user_id.to_string();
    let mut identities = vec![user_id_str.as_str()];
    if let Some(name) = username {
        identities.push(name);
    }
    if !check_user_allowed(allowed_users, identities) {
        tracing::warn!(
            user_id,
            username = username.unwrap_or("unknown"),
            "Telegram: ignoring message from unauthorized user"
        );
        return None;
    }

    Some(IncomingMessage {
        channel: "telegram".into(),
        user_id,
        username: username.map(String::from),
        chat_id,
        message_id,
        text: text.to_string(),
        received_at: Utc::now(),
    })
}

/// Check if any identity in the iterator matches the allowed users list.
fn check_user_allowed<'a>(
    allowed_users: &[String],
    identities: impl IntoIterator<Item = &'a str>,
) -> bool {
    let ids: Vec<&str> = identities.into_iter().collect();
    allowed_users
        .iter()
        .any(|u| u == "*" || ids.contains(&u.as_str()))
}

fn send_failed(e: reqwest::Error) -> ChannelError {
    ChannelError::SendFailed {
        name: "telegram".into(),
        reason: e.without_url().to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut boundary = max_len;
        while !remaining.is_char_boundary(boundary) {
            boundary -= 1;
        }
        let chunk = &remaining[..boundary];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(boundary);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { boundary } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
