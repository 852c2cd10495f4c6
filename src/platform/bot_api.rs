//! Telegram Bot API adapter for the platform traits.
//!
//! A bot cannot read arbitrary chat history, so `fetch` forwards the source
//! message into a dump chat the bot administers and reads the media off the
//! forwarded copy. Downloads go through `getFile` and the file endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::error::PlatformError;
use crate::platform::{
    DownloadStream, ItemMetadata, MediaKind, PlatformClient, PlatformConnector,
};
use crate::queue::task::{ChatRef, SourceRef};
use crate::vault::Credentials;

const DEFAULT_BASE_URL: &str = "https://api.telegram.org";

/// Creates [`BotApiClient`]s from bot tokens.
#[derive(Clone)]
pub struct BotApiConnector {
    http: reqwest::Client,
    base_url: String,
    dump_chat_id: Option<i64>,
}

impl BotApiConnector {
    pub fn new(dump_chat_id: Option<i64>) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, dump_chat_id)
    }

    /// Point at another Bot API server (self-hosted or a test double).
    pub fn with_base_url(base_url: impl Into<String>, dump_chat_id: Option<i64>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            dump_chat_id,
        }
    }
}

#[async_trait]
impl PlatformConnector for BotApiConnector {
    async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<Arc<dyn PlatformClient>, PlatformError> {
        let client = BotApiClient {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            token: credentials.session.clone(),
            dump_chat_id: self.dump_chat_id,
        };
        let me = client.call("getMe", &serde_json::json!({})).await?;
        tracing::debug!(
            bot = me.get("username").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            "Bot API client authenticated"
        );
        Ok(Arc::new(client))
    }
}

/// One bot identity talking to the Bot API.
pub struct BotApiClient {
    http: reqwest::Client,
    base_url: String,
    token: SecretString,
    dump_chat_id: Option<i64>,
}

impl BotApiClient {
    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.base_url,
            self.token.expose_secret()
        )
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{}/file/bot{}/{file_path}",
            self.base_url,
            self.token.expose_secret()
        )
    }

    /// Call a Bot API method and return its `result`.
    async fn call(&self, method: &str, body: &Value) -> Result<Value, PlatformError> {
        let resp = self
            .http
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| PlatformError::Transient {
                reason: format!("{method}: {e}"),
            })?;

        let status = resp.status().as_u16();
        let data: Value = resp.json().await.map_err(|e| PlatformError::Transient {
            reason: format!("{method}: unreadable response ({status}): {e}"),
        })?;

        if data.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(data.get("result").cloned().unwrap_or(Value::Null));
        }

        let code = data
            .get("error_code")
            .and_then(Value::as_u64)
            .map(|c| c as u16)
            .unwrap_or(status);
        let description = data
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("no description");
        let retry_after = data
            .get("parameters")
            .and_then(|p| p.get("retry_after"))
            .and_then(Value::as_u64);
        Err(classify_api_error(method, code, description, retry_after))
    }
}

#[async_trait]
impl PlatformClient for BotApiClient {
    async fn fetch(&self, source: &SourceRef) -> Result<ItemMetadata, PlatformError> {
        let dump_chat_id = self.dump_chat_id.ok_or_else(|| {
            PlatformError::Internal("DUMP_CHAT_ID is required to read messages".into())
        })?;
        let from_chat_id = match &source.chat {
            ChatRef::Id(id) => Value::from(*id),
            ChatRef::Username(name) => Value::from(format!("@{name}")),
            ChatRef::Bot(name) => {
                return Err(PlatformError::PermissionDenied {
                    reason: format!("bots cannot read chats with other bots (@{name})"),
                });
            }
        };

        let message = self
            .call(
                "forwardMessage",
                &serde_json::json!({
                    "chat_id": dump_chat_id,
                    "from_chat_id": from_chat_id,
                    "message_id": source.message_id,
                    "disable_notification": true,
                }),
            )
            .await?;
        item_from_message(source, &message)
    }

    async fn download(&self, item: &ItemMetadata) -> Result<DownloadStream, PlatformError> {
        let file_id = item
            .file_ref
            .as_deref()
            .ok_or_else(|| PlatformError::Internal("item has no file to download".into()))?;

        let file = self
            .call("getFile", &serde_json::json!({ "file_id": file_id }))
            .await?;
        let file_path = file
            .get("file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| PlatformError::PermissionDenied {
                reason: "file is not downloadable".into(),
            })?;

        let resp = self
            .http
            .get(self.file_url(file_path))
            .send()
            .await
            .map_err(|e| PlatformError::Transient {
                reason: format!("file download: {e}"),
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(classify_api_error(
                "file",
                status.as_u16(),
                status.canonical_reason().unwrap_or("download failed"),
                None,
            ));
        }

        let total = resp
            .content_length()
            .or_else(|| file.get("file_size").and_then(Value::as_u64))
            .or(item.file_size);
        let chunks = resp
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| PlatformError::Transient {
                        reason: format!("file download: {e}"),
                    })
            })
            .boxed();
        Ok(DownloadStream { total, chunks })
    }
}

/// Map a Bot API failure onto the platform error taxonomy.
pub(crate) fn classify_api_error(
    method: &str,
    code: u16,
    description: &str,
    retry_after: Option<u64>,
) -> PlatformError {
    let lower = description.to_ascii_lowercase();
    match code {
        401 => PlatformError::Auth {
            reason: format!("{method}: {description}"),
        },
        429 => PlatformError::RateLimited {
            retry_after: retry_after.map(std::time::Duration::from_secs),
        },
        403 => PlatformError::PermissionDenied {
            reason: format!("{method}: {description}"),
        },
        400 | 404 if lower.contains("not found") || lower.contains("message_id_invalid") => {
            PlatformError::NotFound {
                what: format!("{method}: {description}"),
            }
        }
        400 | 404 => PlatformError::PermissionDenied {
            reason: format!("{method}: {description}"),
        },
        _ => PlatformError::Transient {
            reason: format!("{method} returned {code}: {description}"),
        },
    }
}

/// Read media metadata off a Bot API `Message` object.
fn item_from_message(source: &SourceRef, message: &Value) -> Result<ItemMetadata, PlatformError> {
    let caption = message
        .get("caption")
        .and_then(Value::as_str)
        .map(String::from);
    let text = message.get("text").and_then(Value::as_str).map(String::from);

    // Animations also carry a `document` field, so check them first.
    const FILE_FIELDS: [(&str, MediaKind); 7] = [
        ("animation", MediaKind::Animation),
        ("video", MediaKind::Video),
        ("audio", MediaKind::Audio),
        ("voice", MediaKind::Voice),
        ("video_note", MediaKind::VideoNote),
        ("sticker", MediaKind::Sticker),
        ("document", MediaKind::Document),
    ];

    let media = FILE_FIELDS
        .iter()
        .find_map(|(field, kind)| message.get(*field).map(|m| (*kind, m)))
        .or_else(|| {
            // Photo sizes ascend; the last is the original.
            message
                .get("photo")
                .and_then(Value::as_array)
                .and_then(|sizes| sizes.last())
                .map(|m| (MediaKind::Photo, m))
        });

    match media {
        Some((kind, media)) => Ok(ItemMetadata {
            source: source.clone(),
            kind,
            file_name: media
                .get("file_name")
                .and_then(Value::as_str)
                .map(String::from),
            file_size: media.get("file_size").and_then(Value::as_u64),
            mime_type: media
                .get("mime_type")
                .and_then(Value::as_str)
                .map(String::from),
            caption,
            text,
            file_ref: media
                .get("file_id")
                .and_then(Value::as_str)
                .map(String::from),
        }),
        None if text.is_some() => Ok(ItemMetadata {
            source: source.clone(),
            kind: MediaKind::Text,
            file_name: None,
            file_size: None,
            mime_type: None,
            caption: None,
            text,
            file_ref: None,
        }),
        None => Err(PlatformError::NotFound {
            what: format!("message {source} has no downloadable content"),
        }),
    }
}
