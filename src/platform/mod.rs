//! Remote messaging platform: authenticated clients, item lookup and
//! streamed downloads, plus the outbound delivery leg.

pub mod bot_api;
pub mod pool;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::PlatformError;
use crate::queue::task::SourceRef;
use crate::vault::Credentials;

pub use bot_api::BotApiConnector;
pub use pool::ClientPool;

/// What a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Text,
    Photo,
    Video,
    Audio,
    Voice,
    Document,
    Animation,
    Sticker,
    VideoNote,
}

impl MediaKind {
    pub fn has_file(&self) -> bool {
        !matches!(self, Self::Text)
    }

    /// File extension used when the platform gives no file name.
    pub fn default_extension(&self) -> &'static str {
        match self {
            Self::Text => "txt",
            Self::Photo => "jpg",
            Self::Video | Self::VideoNote | Self::Animation => "mp4",
            Self::Audio => "mp3",
            Self::Voice => "ogg",
            Self::Sticker => "webp",
            Self::Document => "bin",
        }
    }
}

/// Metadata of one remote message, enough to download and re-send it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub source: SourceRef,
    pub kind: MediaKind,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub mime_type: Option<String>,
    pub caption: Option<String>,
    /// Message text, for text-only items.
    pub text: Option<String>,
    /// Platform handle used to download the file.
    pub file_ref: Option<String>,
}

impl ItemMetadata {
    /// File name to deliver under.
    pub fn display_name(&self) -> String {
        self.file_name.clone().unwrap_or_else(|| {
            format!(
                "{}_{}.{}",
                self.kind_label(),
                self.source.message_id,
                self.kind.default_extension()
            )
        })
    }

    fn kind_label(&self) -> &'static str {
        match self.kind {
            MediaKind::Text => "text",
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Voice => "voice",
            MediaKind::Document => "document",
            MediaKind::Animation => "animation",
            MediaKind::Sticker => "sticker",
            MediaKind::VideoNote => "video_note",
        }
    }
}

/// A download in flight.
pub struct DownloadStream {
    /// Total size if known up front.
    pub total: Option<u64>,
    pub chunks: BoxStream<'static, Result<Vec<u8>, PlatformError>>,
}

impl std::fmt::Debug for DownloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadStream")
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

/// Creates authenticated clients.
#[async_trait]
pub trait PlatformConnector: Send + Sync {
    /// Authenticate with `credentials`. Bad or revoked credentials yield
    /// [`PlatformError::Auth`].
    async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<std::sync::Arc<dyn PlatformClient>, PlatformError>;
}

/// One authenticated connection.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn fetch(&self, source: &SourceRef) -> Result<ItemMetadata, PlatformError>;

    async fn download(&self, item: &ItemMetadata) -> Result<DownloadStream, PlatformError>;
}

/// Sends a finished item to the requesting chat.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(
        &self,
        chat_id: i64,
        item: &ItemMetadata,
        bytes: Vec<u8>,
    ) -> Result<(), PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::task::ChatRef;

    #[test]
    fn display_name_falls_back_to_kind_and_id() {
        let mut item = ItemMetadata {
            source: SourceRef::new(ChatRef::Username("c".into()), 77),
            kind: MediaKind::Photo,
            file_name: None,
            file_size: None,
            mime_type: None,
            caption: None,
            text: None,
            file_ref: Some("f".into()),
        };
        assert_eq!(item.display_name(), "photo_77.jpg");
        item.file_name = Some("holiday.png".into());
        assert_eq!(item.display_name(), "holiday.png");
    }
}
