//! Per-user delivery preferences: a destination chat override and the file
//! categories the user does not want.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::platform::{ItemMetadata, MediaKind};

/// File name endings treated as archives rather than plain documents.
const ARCHIVE_EXTENSIONS: &[&str] = &[".zip", ".rar", ".7z", ".tar", ".gz"];

/// What `/filters` can switch off. Text posts are always delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Document,
    Archive,
    Video,
    Audio,
    Photo,
    Animation,
    Sticker,
    Voice,
}

impl FileCategory {
    pub const ALL: [FileCategory; 8] = [
        Self::Document,
        Self::Archive,
        Self::Video,
        Self::Audio,
        Self::Photo,
        Self::Animation,
        Self::Sticker,
        Self::Voice,
    ];

    /// Category of a fetched item, `None` for text.
    pub fn of(item: &ItemMetadata) -> Option<Self> {
        Some(match item.kind {
            MediaKind::Text => return None,
            MediaKind::Document => {
                let is_archive = item.file_name.as_deref().is_some_and(|name| {
                    let name = name.to_lowercase();
                    ARCHIVE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
                });
                if is_archive { Self::Archive } else { Self::Document }
            }
            MediaKind::Video | MediaKind::VideoNote => Self::Video,
            MediaKind::Audio => Self::Audio,
            MediaKind::Photo => Self::Photo,
            MediaKind::Animation => Self::Animation,
            MediaKind::Sticker => Self::Sticker,
            MediaKind::Voice => Self::Voice,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Archive => "archive",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Photo => "photo",
            Self::Animation => "animation",
            Self::Sticker => "sticker",
            Self::Voice => "voice",
        }
    }
}

impl std::fmt::Display for FileCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FileCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "zip" => Ok(Self::Archive),
            other => Self::ALL
                .into_iter()
                .find(|category| category.as_str() == other)
                .ok_or_else(|| format!("unknown file type: {other}")),
        }
    }
}

/// Stored preferences of one user. The default delivers everything to the
/// chat the request came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    /// Deliver here instead of the requesting chat.
    pub target_chat: Option<i64>,
    pub skipped: BTreeSet<FileCategory>,
}

impl UserSettings {
    /// The category that makes `item` unwanted, if any.
    pub fn rejects(&self, item: &ItemMetadata) -> Option<FileCategory> {
        FileCategory::of(item).filter(|category| self.skipped.contains(category))
    }
}
