//! Error types for the bot.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store operation {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Rate limited on channel {name}")]
    RateLimited { name: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Credential vault errors.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Vault is locked (no master key configured)")]
    Locked,

    #[error("No session stored for user {user_id}")]
    NotFound { user_id: i64 },

    #[error("Failed to seal credentials: {0}")]
    SealFailed(String),

    #[error("Failed to unseal credentials: {0}")]
    UnsealFailed(String),

    #[error("Session store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Errors surfaced by the remote platform and the client pool.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Authentication failed: {reason}")]
    Auth { reason: String },

    #[error("Session expired for user {user_id}")]
    SessionExpired { user_id: i64 },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Rate limited by platform, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Transient platform failure: {reason}")]
    Transient { reason: String },

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Platform operation {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors from parsing message links.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("Not a message link. Example: https://t.me/channel/123")]
    Unrecognized,

    #[error("Invite links are not supported; join the chat yourself and send a message link")]
    Invite,

    #[error("Invalid message id: {0}")]
    InvalidMessageId(String),

    #[error("Invalid message range {start}-{end}")]
    InvalidRange { start: i64, end: i64 },
}

/// Queue engine errors returned to callers of the command surface.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Task {id} not found")]
    TaskNotFound { id: Uuid },

    #[error("Task {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Invalid message range {start}-{end}")]
    InvalidRange { start: i64, end: i64 },

    #[error("Batch of {size} items exceeds the limit of {max}")]
    BatchTooLarge { size: u64, max: u64 },

    #[error("Task {id} does not belong to this user")]
    NotOwner { id: Uuid },

    #[error("Private chats need a stored session; use /login first")]
    LoginRequired,

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Coarse error taxonomy driving retry decisions and user-visible summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network, timeout or rate limit. Retried with backoff.
    Transient,
    /// Session invalid; task is held until re-login.
    SessionExpired,
    /// Permanent: the item cannot be accessed.
    PermissionDenied,
    /// Permanent: the item does not exist.
    NotFound,
    /// The owner's file filters exclude this kind of item.
    Filtered,
    /// A racing worker won the claim. Not an error.
    StoreConflict,
    /// User or admin cancelled.
    Cancelled,
    /// Store unavailable, vault locked and similar operator problems.
    Internal,
}

impl ErrorClass {
    /// Whether the failure should consume an attempt and be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Internal)
    }

    /// Whether the failure is permanent for this task.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::PermissionDenied | Self::NotFound | Self::Filtered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::SessionExpired => "session_expired",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::Filtered => "filtered",
            Self::StoreConflict => "store_conflict",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "session_expired" => Ok(Self::SessionExpired),
            "permission_denied" => Ok(Self::PermissionDenied),
            "not_found" => Ok(Self::NotFound),
            "filtered" => Ok(Self::Filtered),
            "store_conflict" => Ok(Self::StoreConflict),
            "cancelled" => Ok(Self::Cancelled),
            "internal" => Ok(Self::Internal),
            other => Err(format!("unknown error class: {other}")),
        }
    }
}

impl PlatformError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Auth { .. } | Self::SessionExpired { .. } => ErrorClass::SessionExpired,
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::PermissionDenied { .. } => ErrorClass::PermissionDenied,
            Self::RateLimited { .. } | Self::Transient { .. } | Self::Timeout { .. } => {
                ErrorClass::Transient
            }
            Self::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Server-requested wait before the next call, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<VaultError> for PlatformError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::NotFound { user_id } => Self::SessionExpired { user_id },
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Result type alias for the bot.
pub type Result<T> = std::result::Result<T, Error>;
