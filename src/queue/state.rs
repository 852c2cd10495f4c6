//! Task state machine.

use serde::{Deserialize, Serialize};

/// State of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a worker.
    Pending,
    /// A worker holds the lease but has not started transferring.
    Claimed,
    /// Bytes are being pulled from the platform.
    Downloading,
    /// The item is being delivered to the requesting chat.
    Uploading,
    /// Delivered.
    Completed,
    /// Gave up. Only an admin retry moves it back to `Pending`.
    Failed,
    /// Cancelled by the user or an admin.
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 7] = [
        Self::Pending,
        Self::Claimed,
        Self::Downloading,
        Self::Uploading,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// States in which a worker holds the claim.
    pub const CLAIMED: [TaskState; 3] = [Self::Claimed, Self::Downloading, Self::Uploading];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            // Claim
            (Pending, Claimed) |
            // Forward progress
            (Claimed, Downloading) | (Downloading, Uploading) | (Uploading, Completed) |
            // Text items skip the transfer
            (Claimed, Uploading) |
            // Recoverable failure or lease recovery
            (Claimed, Pending) | (Downloading, Pending) | (Uploading, Pending) |
            // Unrecoverable failure
            (Claimed, Failed) | (Downloading, Failed) | (Uploading, Failed) |
            // Failing held tasks without a worker
            (Pending, Failed) |
            // Admin retry
            (Failed, Pending) |
            // Cancellation
            (Pending, Cancelled) | (Claimed, Cancelled) |
            (Downloading, Cancelled) | (Uploading, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a worker holds the claim in this state.
    pub fn is_claimed(&self) -> bool {
        Self::CLAIMED.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Downloading => "downloading",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown task state: {s}"))
    }
}
