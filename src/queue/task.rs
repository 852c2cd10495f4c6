//! Task records and the request types that produce them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorClass, QueueError};
use crate::queue::state::TaskState;

/// Chat a source message lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ChatRef {
    /// Numeric chat id (private channels and groups, `-100...`).
    Id(i64),
    /// Public channel or group username, without the `@`.
    Username(String),
    /// Chat with a bot, by the bot's username.
    Bot(String),
}

impl std::fmt::Display for ChatRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Username(name) => write!(f, "@{name}"),
            Self::Bot(name) => write!(f, "bot @{name}"),
        }
    }
}

/// Pointer to one remote message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub chat: ChatRef,
    pub message_id: i64,
}

impl SourceRef {
    pub fn new(chat: ChatRef, message_id: i64) -> Self {
        Self { chat, message_id }
    }

    /// Private chats are only readable with the user's own session.
    pub fn needs_user_session(&self) -> bool {
        matches!(self.chat, ChatRef::Id(_))
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.chat, self.message_id)
    }
}

/// Last failure recorded on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub class: ErrorClass,
    pub message: String,
}

impl TaskError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Text safe to show the user. Internal details stay in the logs.
    pub fn user_message(&self) -> String {
        match self.class {
            ErrorClass::Internal => "temporary problem, try again later".to_string(),
            ErrorClass::Filtered => self.message.clone(),
            class => format!("{class}: {}", self.message),
        }
    }
}

/// A durable unit of work: fetch one remote message and deliver it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub owner_user_id: i64,
    /// Chat the request came from; notifications go here.
    pub chat_id: i64,
    /// Delivery override taken from the owner's settings at enqueue time.
    #[serde(default)]
    pub target_chat: Option<i64>,
    pub source: SourceRef,
    pub state: TaskState,
    /// Failed attempts so far.
    pub attempt_count: u32,
    pub last_error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claim_expiry: Option<DateTime<Utc>>,
    /// Backoff gate: not dispatched before this instant.
    pub not_before: Option<DateTime<Utc>>,
    /// Higher runs first.
    pub priority: i64,
    pub batch_id: Option<Uuid>,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
}

impl Task {
    pub fn new(owner_user_id: i64, chat_id: i64, source: SourceRef, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_user_id,
            chat_id,
            target_chat: None,
            source,
            state: TaskState::Pending,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            claimed_by: None,
            claim_expiry: None,
            not_before: None,
            priority: 0,
            batch_id: None,
            bytes_done: 0,
            bytes_total: None,
        }
    }

    /// Where the item is sent.
    pub fn delivery_chat(&self) -> i64 {
        self.target_chat.unwrap_or(self.chat_id)
    }

    /// Download progress in whole percent, if the size is known.
    pub fn progress_percent(&self) -> Option<u8> {
        match self.bytes_total {
            Some(0) => Some(100),
            Some(total) => Some(((self.bytes_done.min(total) * 100) / total) as u8),
            None => None,
        }
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id,
            state: self.state,
            source: self.source.clone(),
            attempt_count: self.attempt_count,
            error: self.last_error.as_ref().map(TaskError::user_message),
            progress_percent: self.progress_percent(),
            priority: self.priority,
            batch_id: self.batch_id,
        }
    }
}

/// Range request: every message id in `start..=end` of one chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub chat: ChatRef,
    pub start: i64,
    pub end: i64,
}

impl BatchRequest {
    pub fn len(&self) -> u64 {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as u64 + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expand into one pending task per message, all tagged with a fresh batch id.
    pub fn expand(
        &self,
        owner_user_id: i64,
        chat_id: i64,
        now: DateTime<Utc>,
        max_batch_size: u64,
    ) -> Result<Vec<Task>, QueueError> {
        if self.start <= 0 || self.end < self.start {
            return Err(QueueError::InvalidRange {
                start: self.start,
                end: self.end,
            });
        }
        let size = self.len();
        if size > max_batch_size {
            return Err(QueueError::BatchTooLarge {
                size,
                max: max_batch_size,
            });
        }

        let batch_id = Uuid::new_v4();
        Ok((self.start..=self.end)
            .map(|message_id| {
                let mut task = Task::new(
                    owner_user_id,
                    chat_id,
                    SourceRef::new(self.chat.clone(), message_id),
                    now,
                );
                task.batch_id = Some(batch_id);
                task
            })
            .collect())
    }
}

/// Changes a claim holder applies to its task.
///
/// Moving to `Pending` or a terminal state releases the claim.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub state: Option<TaskState>,
    pub bytes_done: Option<u64>,
    pub bytes_total: Option<u64>,
    /// Lease renewal.
    pub claim_expiry: Option<DateTime<Utc>>,
    pub last_error: Option<TaskError>,
    pub not_before: Option<DateTime<Utc>>,
    pub increment_attempts: bool,
}

impl TaskPatch {
    pub fn state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn progress(bytes_done: u64, bytes_total: Option<u64>, lease: DateTime<Utc>) -> Self {
        Self {
            bytes_done: Some(bytes_done),
            bytes_total,
            claim_expiry: Some(lease),
            ..Self::default()
        }
    }

    /// Extend the lease without touching anything else.
    pub fn renew(lease: DateTime<Utc>) -> Self {
        Self {
            claim_expiry: Some(lease),
            ..Self::default()
        }
    }

    /// Back to `Pending` after a failed attempt.
    pub fn retry(error: TaskError, not_before: DateTime<Utc>) -> Self {
        Self {
            state: Some(TaskState::Pending),
            last_error: Some(error),
            not_before: Some(not_before),
            increment_attempts: true,
            ..Self::default()
        }
    }

    /// Back to `Pending` without consuming an attempt.
    pub fn release(error: TaskError) -> Self {
        Self {
            state: Some(TaskState::Pending),
            last_error: Some(error),
            ..Self::default()
        }
    }

    pub fn fail(error: TaskError, count_attempt: bool) -> Self {
        Self {
            state: Some(TaskState::Failed),
            last_error: Some(error),
            increment_attempts: count_attempt,
            ..Self::default()
        }
    }

    /// Whether applying this patch gives up the claim.
    pub fn releases_claim(&self) -> bool {
        self.state
            .is_some_and(|s| s == TaskState::Pending || s.is_terminal())
    }
}

/// What `/status` shows per task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub id: Uuid,
    pub state: TaskState,
    pub source: SourceRef,
    pub attempt_count: u32,
    pub error: Option<String>,
    pub progress_percent: Option<u8>,
    pub priority: i64,
    pub batch_id: Option<Uuid>,
}

/// Per-batch roll-up for `/status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub remaining: usize,
    /// Completed over finished (completed + failed), in percent.
    pub success_rate: f64,
}

impl BatchSummary {
    /// Group tasks by batch id. Tasks without one are skipped.
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Vec<BatchSummary> {
        let mut batches: Vec<BatchSummary> = Vec::new();
        for task in tasks {
            let Some(batch_id) = task.batch_id else {
                continue;
            };
            let idx = match batches.iter().position(|b| b.batch_id == batch_id) {
                Some(idx) => idx,
                None => {
                    batches.push(BatchSummary {
                        batch_id,
                        total: 0,
                        completed: 0,
                        failed: 0,
                        cancelled: 0,
                        remaining: 0,
                        success_rate: 0.0,
                    });
                    batches.len() - 1
                }
            };
            let batch = &mut batches[idx];
            batch.total += 1;
            match task.state {
                TaskState::Completed => batch.completed += 1,
                TaskState::Failed => batch.failed += 1,
                TaskState::Cancelled => batch.cancelled += 1,
                _ => batch.remaining += 1,
            }
        }
        for batch in &mut batches {
            let finished = batch.completed + batch.failed;
            if finished > 0 {
                batch.success_rate = batch.completed as f64 * 100.0 / finished as f64;
            }
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat() -> ChatRef {
        ChatRef::Username("archive".into())
    }

    #[test]
    fn range_expands_to_one_task_per_message() {
        let req = BatchRequest {
            chat: chat(),
            start: 100,
            end: 200,
        };
        let tasks = req.expand(1, 1, Utc::now(), 1000).unwrap();
        assert_eq!(tasks.len(), 101);
        assert_eq!(tasks[0].source.message_id, 100);
        assert_eq!(tasks[100].source.message_id, 200);

        let batch = tasks[0].batch_id.unwrap();
        assert!(tasks.iter().all(|t| t.batch_id == Some(batch)));
        assert!(tasks.iter().all(|t| t.state == TaskState::Pending));

        let mut ids: Vec<_> = tasks.iter().map(|t| t.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 101);
    }

    #[test]
    fn inverted_or_oversized_range_rejected() {
        let inverted = BatchRequest {
            chat: chat(),
            start: 10,
            end: 5,
        };
        assert!(matches!(
            inverted.expand(1, 1, Utc::now(), 100),
            Err(QueueError::InvalidRange { start: 10, end: 5 })
        ));

        let big = BatchRequest {
            chat: chat(),
            start: 1,
            end: 500,
        };
        assert!(matches!(
            big.expand(1, 1, Utc::now(), 100),
            Err(QueueError::BatchTooLarge { size: 500, max: 100 })
        ));
    }

    #[test]
    fn internal_errors_are_masked_for_users() {
        let err = TaskError::new(ErrorClass::Internal, "disk I/O error at /var/db");
        assert_eq!(err.user_message(), "temporary problem, try again later");

        let err = TaskError::new(ErrorClass::NotFound, "message 5 deleted");
        assert_eq!(err.user_message(), "not_found: message 5 deleted");
    }

    #[test]
    fn progress_percent_clamps() {
        let mut task = Task::new(1, 1, SourceRef::new(chat(), 1), Utc::now());
        assert_eq!(task.progress_percent(), None);
        task.bytes_total = Some(200);
        task.bytes_done = 50;
        assert_eq!(task.progress_percent(), Some(25));
        task.bytes_done = 500;
        assert_eq!(task.progress_percent(), Some(100));
    }

    #[test]
    fn batch_summary_counts_outcomes() {
        let req = BatchRequest {
            chat: chat(),
            start: 1,
            end: 4,
        };
        let mut tasks = req.expand(1, 1, Utc::now(), 10).unwrap();
        tasks[0].state = TaskState::Completed;
        tasks[1].state = TaskState::Completed;
        tasks[2].state = TaskState::Failed;

        let summaries = BatchSummary::from_tasks(&tasks);
        assert_eq!(summaries.len(), 1);
        let s = &summaries[0];
        assert_eq!((s.total, s.completed, s.failed, s.remaining), (4, 2, 1, 1));
        assert!((s.success_rate - 66.666).abs() < 0.01);
    }

    #[test]
    fn terminal_patch_releases_claim() {
        assert!(TaskPatch::state(TaskState::Completed).releases_claim());
        assert!(
            TaskPatch::release(TaskError::new(ErrorClass::SessionExpired, "x")).releases_claim()
        );
        assert!(!TaskPatch::state(TaskState::Downloading).releases_claim());
    }
}
