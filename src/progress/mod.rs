//! Progress reporting.
//!
//! The queue engine publishes [`TaskEvent`]s on a broadcast channel. The
//! [`ProgressReporter`] turns them into throttled chat notifications: once
//! per distinct state per task, and for download progress only when the
//! percentage moved by at least the configured step.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{ChannelError, ErrorClass};
use crate::queue::state::TaskState;
use crate::queue::task::{SourceRef, TaskError};

/// Something that happened to a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    StateChanged {
        task_id: Uuid,
        chat_id: i64,
        source: SourceRef,
        state: TaskState,
        attempt_count: u32,
        error: Option<TaskError>,
    },
    Progress {
        task_id: Uuid,
        chat_id: i64,
        source: SourceRef,
        bytes_done: u64,
        bytes_total: Option<u64>,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            Self::StateChanged { task_id, .. } | Self::Progress { task_id, .. } => *task_id,
        }
    }
}

/// Sends text to a chat.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, chat_id: i64, text: &str) -> Result<(), ChannelError>;
}

/// Last reported position of one task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub last_percent: Option<u8>,
    pub last_state: Option<TaskState>,
    notified: HashSet<TaskState>,
}

/// Consumes task events and notifies the owning chat.
pub struct ProgressReporter {
    notifier: Arc<dyn Notifier>,
    step_percent: u8,
    snapshots: HashMap<Uuid, Snapshot>,
}

impl ProgressReporter {
    pub fn new(notifier: Arc<dyn Notifier>, step_percent: u8) -> Self {
        Self {
            notifier,
            step_percent: step_percent.max(1),
            snapshots: HashMap::new(),
        }
    }

    /// Run until the event channel closes.
    pub fn spawn(mut self, mut events: broadcast::Receiver<TaskEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => self.handle(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Progress reporter lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Progress reporter stopped");
        })
    }

    pub fn snapshot(&self, task_id: Uuid) -> Option<&Snapshot> {
        self.snapshots.get(&task_id)
    }

    pub async fn handle(&mut self, event: TaskEvent) {
        let Some((chat_id, text)) = self.render(&event) else {
            return;
        };
        if let Err(e) = self.notifier.notify(chat_id, &text).await {
            tracing::warn!(task_id = %event.task_id(), chat_id, error = %e, "Progress notification failed");
        }
    }

    /// Update the snapshot and decide what, if anything, to send.
    fn render(&mut self, event: &TaskEvent) -> Option<(i64, String)> {
        match event {
            TaskEvent::StateChanged {
                task_id,
                chat_id,
                source,
                state,
                attempt_count,
                error,
            } => {
                let snapshot = self.snapshots.entry(*task_id).or_default();
                if snapshot.last_state == Some(*state) {
                    return None;
                }
                snapshot.last_state = Some(*state);
                if *state == TaskState::Pending {
                    // A new attempt downloads from zero and may fail again.
                    snapshot.last_percent = None;
                    snapshot.notified.remove(&TaskState::Pending);
                    if error.is_none() {
                        return None;
                    }
                }
                if state.is_terminal() {
                    // Keep nothing for finished tasks; at most one terminal state applies.
                    self.snapshots.remove(task_id);
                } else if !snapshot.notified.insert(*state) {
                    return None;
                }
                let text = state_message(source, *state, *attempt_count, error.as_ref())?;
                Some((*chat_id, text))
            }
            TaskEvent::Progress {
                task_id,
                chat_id,
                source,
                bytes_done,
                bytes_total,
            } => {
                let total = (*bytes_total)?;
                let percent = if total == 0 {
                    100
                } else {
                    ((bytes_done.min(&total) * 100) / total) as u8
                };
                let snapshot = self.snapshots.entry(*task_id).or_default();
                let last = snapshot.last_percent.unwrap_or(0);
                if percent < last.saturating_add(self.step_percent) {
                    return None;
                }
                snapshot.last_percent = Some(percent);
                Some((*chat_id, format!("⬇️ {source}: {percent}%")))
            }
        }
    }
}

fn state_message(
    source: &SourceRef,
    state: TaskState,
    attempt_count: u32,
    error: Option<&TaskError>,
) -> Option<String> {
    let reason = error.map(TaskError::user_message).unwrap_or_default();
    let text = match state {
        TaskState::Claimed => return None,
        TaskState::Pending => format!("🔁 Retrying {source} (attempt {}): {reason}", attempt_count + 1),
        TaskState::Downloading => format!("⬇️ Downloading {source}"),
        TaskState::Uploading => format!("📤 Sending {source}"),
        TaskState::Completed => format!("✅ Completed {source}"),
        TaskState::Failed if error.is_some_and(|e| e.class == ErrorClass::Filtered) => {
            format!("⏭️ Skipped {source}: {reason}")
        }
        TaskState::Failed => format!("❌ Failed {source}: {reason}"),
        TaskState::Cancelled => format!("🚫 Cancelled {source}"),
    };
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::task::ChatRef;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(i64, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, chat_id: i64, text: &str) -> Result<(), ChannelError> {
            if self.fail {
                return Err(ChannelError::SendFailed {
                    name: "test".into(),
                    reason: "down".into(),
                });
            }
            self.sent.lock().await.push((chat_id, text.to_string()));
            Ok(())
        }
    }

    fn source() -> SourceRef {
        SourceRef::new(ChatRef::Username("news".into()), 5)
    }

    fn state(id: Uuid, state: TaskState, error: Option<TaskError>) -> TaskEvent {
        TaskEvent::StateChanged {
            task_id: id,
            chat_id: 42,
            source: source(),
            state,
            attempt_count: 0,
            error,
        }
    }

    fn progress(id: Uuid, done: u64) -> TaskEvent {
        TaskEvent::Progress {
            task_id: id,
            chat_id: 42,
            source: source(),
            bytes_done: done,
            bytes_total: Some(1000),
        }
    }

    #[tokio::test]
    async fn progress_is_throttled_to_step() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut reporter = ProgressReporter::new(notifier.clone(), 5);
        let id = Uuid::new_v4();

        for done in [10, 30, 49, 50, 60, 99, 100, 1000] {
            reporter.handle(progress(id, done)).await;
        }
        let sent = notifier.sent.lock().await;
        let texts: Vec<&str> = sent.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(
            texts,
            vec!["⬇️ @news/5: 5%", "⬇️ @news/5: 10%", "⬇️ @news/5: 100%"]
        );
    }

    #[tokio::test]
    async fn each_state_notified_once() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut reporter = ProgressReporter::new(notifier.clone(), 5);
        let id = Uuid::new_v4();
        let transient = TaskError::new(ErrorClass::Transient, "reset");

        reporter.handle(state(id, TaskState::Claimed, None)).await;
        reporter.handle(state(id, TaskState::Downloading, None)).await;
        reporter.handle(state(id, TaskState::Downloading, None)).await;
        reporter
            .handle(state(id, TaskState::Pending, Some(transient)))
            .await;
        reporter.handle(state(id, TaskState::Claimed, None)).await;
        reporter.handle(state(id, TaskState::Downloading, None)).await;
        reporter.handle(state(id, TaskState::Uploading, None)).await;
        reporter.handle(state(id, TaskState::Completed, None)).await;

        let sent = notifier.sent.lock().await;
        let texts: Vec<&str> = sent.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "⬇️ Downloading @news/5",
                "🔁 Retrying @news/5 (attempt 1): transient: reset",
                "📤 Sending @news/5",
                "✅ Completed @news/5",
            ]
        );
        assert!(reporter.snapshot(id).is_none());
    }

    #[tokio::test]
    async fn every_retry_is_announced_and_progress_restarts() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut reporter = ProgressReporter::new(notifier.clone(), 5);
        let id = Uuid::new_v4();
        let transient = TaskError::new(ErrorClass::Transient, "reset");

        for round in 0..2 {
            reporter.handle(state(id, TaskState::Downloading, None)).await;
            reporter.handle(progress(id, 600)).await;
            let retry = TaskEvent::StateChanged {
                task_id: id,
                chat_id: 42,
                source: source(),
                state: TaskState::Pending,
                attempt_count: round + 1,
                error: Some(transient.clone()),
            };
            reporter.handle(retry).await;
            assert_eq!(reporter.snapshot(id).unwrap().last_percent, None);
        }

        let sent = notifier.sent.lock().await;
        let texts: Vec<&str> = sent.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "⬇️ Downloading @news/5",
                "⬇️ @news/5: 60%",
                "🔁 Retrying @news/5 (attempt 2): transient: reset",
                "⬇️ @news/5: 60%",
                "🔁 Retrying @news/5 (attempt 3): transient: reset",
            ]
        );
    }

    #[tokio::test]
    async fn internal_errors_are_not_leaked() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut reporter = ProgressReporter::new(notifier.clone(), 5);
        let err = TaskError::new(ErrorClass::Internal, "database is locked");
        reporter
            .handle(state(Uuid::new_v4(), TaskState::Failed, Some(err)))
            .await;
        let sent = notifier.sent.lock().await;
        assert_eq!(
            sent[0].1,
            "❌ Failed @news/5: temporary problem, try again later"
        );
    }

    #[tokio::test]
    async fn filtered_items_read_as_skipped() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut reporter = ProgressReporter::new(notifier.clone(), 5);
        let err = TaskError::new(ErrorClass::Filtered, "video files are switched off in /filters");
        reporter
            .handle(state(Uuid::new_v4(), TaskState::Failed, Some(err)))
            .await;
        let sent = notifier.sent.lock().await;
        assert_eq!(
            sent[0].1,
            "⏭️ Skipped @news/5: video files are switched off in /filters"
        );
    }

    #[tokio::test]
    async fn notifier_failures_are_swallowed() {
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..RecordingNotifier::default()
        });
        let mut reporter = ProgressReporter::new(notifier, 5);
        reporter
            .handle(state(Uuid::new_v4(), TaskState::Completed, None))
            .await;
    }

    #[tokio::test]
    async fn spawned_reporter_drains_channel() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (tx, rx) = broadcast::channel(16);
        let handle = ProgressReporter::new(notifier.clone(), 5).spawn(rx);
        tx.send(state(Uuid::new_v4(), TaskState::Completed, None))
            .unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(notifier.sent.lock().await.len(), 1);
    }
}
