//! The queue's command surface.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::{DatabaseError, ErrorClass, QueueError};
use crate::platform::{ClientPool, Deliverer};
use crate::progress::TaskEvent;
use crate::queue::rate_limit::SessionRateLimiter;
use crate::queue::recovery::{Recovery, RecoveryReport};
use crate::queue::scheduler::Scheduler;
use crate::queue::state::TaskState;
use crate::queue::store_call;
use crate::queue::task::{BatchRequest, BatchSummary, SourceRef, Task, TaskSummary};
use crate::queue::worker::TaskRunner;
use crate::settings::{FileCategory, UserSettings};
use crate::store::{SettingsStore, TaskStore};
use crate::vault::{CredentialVault, Credentials};

/// Capacity of the task event channel.
const EVENT_CAPACITY: usize = 1024;

/// Finished tasks shown by `/status`.
const RECENT_LIMIT: usize = 10;

/// One user's view of their queue.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Non-terminal tasks, oldest first.
    pub active: Vec<TaskSummary>,
    /// Most recently finished tasks, newest first.
    pub recent: Vec<TaskSummary>,
    pub batches: Vec<BatchSummary>,
    pub paused: bool,
    /// The session expired and tasks wait for `/login`.
    pub held: bool,
}

/// Operator view of the whole queue.
#[derive(Debug, Clone, Serialize)]
pub struct AdminStats {
    pub by_state: HashMap<TaskState, u64>,
    pub failures_by_class: HashMap<ErrorClass, u64>,
    /// Workers running in this process.
    pub running: usize,
    pub paused_users: Vec<i64>,
    pub held_users: Vec<i64>,
    pub sessions: u64,
}

impl AdminStats {
    pub fn total(&self) -> u64 {
        self.by_state.values().sum()
    }
}

pub struct QueueEngine {
    store: Arc<dyn TaskStore>,
    settings: Arc<dyn SettingsStore>,
    vault: CredentialVault,
    pool: Arc<ClientPool>,
    limiter: Arc<SessionRateLimiter>,
    scheduler: Arc<Scheduler>,
    recovery: Arc<Recovery>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    events: broadcast::Sender<TaskEvent>,
}

impl QueueEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        settings: Arc<dyn SettingsStore>,
        vault: CredentialVault,
        pool: Arc<ClientPool>,
        deliverer: Arc<dyn Deliverer>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let limiter = Arc::new(SessionRateLimiter::new(
            config.rate_limit_per_sec,
            config.rate_limit_burst,
        ));
        let runner = Arc::new(TaskRunner::new(
            Arc::clone(&store),
            Arc::clone(&settings),
            Arc::clone(&pool),
            deliverer,
            Arc::clone(&limiter),
            Arc::clone(&clock),
            config.clone(),
            events.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            runner,
            Arc::clone(&clock),
            config.clone(),
        ));
        let recovery = Arc::new(Recovery::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::clone(&clock),
            config.clone(),
            events.clone(),
        ));
        Self {
            store,
            settings,
            vault,
            pool,
            limiter,
            scheduler,
            recovery,
            clock,
            config,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Recover orphans, then start the scheduler and the recovery loop.
    pub async fn start(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, QueueError> {
        let report = self.recover().await?;
        tracing::info!(
            requeued = report.requeued,
            exhausted = report.exhausted,
            "Startup recovery complete"
        );
        let scheduler = tokio::spawn(Arc::clone(&self.scheduler).run(shutdown.clone()));
        let recovery = Arc::clone(&self.recovery).spawn(shutdown);
        Ok(vec![scheduler, recovery])
    }

    pub async fn recover(&self) -> Result<RecoveryReport, QueueError> {
        Ok(self.recovery.run_once().await?)
    }

    /// Queue one message for `user_id`, requested from `chat_id`. Delivery
    /// goes to the user's target chat when one is set.
    pub async fn enqueue(
        &self,
        user_id: i64,
        chat_id: i64,
        source: SourceRef,
    ) -> Result<Uuid, QueueError> {
        self.require_session(user_id, &source).await?;
        let mut task = Task::new(user_id, chat_id, source, self.clock.now());
        task.target_chat = self.settings(user_id).await?.target_chat;
        self.timed("create", self.store.create(&task)).await?;
        tracing::info!(task_id = %task.id, user_id, source = %task.source, "Task enqueued");
        self.scheduler.wake();
        Ok(task.id)
    }

    /// Queue a message range as one batch. All tasks land or none do.
    pub async fn enqueue_batch(
        &self,
        user_id: i64,
        chat_id: i64,
        request: BatchRequest,
    ) -> Result<Vec<Uuid>, QueueError> {
        let probe = SourceRef::new(request.chat.clone(), request.start);
        self.require_session(user_id, &probe).await?;
        let mut tasks = request.expand(
            user_id,
            chat_id,
            self.clock.now(),
            self.config.max_batch_size,
        )?;
        let target_chat = self.settings(user_id).await?.target_chat;
        for task in &mut tasks {
            task.target_chat = target_chat;
        }
        self.timed("create_many", self.store.create_many(&tasks))
            .await?;
        tracing::info!(
            user_id,
            chat = %request.chat,
            start = request.start,
            end = request.end,
            batch_id = ?tasks.first().and_then(|t| t.batch_id),
            "Batch enqueued"
        );
        self.scheduler.wake();
        Ok(tasks.into_iter().map(|t| t.id).collect())
    }

    /// Cancel one task. `user_id` of `None` is an admin cancel.
    pub async fn cancel(&self, user_id: Option<i64>, id: Uuid) -> Result<(), QueueError> {
        let now = self.clock.now();
        let cancelled = self
            .timed("cancel", self.store.cancel(id, user_id, now))
            .await?;
        if !cancelled {
            return Err(self.explain_refusal(id, user_id, TaskState::Cancelled).await?);
        }
        self.scheduler.signal_cancel(id).await;
        if let Some(task) = self.timed("get", self.store.get(id)).await? {
            self.emit_state(&task);
        }
        tracing::info!(task_id = %id, ?user_id, "Task cancelled");
        Ok(())
    }

    /// Cancel every non-terminal task of `user_id`. Returns how many.
    pub async fn cancel_all(&self, user_id: i64) -> Result<u64, QueueError> {
        let now = self.clock.now();
        let count = self
            .timed("cancel_all", self.store.cancel_all(user_id, now))
            .await?;
        // Only running tasks are announced.
        for id in self.scheduler.signal_cancel_owner(user_id).await {
            let task = self.timed("get", self.store.get(id)).await?;
            if let Some(task) = task.filter(|t| t.state == TaskState::Cancelled) {
                self.emit_state(&task);
            }
        }
        tracing::info!(user_id, count, "All tasks cancelled");
        Ok(count)
    }

    pub async fn status(&self, user_id: i64) -> Result<StatusReport, QueueError> {
        let tasks = self
            .timed("find_by_owner", self.store.find_by_owner(user_id, None))
            .await?;
        let batches = BatchSummary::from_tasks(tasks.iter().filter(|t| t.batch_id.is_some()));

        let (finished, active): (Vec<&Task>, Vec<&Task>) =
            tasks.iter().partition(|t| t.state.is_terminal());
        let mut recent: Vec<&Task> = finished;
        recent.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        recent.truncate(RECENT_LIMIT);

        Ok(StatusReport {
            active: active.into_iter().map(Task::summary).collect(),
            recent: recent.into_iter().map(Task::summary).collect(),
            batches: batches
                .into_iter()
                .filter(|b| b.remaining > 0 || b.total > 1)
                .collect(),
            paused: self.scheduler.is_paused(user_id).await,
            held: self.pool.is_held(user_id).await,
        })
    }

    pub async fn admin_stats(&self) -> Result<AdminStats, QueueError> {
        let by_state = self
            .timed("counts_by_state", self.store.counts_by_state())
            .await?;
        let failures_by_class = self
            .timed("counts_by_error_class", self.store.counts_by_error_class())
            .await?;
        let sessions = match self.vault.session_count().await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "Could not count sessions");
                0
            }
        };
        let mut held_users: Vec<i64> = self
            .pool
            .held_users()
            .await
            .into_iter()
            .map(|(user, _)| user)
            .collect();
        held_users.sort_unstable();

        Ok(AdminStats {
            by_state,
            failures_by_class,
            running: self.scheduler.running_count().await,
            paused_users: self.scheduler.paused_users().await,
            held_users,
            sessions,
        })
    }

    /// Admin listing, newest first.
    pub async fn list_tasks(
        &self,
        owner: Option<i64>,
        state: Option<TaskState>,
        limit: usize,
    ) -> Result<Vec<Task>, QueueError> {
        Ok(self
            .timed("list_tasks", self.store.list_tasks(owner, state, limit))
            .await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Task, QueueError> {
        self.timed("get", self.store.get(id))
            .await?
            .ok_or(QueueError::TaskNotFound { id })
    }

    pub async fn pause(&self, user_id: i64) -> bool {
        self.scheduler.pause(user_id).await
    }

    pub async fn resume(&self, user_id: i64) -> bool {
        self.scheduler.resume(user_id).await
    }

    pub async fn set_priority(&self, id: Uuid, priority: i64) -> Result<(), QueueError> {
        let now = self.clock.now();
        let changed = self
            .timed("set_priority", self.store.set_priority(id, priority, now))
            .await?;
        if !changed {
            return Err(self.explain_refusal(id, None, TaskState::Pending).await?);
        }
        tracing::info!(task_id = %id, priority, "Task priority changed");
        self.scheduler.wake();
        Ok(())
    }

    /// Give a failed task a fresh attempt budget.
    pub async fn retry(&self, id: Uuid) -> Result<(), QueueError> {
        let now = self.clock.now();
        let retried = self
            .timed("retry_failed", self.store.retry_failed(id, now))
            .await?;
        if !retried {
            return Err(self.explain_refusal(id, None, TaskState::Pending).await?);
        }
        tracing::info!(task_id = %id, "Failed task requeued");
        self.scheduler.wake();
        Ok(())
    }

    /// Store a session and release any hold on the user's tasks.
    pub async fn login(&self, user_id: i64, credentials: &Credentials) -> Result<(), QueueError> {
        self.vault
            .login(user_id, credentials, self.clock.now())
            .await?;
        if self.pool.release_hold(user_id).await {
            tracing::info!(user_id, "Session restored; held tasks resume");
        }
        self.scheduler.wake();
        Ok(())
    }

    /// Revoke the session and drop the live client. Returns whether a
    /// session existed.
    pub async fn logout(&self, user_id: i64) -> Result<bool, QueueError> {
        let removed = self.vault.logout(user_id).await?;
        self.pool.invalidate(user_id).await;
        self.limiter.remove(user_id).await;
        Ok(removed)
    }

    pub async fn settings(&self, user_id: i64) -> Result<UserSettings, QueueError> {
        Ok(self
            .timed("get_settings", self.settings.get_settings(user_id))
            .await?)
    }

    /// Deliver future downloads to `target`, or back to the requesting chat
    /// with `None`. Already queued tasks keep their destination.
    pub async fn set_target_chat(
        &self,
        user_id: i64,
        target: Option<i64>,
    ) -> Result<UserSettings, QueueError> {
        let mut settings = self.settings(user_id).await?;
        settings.target_chat = target;
        self.save_settings(user_id, &settings).await?;
        tracing::info!(user_id, ?target, "Target chat changed");
        Ok(settings)
    }

    /// Switch one file category on (`skip == false`) or off.
    pub async fn set_filter(
        &self,
        user_id: i64,
        category: FileCategory,
        skip: bool,
    ) -> Result<UserSettings, QueueError> {
        let mut settings = self.settings(user_id).await?;
        if skip {
            settings.skipped.insert(category);
        } else {
            settings.skipped.remove(&category);
        }
        self.save_settings(user_id, &settings).await?;
        tracing::info!(user_id, %category, skip, "File filter changed");
        Ok(settings)
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    async fn save_settings(&self, user_id: i64, settings: &UserSettings) -> Result<(), QueueError> {
        let now = self.clock.now();
        Ok(self
            .timed(
                "put_settings",
                self.settings.put_settings(user_id, settings, now),
            )
            .await?)
    }

    async fn require_session(&self, user_id: i64, source: &SourceRef) -> Result<(), QueueError> {
        if source.needs_user_session() && !self.vault.has_session(user_id).await? {
            return Err(QueueError::LoginRequired);
        }
        Ok(())
    }

    /// Work out why a conditional write on `id` did not land.
    async fn explain_refusal(
        &self,
        id: Uuid,
        user_id: Option<i64>,
        target: TaskState,
    ) -> Result<QueueError, QueueError> {
        let task = self.get(id).await?;
        if user_id.is_some_and(|user| user != task.owner_user_id) {
            return Ok(QueueError::NotOwner { id });
        }
        Ok(QueueError::InvalidTransition {
            id,
            state: task.state.to_string(),
            target: target.to_string(),
        })
    }

    fn emit_state(&self, task: &Task) {
        let _ = self.events.send(TaskEvent::StateChanged {
            task_id: task.id,
            chat_id: task.chat_id,
            source: task.source.clone(),
            state: task.state,
            attempt_count: task.attempt_count,
            error: task.last_error.clone().filter(|_| task.state != TaskState::Cancelled),
        });
    }

    async fn timed<T>(
        &self,
        operation: &'static str,
        fut: impl std::future::Future<Output = Result<T, DatabaseError>>,
    ) -> Result<T, DatabaseError> {
        store_call(operation, self.config.store_timeout, fut).await
    }
}
