//! Executes one claimed task: fetch, download, deliver.
//!
//! Every store write is conditional on the worker still holding the claim.
//! A write that does not land means the task was cancelled or recovered
//! underneath us, and the attempt is abandoned without further writes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::{DatabaseError, ErrorClass, PlatformError};
use crate::platform::{ClientPool, Deliverer, ItemMetadata};
use crate::progress::TaskEvent;
use crate::queue::rate_limit::SessionRateLimiter;
use crate::queue::store_call;
use crate::queue::retry::{RetryDecision, RetryPolicy};
use crate::queue::state::TaskState;
use crate::queue::task::{Task, TaskError, TaskPatch};
use crate::store::{SettingsStore, TaskStore};

/// Without a known size, persist progress at least this often.
const UNKNOWN_SIZE_PERSIST_BYTES: u64 = 1024 * 1024;

/// How one run of a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Retrying,
    Held,
    Failed,
    /// Cancelled, or the claim was lost; nothing recorded.
    Discarded,
}

/// Why an attempt stopped.
#[derive(Debug)]
struct AttemptFailure {
    class: ErrorClass,
    message: String,
    retry_after: Option<Duration>,
}

impl AttemptFailure {
    fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retry_after: None,
        }
    }

    fn claim_lost() -> Self {
        Self::new(ErrorClass::StoreConflict, "claim lost")
    }

    fn cancelled() -> Self {
        Self::new(ErrorClass::Cancelled, "cancelled")
    }
}

impl From<PlatformError> for AttemptFailure {
    fn from(e: PlatformError) -> Self {
        Self {
            class: e.class(),
            retry_after: e.retry_after(),
            message: e.to_string(),
        }
    }
}

impl From<DatabaseError> for AttemptFailure {
    fn from(e: DatabaseError) -> Self {
        Self::new(ErrorClass::Internal, e.to_string())
    }
}

/// Shared machinery every worker uses.
pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    settings: Arc<dyn SettingsStore>,
    pool: Arc<ClientPool>,
    deliverer: Arc<dyn Deliverer>,
    limiter: Arc<SessionRateLimiter>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    policy: RetryPolicy,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        settings: Arc<dyn SettingsStore>,
        pool: Arc<ClientPool>,
        deliverer: Arc<dyn Deliverer>,
        limiter: Arc<SessionRateLimiter>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        Self {
            policy: RetryPolicy::from_config(&config),
            store,
            settings,
            pool,
            deliverer,
            limiter,
            clock,
            config,
            events,
        }
    }

    /// Drive a task this worker has just claimed to its next resting state.
    pub async fn run(&self, task: Task, worker_id: &str, cancelled: &AtomicBool) -> RunOutcome {
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            result = self.attempt(&task, worker_id, cancelled) => result,
            failure = self.heartbeat(&task, worker_id) => Err(failure),
        };
        match result {
            Ok(()) => {
                tracing::info!(
                    task_id = %task.id,
                    owner = task.owner_user_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Task completed"
                );
                RunOutcome::Completed
            }
            Err(failure) => self.settle(&task, worker_id, failure).await,
        }
    }

    async fn attempt(
        &self,
        task: &Task,
        worker_id: &str,
        cancelled: &AtomicBool,
    ) -> Result<(), AttemptFailure> {
        let owner = task.owner_user_id;
        check_cancelled(cancelled)?;

        self.limiter
            .acquire_within(owner, self.config.platform_timeout)
            .await?;
        let item = self.pool.fetch_item(owner, &task.source).await?;
        check_cancelled(cancelled)?;

        let settings = store_call(
            "get_settings",
            self.config.store_timeout,
            self.settings.get_settings(owner),
        )
        .await?;
        if let Some(category) = settings.rejects(&item) {
            return Err(AttemptFailure::new(
                ErrorClass::Filtered,
                format!("{category} files are switched off in /filters"),
            ));
        }

        let bytes = if item.kind.has_file() {
            if item.file_size.is_some_and(|size| size > self.config.max_file_size) {
                return Err(self.too_large());
            }
            self.advance(task, worker_id, TaskState::Downloading).await?;
            self.download(task, worker_id, &item, cancelled).await?
        } else {
            item.text.clone().unwrap_or_default().into_bytes()
        };
        check_cancelled(cancelled)?;

        self.advance(task, worker_id, TaskState::Uploading).await?;
        let timeout = self.config.delivery_timeout;
        let delivery = self.deliverer.deliver(task.delivery_chat(), &item, bytes);
        match tokio::time::timeout(timeout, delivery).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(PlatformError::Timeout {
                    operation: "deliver",
                    timeout,
                }
                .into());
            }
        }

        self.advance(task, worker_id, TaskState::Completed).await
    }

    /// Renew the lease for as long as the attempt runs. Returns only once a
    /// renewal is refused, which means the claim is gone.
    async fn heartbeat(&self, task: &Task, worker_id: &str) -> AttemptFailure {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let patch = TaskPatch::renew(self.lease_from(self.clock.now()));
            match self.update(task, worker_id, &patch).await {
                Ok(true) => tracing::trace!(task_id = %task.id, "Lease renewed"),
                Ok(false) => {
                    tracing::warn!(task_id = %task.id, "Lease renewal refused");
                    return AttemptFailure::claim_lost();
                }
                // The next tick tries again while the lease still holds.
                Err(e) => tracing::warn!(task_id = %task.id, error = %e, "Lease renewal failed"),
            }
        }
    }

    async fn download(
        &self,
        task: &Task,
        worker_id: &str,
        item: &ItemMetadata,
        cancelled: &AtomicBool,
    ) -> Result<Vec<u8>, AttemptFailure> {
        let owner = task.owner_user_id;
        self.limiter
            .acquire_within(owner, self.config.platform_timeout)
            .await?;
        let mut stream = self.pool.download(owner, item).await?;
        let total = stream.total.or(item.file_size);
        if total.is_some_and(|size| size > self.config.max_file_size) {
            return Err(self.too_large());
        }

        let mut buf = Vec::with_capacity(total.unwrap_or(0).min(64 * 1024 * 1024) as usize);
        let mut persisted_bytes = 0u64;
        let chunk_timeout = self.config.platform_timeout;

        loop {
            let next = match tokio::time::timeout(chunk_timeout, stream.chunks.next()).await {
                Ok(next) => next,
                Err(_) => {
                    return Err(PlatformError::Timeout {
                        operation: "download chunk",
                        timeout: chunk_timeout,
                    }
                    .into());
                }
            };
            let Some(chunk) = next else {
                break;
            };
            buf.extend_from_slice(&chunk?);
            let done = buf.len() as u64;
            if done > self.config.max_file_size {
                return Err(self.too_large());
            }
            check_cancelled(cancelled)?;

            let advanced = match total {
                Some(total) if total > 0 => {
                    done * 100 / total > persisted_bytes * 100 / total
                }
                _ => done - persisted_bytes >= UNKNOWN_SIZE_PERSIST_BYTES,
            };
            if advanced {
                self.record_progress(task, worker_id, done, total).await?;
                persisted_bytes = done;
            }
        }

        let done = buf.len() as u64;
        if done != persisted_bytes || total.is_none() {
            self.record_progress(task, worker_id, done, Some(total.unwrap_or(done)))
                .await?;
        }
        Ok(buf)
    }

    /// Persist progress and renew the lease in one write.
    async fn record_progress(
        &self,
        task: &Task,
        worker_id: &str,
        done: u64,
        total: Option<u64>,
    ) -> Result<(), AttemptFailure> {
        let now = self.clock.now();
        let patch = TaskPatch::progress(done, total, self.lease_from(now));
        if !self.update(task, worker_id, &patch).await? {
            return Err(AttemptFailure::claim_lost());
        }
        self.emit(TaskEvent::Progress {
            task_id: task.id,
            chat_id: task.chat_id,
            source: task.source.clone(),
            bytes_done: done,
            bytes_total: total,
        });
        Ok(())
    }

    /// Move to the next lifecycle state, renewing the lease.
    async fn advance(
        &self,
        task: &Task,
        worker_id: &str,
        state: TaskState,
    ) -> Result<(), AttemptFailure> {
        let mut patch = TaskPatch::state(state);
        if !state.is_terminal() {
            patch.claim_expiry = Some(self.lease_from(self.clock.now()));
        }
        if !self.update(task, worker_id, &patch).await? {
            return Err(AttemptFailure::claim_lost());
        }
        tracing::debug!(task_id = %task.id, %state, "Task advanced");
        self.emit_state(task, state, task.attempt_count, None);
        Ok(())
    }

    /// Record the failed attempt according to the retry policy.
    async fn settle(&self, task: &Task, worker_id: &str, failure: AttemptFailure) -> RunOutcome {
        let decision = self
            .policy
            .decide(failure.class, task.attempt_count, failure.retry_after);
        let error = TaskError::new(failure.class, failure.message.clone());

        let (patch, state, attempts, outcome) = match decision {
            RetryDecision::Discard => {
                tracing::info!(task_id = %task.id, class = %failure.class, "Attempt abandoned");
                return RunOutcome::Discarded;
            }
            RetryDecision::Retry { delay } => {
                let gate = self.clock.now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
                (
                    TaskPatch::retry(error.clone(), gate),
                    TaskState::Pending,
                    task.attempt_count + 1,
                    RunOutcome::Retrying,
                )
            }
            RetryDecision::Hold => (
                TaskPatch::release(TaskError::new(
                    ErrorClass::SessionExpired,
                    "session expired; send /login to continue",
                )),
                TaskState::Pending,
                task.attempt_count,
                RunOutcome::Held,
            ),
            RetryDecision::Fail => (
                TaskPatch::fail(error.clone(), failure.class.is_retryable()),
                TaskState::Failed,
                task.attempt_count + u32::from(failure.class.is_retryable()),
                RunOutcome::Failed,
            ),
        };

        if failure.class == ErrorClass::Internal {
            tracing::error!(task_id = %task.id, error = %failure.message, "Task attempt failed");
        } else {
            tracing::warn!(
                task_id = %task.id,
                class = %failure.class,
                error = %failure.message,
                ?outcome,
                "Task attempt failed"
            );
        }

        match self.update(task, worker_id, &patch).await {
            Ok(true) => {
                let error = patch.last_error.clone();
                self.emit_state(task, state, attempts, error);
                outcome
            }
            Ok(false) => RunOutcome::Discarded,
            Err(e) => {
                // The lease will expire and recovery picks the task up.
                tracing::error!(task_id = %task.id, error = %e, "Could not record failed attempt");
                RunOutcome::Discarded
            }
        }
    }

    async fn update(
        &self,
        task: &Task,
        worker_id: &str,
        patch: &TaskPatch,
    ) -> Result<bool, DatabaseError> {
        let now = self.clock.now();
        store_call(
            "update_claimed",
            self.config.store_timeout,
            self.store.update_claimed(task.id, worker_id, now, patch),
        )
        .await
    }

    fn lease_from(&self, now: chrono::DateTime<chrono::Utc>) -> chrono::DateTime<chrono::Utc> {
        now + chrono::Duration::from_std(self.config.lease_duration)
            .unwrap_or(chrono::Duration::MAX)
    }

    fn too_large(&self) -> AttemptFailure {
        AttemptFailure::new(
            ErrorClass::PermissionDenied,
            format!(
                "file too large (limit {} MB)",
                self.config.max_file_size / (1024 * 1024)
            ),
        )
    }

    fn emit_state(&self, task: &Task, state: TaskState, attempt_count: u32, error: Option<TaskError>) {
        self.emit(TaskEvent::StateChanged {
            task_id: task.id,
            chat_id: task.chat_id,
            source: task.source.clone(),
            state,
            attempt_count,
            error,
        });
    }

    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn check_cancelled(cancelled: &AtomicBool) -> Result<(), AttemptFailure> {
    if cancelled.load(Ordering::SeqCst) {
        Err(AttemptFailure::cancelled())
    } else {
        Ok(())
    }
}
