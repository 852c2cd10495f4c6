//! Orphan recovery.
//!
//! Runs once before the scheduler starts and then on an interval. Each pass
//! returns expired claims to `Pending` (or fails them once the attempt budget
//! is spent), and fails the pending work of users whose session has been on
//! hold for longer than the hold timeout.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::{DatabaseError, ErrorClass};
use crate::platform::ClientPool;
use crate::progress::TaskEvent;
use crate::queue::state::TaskState;
use crate::queue::store_call;
use crate::queue::task::TaskError;
use crate::store::TaskStore;

/// What one recovery pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Expired claims returned to `Pending`.
    pub requeued: usize,
    /// Expired claims that ran out of attempts.
    pub exhausted: usize,
    /// Pending tasks failed because their owner's session stayed expired.
    pub session_failures: u64,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Recovery {
    store: Arc<dyn TaskStore>,
    pool: Arc<ClientPool>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    events: broadcast::Sender<TaskEvent>,
}

impl Recovery {
    pub fn new(
        store: Arc<dyn TaskStore>,
        pool: Arc<ClientPool>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        Self {
            store,
            pool,
            clock,
            config,
            events,
        }
    }

    /// A single pass. Running it again with nothing expired changes nothing.
    pub async fn run_once(&self) -> Result<RecoveryReport, DatabaseError> {
        let mut report = RecoveryReport::default();
        self.requeue_expired(&mut report).await?;
        self.expire_holds(&mut report).await?;
        if !report.is_empty() {
            tracing::info!(
                requeued = report.requeued,
                exhausted = report.exhausted,
                session_failures = report.session_failures,
                "Recovery pass changed tasks"
            );
        }
        Ok(report)
    }

    /// Repeat [`run_once`](Self::run_once) every recovery interval until
    /// `shutdown` flips. The first tick fires immediately.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.config.recovery_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = self.run_once().await {
                            tracing::warn!(error = %e, "Recovery pass failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("Recovery loop stopped");
        })
    }

    async fn requeue_expired(&self, report: &mut RecoveryReport) -> Result<(), DatabaseError> {
        let timeout = self.config.store_timeout;
        let now = self.clock.now();
        let expired = store_call(
            "find_expired_leases",
            timeout,
            self.store.find_expired_leases(now),
        )
        .await?;

        for task in expired {
            let reverted = store_call(
                "revert_expired",
                timeout,
                self.store
                    .revert_expired(task.id, now, self.config.max_attempts),
            )
            .await?;
            let Some(state) = reverted else {
                continue;
            };
            tracing::warn!(
                task_id = %task.id,
                worker = task.claimed_by.as_deref().unwrap_or("-"),
                was = %task.state,
                now = %state,
                "Recovered orphaned task"
            );
            if state == TaskState::Failed {
                report.exhausted += 1;
            } else {
                report.requeued += 1;
            }
            let _ = self.events.send(TaskEvent::StateChanged {
                task_id: task.id,
                chat_id: task.chat_id,
                source: task.source.clone(),
                state,
                attempt_count: task.attempt_count + 1,
                error: Some(TaskError::new(ErrorClass::Transient, "worker lease expired")),
            });
        }
        Ok(())
    }

    async fn expire_holds(&self, report: &mut RecoveryReport) -> Result<(), DatabaseError> {
        let timeout = self.config.store_timeout;
        let now = self.clock.now();
        let limit = chrono::Duration::from_std(self.config.session_hold_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let error = TaskError::new(
            ErrorClass::SessionExpired,
            "session expired; log in again and retry",
        );

        for (user_id, since) in self.pool.held_users().await {
            if now - since < limit {
                continue;
            }
            let pending = store_call(
                "find_by_owner",
                timeout,
                self.store.find_by_owner(user_id, Some(TaskState::Pending)),
            )
            .await?;
            let failed = store_call(
                "fail_pending_for_owner",
                timeout,
                self.store.fail_pending_for_owner(user_id, &error, now),
            )
            .await?;
            self.pool.release_hold(user_id).await;
            tracing::warn!(user_id, failed, "Session hold timed out; pending tasks failed");
            report.session_failures += failed;

            for task in pending {
                let _ = self.events.send(TaskEvent::StateChanged {
                    task_id: task.id,
                    chat_id: task.chat_id,
                    source: task.source,
                    state: TaskState::Failed,
                    attempt_count: task.attempt_count,
                    error: Some(error.clone()),
                });
            }
        }
        Ok(())
    }
}
