//! Dispatch loop.
//!
//! Claims ready tasks in priority order and spawns one worker per claim,
//! bounded by a global semaphore and a per-user slot count. Users whose
//! queue is paused or whose session is on hold are skipped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Notify, RwLock, Semaphore, watch};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::DatabaseError;
use crate::platform::ClientPool;
use crate::queue::state::TaskState;
use crate::queue::store_call;
use crate::queue::worker::TaskRunner;
use crate::store::TaskStore;

/// Candidates fetched per free worker slot, to skip past full users.
const CANDIDATES_PER_SLOT: usize = 4;

/// A task some worker in this process is running.
struct RunningTask {
    owner: i64,
    cancelled: Arc<AtomicBool>,
}

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    pool: Arc<ClientPool>,
    runner: Arc<TaskRunner>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    permits: Arc<Semaphore>,
    running: Arc<RwLock<HashMap<Uuid, RunningTask>>>,
    paused: RwLock<HashSet<i64>>,
    wake: Arc<Notify>,
    instance: String,
    next_worker: AtomicU64,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        pool: Arc<ClientPool>,
        runner: Arc<TaskRunner>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        let instance = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            store,
            pool,
            runner,
            clock,
            config,
            running: Arc::new(RwLock::new(HashMap::new())),
            paused: RwLock::new(HashSet::new()),
            wake: Arc::new(Notify::new()),
            instance,
            next_worker: AtomicU64::new(0),
        }
    }

    /// Run a dispatch pass soon, instead of at the next poll tick.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Dispatch until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            instance = %self.instance,
            max_concurrent = self.config.max_concurrent_downloads,
            per_user = self.config.max_user_concurrent_downloads,
            "Scheduler started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.dispatch_once().await {
                Ok(0) => {}
                Ok(started) => tracing::debug!(started, "Dispatched tasks"),
                Err(e) => tracing::warn!(error = %e, "Dispatch pass failed"),
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        let running = self.running_count().await;
        tracing::info!(running, "Scheduler stopped");
    }

    /// One pass: claim as many ready tasks as the limits allow and start them.
    /// Returns how many were started.
    pub async fn dispatch_once(&self) -> Result<usize, DatabaseError> {
        let available = self.permits.available_permits();
        if available == 0 {
            return Ok(0);
        }

        let mut per_user = self.running_by_owner().await;
        let mut exclude: HashSet<i64> = self.paused.read().await.clone();
        exclude.extend(self.pool.held_users().await.into_iter().map(|(user, _)| user));
        exclude.extend(
            per_user
                .iter()
                .filter(|(_, n)| **n >= self.config.max_user_concurrent_downloads)
                .map(|(user, _)| *user),
        );
        let exclude: Vec<i64> = exclude.into_iter().collect();

        let now = self.clock.now();
        let candidates = store_call(
            "find_dispatchable",
            self.config.store_timeout,
            self.store
                .find_dispatchable(now, &exclude, available * CANDIDATES_PER_SLOT),
        )
        .await?;

        let mut started = 0;
        for mut task in candidates {
            let owner = task.owner_user_id;
            if per_user.get(&owner).copied().unwrap_or(0)
                >= self.config.max_user_concurrent_downloads
            {
                continue;
            }
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };

            let worker_id = self.worker_id();
            let now = self.clock.now();
            let lease = now
                + chrono::Duration::from_std(self.config.lease_duration)
                    .unwrap_or(chrono::Duration::MAX);
            let claimed = store_call(
                "try_claim",
                self.config.store_timeout,
                self.store.try_claim(task.id, &worker_id, now, lease),
            )
            .await?;
            if !claimed {
                tracing::debug!(task_id = %task.id, "Lost claim race");
                continue;
            }
            task.state = TaskState::Claimed;
            task.claimed_by = Some(worker_id.clone());
            task.claim_expiry = Some(lease);

            let cancelled = Arc::new(AtomicBool::new(false));
            let task_id = task.id;
            // Hold the map lock across spawn so the worker's own removal
            // cannot run before its insertion.
            let mut running = self.running.write().await;
            {
                let runner = Arc::clone(&self.runner);
                let running = Arc::clone(&self.running);
                let wake = Arc::clone(&self.wake);
                let cancelled = Arc::clone(&cancelled);
                tokio::spawn(async move {
                    let outcome = runner.run(task, &worker_id, &cancelled).await;
                    tracing::debug!(%task_id, worker = %worker_id, ?outcome, "Worker finished");
                    running.write().await.remove(&task_id);
                    drop(permit);
                    wake.notify_one();
                });
            }
            running.insert(task_id, RunningTask { owner, cancelled });
            drop(running);

            *per_user.entry(owner).or_default() += 1;
            started += 1;
        }
        Ok(started)
    }

    /// Signal the worker running `task_id`, if any. Returns whether one was.
    pub async fn signal_cancel(&self, task_id: Uuid) -> bool {
        match self.running.read().await.get(&task_id) {
            Some(task) => {
                task.cancelled.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Signal every running worker of `owner`. Returns the affected task ids.
    pub async fn signal_cancel_owner(&self, owner: i64) -> Vec<Uuid> {
        self.running
            .read()
            .await
            .iter()
            .filter(|(_, task)| task.owner == owner)
            .map(|(id, task)| {
                task.cancelled.store(true, Ordering::SeqCst);
                *id
            })
            .collect()
    }

    /// Stop dispatching `user_id`'s tasks. Running ones finish.
    pub async fn pause(&self, user_id: i64) -> bool {
        let inserted = self.paused.write().await.insert(user_id);
        if inserted {
            tracing::info!(user_id, "Queue paused");
        }
        inserted
    }

    pub async fn resume(&self, user_id: i64) -> bool {
        let removed = self.paused.write().await.remove(&user_id);
        if removed {
            tracing::info!(user_id, "Queue resumed");
            self.wake();
        }
        removed
    }

    pub async fn is_paused(&self, user_id: i64) -> bool {
        self.paused.read().await.contains(&user_id)
    }

    pub async fn paused_users(&self) -> Vec<i64> {
        let mut users: Vec<i64> = self.paused.read().await.iter().copied().collect();
        users.sort_unstable();
        users
    }

    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    /// Wait until no worker is running. Polls, so only for shutdown and tests.
    pub async fn wait_idle(&self) {
        while self.running_count().await > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    async fn running_by_owner(&self) -> HashMap<i64, usize> {
        let mut counts = HashMap::new();
        for task in self.running.read().await.values() {
            *counts.entry(task.owner).or_default() += 1;
        }
        counts
    }

    fn worker_id(&self) -> String {
        let n = self.next_worker.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.instance)
    }
}
