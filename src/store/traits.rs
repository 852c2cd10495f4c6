//! Persistence traits for task records, sealed sessions and user settings.
//!
//! Every mutation a worker makes is conditional on it still holding the
//! claim, so a task cancelled or recovered underneath a slow worker simply
//! stops accepting that worker's writes.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{DatabaseError, ErrorClass};
use crate::queue::state::TaskState;
use crate::queue::task::{Task, TaskError, TaskPatch};
use crate::settings::UserSettings;

/// Durable task records behind atomic claim/update operations.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert one new task.
    async fn create(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Insert many tasks atomically. Either all land or none do.
    async fn create_many(&self, tasks: &[Task]) -> Result<(), DatabaseError>;

    async fn get(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Claim a task for `worker`.
    ///
    /// Succeeds only if the task is `Pending` and past its backoff gate, or
    /// `Claimed` with an expired lease. Exactly one of any number of racing
    /// callers gets `true`.
    async fn try_claim(
        &self,
        id: Uuid,
        worker: &str,
        now: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Apply `patch` if `worker` still holds the claim and the state change,
    /// if any, is a legal transition. Returns whether the write landed.
    async fn update_claimed(
        &self,
        id: Uuid,
        worker: &str,
        now: DateTime<Utc>,
        patch: &TaskPatch,
    ) -> Result<bool, DatabaseError>;

    /// Claimed tasks whose lease ran out.
    async fn find_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError>;

    /// Return an orphaned task to `Pending` with one more attempt counted, or
    /// fail it when that exhausts `max_attempts`. `None` if the lease was
    /// renewed or the task moved on in the meantime.
    async fn revert_expired(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Option<TaskState>, DatabaseError>;

    /// Tasks of one user, oldest first, optionally filtered by state.
    async fn find_by_owner(
        &self,
        owner: i64,
        state: Option<TaskState>,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Filtered listing for the admin surface, newest first.
    async fn list_tasks(
        &self,
        owner: Option<i64>,
        state: Option<TaskState>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Pending tasks ready to run, in dispatch order (priority, then age,
    /// then insertion). Owners in `exclude_owners` are skipped.
    async fn find_dispatchable(
        &self,
        now: DateTime<Utc>,
        exclude_owners: &[i64],
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Cancel a non-terminal task, optionally only if `owner` owns it.
    async fn cancel(
        &self,
        id: Uuid,
        owner: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Cancel every non-terminal task of `owner`. Returns how many.
    async fn cancel_all(&self, owner: i64, now: DateTime<Utc>) -> Result<u64, DatabaseError>;

    /// Fail every pending task of `owner` with `error`.
    async fn fail_pending_for_owner(
        &self,
        owner: i64,
        error: &TaskError,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    /// Change the priority of a non-terminal task.
    async fn set_priority(
        &self,
        id: Uuid,
        priority: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Move a failed task back to `Pending` with a fresh attempt budget.
    async fn retry_failed(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    async fn counts_by_state(&self) -> Result<HashMap<TaskState, u64>, DatabaseError>;

    /// Failed tasks grouped by the class of their last error.
    async fn counts_by_error_class(&self) -> Result<HashMap<ErrorClass, u64>, DatabaseError>;

    /// Delete terminal tasks last updated before `older_than`.
    async fn prune_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, DatabaseError>;

    /// Every task, oldest first. Used by backups.
    async fn all_tasks(&self) -> Result<Vec<Task>, DatabaseError>;
}

/// Opaque sealed credential blobs keyed by user.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put_sealed(
        &self,
        user_id: i64,
        blob: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn get_sealed(&self, user_id: i64) -> Result<Option<Vec<u8>>, DatabaseError>;

    /// Returns whether a session existed.
    async fn delete_sealed(&self, user_id: i64) -> Result<bool, DatabaseError>;

    async fn count_sessions(&self) -> Result<u64, DatabaseError>;
}

/// Per-user delivery preferences.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Stored settings, or the defaults for a user who never changed any.
    async fn get_settings(&self, user_id: i64) -> Result<UserSettings, DatabaseError>;

    async fn put_settings(
        &self,
        user_id: i64,
        settings: &UserSettings,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
}
