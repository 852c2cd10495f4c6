//! Persistent download queue.
//!
//! Requests become durable [`Task`] records. The [`Scheduler`] claims ready
//! tasks under global, per-user and per-session limits and hands each to a
//! [`TaskRunner`]. [`Recovery`] returns orphaned claims to the queue, and
//! [`QueueEngine`] is the command surface over all of it.

pub mod engine;
pub mod rate_limit;
pub mod recovery;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod task;
pub mod worker;

use std::future::Future;
use std::time::Duration;

use crate::error::DatabaseError;

pub use engine::{AdminStats, QueueEngine, StatusReport};
pub use rate_limit::{SessionRateLimiter, TokenBucket};
pub use recovery::{Recovery, RecoveryReport};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::Scheduler;
pub use state::TaskState;
pub use task::{BatchRequest, ChatRef, SourceRef, Task, TaskError, TaskPatch, TaskSummary};
pub use worker::{RunOutcome, TaskRunner};

/// Bound a store call so a wedged database cannot stall the queue.
pub(crate) async fn store_call<T>(
    operation: &'static str,
    timeout: Duration,
    fut: impl Future<Output = Result<T, DatabaseError>>,
) -> Result<T, DatabaseError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(DatabaseError::Timeout { operation, timeout }),
    }
}
