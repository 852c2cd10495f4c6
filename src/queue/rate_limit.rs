//! Per-session rate limiting.
//!
//! Each session gets one token bucket shared by all of that user's workers.
//! The bucket is kept in GCRA form: a single theoretical-arrival time behind
//! a mutex, advanced by one emission interval per call. Callers reserve a
//! slot under the lock and sleep outside it, so waiters are served in order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::error::PlatformError;

/// Token bucket with `burst` capacity refilling at `rate` tokens per second.
#[derive(Debug)]
pub struct TokenBucket {
    interval: Duration,
    /// How far ahead of the schedule a caller may run (`(burst - 1) * interval`).
    tolerance: Duration,
    tat: Mutex<Instant>,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        // Round up so `rate` calls never fit in less than a second.
        let interval = Duration::from_nanos((1e9 / rate_per_sec).ceil() as u64);
        Self {
            interval,
            tolerance: interval * burst.saturating_sub(1),
            tat: Mutex::new(Instant::now()),
        }
    }

    /// Wait until a call is allowed, then consume one token.
    pub async fn acquire(&self) {
        let slot = self.reserve().await;
        if slot > Instant::now() {
            tokio::time::sleep_until(slot).await;
        }
    }

    /// Like [`acquire`](Self::acquire), but give up without consuming a token
    /// when the slot is more than `limit` away.
    pub async fn acquire_within(&self, limit: Duration) -> bool {
        let now = Instant::now();
        let slot = {
            let mut tat = self.tat.lock().await;
            let earliest = tat.checked_sub(self.tolerance).unwrap_or(now);
            let slot = earliest.max(now);
            if slot - now > limit {
                return false;
            }
            *tat = (*tat).max(slot) + self.interval;
            slot
        };
        if slot > now {
            tokio::time::sleep_until(slot).await;
        }
        true
    }

    /// Consume a token if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut tat = self.tat.lock().await;
        let earliest = tat.checked_sub(self.tolerance).unwrap_or(now);
        if earliest > now {
            return false;
        }
        *tat = (*tat).max(now) + self.interval;
        true
    }

    async fn reserve(&self) -> Instant {
        let now = Instant::now();
        let mut tat = self.tat.lock().await;
        let earliest = tat.checked_sub(self.tolerance).unwrap_or(now);
        let slot = earliest.max(now);
        *tat = (*tat).max(slot) + self.interval;
        slot
    }
}

/// Lazily created buckets, one per session owner.
#[derive(Debug)]
pub struct SessionRateLimiter {
    rate_per_sec: f64,
    burst: u32,
    buckets: RwLock<HashMap<i64, Arc<TokenBucket>>>,
}

impl SessionRateLimiter {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_per_sec,
            burst,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub async fn bucket(&self, user_id: i64) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.read().await.get(&user_id) {
            return Arc::clone(bucket);
        }
        let mut buckets = self.buckets.write().await;
        Arc::clone(
            buckets
                .entry(user_id)
                .or_insert_with(|| Arc::new(TokenBucket::new(self.rate_per_sec, self.burst))),
        )
    }

    /// Wait for a platform-call slot for `user_id`'s session.
    pub async fn acquire(&self, user_id: i64) {
        self.bucket(user_id).await.acquire().await;
    }

    /// Wait at most `limit` for a slot. A backlog longer than that is
    /// reported as a transient platform timeout.
    pub async fn acquire_within(
        &self,
        user_id: i64,
        limit: Duration,
    ) -> Result<(), PlatformError> {
        if self.bucket(user_id).await.acquire_within(limit).await {
            Ok(())
        } else {
            tracing::debug!(user_id, ?limit, "Rate limit backlog exceeds wait limit");
            Err(PlatformError::Timeout {
                operation: "rate limit",
                timeout: limit,
            })
        }
    }

    /// Forget a user's bucket (logout).
    pub async fn remove(&self, user_id: i64) {
        self.buckets.write().await.remove(&user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_calls_in_any_second(times: &[Instant]) -> usize {
        let mut sorted = times.to_vec();
        sorted.sort();
        sorted
            .iter()
            .map(|start| {
                sorted
                    .iter()
                    .filter(|t| **t >= *start && **t - *start < Duration::from_secs(1))
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquirers_never_exceed_rate() {
        let bucket = Arc::new(TokenBucket::new(5.0, 1));
        let times = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..60 {
            let bucket = Arc::clone(&bucket);
            let times = Arc::clone(&times);
            handles.push(tokio::spawn(async move {
                bucket.acquire().await;
                times.lock().await.push(Instant::now());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let times = times.lock().await;
        assert_eq!(times.len(), 60);
        assert!(max_calls_in_any_second(&times) <= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_allows_initial_run_then_throttles() {
        let bucket = TokenBucket::new(2.0, 3);
        for _ in 0..3 {
            assert!(bucket.try_acquire().await);
        }
        assert!(!bucket.try_acquire().await);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_beyond_limit_is_a_transient_timeout() {
        let limiter = SessionRateLimiter::new(1.0, 1);
        let limit = Duration::from_millis(500);
        limiter.acquire_within(1, limit).await.unwrap();

        let start = Instant::now();
        let err = limiter.acquire_within(1, limit).await.unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Transient);
        assert_eq!(Instant::now(), start);

        // The refused call left the schedule alone.
        tokio::time::advance(Duration::from_millis(600)).await;
        limiter.acquire_within(1, limit).await.unwrap();
        let waited = Instant::now() - start;
        assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_are_limited_independently() {
        let limiter = SessionRateLimiter::new(1.0, 1);
        let start = Instant::now();
        limiter.acquire(1).await;
        limiter.acquire(2).await;
        assert_eq!(Instant::now(), start);

        limiter.acquire(1).await;
        assert!(Instant::now() - start >= Duration::from_secs(1));
        assert!(Arc::ptr_eq(&limiter.bucket(1).await, &limiter.bucket(1).await));
    }
}
