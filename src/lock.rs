//! Lease-based mutual exclusion over named resources.
//!
//! A lock is a document in the `locks` collection keyed by its lock id
//! (`role:<roleId>` for roles). Every grant and release goes through the
//! store's single-document atomic primitive, so two owners can never both
//! observe the lock as free. A lease older than its `timeout_ms` is treated
//! as abandoned and may be taken over.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::store::{AtomicWrite, DocumentStore, LOCKS, StoreError, atomic_fn};

/// Lock key guarding a single role.
pub fn role_lock_key(role_id: &str) -> String {
    format!("role:{role_id}")
}

/// A granted lease on a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub lock_id: String,
    pub owner_id: String,
    pub acquired_at: i64,
    pub timeout_ms: u64,
}

impl Lock {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.acquired_at) >= self.timeout_ms as i64
    }
}

/// Backoff between lock attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt before giving up.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryConfig {
    /// delay = min(base_delay_ms * 2^(attempt - 1), max_delay_ms)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }
}

#[derive(Debug, Clone)]
pub struct LockRequest {
    pub lock_id: String,
    pub owner_id: String,
    pub timeout_ms: u64,
    pub retry_count: u32,
}

pub struct LockManager {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    backoff: RetryConfig,
}

impl LockManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        backoff: RetryConfig,
    ) -> Self {
        Self {
            store,
            clock,
            backoff,
        }
    }

    /// Try to take the lock, retrying with backoff up to `retry_count` times.
    ///
    /// Returns `Ok(false)` once retries are exhausted; the caller decides how
    /// to surface that. Re-acquiring a lock already held by the same owner
    /// refreshes the lease.
    pub async fn acquire_lock(&self, req: &LockRequest) -> Result<bool, StoreError> {
        for attempt in 0..=req.retry_count {
            if attempt > 0 {
                let delay_ms = self.backoff.delay_for_attempt(attempt);
                debug!(
                    lock_id = %req.lock_id,
                    owner_id = %req.owner_id,
                    attempt,
                    delay_ms,
                    "lock busy, backing off"
                );
                sleep(Duration::from_millis(delay_ms)).await;
            }

            if self.try_acquire(req).await? {
                debug!(lock_id = %req.lock_id, owner_id = %req.owner_id, attempt, "lock granted");
                return Ok(true);
            }
        }

        warn!(
            lock_id = %req.lock_id,
            owner_id = %req.owner_id,
            attempts = req.retry_count + 1,
            "lock acquisition exhausted retries"
        );
        Ok(false)
    }

    async fn try_acquire(&self, req: &LockRequest) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let owner = req.owner_id.clone();
        let candidate = Lock {
            lock_id: req.lock_id.clone(),
            owner_id: req.owner_id.clone(),
            acquired_at: now,
            timeout_ms: req.timeout_ms,
        };
        let candidate = serde_json::to_value(&candidate)?;

        let after = self
            .store
            .run_atomic(
                LOCKS,
                &req.lock_id,
                atomic_fn(move |current| match current.and_then(parse_lock) {
                    Some(held) if held.owner_id != owner && !held.is_expired(now) => {
                        AtomicWrite::Keep
                    }
                    _ => AtomicWrite::Put(candidate),
                }),
            )
            .await?;

        Ok(after
            .and_then(|doc| parse_lock(&doc))
            .is_some_and(|lock| lock.owner_id == req.owner_id))
    }

    /// Release the lock if, and only if, `owner_id` holds it.
    ///
    /// Releasing a lock held by someone else, or not held at all, is a no-op.
    pub async fn release_lock(&self, lock_id: &str, owner_id: &str) -> Result<(), StoreError> {
        let owner = owner_id.to_string();
        self.store
            .run_atomic(
                LOCKS,
                lock_id,
                atomic_fn(move |current| match current.and_then(parse_lock) {
                    Some(held) if held.owner_id == owner => AtomicWrite::Remove,
                    _ => AtomicWrite::Keep,
                }),
            )
            .await?;
        debug!(lock_id, owner_id, "lock released");
        Ok(())
    }

    /// The current, unexpired holder of `lock_id`, if any.
    pub async fn current_lock(&self, lock_id: &str) -> Result<Option<Lock>, StoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .store
            .get(LOCKS, lock_id)
            .await?
            .and_then(|doc| parse_lock(&doc))
            .filter(|lock| !lock.is_expired(now)))
    }
}

// An unreadable lock document is treated as free.
fn parse_lock(doc: &serde_json::Value) -> Option<Lock> {
    serde_json::from_value(doc.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn manager(clock: Arc<ManualClock>) -> LockManager {
        LockManager::new(
            Arc::new(MemoryStore::new()),
            clock,
            RetryConfig {
                max_retries: 3,
                base_delay_ms: 100,
                max_delay_ms: 1_000,
            },
        )
    }

    fn request(owner: &str, retry_count: u32) -> LockRequest {
        LockRequest {
            lock_id: role_lock_key("r1"),
            owner_id: owner.to_string(),
            timeout_ms: 5_000,
            retry_count,
        }
    }

    #[test]
    fn retry_config_exponential_backoff() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 500,
        };
        assert_eq!(config.delay_for_attempt(1), 100);
        assert_eq!(config.delay_for_attempt(2), 200);
        assert_eq!(config.delay_for_attempt(3), 400);
        assert_eq!(config.delay_for_attempt(4), 500);
        assert_eq!(config.delay_for_attempt(60), 500);
    }

    #[test]
    fn lock_key_format() {
        assert_eq!(role_lock_key("abc"), "role:abc");
    }

    #[tokio::test]
    async fn second_owner_is_refused_while_held() {
        let clock = Arc::new(ManualClock::new(0));
        let locks = manager(clock);

        assert!(locks.acquire_lock(&request("tx-a", 0)).await.unwrap());
        assert!(!locks.acquire_lock(&request("tx-b", 0)).await.unwrap());

        let holder = locks.current_lock("role:r1").await.unwrap().unwrap();
        assert_eq!(holder.owner_id, "tx-a");
    }

    #[tokio::test]
    async fn same_owner_reacquires() {
        let clock = Arc::new(ManualClock::new(0));
        let locks = manager(clock.clone());

        assert!(locks.acquire_lock(&request("tx-a", 0)).await.unwrap());
        clock.advance(1_000);
        assert!(locks.acquire_lock(&request("tx-a", 0)).await.unwrap());

        let holder = locks.current_lock("role:r1").await.unwrap().unwrap();
        assert_eq!(holder.acquired_at, 1_000);
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let clock = Arc::new(ManualClock::new(0));
        let locks = manager(clock.clone());

        assert!(locks.acquire_lock(&request("tx-a", 0)).await.unwrap());
        clock.advance(5_000);
        assert!(locks.current_lock("role:r1").await.unwrap().is_none());
        assert!(locks.acquire_lock(&request("tx-b", 0)).await.unwrap());

        let holder = locks.current_lock("role:r1").await.unwrap().unwrap();
        assert_eq!(holder.owner_id, "tx-b");
    }

    #[tokio::test]
    async fn release_is_idempotent_and_owner_scoped() {
        let clock = Arc::new(ManualClock::new(0));
        let locks = manager(clock);

        assert!(locks.acquire_lock(&request("tx-a", 0)).await.unwrap());

        // Stranger and never-held releases do nothing.
        locks.release_lock("role:r1", "tx-b").await.unwrap();
        locks.release_lock("role:other", "tx-a").await.unwrap();
        let holder = locks.current_lock("role:r1").await.unwrap().unwrap();
        assert_eq!(holder.owner_id, "tx-a");

        locks.release_lock("role:r1", "tx-a").await.unwrap();
        locks.release_lock("role:r1", "tx-a").await.unwrap();
        assert!(locks.current_lock("role:r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delayed_release_does_not_clobber_new_holder() {
        let clock = Arc::new(ManualClock::new(0));
        let locks = manager(clock.clone());

        assert!(locks.acquire_lock(&request("tx-a", 0)).await.unwrap());
        clock.advance(6_000);
        assert!(locks.acquire_lock(&request("tx-b", 0)).await.unwrap());

        // tx-a wakes up late and releases.
        locks.release_lock("role:r1", "tx-a").await.unwrap();
        let holder = locks.current_lock("role:r1").await.unwrap().unwrap();
        assert_eq!(holder.owner_id, "tx-b");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_wait_with_backoff() {
        let clock = Arc::new(ManualClock::new(0));
        let locks = manager(clock);
        assert!(locks.acquire_lock(&request("tx-a", 0)).await.unwrap());

        let started = tokio::time::Instant::now();
        let acquired = locks.acquire_lock(&request("tx-b", 3)).await.unwrap();
        assert!(!acquired);
        // 100 + 200 + 400
        assert_eq!(started.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gets_lock_after_release() {
        let clock = Arc::new(ManualClock::new(0));
        let locks = Arc::new(manager(clock));
        assert!(locks.acquire_lock(&request("tx-a", 0)).await.unwrap());

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire_lock(&request("tx-b", 3)).await.unwrap() })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        locks.release_lock("role:r1", "tx-a").await.unwrap();

        assert!(waiter.await.unwrap());
        let holder = locks.current_lock("role:r1").await.unwrap().unwrap();
        assert_eq!(holder.owner_id, "tx-b");
    }
}
