//! Cluster-wide restart lock built on exclusive key creation.
//!
//! Whoever creates the key holds the lock until it deletes the key or the TTL
//! expires. There is no fencing token. If the key stays taken for the whole
//! retry budget the caller proceeds without the lock, preferring availability
//! over strict mutual exclusion when a holder died mid-restart.

use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;
use crate::store::{ConfigStore, Result};

/// How long to keep retrying while someone else holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// Total creation attempts, including the first.
    pub attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryBudget {
    /// 100 attempts, 600ms apart: roughly a minute.
    fn default() -> Self {
        Self {
            attempts: 100,
            backoff: Duration::from_millis(600),
        }
    }
}

impl RetryBudget {
    /// Worst-case time spent waiting before giving up.
    pub fn max_wait(&self) -> Duration {
        self.backoff * self.attempts.saturating_sub(1)
    }
}

/// Result of trying to take the lock.
#[derive(Debug)]
pub enum Acquisition {
    /// We created the key.
    Held(DistributedLock),
    /// The key stayed taken for the whole budget.
    GaveUp {
        /// Attempts made.
        attempts: u32,
    },
}

/// A held lock. Release it explicitly; dropping it leaves the key to expire.
pub struct DistributedLock {
    key: String,
    attempts: u32,
    store: Arc<dyn ConfigStore>,
}

impl DistributedLock {
    /// How many attempts it took to get the lock.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delete the lock key.
    pub async fn release(self) -> Result<()> {
        match self.store.delete(&self.key).await {
            Ok(()) => Ok(()),
            // Already expired.
            Err(StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Try to create `key` within `budget`.
///
/// Retries only on [`StoreError::AlreadyExists`], sleeping `budget.backoff`
/// between attempts but not after the last one. Any other error is returned
/// immediately.
pub async fn acquire_lock(
    store: Arc<dyn ConfigStore>,
    key: &str,
    ttl: Duration,
    budget: RetryBudget,
) -> Result<Acquisition> {
    let attempts = budget.attempts.max(1);

    for attempt in 1..=attempts {
        match store.create_exclusive(key, ttl).await {
            Ok(()) => {
                tracing::debug!(key, attempt, "Acquired restart lock");
                return Ok(Acquisition::Held(DistributedLock {
                    key: key.to_string(),
                    attempts: attempt,
                    store,
                }));
            }
            Err(e) if e.is_already_exists() => {
                if attempt < attempts {
                    tokio::time::sleep(budget.backoff).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    tracing::warn!(key, attempts, "Restart lock still held, giving up");
    Ok(Acquisition::GaveUp { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    const LOCK: &str = "/forerunner/locks/api";
    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn test_acquires_after_contention() {
        let store = Arc::new(MemoryStore::new());
        store.hold_lock_for(3);

        let started = tokio::time::Instant::now();
        let budget = RetryBudget {
            attempts: 100,
            backoff: Duration::from_millis(600),
        };
        let outcome = acquire_lock(store.clone(), LOCK, TTL, budget).await.unwrap();

        let Acquisition::Held(lock) = outcome else {
            panic!("expected the lock to be acquired");
        };
        assert_eq!(lock.attempts(), 4);
        assert_eq!(store.create_attempts(), 4);
        // Three sleeps, one per contended attempt.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1800), "waited {waited:?}");
        assert!(waited < Duration::from_millis(2400), "waited {waited:?}");
        assert!(store.contains(LOCK));

        lock.release().await.unwrap();
        assert!(!store.contains(LOCK));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let store = Arc::new(MemoryStore::new());
        store.hold_lock_for(u32::MAX);

        let started = tokio::time::Instant::now();
        let budget = RetryBudget::default();
        let outcome = acquire_lock(store.clone(), LOCK, TTL, budget).await.unwrap();

        assert!(matches!(outcome, Acquisition::GaveUp { attempts: 100 }));
        assert_eq!(store.create_attempts(), 100);
        let waited = started.elapsed();
        assert!(waited >= budget.max_wait(), "waited {waited:?}");
        assert!(waited < budget.max_wait() + budget.backoff, "waited {waited:?}");
    }

    #[tokio::test]
    async fn test_other_errors_are_returned() {
        let store = Arc::new(MemoryStore::new());
        store.fail_creates("cluster unavailable");

        let err = acquire_lock(store.clone(), LOCK, TTL, RetryBudget::default())
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Unreachable { .. }));
        assert_eq!(store.create_attempts(), 1);
    }

    #[test]
    fn test_default_budget_is_about_a_minute() {
        let budget = RetryBudget::default();
        assert_eq!(budget.attempts, 100);
        assert_eq!(budget.max_wait(), Duration::from_millis(59_400));
    }
}
