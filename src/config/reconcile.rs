use std::time::Duration;

use crate::store::RetryBudget;

/// Timing of container restarts.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Quiet period after the last configuration change before restarting.
    pub debounce: Duration,
    /// Lifetime of the cluster-wide restart lock.
    pub lock_ttl: Duration,
    /// How long to wait for the lock before restarting without it.
    pub lock_budget: RetryBudget,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            lock_ttl: Duration::from_secs(10),
            lock_budget: RetryBudget::default(),
        }
    }
}
