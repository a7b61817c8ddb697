//! Distributed configuration store.
//!
//! The agent reads its workload configuration from, coordinates restarts
//! through, and registers endpoints in a shared key-value store. The
//! [`ConfigStore`] trait is the seam; [`EtcdStore`] talks to etcd's v2 keys
//! API.

pub mod etcd;
pub mod lock;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;

pub use etcd::EtcdStore;
pub use lock::{Acquisition, DistributedLock, RetryBudget, acquire_lock};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// One change observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Full key that changed.
    pub key: String,
    /// New value, `None` when the key was deleted or expired.
    pub value: Option<String>,
}

impl WatchEvent {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn removed(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }
}

/// Stream of watch results; errors are surfaced and the stream continues.
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// Key-value store capability used by the listeners.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read a key's value.
    async fn get(&self, key: &str) -> Result<String>;

    /// Write a key, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Remove a key.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Create a key only if it does not exist yet.
    ///
    /// Fails with [`StoreError::AlreadyExists`] when someone else holds it.
    async fn create_exclusive(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Watch every key under `prefix` until `cancel` fires.
    ///
    /// The stream yields every change made after this call returns, even if
    /// it is first polled later.
    async fn watch(&self, prefix: &str, cancel: CancellationToken) -> WatchStream;
}

/// Key of the vulcand endpoint entry for one instance.
pub fn endpoint_key(namespace: &str, group: &str, id: &str) -> String {
    format!(
        "/{}/upstreams/{}/endpoints/{}",
        namespace.trim_matches('/'),
        group,
        id
    )
}

/// Key of the cluster-wide restart lock for a group.
pub fn lock_key(group: &str) -> String {
    format!("/forerunner/locks/{}", group)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_key() {
        assert_eq!(
            endpoint_key("vulcand", "api", "a1"),
            "/vulcand/upstreams/api/endpoints/a1"
        );
        assert_eq!(
            endpoint_key("/proxy/", "api", "a1"),
            "/proxy/upstreams/api/endpoints/a1"
        );
    }

    #[test]
    fn test_lock_key() {
        assert_eq!(lock_key("api"), "/forerunner/locks/api");
    }
}
