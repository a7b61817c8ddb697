//! Workload configuration read from etcd.
//!
//! [`EnvironmentWatcher`] is the only writer of the [`cache`]; the
//! reconciliation engine reads whatever snapshot is current when a restart
//! actually runs.

pub mod cache;
pub mod watcher;

pub use cache::{CacheReader, CacheWriter, DEFAULT_TAG, Snapshot, cache};
pub use watcher::EnvironmentWatcher;
