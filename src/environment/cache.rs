//! Latest workload configuration, one writer and many readers.

use std::collections::BTreeMap;

use tokio::sync::watch;

/// Tag used until etcd says otherwise.
pub const DEFAULT_TAG: &str = "latest";

/// The workload configuration at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Image tag to run.
    pub tag: String,
    /// Container environment.
    pub env: BTreeMap<String, String>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            tag: DEFAULT_TAG.to_string(),
            env: BTreeMap::new(),
        }
    }
}

impl Snapshot {
    /// Environment as `KEY=value` entries, sorted by key.
    pub fn env_pairs(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// Create a cache holding the default snapshot.
pub fn cache() -> (CacheWriter, CacheReader) {
    let (tx, rx) = watch::channel(Snapshot::default());
    (CacheWriter { tx }, CacheReader { rx })
}

/// Sole writer, owned by the environment watcher.
#[derive(Debug)]
pub struct CacheWriter {
    tx: watch::Sender<Snapshot>,
}

impl CacheWriter {
    pub fn set_tag(&self, tag: impl Into<String>) {
        let tag = tag.into();
        self.tx.send_modify(|snapshot| snapshot.tag = tag);
    }

    pub fn set_env(&self, env: BTreeMap<String, String>) {
        self.tx.send_modify(|snapshot| snapshot.env = env);
    }

    pub fn reader(&self) -> CacheReader {
        CacheReader {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read handle; every clone sees the latest snapshot.
#[derive(Debug, Clone)]
pub struct CacheReader {
    rx: watch::Receiver<Snapshot>,
}

impl CacheReader {
    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.rx.borrow().clone()
    }
}
