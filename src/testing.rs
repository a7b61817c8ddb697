//! In-memory fakes for the store and the container runtime.
//!
//! Provides:
//! - [`MemoryStore`]: a [`ConfigStore`] over a `HashMap` with injectable
//!   watch events, lock contention and failures
//! - [`FakeRuntime`]: a [`ContainerRuntime`] that records every call
//! - [`Recorder`]: drains bus topics in the background for later inspection
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use forerunner::testing::{FakeRuntime, MemoryStore};
//!
//! let store = Arc::new(MemoryStore::new());
//! store.put("/forerunner/tag", "v1");
//! let runtime = Arc::new(FakeRuntime::new());
//! runtime.set_port(8080, 49153);
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{Message, Router, Status, Topic};
use crate::container::{self, ContainerRef, ContainerRuntime, ContainerSpec};
use crate::error::{ContainerError, StoreError};
use crate::store::{self, ConfigStore, WatchEvent, WatchStream};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A recorded `set` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCall {
    pub key: String,
    pub value: String,
    pub ttl: Option<Duration>,
}

#[derive(Default)]
struct StoreState {
    values: HashMap<String, String>,
    contended_creates: u32,
    create_attempts: u32,
    create_failure: Option<String>,
    get_failure: Option<String>,
    set_failure: Option<String>,
    sets: Vec<SetCall>,
    deletes: Vec<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<store::Result<WatchEvent>>,
}

/// A [`ConfigStore`] kept entirely in memory.
///
/// Writes through the trait and through [`put`](Self::put) /
/// [`remove`](Self::remove) are delivered to every open watch whose prefix
/// matches.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    watchers: Mutex<Vec<Watcher>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key and notify watchers.
    pub fn put(&self, key: &str, value: &str) {
        lock(&self.state)
            .values
            .insert(key.to_string(), value.to_string());
        self.notify(WatchEvent::set(key, value));
    }

    /// Delete a key and notify watchers.
    pub fn remove(&self, key: &str) {
        lock(&self.state).values.remove(key);
        self.notify(WatchEvent::removed(key));
    }

    /// Deliver a malformed-response error to every open watch.
    pub fn push_watch_error(&self, reason: &str) {
        for watcher in lock(&self.watchers).iter() {
            let _ = watcher
                .tx
                .send(Err(StoreError::Malformed(reason.to_string())));
        }
    }

    pub fn value(&self, key: &str) -> Option<String> {
        lock(&self.state).values.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.state).values.contains_key(key)
    }

    /// Make the next `n` exclusive creates fail with `AlreadyExists`.
    pub fn hold_lock_for(&self, n: u32) {
        lock(&self.state).contended_creates = n;
    }

    /// Make every exclusive create fail as unreachable.
    pub fn fail_creates(&self, reason: &str) {
        lock(&self.state).create_failure = Some(reason.to_string());
    }

    /// Make every `get` fail as unreachable.
    pub fn fail_gets(&self, reason: &str) {
        lock(&self.state).get_failure = Some(reason.to_string());
    }

    /// Make every `set` fail as unreachable, or clear the failure.
    pub fn fail_sets(&self, reason: Option<&str>) {
        lock(&self.state).set_failure = reason.map(str::to_string);
    }

    pub fn create_attempts(&self) -> u32 {
        lock(&self.state).create_attempts
    }

    /// Every `set` made through the trait, in order.
    pub fn sets(&self) -> Vec<SetCall> {
        lock(&self.state).sets.clone()
    }

    /// Every key passed to `delete`, found or not.
    pub fn deletes(&self) -> Vec<String> {
        lock(&self.state).deletes.clone()
    }

    /// Number of open watches.
    pub fn watch_count(&self) -> usize {
        let mut watchers = lock(&self.watchers);
        watchers.retain(|w| !w.tx.is_closed());
        watchers.len()
    }

    fn notify(&self, event: WatchEvent) {
        lock(&self.watchers).retain(|watcher| {
            if !event.key.starts_with(&watcher.prefix) {
                return !watcher.tx.is_closed();
            }
            watcher.tx.send(Ok(event.clone())).is_ok()
        });
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(&self, key: &str) -> store::Result<String> {
        let state = lock(&self.state);
        if let Some(reason) = &state.get_failure {
            return Err(StoreError::Unreachable {
                reason: reason.clone(),
            });
        }
        state
            .values
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> store::Result<()> {
        {
            let mut state = lock(&self.state);
            if let Some(reason) = &state.set_failure {
                return Err(StoreError::Unreachable {
                    reason: reason.clone(),
                });
            }
            state.sets.push(SetCall {
                key: key.to_string(),
                value: value.to_string(),
                ttl,
            });
            state.values.insert(key.to_string(), value.to_string());
        }
        self.notify(WatchEvent::set(key, value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> store::Result<()> {
        let removed = {
            let mut state = lock(&self.state);
            state.deletes.push(key.to_string());
            state.values.remove(key)
        };
        match removed {
            Some(_) => {
                self.notify(WatchEvent::removed(key));
                Ok(())
            }
            None => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn create_exclusive(&self, key: &str, _ttl: Duration) -> store::Result<()> {
        let mut state = lock(&self.state);
        state.create_attempts += 1;

        if let Some(reason) = &state.create_failure {
            return Err(StoreError::Unreachable {
                reason: reason.clone(),
            });
        }
        if state.contended_creates > 0 {
            state.contended_creates -= 1;
            return Err(StoreError::AlreadyExists {
                key: key.to_string(),
            });
        }
        if state.values.contains_key(key) {
            return Err(StoreError::AlreadyExists {
                key: key.to_string(),
            });
        }
        state.values.insert(key.to_string(), String::new());
        Ok(())
    }

    async fn watch(&self, prefix: &str, cancel: CancellationToken) -> WatchStream {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.watchers).push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        Box::pin(futures::stream::unfold(
            (rx, cancel),
            |(mut rx, cancel)| async move {
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    item = rx.recv() => item.map(|item| (item, (rx, cancel))),
                }
            },
        ))
    }
}

/// A call made against [`FakeRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Pull { image: String, tag: String },
    FindByName(String),
    KillAndRemove(String),
    CreateAndStart(ContainerSpec),
    PublicPort { name: String, private_port: u16 },
}

#[derive(Default)]
struct RuntimeState {
    calls: Vec<RuntimeCall>,
    existing: Option<ContainerRef>,
    next_id: u32,
    ports: HashMap<u16, u16>,
    pull_failure: Option<String>,
    lookup_failure: Option<String>,
    start_failure: Option<String>,
    vanish_on_kill: bool,
}

/// A [`ContainerRuntime`] holding at most one container.
///
/// `create_and_start` replaces the held container, `kill_and_remove` clears
/// it, and `public_port` answers from the port map while a container exists.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a container named `name` already exists.
    pub fn with_container(self, name: &str) -> Self {
        {
            let mut state = lock(&self.state);
            state.next_id += 1;
            state.existing = Some(ContainerRef {
                id: format!("container-{}", state.next_id),
                name: name.to_string(),
            });
        }
        self
    }

    /// Publish `private_port` on `public_port`.
    pub fn set_port(&self, private_port: u16, public_port: u16) {
        lock(&self.state).ports.insert(private_port, public_port);
    }

    pub fn fail_pulls(&self, reason: &str) {
        lock(&self.state).pull_failure = Some(reason.to_string());
    }

    pub fn fail_lookups(&self, reason: &str) {
        lock(&self.state).lookup_failure = Some(reason.to_string());
    }

    pub fn fail_starts(&self, reason: &str) {
        lock(&self.state).start_failure = Some(reason.to_string());
    }

    /// Make the next kill report the container as already gone.
    pub fn vanish_on_kill(&self) {
        lock(&self.state).vanish_on_kill = true;
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        lock(&self.state).calls.clone()
    }

    /// Specs passed to `create_and_start`, in order.
    pub fn started(&self) -> Vec<ContainerSpec> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                RuntimeCall::CreateAndStart(spec) => Some(spec.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn kills(&self) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| matches!(call, RuntimeCall::KillAndRemove(_)))
            .count()
    }

    pub fn running(&self) -> Option<ContainerRef> {
        lock(&self.state).existing.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull(&self, image: &str, tag: &str, _registry: Option<&str>) -> container::Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(RuntimeCall::Pull {
            image: image.to_string(),
            tag: tag.to_string(),
        });
        match &state.pull_failure {
            Some(reason) => Err(ContainerError::Api {
                operation: "pull",
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn find_by_name(&self, name: &str) -> container::Result<ContainerRef> {
        let mut state = lock(&self.state);
        state.calls.push(RuntimeCall::FindByName(name.to_string()));
        if let Some(reason) = &state.lookup_failure {
            return Err(ContainerError::Api {
                operation: "list containers",
                reason: reason.clone(),
            });
        }
        state
            .existing
            .clone()
            .filter(|c| c.name == name)
            .ok_or_else(|| ContainerError::NotFound {
                name: name.to_string(),
            })
    }

    async fn kill_and_remove(&self, id: &str) -> container::Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(RuntimeCall::KillAndRemove(id.to_string()));
        let held = state.existing.as_ref().is_some_and(|c| c.id == id);
        if std::mem::take(&mut state.vanish_on_kill) || !held {
            state.existing = None;
            return Err(ContainerError::NotFound {
                name: id.to_string(),
            });
        }
        state.existing = None;
        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> container::Result<ContainerRef> {
        let mut state = lock(&self.state);
        state.calls.push(RuntimeCall::CreateAndStart(spec.clone()));
        if let Some(reason) = &state.start_failure {
            return Err(ContainerError::Api {
                operation: "start",
                reason: reason.clone(),
            });
        }
        state.next_id += 1;
        let container = ContainerRef {
            id: format!("container-{}", state.next_id),
            name: spec.name.clone(),
        };
        state.existing = Some(container.clone());
        Ok(container)
    }

    async fn public_port(&self, name: &str, private_port: u16) -> container::Result<u16> {
        let mut state = lock(&self.state);
        state.calls.push(RuntimeCall::PublicPort {
            name: name.to_string(),
            private_port,
        });
        if !state.existing.as_ref().is_some_and(|c| c.name == name) {
            return Err(ContainerError::NotFound {
                name: name.to_string(),
            });
        }
        state
            .ports
            .get(&private_port)
            .copied()
            .ok_or_else(|| ContainerError::NoPublicPort {
                name: name.to_string(),
                private_port,
            })
    }
}

/// Collects every message on some topics.
///
/// The inbox is drained on its own task, so a test that never looks at the
/// messages cannot stall the router.
pub struct Recorder {
    messages: std::sync::Arc<Mutex<Vec<Message>>>,
    task: JoinHandle<()>,
}

impl Recorder {
    pub fn attach(router: &Router, topics: &[Topic]) -> Self {
        let mut inbox = router.subscribe(topics);
        let messages = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();
        let task = tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                lock(&sink).push(message);
            }
        });
        Self { messages, task }
    }

    pub fn messages(&self) -> Vec<Message> {
        lock(&self.messages).clone()
    }

    /// Texts of the messages seen on `topic`, in order.
    pub fn texts(&self, topic: Topic) -> Vec<String> {
        lock(&self.messages)
            .iter()
            .filter(|m| m.topic() == topic)
            .map(|m| m.text().to_string())
            .collect()
    }

    /// Number of `Change` messages on `topic` with `status`.
    pub fn changes(&self, topic: Topic, status: Status) -> usize {
        lock(&self.messages)
            .iter()
            .filter(|m| m.topic() == topic && m.is_change(status))
            .count()
    }

    /// Poll until `predicate` holds, giving up after `timeout`.
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&[Message]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(lock(&self.messages).as_slice()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.task.abort();
    }
}
