//! Environment listener: mirrors the workload's etcd configuration into the
//! cache and announces every change on the bus.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::bus::{Inbox, Messenger, Publisher, Status, Topic};
use crate::config::EtcdConfig;
use crate::environment::cache::CacheWriter;
use crate::store::{self, ConfigStore, WatchEvent, WatchStream};

/// Which cached value a key feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigKey {
    Tag,
    Env,
}

impl ConfigKey {
    fn name(&self) -> &'static str {
        match self {
            ConfigKey::Tag => "tag",
            ConfigKey::Env => "env",
        }
    }
}

/// Watches `<prefix>tag` and `<prefix>env` and owns the cache writer.
pub struct EnvironmentWatcher {
    store: Arc<dyn ConfigStore>,
    writer: CacheWriter,
    prefix: String,
    tag_key: String,
    env_key: String,
}

impl EnvironmentWatcher {
    pub const TOPICS: &'static [Topic] = &[Topic::Init, Topic::Shutdown];

    pub fn new(store: Arc<dyn ConfigStore>, writer: CacheWriter, etcd: &EtcdConfig) -> Self {
        Self {
            store,
            writer,
            prefix: etcd.prefix.clone(),
            tag_key: etcd.tag_key(),
            env_key: etcd.env_key(),
        }
    }

    pub async fn run(self, mut inbox: Inbox, publisher: Publisher) {
        let send = publisher.messenger(Topic::Environment);
        let cancel = CancellationToken::new();
        let mut watch: Option<WatchStream> = None;

        loop {
            tokio::select! {
                message = inbox.recv() => {
                    let Some(message) = message else {
                        break;
                    };

                    match message.topic() {
                        Topic::Init => {
                            if watch.is_some() {
                                send.debug("already watching, ignoring init").await;
                                continue;
                            }
                            send.info(format!("setting watch on {}", self.prefix)).await;
                            watch = Some(self.store.watch(&self.prefix, cancel.clone()).await);

                            send.info("getting initial configuration from etcd").await;
                            if self.fetch(ConfigKey::Tag, &send).await {
                                self.fetch(ConfigKey::Env, &send).await;
                            }
                        }
                        Topic::Shutdown => {
                            cancel.cancel();
                            send.info(format!("cleared watches on {}", self.prefix)).await;
                            return;
                        }
                        other => {
                            send.fatal(format!("environment can't process {} messages", other))
                                .await;
                            return;
                        }
                    }
                }
                event = next_event(&mut watch) => {
                    match event {
                        Some(Ok(event)) => self.apply_event(event, &send).await,
                        Some(Err(e)) => send.warning(format!("watch error: {}", e)).await,
                        None => {
                            send.warning(format!("watch on {} ended", self.prefix)).await;
                            watch = None;
                        }
                    }
                }
            }
        }

        cancel.cancel();
    }

    fn key_of(&self, key: &str) -> Option<ConfigKey> {
        if key == self.tag_key {
            Some(ConfigKey::Tag)
        } else if key == self.env_key {
            Some(ConfigKey::Env)
        } else {
            None
        }
    }

    fn key_name(&self, key: ConfigKey) -> &str {
        match key {
            ConfigKey::Tag => &self.tag_key,
            ConfigKey::Env => &self.env_key,
        }
    }

    /// Read one key once. A key that cannot be read, missing included, is
    /// fatal. Returns whether the value was read.
    async fn fetch(&self, key: ConfigKey, send: &Messenger) -> bool {
        match self.store.get(self.key_name(key)).await {
            Ok(value) => {
                self.apply(key, &value, send).await;
                true
            }
            Err(e) => {
                send.fatal(format!("failed to get {}: {}", key.name(), e)).await;
                false
            }
        }
    }

    async fn apply_event(&self, event: WatchEvent, send: &Messenger) {
        let Some(key) = self.key_of(&event.key) else {
            send.debug(format!("unknown config key: {}", event.key)).await;
            return;
        };

        match event.value {
            Some(value) => self.apply(key, &value, send).await,
            None => {
                send.warning(format!(
                    "{} was removed, keeping the last {}",
                    event.key,
                    key.name()
                ))
                .await;
            }
        }
    }

    async fn apply(&self, key: ConfigKey, value: &str, send: &Messenger) {
        match key {
            ConfigKey::Tag => self.writer.set_tag(value.trim()),
            ConfigKey::Env => match parse_env(value) {
                Ok(env) => self.writer.set_env(env),
                Err(e) => {
                    send.fatal(format!("error loading env: {}", e)).await;
                    return;
                }
            },
        }
        self.announce(key, send).await;
    }

    async fn announce(&self, key: ConfigKey, send: &Messenger) {
        let snapshot = self.writer.reader().snapshot();
        let text = match key {
            ConfigKey::Tag => format!("tag is {}", snapshot.tag),
            ConfigKey::Env => format!("environment is {:?}", snapshot.env),
        };
        send.change(Status::Neutral, text).await;
    }
}

/// Parse the `env` document: a flat JSON object of strings.
fn parse_env(value: &str) -> Result<BTreeMap<String, String>, serde_json::Error> {
    if value.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(value)
}

async fn next_event(watch: &mut Option<WatchStream>) -> Option<store::Result<WatchEvent>> {
    match watch {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
